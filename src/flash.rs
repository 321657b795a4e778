//! Driving `stm32flash` to erase or program a part.

use std::{ffi::OsString, path::Path};

use crate::{
    elf::{convert_to_binary, AddressExtractor, StartAddress},
    run::{Runner, Tool, Toolchain},
    Error, OurContext,
};

bitflags::bitflags! {
    /// Optional switches passed to the flasher when writing an image.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FlashFlags: u32 {
        /// Read back and compare after writing (`-v`).
        const VERIFY = 1 << 0;
        /// Treat the input as a raw binary regardless of its contents (`-f`).
        const FORCE_BINARY = 1 << 1;
        /// Reset the device once the flasher is done (`-R`).
        const RESET = 1 << 2;
    }
}

impl Default for FlashFlags {
    fn default() -> Self {
        FlashFlags::VERIFY | FlashFlags::FORCE_BINARY
    }
}

/// Arguments for a mass erase.
pub fn erase_args(baud_rate: u32, device: &str) -> Vec<OsString> {
    vec![
        "-b".into(),
        baud_rate.to_string().into(),
        "-o".into(),
        device.into(),
    ]
}

/// Arguments for writing `bin` to `address`. The device is always last.
pub fn flash_args(
    baud_rate: u32,
    bin: &Path,
    flags: FlashFlags,
    address: &StartAddress,
    device: &str,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-b".into(),
        baud_rate.to_string().into(),
        "-w".into(),
        bin.as_os_str().to_owned(),
    ];
    if flags.contains(FlashFlags::VERIFY) {
        args.push("-v".into());
    }
    if flags.contains(FlashFlags::FORCE_BINARY) {
        args.push("-f".into());
    }
    if flags.contains(FlashFlags::RESET) {
        args.push("-R".into());
    }
    args.push("-S".into());
    args.push(address.token().into());
    args.push(device.into());
    args
}

/// Runs the erase and flash sequences against one device.
pub struct Flasher<'a, R> {
    runner: R,
    tools: &'a Toolchain,
    extractor: &'a dyn AddressExtractor,
    device: &'a str,
    baud_rate: u32,
    flags: FlashFlags,
}

impl<'a, R: Runner> Flasher<'a, R> {
    pub fn new(
        runner: R,
        tools: &'a Toolchain,
        extractor: &'a dyn AddressExtractor,
        device: &'a str,
        baud_rate: u32,
        flags: FlashFlags,
    ) -> Self {
        Flasher { runner, tools, extractor, device, baud_rate, flags }
    }

    pub fn erase(&mut self) -> Result<(), Error> {
        let flasher = self.tools.program(Tool::Stm32flash);
        self.runner.run(flasher, &erase_args(self.baud_rate, self.device))?
            .check(flasher)
            .with_context(|| format!("erasing device on {}", self.device))?;
        Ok(())
    }

    /// Extracts the start address, flattens `elf`, and writes it out.
    ///
    /// The temporary binary is gone by the time this returns, whatever the
    /// outcome.
    pub fn flash(&mut self, elf: &Path) -> Result<(), Error> {
        let address = self.extractor.start_address(&mut self.runner, elf)
            .with_context(|| format!("finding start address of {}", elf.display()))?;
        log::info!("start address is {address}");

        let objcopy = self.tools.program(Tool::Objcopy);
        let bin = convert_to_binary(&mut self.runner, objcopy, elf)
            .with_context(|| format!("converting {} to binary", elf.display()))?;

        let flasher = self.tools.program(Tool::Stm32flash);
        let args = flash_args(self.baud_rate, &bin, self.flags, &address, self.device);
        let outcome = self.runner.run(flasher, &args)
            .and_then(|output| output.check(flasher));

        let bin_path = bin.to_path_buf();
        let removed = bin.close();

        outcome.with_context(|| format!("flashing {}", elf.display()))?;
        removed.with_context(|| format!("removing {}", bin_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        elf::{tests::READELF_LISTING, ReadelfExtractor},
        run::Output,
    };
    use std::path::PathBuf;

    /// Plays back canned output per tool and writes down every call.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub calls: Vec<(String, Vec<OsString>)>,
        pub fail: Option<&'static str>,
        /// Whether the file named last on the flasher's command line existed
        /// while the flasher was running.
        pub bin_existed: Option<bool>,
    }

    impl Runner for Recorder {
        fn run(&mut self, program: &str, args: &[OsString]) -> Result<Output, Error> {
            self.calls.push((program.to_string(), args.to_vec()));
            let mut output = Output { code: Some(0), ..Output::default() };
            if program == "readelf" {
                output.stdout = READELF_LISTING.lines().map(str::to_string).collect();
            }
            if program == "stm32flash" && args.iter().any(|a| a == "-w") {
                self.bin_existed = Some(Path::new(&args[3]).exists());
            }
            if self.fail == Some(program) {
                output.code = Some(1);
            }
            Ok(output)
        }
    }

    pub(crate) fn toolchain() -> Toolchain {
        let mut tools = Toolchain::default();
        tools.set(Tool::Readelf, "readelf");
        tools.set(Tool::Objcopy, "objcopy");
        tools.set(Tool::Stm32flash, "stm32flash");
        tools
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn erase_command_line() {
        assert_eq!(strings(&erase_args(115_200, "/dev/ttyUSB0")), ["-b", "115200", "-o", "/dev/ttyUSB0"]);
    }

    #[test]
    fn flash_command_line_with_defaults() {
        let addr = StartAddress::parse("0x08000000").unwrap();
        let args = flash_args(115_200, Path::new("/tmp/x.bin"), FlashFlags::default(), &addr, "/dev/ttyUSB0");
        assert_eq!(strings(&args), [
            "-b", "115200", "-w", "/tmp/x.bin", "-v", "-f", "-S", "0x08000000", "/dev/ttyUSB0",
        ]);
    }

    #[test]
    fn reset_flag_only_when_requested() {
        let addr = StartAddress::parse("0x08000000").unwrap();
        let without = flash_args(115_200, Path::new("a.bin"), FlashFlags::default(), &addr, "/dev/ttyACM1");
        assert!(!without.iter().any(|a| a == "-R"));

        let with = flash_args(
            115_200,
            Path::new("a.bin"),
            FlashFlags::default() | FlashFlags::RESET,
            &addr,
            "/dev/ttyACM1",
        );
        assert_eq!(strings(&with)[4..], ["-v", "-f", "-R", "-S", "0x08000000", "/dev/ttyACM1"]);
    }

    #[test]
    fn no_verify_drops_v() {
        let addr = StartAddress::from_value(0x0800_4000);
        let args = flash_args(57_600, Path::new("a.bin"), FlashFlags::FORCE_BINARY, &addr, "COM3");
        assert_eq!(strings(&args), ["-b", "57600", "-w", "a.bin", "-f", "-S", "0x08004000", "COM3"]);
    }

    fn flasher<'a>(
        runner: &'a mut Recorder,
        tools: &'a Toolchain,
        extractor: &'a dyn AddressExtractor,
    ) -> Flasher<'a, &'a mut Recorder> {
        Flasher::new(runner, tools, extractor, "/dev/ttyUSB0", 115_200, FlashFlags::default())
    }

    #[test]
    fn erase_only_runs_flasher() {
        let tools = toolchain();
        let extractor = ReadelfExtractor::new("readelf");
        let mut runner = Recorder::default();
        flasher(&mut runner, &tools, &extractor).erase().unwrap();
        assert_eq!(runner.calls.len(), 1);
        assert_eq!(runner.calls[0].0, "stm32flash");
        assert_eq!(strings(&runner.calls[0].1), ["-b", "115200", "-o", "/dev/ttyUSB0"]);
    }

    #[test]
    fn failed_erase_is_an_error() {
        let tools = toolchain();
        let extractor = ReadelfExtractor::new("readelf");
        let mut runner = Recorder { fail: Some("stm32flash"), ..Recorder::default() };
        assert!(flasher(&mut runner, &tools, &extractor).erase().is_err());
    }

    fn bin_path(runner: &Recorder) -> PathBuf {
        PathBuf::from(&runner.calls[2].1[3])
    }

    #[test]
    fn flash_runs_extract_convert_flash_in_order() {
        let tools = toolchain();
        let extractor = ReadelfExtractor::new("readelf");
        let mut runner = Recorder::default();
        flasher(&mut runner, &tools, &extractor).flash(Path::new("firmware.elf")).unwrap();

        let programs: Vec<&str> = runner.calls.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(programs, ["readelf", "objcopy", "stm32flash"]);

        let bin = bin_path(&runner);
        assert_eq!(runner.calls[1].1[5], bin.as_os_str());

        let args = strings(&runner.calls[2].1);
        assert_eq!(args[..3], ["-b", "115200", "-w"]);
        let s = args.iter().position(|a| a == "-S").unwrap();
        assert_eq!(args[s + 1], "0x08000000");
        assert_eq!(args.last().unwrap(), "/dev/ttyUSB0");

        assert_eq!(runner.bin_existed, Some(true));
        assert!(!bin.exists());
    }

    #[test]
    fn binary_removed_when_flasher_fails() {
        let tools = toolchain();
        let extractor = ReadelfExtractor::new("readelf");
        let mut runner = Recorder { fail: Some("stm32flash"), ..Recorder::default() };
        let err = flasher(&mut runner, &tools, &extractor)
            .flash(Path::new("firmware.elf"))
            .unwrap_err();
        assert!(err.to_string().contains("firmware.elf"));

        assert_eq!(runner.calls.len(), 3);
        assert!(!bin_path(&runner).exists());
    }

    #[test]
    fn failed_extraction_stops_before_conversion() {
        let tools = toolchain();
        let extractor = ReadelfExtractor::new("readelf");
        let mut runner = Recorder { fail: Some("readelf"), ..Recorder::default() };
        assert!(flasher(&mut runner, &tools, &extractor).flash(Path::new("firmware.elf")).is_err());
        assert_eq!(runner.calls.len(), 1);
    }

    #[test]
    fn failed_conversion_stops_before_flashing() {
        let tools = toolchain();
        let extractor = ReadelfExtractor::new("readelf");
        let mut runner = Recorder { fail: Some("objcopy"), ..Recorder::default() };
        assert!(flasher(&mut runner, &tools, &extractor).flash(Path::new("firmware.elf")).is_err());
        assert_eq!(runner.calls.len(), 2);
        assert!(!Path::new(&runner.calls[1].1[5]).exists());
    }
}
