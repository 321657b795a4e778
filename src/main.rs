//! A command-line tool for flashing STM32 parts over their UART bootloader
//! using `readelf`, `objcopy` and `stm32flash`.

use std::ffi::OsString;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use stm32_serial_flash::{
    execute,
    flash::FlashFlags,
    handshake::WakeFraming,
    run::{SystemRunner, Tool},
    Action, AddressSource, Config, DEFAULT_BAUD_RATE, DEFAULT_DEVICE,
};

/// Flashes an ELF image onto an STM32 through its serial bootloader, or
/// erases it.
///
/// Unless told otherwise, the running firmware is first sent an `update`
/// command on the same port so it drops into the bootloader.
#[derive(Debug, Parser)]
#[clap(version)]
struct FlashTool {
    /// Either "erase" or the path to an ELF file.
    action: OsString,
    /// Serial device the part is attached to.
    #[clap(short('d'), long, env = "STM32_DEVICE", default_value = DEFAULT_DEVICE)]
    device: String,
    #[clap(long, short, default_value_t = DEFAULT_BAUD_RATE)]
    baud_rate: u32,
    /// Reset the device when the flasher exits.
    #[clap(short('R'), long)]
    reset: bool,
    /// Don't send the wake command; the device is already in its
    /// bootloader.
    #[clap(short('c'), long)]
    no_wake: bool,
    /// How to send the wake command.
    #[clap(long, value_enum, default_value_t = Framing::Paced)]
    wake_framing: Framing,
    /// Skip reading back the image after writing it.
    #[clap(long)]
    no_verify: bool,
    /// Where the start address of the image comes from.
    #[clap(long, value_enum, default_value_t = Source::Readelf)]
    address_source: Source,
    #[clap(long, env = "STM32_READELF", default_value = Tool::Readelf.default_program())]
    readelf: String,
    #[clap(long, env = "STM32_OBJCOPY", default_value = Tool::Objcopy.default_program())]
    objcopy: String,
    #[clap(long, env = "STM32_FLASHER", default_value = Tool::Stm32flash.default_program())]
    stm32flash: String,
    #[clap(long, short('v'))]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Framing {
    /// "update\r\n" in one write.
    Line,
    /// "\rupdate\r" one character at a time.
    Paced,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Source {
    /// Scrape `readelf -l`.
    Readelf,
    /// Read the ELF program headers directly.
    Elf,
}

impl FlashTool {
    fn config(&self) -> Config {
        let mut config = Config {
            device: self.device.clone(),
            baud_rate: self.baud_rate,
            ..Config::default()
        };
        config.tools.set(Tool::Readelf, &self.readelf);
        config.tools.set(Tool::Objcopy, &self.objcopy);
        config.tools.set(Tool::Stm32flash, &self.stm32flash);

        config.wake = (!self.no_wake).then_some(match self.wake_framing {
            Framing::Line => WakeFraming::Line,
            Framing::Paced => WakeFraming::Paced,
        });
        config.flags.set(FlashFlags::RESET, self.reset);
        config.flags.set(FlashFlags::VERIFY, !self.no_verify);
        config.address_source = match self.address_source {
            Source::Readelf => AddressSource::Readelf,
            Source::Elf => AddressSource::ElfHeader,
        };
        config
    }
}

fn main() -> Result<()> {
    let args = FlashTool::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();

    let action = Action::parse(&args.action)?;
    let config = args.config();

    execute(&config, &action, SystemRunner::new())
        .with_context(|| match &action {
            Action::Erase => "erase failed".to_string(),
            Action::Flash(elf) => format!("flashing {} failed", elf.display()),
        })?;

    println!("done");
    Ok(())
}
