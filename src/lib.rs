//! Flashing STM32 parts through their serial bootloader by way of the usual
//! external tools: `readelf` to find where the image goes, `objcopy` to
//! flatten it, and `stm32flash` to push it over the wire.
//!
//! Before flashing, a running application can be asked to drop into its
//! bootloader by sending it an `update` command on the same serial port
//! (see [`handshake`]).

use std::{borrow::Cow, ffi::OsStr, path::PathBuf};

use thiserror::Error;

pub mod elf;
pub mod flash;
pub mod handshake;
pub mod run;

use elf::{AddressExtractor, ElfHeaderExtractor, ReadelfExtractor};
use flash::{FlashFlags, Flasher};
use handshake::WakeFraming;
use run::{Runner, Tool, Toolchain};

pub const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// What to do to the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    Erase,
    /// Write the image at this path, already resolved to an existing file.
    Flash(PathBuf),
}

impl Action {
    /// Interprets the literal `erase`, or else resolves `arg` as an ELF path.
    pub fn parse(arg: impl AsRef<OsStr>) -> Result<Self, Error> {
        let arg = arg.as_ref();
        if arg == "erase" {
            return Ok(Action::Erase);
        }
        let missing = || Error::MissingElf { path: PathBuf::from(arg) };
        let path = std::fs::canonicalize(arg).map_err(|e| {
            log::debug!("can't resolve {}: {e}", arg.to_string_lossy());
            missing()
        })?;
        if !path.is_file() {
            return Err(missing());
        }
        Ok(Action::Flash(path))
    }
}

/// How the start address of an image is determined.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum AddressSource {
    /// Scrape `readelf -l` output.
    #[default]
    Readelf,
    /// Read the program headers ourselves.
    ElfHeader,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub device: String,
    pub baud_rate: u32,
    pub tools: Toolchain,
    /// `None` when the device is already sitting in its bootloader.
    pub wake: Option<WakeFraming>,
    pub flags: FlashFlags,
    pub address_source: AddressSource,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DEFAULT_DEVICE.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            tools: Toolchain::default(),
            wake: Some(WakeFraming::default()),
            flags: FlashFlags::default(),
            address_source: AddressSource::default(),
        }
    }
}

impl Config {
    fn extractor(&self) -> Box<dyn AddressExtractor> {
        match self.address_source {
            AddressSource::Readelf => Box::new(ReadelfExtractor::new(self.tools.program(Tool::Readelf))),
            AddressSource::ElfHeader => Box::new(ElfHeaderExtractor),
        }
    }
}

/// Wakes the bootloader if configured to, then carries out `action`.
pub fn execute<R: Runner>(config: &Config, action: &Action, runner: R) -> Result<(), Error> {
    log::info!("device = {}", config.device);

    if let Some(framing) = config.wake {
        handshake::wake_device(&config.device, config.baud_rate, framing)?;
    } else {
        log::debug!("skipping wake command, assuming device is in its bootloader");
    }

    let extractor = config.extractor();
    let mut flasher = Flasher::new(
        runner,
        &config.tools,
        &*extractor,
        &config.device,
        config.baud_rate,
        config.flags,
    );
    context_scope(
        || match action {
            Action::Erase => flasher.erase(),
            Action::Flash(elf) => flasher.flash(elf),
        },
        || format!("operating on device {}", config.device),
    )
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to connect to {port}. The device may be unplugged, another \
        program may be using the port, or an incorrect port may have been given.")]
    Connect {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("unable to parse elf file")]
    ElfParse,
    #[error("{} does not resolve to an existing file", path.display())]
    MissingElf {
        path: PathBuf,
    },
    #[error("can't run {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} {}", describe_exit(*code))]
    ToolFailed {
        program: String,
        code: Option<i32>,
    },
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("serial port configuration error")]
    Ser(#[from] serialport::Error),
    #[error("malformed ELF image")]
    Elf(#[from] goblin::error::Error),

    #[error("{0}")]
    Context(Cow<'static, str>, #[source] Box<Self>),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

pub trait OurContext {
    type Ok;
    fn context(self, info: impl Into<Cow<'static, str>>) -> Result<Self::Ok, Error>;
    fn with_context<M>(self, f: impl FnOnce() -> M) -> Result<Self::Ok, Error>
        where M: Into<Cow<'static, str>>;
}

impl<T, E> OurContext for Result<T, E>
    where E: Into<Error>,
{
    type Ok = T;

    fn context(self, info: impl Into<Cow<'static, str>>) -> Result<T, Error> {
        self.map_err(|e| Error::Context(info.into(), Box::new(e.into())))
    }

    fn with_context<M>(self, f: impl FnOnce() -> M) -> Result<T, Error>
        where M: Into<Cow<'static, str>>
    {
        self.map_err(|e| Error::Context(f().into(), Box::new(e.into())))
    }
}

fn context_scope<T, C>(
    body: impl FnOnce() -> Result<T, Error>,
    context_provider: impl FnOnce() -> C,
) -> Result<T, Error>
    where C: Into<Cow<'static, str>>,
{
    body().with_context(context_provider)
}
