//! Pulling the load address out of an ELF image, and flattening the image
//! into a raw binary.

use std::{ffi::OsString, fmt, path::Path};

use goblin::elf::{program_header::PT_LOAD, Elf};
use tempfile::TempPath;

use crate::{
    run::{Output, Runner},
    Error, OurContext,
};

/// Where the flattened image has to be written on the chip.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartAddress {
    token: String,
    value: u32,
}

impl StartAddress {
    /// Accepts a numeric token such as `0x08000000`, keeping its spelling.
    pub fn parse(token: &str) -> Result<Self, Error> {
        let value = parse_int::parse::<u32>(token).map_err(|_| Error::ElfParse)?;
        Ok(StartAddress {
            token: token.to_string(),
            value,
        })
    }

    pub fn from_value(value: u32) -> Self {
        StartAddress {
            token: format!("{value:#010x}"),
            value,
        }
    }

    /// The address exactly as it will be handed to the flasher.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn value(&self) -> u32 {
        self.value
    }
}

impl fmt::Display for StartAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// Finds the start address of an ELF image.
pub trait AddressExtractor {
    fn start_address(&self, runner: &mut dyn Runner, elf: &Path) -> Result<StartAddress, Error>;
}

/// Zero-based line of `readelf -l` output that describes the first program
/// header.
const FIRST_HEADER_LINE: usize = 7;
/// Zero-based column on that line holding `PhysAddr`.
const PHYS_ADDR_COLUMN: usize = 3;

/// Scrapes the first program header's physical address from `readelf -l`.
///
/// This relies on the inspector's layout: a short preamble, the column
/// headings, then one line per program header. If that layout moves, so
/// does the answer.
#[derive(Clone, Debug)]
pub struct ReadelfExtractor {
    program: String,
}

impl ReadelfExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        ReadelfExtractor { program: program.into() }
    }
}

impl AddressExtractor for ReadelfExtractor {
    fn start_address(&self, runner: &mut dyn Runner, elf: &Path) -> Result<StartAddress, Error> {
        let args = [OsString::from("-l"), elf.as_os_str().to_owned()];
        let output = runner.run(&self.program, &args)?
            .check(&self.program)?;
        parse_readelf_output(&output)
    }
}

/// Picks the fourth token of the eighth line of standard output.
pub fn parse_readelf_output(output: &Output) -> Result<StartAddress, Error> {
    let line = output.stdout.get(FIRST_HEADER_LINE)
        .ok_or(Error::ElfParse)?;
    let token = line.split_whitespace()
        .nth(PHYS_ADDR_COLUMN)
        .ok_or(Error::ElfParse)?;
    StartAddress::parse(token)
}

/// Reads the program headers directly instead of asking an external tool.
///
/// The answer is the lowest physical address among loadable segments that
/// carry file contents, which is where `objcopy -O binary` output begins.
/// Headers are ordered by virtual address, so the first one is not always
/// the lowest in flash (code copied to ITCM at 0x0 is a common case).
#[derive(Copy, Clone, Debug, Default)]
pub struct ElfHeaderExtractor;

impl AddressExtractor for ElfHeaderExtractor {
    fn start_address(&self, _runner: &mut dyn Runner, elf: &Path) -> Result<StartAddress, Error> {
        let image = std::fs::read(elf)
            .with_context(|| format!("reading {}", elf.display()))?;
        start_address_of(&image)
    }
}

pub fn start_address_of(image: &[u8]) -> Result<StartAddress, Error> {
    let elf = Elf::parse(image)?;
    let paddr = elf.program_headers.iter()
        .filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0)
        .map(|ph| ph.p_paddr)
        .min()
        .ok_or(Error::ElfParse)?;
    let paddr = u32::try_from(paddr).map_err(|_| Error::ElfParse)?;
    Ok(StartAddress::from_value(paddr))
}

/// Flattens `elf` into a raw binary in a fresh temporary file.
///
/// The returned path deletes the file when dropped; callers that want to
/// see removal errors should `close()` it.
pub fn convert_to_binary(
    runner: &mut dyn Runner,
    objcopy: &str,
    elf: &Path,
) -> Result<TempPath, Error> {
    let bin = tempfile::Builder::new()
        .prefix("stm32-flash-")
        .suffix(".bin")
        .tempfile()
        .context("creating temporary binary")?
        .into_temp_path();
    log::info!("temp file name = {}", bin.display());

    let args = [
        OsString::from("--input-target"),
        OsString::from("elf32-littlearm"),
        OsString::from("--output-target"),
        OsString::from("binary"),
        elf.as_os_str().to_owned(),
        bin.as_os_str().to_owned(),
    ];
    runner.run(objcopy, &args)?
        .check(objcopy)?;

    Ok(bin)
}
