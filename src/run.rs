//! Launching the external tools and collecting what they say.

use std::{
    ffi::OsString,
    io::{BufRead, BufReader, Read, Write},
    process::{Command, Stdio},
    thread,
};

use enum_map::EnumMap;

use crate::{Error, OurContext};

/// The external programs this tool drives.
#[derive(Copy, Clone, Debug, Eq, PartialEq, enum_map::Enum)]
pub enum Tool {
    /// Prints ELF program headers (`readelf -l`).
    Readelf,
    /// Converts ELF images to raw binaries.
    Objcopy,
    /// Talks to the STM32 serial bootloader.
    Stm32flash,
}

impl Tool {
    pub fn default_program(self) -> &'static str {
        match self {
            Tool::Readelf => "arm-none-eabi-readelf",
            Tool::Objcopy => "arm-none-eabi-objcopy",
            Tool::Stm32flash => "stm32flash",
        }
    }
}

/// Program names to use for each [`Tool`].
#[derive(Clone, Debug)]
pub struct Toolchain(EnumMap<Tool, String>);

impl Toolchain {
    pub fn program(&self, tool: Tool) -> &str {
        &self.0[tool]
    }

    pub fn set(&mut self, tool: Tool, program: impl Into<String>) {
        self.0[tool] = program.into();
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Toolchain(EnumMap::from_fn(|tool: Tool| tool.default_program().to_string()))
    }
}

/// What an external program left behind once it exited.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Output {
    /// Exit code, or `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turns an unsuccessful exit into [`Error::ToolFailed`].
    pub fn check(self, program: &str) -> Result<Self, Error> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::ToolFailed {
                program: program.to_string(),
                code: self.code,
            })
        }
    }
}

/// Something that can run an external program to completion.
///
/// A non-zero exit is not an error at this level; callers decide what a
/// failed step means by looking at [`Output::code`].
pub trait Runner {
    fn run(&mut self, program: &str, args: &[OsString]) -> Result<Output, Error>;
}

impl<R: Runner + ?Sized> Runner for &mut R {
    fn run(&mut self, program: &str, args: &[OsString]) -> Result<Output, Error> {
        (**self).run(program, args)
    }
}

/// Runs programs on the host, echoing their output as it arrives.
#[derive(Debug)]
pub struct SystemRunner {
    echo: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner { echo: true }
    }

    /// Collects output without copying it to the console.
    pub fn quiet() -> Self {
        SystemRunner { echo: false }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for SystemRunner {
    fn run(&mut self, program: &str, args: &[OsString]) -> Result<Output, Error> {
        log::info!("running: {}", command_line(program, args));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.to_string(),
                source,
            })?;

        let echo = self.echo;
        let stderr_pump = child.stderr.take()
            .map(|pipe| thread::spawn(move || pump(pipe, echo.then(std::io::stderr))));

        let stdout = match child.stdout.take() {
            Some(pipe) => pump(pipe, echo.then(std::io::stdout))
                .with_context(|| format!("reading output of {program}"))?,
            None => vec![],
        };
        let stderr = match stderr_pump {
            Some(handle) => handle.join()
                .map_err(|_| std::io::Error::other("stderr reader thread panicked"))?
                .with_context(|| format!("reading error output of {program}"))?,
            None => vec![],
        };

        let status = child.wait()
            .with_context(|| format!("waiting for {program} to exit"))?;
        log::debug!("{program} exited with {status}");

        Ok(Output {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

/// Reads `pipe` line by line until EOF, copying each line to `echo` as soon
/// as it shows up.
fn pump(pipe: impl Read, mut echo: Option<impl Write>) -> std::io::Result<Vec<String>> {
    let mut reader = BufReader::new(pipe);
    let mut lines = vec![];
    let mut raw = vec![];
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        if let Some(out) = echo.as_mut() {
            out.write_all(&raw)?;
            out.flush()?;
        }
        let line = String::from_utf8_lossy(&raw);
        lines.push(line.trim_end_matches(['\r', '\n']).to_string());
    }
    Ok(lines)
}

/// Renders an invocation the way a shell user would type it.
pub fn command_line(program: &str, args: &[OsString]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}
