//! Kicking a running application into its bootloader over the serial port.
//!
//! The firmware listens for an `update` command on its console UART and
//! jumps to the bootloader when it sees one. This only has to happen once
//! per flash; the serial port is released again before the flasher opens
//! it.

use std::{
    io::{ErrorKind, Read, Write},
    thread,
    time::Duration,
};

use indicatif::ProgressBar;
use serialport::SerialPort;

use crate::{Error, OurContext};

/// How the wake command is put on the wire.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum WakeFraming {
    /// `update\r\n` in a single write.
    Line,
    /// `\rupdate\r`, one character at a time, draining any echo in between.
    #[default]
    Paced,
}

/// Gap between characters of a paced wake command.
pub const CHARACTER_DELAY: Duration = Duration::from_millis(50);

/// Read timeout used while the port is open.
const PORT_TIMEOUT: Duration = Duration::from_secs(1);

impl WakeFraming {
    pub fn command(self) -> &'static [u8] {
        match self {
            WakeFraming::Line => b"update\r\n",
            WakeFraming::Paced => b"\rupdate\r",
        }
    }

    pub fn pacing(self) -> Option<Duration> {
        match self {
            WakeFraming::Line => None,
            WakeFraming::Paced => Some(CHARACTER_DELAY),
        }
    }
}

/// A writable link that can also throw away whatever the other end sent.
pub trait WakeLink: Write {
    /// Discards pending input, returning how many bytes were dropped.
    fn drain(&mut self) -> Result<usize, Error>;
}

pub struct SerialLink(Box<dyn SerialPort>);

impl SerialLink {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, Error> {
        log::info!("attempting to connect to serial port {port}");
        let handle = serialport::new(port, baud_rate)
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|source| Error::Connect {
                port: port.to_string(),
                source,
            })?;
        log::info!("{port} is connected");
        Ok(SerialLink(handle))
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl WakeLink for SerialLink {
    fn drain(&mut self) -> Result<usize, Error> {
        let saved_timeout = self.0.timeout();

        self.0.set_timeout(Duration::from_millis(1))
            .context("reducing timeout for drain")?;

        let mut buffer = [0; 32];
        let mut cruft = 0_usize;
        loop {
            match self.0.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => cruft += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    break;
                }
                Err(e) => return Err(e)
                    .context("attempting to drain buffer"),
            }
        }
        self.0.set_timeout(saved_timeout)
            .context("restoring timeout after drain")?;

        Ok(cruft)
    }
}

/// Opens `port`, sends the wake command in the requested framing, and
/// closes the port again.
pub fn wake_device(port: &str, baud_rate: u32, framing: WakeFraming) -> Result<(), Error> {
    let link = SerialLink::open(port, baud_rate)?;
    send_wake(link, framing.command(), framing.pacing())
        .with_context(|| format!("sending wake command on {port}"))
}

/// Writes `command` to `link`, which is closed before this returns whether
/// or not the write went through.
///
/// With `pacing`, each byte is followed by that delay and a drain of
/// whatever the device echoed back.
pub fn send_wake<L: WakeLink>(
    link: L,
    command: &[u8],
    pacing: Option<Duration>,
) -> Result<(), Error> {
    let mut link = scopeguard::guard(link, |mut link| {
        // Whatever made it into the output buffer goes out before release.
        if let Err(e) = link.flush() {
            log::debug!("flush before closing serial link failed: {e}");
        }
        log::debug!("closing serial link");
        drop(link);
    });

    let Some(delay) = pacing else {
        link.write_all(command)?;
        link.flush()?;
        return Ok(());
    };

    let bar = ProgressBar::new(command.len() as u64);
    for &byte in command {
        link.write_all(std::slice::from_ref(&byte))?;
        link.flush()?;
        thread::sleep(delay);
        let cruft = link.drain()?;
        if cruft > 0 {
            log::debug!("{cruft} bytes echoed after {:?}", char::from(byte));
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    Ok(())
}
