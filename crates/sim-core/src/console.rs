//! Console byte-stream sinks.
//!
//! The framework's only console obligation is to hand output bytes to an
//! opaque sink and feed whatever the sink receives back to the registered
//! input device. The default sink is a TCP connection to the console
//! server; `--stdout-console` substitutes bare stdout (no input).

use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::error::ConfigError;

/// Where the console server listens.
pub const CONSOLE_PORT: u16 = 6809;

pub trait ConsoleSink {
    /// Best-effort, non-blocking delivery of device output.
    fn send(&mut self, bytes: &[u8]);

    /// Zero-timeout poll for input. `Ok(None)` means nothing pending;
    /// an error ends the run.
    fn poll(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Discards output; never produces input.
#[derive(Default)]
pub struct NullConsole;

impl ConsoleSink for NullConsole {
    fn send(&mut self, _bytes: &[u8]) {}
}

/// Writes output straight to stdout. Input is disconnected.
#[derive(Default)]
pub struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn send(&mut self, bytes: &[u8]) {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }
}

/// Bidirectional raw byte stream to the console server.
pub struct SocketConsole {
    stream: TcpStream,
}

impl SocketConsole {
    /// Connect to the console server on localhost.
    pub fn connect() -> Result<Self, ConfigError> {
        let stream = TcpStream::connect(("localhost", CONSOLE_PORT)).map_err(|_| {
            ConfigError::Console(
                "console server not listening; run the console server in another window".to_string(),
            )
        })?;
        stream
            .set_nonblocking(true)
            .map_err(|e| ConfigError::Console(e.to_string()))?;
        Ok(Self { stream })
    }
}

impl ConsoleSink for SocketConsole {
    fn send(&mut self, bytes: &[u8]) {
        let _ = self.stream.write_all(bytes);
    }

    fn poll(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 256];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "console server disconnected",
            )),
            Ok(n) => Ok(Some(buf[..n].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}
