//! Message exchange with an instrument.
//!
//! The session only needs a small capability set: write a command, read a
//! text line, read a raw (possibly binary) response. [`TcpTransport`]
//! provides it over a raw SCPI socket; any other messaging client can be
//! plugged in through [`Connector`].

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::binary_block;

/// Default raw SCPI socket port for Keysight and Tektronix instruments.
pub const SCPI_SOCKET_PORT: u16 = 5025;

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(200);
/// How long a block terminator may lag behind a complete payload.
const TERMINATOR_GRACE: Duration = Duration::from_millis(50);

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
const PNG_TRAILER: &[u8] = b"IEND\xae\x42\x60\x82";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Instrument did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Could not resolve host {host}")]
    Resolve { host: String },

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Transfer ended after {received} bytes, file is incomplete")]
    Incomplete { received: usize },
}

pub trait Transport: Send {
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);

    fn set_io_timeout(&mut self, timeout: Duration);

    /// Send one command; the transport appends the message terminator.
    fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Read one text response without its terminator.
    fn read(&mut self) -> Result<String, TransportError>;

    /// Read one response as bytes, including any block header and terminator.
    fn read_raw(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Creates (unopened) transports for a host.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str) -> Result<Box<dyn Transport>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    port: u16,
    idle_timeout: Duration,
}

impl TcpConnector {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Silence that ends an unframed transfer, see [`TcpTransport::with_idle_timeout`].
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(SCPI_SOCKET_PORT)
    }
}

impl Connector for TcpConnector {
    fn connect(&self, host: &str) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(
            TcpTransport::new(host, self.port).with_idle_timeout(self.idle_timeout),
        ))
    }
}

/// SCPI over a raw TCP socket, newline terminated.
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    io_timeout: Duration,
    idle_timeout: Duration,
    stream: Option<BufReader<TcpStream>>,
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// A PNG whose IEND chunk has not arrived yet.
fn is_truncated_png(data: &[u8]) -> bool {
    data.starts_with(PNG_SIGNATURE) && !data.windows(PNG_TRAILER.len()).any(|w| w == PNG_TRAILER)
}

impl TcpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            io_timeout: DEFAULT_IO_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            stream: None,
        }
    }

    /// Silence after which an unframed response counts as complete.
    ///
    /// PNG files are read on past this window until their IEND chunk arrives
    /// or the I/O timeout expires.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout.max(Duration::from_millis(1));
        self
    }

    fn stream(&mut self) -> Result<&mut BufReader<TcpStream>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotOpen)
    }

    fn map_io(&self, e: io::Error) -> TransportError {
        if is_timeout(&e) {
            TransportError::Timeout(self.io_timeout)
        } else {
            TransportError::Io(e)
        }
    }

    fn read_line_bytes(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut line = Vec::new();
        let result = self.stream()?.read_until(b'\n', &mut line);
        match result {
            Ok(0) => Err(TransportError::Io(io::ErrorKind::UnexpectedEof.into())),
            Ok(_) => Ok(line),
            Err(e) => Err(self.map_io(e)),
        }
    }

    /// Read a definite-length block, directed by its header.
    fn read_block(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut raw = vec![0u8; 2];
        self.read_exact_into(&mut raw)?;

        let len_digits = usize::from(raw[1].wrapping_sub(b'0'));
        if !raw[1].is_ascii_digit() || len_digits == 0 {
            // indefinite or garbled; the codec will judge what we return
            raw.extend(self.read_line_bytes()?);
            return Ok(raw);
        }

        let mut field = vec![0u8; len_digits];
        self.read_exact_into(&mut field)?;
        raw.extend_from_slice(&field);

        let Ok((_, Some(declared))) = binary_block::parse_header(&raw) else {
            raw.extend(self.read_line_bytes()?);
            return Ok(raw);
        };

        // grows with the data actually received, not with the declared length
        let result = Read::take(self.stream()?, declared as u64).read_to_end(&mut raw);
        let received = result.map_err(|e| self.map_io(e))?;
        if received < declared {
            return Err(TransportError::Io(io::ErrorKind::UnexpectedEof.into()));
        }

        self.consume_terminator(&mut raw);
        Ok(raw)
    }

    /// Swallow the `\n` after a block if it is buffered or arrives shortly.
    ///
    /// The payload is complete at this point, so nothing here fails the read.
    fn consume_terminator(&mut self, raw: &mut Vec<u8>) {
        let io_timeout = self.io_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let waiting = stream.buffer().is_empty();
        if waiting {
            if let Err(e) = stream.get_ref().set_read_timeout(Some(TERMINATOR_GRACE)) {
                log::warn!("Failed to set socket timeout: {}", e);
            }
        }
        let peeked = stream.fill_buf().map(|buf| buf.first().copied());
        if waiting {
            if let Err(e) = stream.get_ref().set_read_timeout(Some(io_timeout)) {
                log::warn!("Failed to set socket timeout: {}", e);
            }
        }

        match peeked {
            Ok(Some(b'\n')) => {
                stream.consume(1);
                raw.push(b'\n');
            }
            Ok(_) => {}
            Err(e) => log::debug!("No terminator after block: {}", e),
        }
    }

    /// Read until the peer stops sending, for unframed file dumps.
    fn read_until_idle(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut data = Vec::new();
        let io_timeout = self.io_timeout;
        let idle_timeout = self.idle_timeout;
        let stream = self.stream()?;
        stream.get_ref().set_read_timeout(Some(idle_timeout))?;

        let mut chunk = [0u8; 4096];
        let mut last_data = Instant::now();
        let result = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    data.extend_from_slice(&chunk[..n]);
                    last_data = Instant::now();
                }
                Err(e) if is_timeout(&e) => {
                    if is_truncated_png(&data) && last_data.elapsed() < io_timeout {
                        continue;
                    }
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };
        stream.get_ref().set_read_timeout(Some(io_timeout))?;
        result?;

        if is_truncated_png(&data) {
            return Err(TransportError::Incomplete {
                received: data.len(),
            });
        }
        Ok(data)
    }

    fn read_exact_into(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let result = self.stream()?.read_exact(buf);
        result.map_err(|e| self.map_io(e))
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve {
                host: self.host.clone(),
            })?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.io_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.io_timeout))?;
                    stream.set_write_timeout(Some(self.io_timeout))?;
                    stream.set_nodelay(true)?;
                    log::debug!("Connected to {}:{} via {}", self.host, self.port, addr);
                    self.stream = Some(BufReader::new(stream));
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => self.map_io(e),
            None => TransportError::Resolve {
                host: self.host.clone(),
            },
        })
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.get_ref().shutdown(std::net::Shutdown::Both);
        }
    }

    fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
        if let Some(stream) = &self.stream {
            let socket = stream.get_ref();
            if let Err(e) = socket
                .set_read_timeout(Some(timeout))
                .and_then(|()| socket.set_write_timeout(Some(timeout)))
            {
                log::warn!("Failed to set socket timeout on {}: {}", self.host, e);
            }
        }
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        log::trace!("{} <- {}", self.host, command);
        let message = format!("{}\n", command);
        let result = self.stream()?.get_mut().write_all(message.as_bytes());
        result.map_err(|e| self.map_io(e))
    }

    fn read(&mut self) -> Result<String, TransportError> {
        let line = self.read_line_bytes()?;
        let text = String::from_utf8(line)?;
        let text = text.trim_end_matches(['\r', '\n']).to_string();
        log::trace!("{} -> {}", self.host, text);
        Ok(text)
    }

    fn read_raw(&mut self) -> Result<Vec<u8>, TransportError> {
        let peeked = self
            .stream()?
            .fill_buf()
            .map(|buf| buf.first().copied());
        let first = match peeked {
            Ok(Some(byte)) => byte,
            Ok(None) => return Err(TransportError::Io(io::ErrorKind::UnexpectedEof.into())),
            Err(e) => return Err(self.map_io(e)),
        };

        if binary_block::is_block(&[first]) {
            self.read_block()
        } else {
            self.read_until_idle()
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
