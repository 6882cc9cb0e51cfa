//! Byte-level serial transport used by the link worker.
//!
//! The worker only talks to [`Transport`] / [`Connector`], so the real port
//! and in-memory fakes are interchangeable.

use std::io::{self, Read, Write};

use serialport::{ClearBuffer, SerialPort};

use hoot_core::types::LinkConfig;

/// Longest response line accepted from the device.
const MAX_LINE_LEN: usize = 256;

/// An open connection to the head controller.
pub trait Transport: Send {
    /// Drop any unread input so a reply can't be confused with stale bytes.
    fn clear_input(&mut self) -> io::Result<()>;
    /// Write one complete frame.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Read up to and excluding the next `\n`.
    fn read_line(&mut self) -> io::Result<Vec<u8>>;
}

/// Opens transports. Called again with the same config on every reconnect.
pub trait Connector: Send + 'static {
    fn connect(&mut self, config: &LinkConfig) -> io::Result<Box<dyn Transport>>;
}

/// Opens the configured serial device.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn connect(&mut self, config: &LinkConfig) -> io::Result<Box<dyn Transport>> {
        let port = serialport::new(config.port.as_str(), config.baud_rate)
            .timeout(config.timeout)
            .open()?;
        Ok(Box::new(SerialTransport { port }))
    }
}

struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl Transport for SerialTransport {
    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        read_line_from(&mut self.port)
    }
}

/// Byte-at-a-time line reader; the port timeout bounds each read.
fn read_line_from(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) if byte[0] == b'\n' => return Ok(line),
            Ok(_) => {
                line.push(byte[0]);
                if line.len() > MAX_LINE_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "response line too long",
                    ));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
