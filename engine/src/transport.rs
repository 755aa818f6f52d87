//! Model Transport (C2)
//!
//! Forwards one request to the device model over a fresh Unix stream socket
//! connection and returns its response. If the model's listening endpoint is
//! absent, or any I/O step fails, falls back to a built-in synthetic oracle
//! so the trap engine remains runnable without a model attached (self-tests,
//! early development).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use mmiotrap_protocol::{Command, Message, ResultCode, WIRE_SIZE};

/// The conventional byte-offset of a device's status register; the built-in
/// oracle treats a read here as "ready" so self-tests have something to poll.
const STATUS_REGISTER_LOW_BYTE: u8 = 0x04;

pub struct Transport {
    socket_path: PathBuf,
}

impl Transport {
    pub fn new(socket_path: PathBuf) -> Transport {
        Transport { socket_path }
    }

    /// Opens a fresh connection, writes exactly one wire message, reads
    /// exactly one back, and closes. Any failure along the way — connect,
    /// short write, short read — falls back to [`Transport::simulate`].
    pub fn exchange(&self, request: &Message) -> Message {
        match self.exchange_over_socket(request) {
            Ok(response) => response,
            Err(err) => {
                log::warn!(
                    "model transport unavailable ({err}), falling back to local simulation"
                );
                Transport::simulate(request)
            }
        }
    }

    fn exchange_over_socket(&self, request: &Message) -> std::io::Result<Message> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        let bytes = request.encode();
        stream.write_all(&bytes)?;

        let mut response_bytes = [0u8; WIRE_SIZE];
        stream.read_exact(&mut response_bytes)?;

        Message::decode(&response_bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// The synthetic oracle used when no model is listening.
    ///
    /// READ: returns `0xDEADBEEF` truncated to the requested size, except
    /// that any address whose low byte is the conventional status-register
    /// offset returns a "ready" bit. WRITE: echoes the request back as
    /// SUCCESS. Anything else is echoed unmodified.
    fn simulate(request: &Message) -> Message {
        match request.command {
            Command::Read => {
                let mut response = request.clone();
                response.result = ResultCode::Success;
                response.data = [0; mmiotrap_protocol::DATA_CAPACITY];

                let value: u32 = if (request.address as u8) == STATUS_REGISTER_LOW_BYTE {
                    0x0000_0001
                } else {
                    0xDEAD_BEEF
                };
                let size = (request.length as usize).min(4);
                response.data[..size].copy_from_slice(&value.to_le_bytes()[..size]);
                response
            }
            Command::Write => {
                let mut response = request.clone();
                response.result = ResultCode::Success;
                response
            }
            _ => request.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_read_reports_ready_at_status_offset() {
        let request = Message::read_request(1, 0x4000_0004, 4);
        let response = Transport::simulate(&request);
        assert_eq!(response.payload_as_u64(), 1);
    }

    #[test]
    fn simulated_read_elsewhere_returns_deadbeef() {
        let request = Message::read_request(1, 0x4000_0000, 4);
        let response = Transport::simulate(&request);
        assert_eq!(response.payload_as_u64(), 0xDEAD_BEEF);
    }

    #[test]
    fn simulated_write_echoes_success() {
        let request = Message::write_request(1, 0x4000_0000, 4, 0x1234);
        let response = Transport::simulate(&request);
        assert_eq!(response.result, ResultCode::Success);
    }
}
