//! Wire protocol between the trap engine and the device model
//!
//! The engine and the model are separate processes, possibly built from
//! separate toolchains, so the message layout is pinned byte-for-byte rather
//! than left to `#[repr(C)]` and the platform ABI: every field is encoded and
//! decoded explicitly as little-endian.

use std::convert::TryFrom;

// ———————————————————————————————— Layout ————————————————————————————————— //

/// Number of inline data bytes carried by a [`Message`].
pub const DATA_CAPACITY: usize = 256;

/// Total size of the wire message, identical for requests and responses.
pub const WIRE_SIZE: usize = 4 * 5 + DATA_CAPACITY;

/// Command carried by a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Read = 1,
    Write = 2,
    Interrupt = 3,
    Init = 4,
    Deinit = 5,
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Command::Read,
            2 => Command::Write,
            3 => Command::Interrupt,
            4 => Command::Init,
            5 => Command::Deinit,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

/// Result code carried by a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    Error = 1,
    Timeout = 2,
    InvalidAddress = 3,
}

impl TryFrom<u32> for ResultCode {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ResultCode::Success,
            1 => ResultCode::Error,
            2 => ResultCode::Timeout,
            3 => ResultCode::InvalidAddress,
            other => return Err(ProtocolError::UnknownResult(other)),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command code {0}")]
    UnknownCommand(u32),
    #[error("unknown result code {0}")]
    UnknownResult(u32),
    #[error("message is {0} bytes, expected {WIRE_SIZE}")]
    BadLength(usize),
    #[error("payload length {0} exceeds the {DATA_CAPACITY}-byte data buffer")]
    PayloadTooLarge(usize),
}

/// A single request or response exchanged with the device model.
#[derive(Debug, Clone)]
pub struct Message {
    pub device_id: u32,
    pub command: Command,
    pub address: u32,
    /// Byte length of the payload for READ/WRITE, or the interrupt id for INTERRUPT.
    pub length: u32,
    pub result: ResultCode,
    pub data: [u8; DATA_CAPACITY],
}

impl Message {
    /// Builds a READ request for `size` bytes at `address` on `device_id`.
    pub fn read_request(device_id: u32, address: u32, size: u8) -> Message {
        Message {
            device_id,
            command: Command::Read,
            address,
            length: size as u32,
            result: ResultCode::Success,
            data: [0; DATA_CAPACITY],
        }
    }

    /// Builds a WRITE request carrying `value`'s low `size` bytes, little-endian.
    pub fn write_request(device_id: u32, address: u32, size: u8, value: u64) -> Message {
        let mut data = [0u8; DATA_CAPACITY];
        data[..8].copy_from_slice(&value.to_le_bytes());
        Message {
            device_id,
            command: Command::Write,
            address,
            length: size as u32,
            result: ResultCode::Success,
            data,
        }
    }

    /// Builds an INTERRUPT message (`length` is overloaded as the interrupt id).
    pub fn interrupt(device_id: u32, interrupt_id: u32) -> Message {
        Message {
            device_id,
            command: Command::Interrupt,
            address: 0,
            length: interrupt_id,
            result: ResultCode::Success,
            data: [0; DATA_CAPACITY],
        }
    }

    /// Interprets the first `length` bytes of `data` as a little-endian unsigned integer.
    ///
    /// `length` is clamped to 8 bytes and to [`Message::length`]; callers only ever decode
    /// 1, 2, 4 or 8-byte scalar accesses.
    pub fn payload_as_u64(&self) -> u64 {
        let n = (self.length as usize).min(8);
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(&self.data[..n]);
        u64::from_le_bytes(buf)
    }

    pub fn encode(&self) -> [u8; WIRE_SIZE] {
        let mut out = [0u8; WIRE_SIZE];
        out[0..4].copy_from_slice(&self.device_id.to_le_bytes());
        out[4..8].copy_from_slice(&(self.command as u32).to_le_bytes());
        out[8..12].copy_from_slice(&self.address.to_le_bytes());
        out[12..16].copy_from_slice(&self.length.to_le_bytes());
        out[16..20].copy_from_slice(&(self.result as u32).to_le_bytes());
        out[20..20 + DATA_CAPACITY].copy_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
        if bytes.len() != WIRE_SIZE {
            return Err(ProtocolError::BadLength(bytes.len()));
        }
        let device_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let command = Command::try_from(u32::from_le_bytes(bytes[4..8].try_into().unwrap()))?;
        let address = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let length = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let result = ResultCode::try_from(u32::from_le_bytes(bytes[16..20].try_into().unwrap()))?;
        let mut data = [0u8; DATA_CAPACITY];
        data.copy_from_slice(&bytes[20..20 + DATA_CAPACITY]);
        Ok(Message {
            device_id,
            command,
            address,
            length,
            result,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_write_request() {
        let msg = Message::write_request(1, 0x40000004, 4, 0x1234_5678);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), WIRE_SIZE);

        let back = Message::decode(&bytes).unwrap();
        assert_eq!(back.device_id, 1);
        assert_eq!(back.command, Command::Write);
        assert_eq!(back.address, 0x40000004);
        assert_eq!(back.length, 4);
        assert_eq!(&back.data[..4], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn payload_as_u64_respects_length() {
        let mut msg = Message::read_request(1, 0x4000_0000, 1);
        msg.data[0] = 0xAA;
        assert_eq!(msg.payload_as_u64(), 0xAA);
    }

    #[test]
    fn rejects_unknown_command() {
        let mut bytes = Message::read_request(1, 0, 1).encode();
        bytes[4..8].copy_from_slice(&42u32.to_le_bytes());
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::UnknownCommand(42))
        ));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            Message::decode(&[0u8; 10]),
            Err(ProtocolError::BadLength(10))
        ));
    }
}
