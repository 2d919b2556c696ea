use crate::error::CreteError;
use bincode::{Decode, Encode};
use log::debug;
use std::io::{self, Read, Write};

/// Size of the fixed frame header: `id`, `size`, `kind`, each a little-endian `u32`.
pub const HEADER_LEN: usize = 12;

/// Largest payload accepted from the peer. A run configuration with its
/// embedded seed files stays far below this.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    HostDistributedMode = 1,
    HostConfigurationPath = 2,
    GuestConfiguration = 3,
    ClusterNextTest = 4,
}

impl PacketType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(PacketType::HostDistributedMode),
            2 => Some(PacketType::HostConfigurationPath),
            3 => Some(PacketType::GuestConfiguration),
            4 => Some(PacketType::ClusterNextTest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub id: u32,
    pub size: u32,
    pub kind: u32,
}

impl PacketInfo {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.id.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.kind.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            id: word(0),
            size: word(4),
            kind: word(8),
        }
    }
}

/// Ordered, synchronous framing over any byte stream. The guest reads the
/// host's frames strictly in protocol order; a frame of any other kind is
/// a fatal protocol error.
pub struct ConfigurationChannel<T: Read + Write> {
    transport: T,
    next_id: u32,
}

impl<T: Read + Write> ConfigurationChannel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_id: 0,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    pub fn read_header(&mut self) -> Result<PacketInfo, CreteError> {
        let mut bytes = [0u8; HEADER_LEN];
        self.transport.read_exact(&mut bytes)?;
        Ok(PacketInfo::from_bytes(&bytes))
    }

    fn read_frame(&mut self, expected: PacketType) -> Result<Vec<u8>, CreteError> {
        let info = self.read_header()?;
        if info.kind != expected as u32 {
            return Err(CreteError::UnexpectedMessage {
                expected,
                received: info.kind,
            });
        }

        if info.size > MAX_FRAME_SIZE {
            return Err(CreteError::Serialization(format!(
                "{:?} frame of {} bytes exceeds the {} byte limit",
                expected, info.size, MAX_FRAME_SIZE
            )));
        }

        let mut payload = Vec::new();
        (&mut self.transport)
            .take(u64::from(info.size))
            .read_to_end(&mut payload)?;
        if payload.len() != info.size as usize {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} of {} payload bytes received", payload.len(), info.size),
            )
            .into());
        }
        debug!(
            "Received {:?} frame #{} ({} bytes)",
            expected, info.id, info.size
        );
        Ok(payload)
    }

    /// Reads one frame of kind `expected` and decodes its payload.
    pub fn read_value<V: Decode<()>>(&mut self, expected: PacketType) -> Result<V, CreteError> {
        let payload = self.read_frame(expected)?;
        let (value, _) = bincode::decode_from_slice(&payload, bincode::config::standard())?;
        Ok(value)
    }

    /// Reads one frame of kind `expected`, discarding any payload.
    pub fn expect(&mut self, expected: PacketType) -> Result<(), CreteError> {
        self.read_frame(expected).map(|_| ())
    }

    fn write_frame(&mut self, kind: PacketType, payload: &[u8]) -> Result<(), CreteError> {
        let size = u32::try_from(payload.len()).map_err(|_| {
            CreteError::Serialization(format!(
                "{:?} payload of {} bytes does not fit a frame",
                kind,
                payload.len()
            ))
        })?;
        let info = PacketInfo {
            id: self.next_id,
            size,
            kind: kind as u32,
        };
        self.next_id = self.next_id.wrapping_add(1);

        self.transport.write_all(&info.to_bytes())?;
        self.transport.write_all(payload)?;
        self.transport.flush()?;
        debug!("Sent {:?} frame #{} ({} bytes)", kind, info.id, size);
        Ok(())
    }

    pub fn write_value<V: Encode>(&mut self, kind: PacketType, value: &V) -> Result<(), CreteError> {
        let payload = bincode::encode_to_vec(value, bincode::config::standard())?;
        self.write_frame(kind, &payload)
    }

    /// Sends an empty frame.
    pub fn write_signal(&mut self, kind: PacketType) -> Result<(), CreteError> {
        self.write_frame(kind, &[])
    }
}
