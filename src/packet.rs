//! DCC packet representation: a small fixed-size payload plus an XOR checksum.
//!
//! [NMRA S-9.2](http://www.nmra.org/sites/default/files/s-92-2004-07.pdf) packets are
//! at most 6 bytes on the wire (5 payload bytes + checksum) for every operation this
//! station issues; `PACKET_MAX` reflects that.

use crate::error::Error;

/// Maximum number of payload bytes (excluding the checksum) a packet built by this
/// station may carry. `schedulePacket` rejects anything over this.
pub const PACKET_MAX: usize = 5;

/// A DCC packet: up to `PACKET_MAX` payload bytes followed by one checksum byte,
/// XOR of everything before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct DccPacket {
    bytes: [u8; PACKET_MAX + 1],
    /// Number of valid bytes in `bytes`, including the checksum.
    len: u8,
}

impl DccPacket {
    /// Builds a packet from `payload`, appending the XOR checksum byte.
    ///
    /// Returns `Error::PacketTooLong` if `payload.len() > PACKET_MAX`, matching
    /// `schedulePacket`'s `byteCount >= DCC_PACKET_MAX_SIZE` rejection (the
    /// original's `DCC_PACKET_MAX_SIZE` counts the checksum byte; `PACKET_MAX`
    /// here does not, so the comparisons differ by one accordingly).
    pub fn new(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() > PACKET_MAX {
            return Err(Error::PacketTooLong);
        }

        let mut bytes = [0u8; PACKET_MAX + 1];
        let mut checksum = 0u8;
        for (i, &b) in payload.iter().enumerate() {
            bytes[i] = b;
            checksum ^= b;
        }
        bytes[payload.len()] = checksum;

        Ok(Self {
            bytes,
            len: (payload.len() + 1) as u8,
        })
    }

    /// The packet's bytes, payload followed by checksum.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Number of bits in this packet on the wire, including the leading '0'
    /// start bit ahead of every byte.
    pub fn len_bytes(&self) -> usize {
        self.len as usize
    }
}

/// Broadcast idle packet: address 0xFF, instruction 0x00. Re-transmitted whenever
/// a track has nothing else pending.
pub fn idle_packet() -> DccPacket {
    DccPacket::new(&[0xFF, 0x00]).expect("idle packet payload is within PACKET_MAX")
}

/// Digital decoder reset packet: address 0x00, instruction 0x00. Used throughout
/// service mode, and at the start of any track's life.
pub fn reset_packet() -> DccPacket {
    DccPacket::new(&[0x00, 0x00]).expect("reset packet payload is within PACKET_MAX")
}
