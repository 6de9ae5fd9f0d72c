//! Packet Engine: the current/pending packet slots and the repeat counter,
//! per track.
//!
//! `PacketEngine` holds no hardware state; it is driven on one side by
//! `schedule` (foreground, called from the command parser and the
//! service-mode driver) and on the other by `advance` (interrupt side,
//! called from [`crate::waveform::WaveformGenerator`] at each packet
//! boundary). The foreground/interrupt split described in the concurrency
//! model is enforced by the caller: this type itself is `&mut`-only and
//! carries no locking, so the glue layer (the RTIC resource, see
//! `main.rs`) is what actually guards it across the interrupt boundary.

use crate::packet::{idle_packet, DccPacket, PACKET_MAX};

/// Why `schedule` could not stage a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum ScheduleError {
    /// `byteCount > PACKET_MAX`; the call is a no-op.
    PacketTooLong,
    /// The previous pending packet hasn't been picked up by the interrupt yet.
    /// Callers on real hardware spin on this; see `Track::schedule_blocking`.
    PendingSlotOccupied,
}

struct Pending {
    packet: DccPacket,
    repeats: u8,
}

/// Holds the packet currently being bit-clocked out plus (at most) one
/// staged successor.
pub struct PacketEngine {
    current: DccPacket,
    repeats_remaining: u8,
    pending: Option<Pending>,
}

impl PacketEngine {
    /// A freshly built engine idles until the foreground schedules something.
    pub fn new() -> Self {
        Self {
            current: idle_packet(),
            repeats_remaining: 0,
            pending: None,
        }
    }

    /// Foreground: stage `payload` (checksum appended here) for `repeats + 1`
    /// total emissions. Fails rather than blocking; see module docs.
    pub fn schedule(&mut self, payload: &[u8], repeats: u8) -> Result<(), ScheduleError> {
        if payload.len() > PACKET_MAX {
            return Err(ScheduleError::PacketTooLong);
        }
        if self.pending.is_some() {
            return Err(ScheduleError::PendingSlotOccupied);
        }

        let packet = DccPacket::new(payload).map_err(|_| ScheduleError::PacketTooLong)?;
        self.pending = Some(Pending { packet, repeats });
        Ok(())
    }

    /// True while a previously-scheduled packet is still waiting for pickup.
    pub fn pending_occupied(&self) -> bool {
        self.pending.is_some()
    }

    /// The packet currently being transmitted.
    pub fn current_packet(&self) -> &DccPacket {
        &self.current
    }

    /// Interrupt side: called once per packet boundary (after the stop bit).
    /// Emits the remaining repeats of the current packet before picking up
    /// the pending one; falls back to the idle packet when nothing is
    /// pending.
    pub fn advance(&mut self) {
        if self.repeats_remaining > 0 {
            self.repeats_remaining -= 1;
            return;
        }

        match self.pending.take() {
            Some(Pending { packet, repeats }) => {
                self.current = packet;
                self.repeats_remaining = repeats;
            }
            None => {
                self.current = idle_packet();
                self.repeats_remaining = 0;
            }
        }
    }
}

impl Default for PacketEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_engine_idles() {
        let engine = PacketEngine::new();
        assert_eq!(engine.current_packet().as_slice(), idle_packet().as_slice());
    }

    #[test]
    fn schedule_then_advance_through_repeats() {
        let mut engine = PacketEngine::new();
        engine.schedule(&[0x03, 0x3F, 0x42], 2).unwrap();
        assert!(engine.pending_occupied());

        // Current packet doesn't change until the current one's repeats are exhausted.
        assert_eq!(engine.current_packet().as_slice(), idle_packet().as_slice());

        engine.advance(); // repeats_remaining on idle (0) -> pick up pending
        assert!(!engine.pending_occupied());
        assert_eq!(
            engine.current_packet().as_slice(),
            &[0x03, 0x3F, 0x42, 0x03 ^ 0x3F ^ 0x42]
        );

        // repeats = 2 means three total emissions: two more `advance`s stay on
        // the same packet before falling back to idle.
        engine.advance();
        assert_eq!(
            engine.current_packet().as_slice(),
            &[0x03, 0x3F, 0x42, 0x03 ^ 0x3F ^ 0x42]
        );
        engine.advance();
        assert_eq!(
            engine.current_packet().as_slice(),
            &[0x03, 0x3F, 0x42, 0x03 ^ 0x3F ^ 0x42]
        );
        engine.advance();
        assert_eq!(engine.current_packet().as_slice(), idle_packet().as_slice());
    }

    #[test]
    fn schedule_accepts_payload_at_packet_max() {
        let mut engine = PacketEngine::new();
        let payload = [0u8; PACKET_MAX];
        assert!(engine.schedule(&payload, 0).is_ok());
    }

    #[test]
    fn schedule_rejects_oversized_payload() {
        let mut engine = PacketEngine::new();
        let payload = [0u8; PACKET_MAX + 1];
        assert_eq!(
            engine.schedule(&payload, 0),
            Err(ScheduleError::PacketTooLong)
        );
    }

    #[test]
    fn schedule_refuses_second_pending_until_consumed() {
        let mut engine = PacketEngine::new();
        engine.schedule(&[1, 2], 0).unwrap();
        assert_eq!(
            engine.schedule(&[3, 4], 0),
            Err(ScheduleError::PendingSlotOccupied)
        );
        engine.advance();
        engine.schedule(&[3, 4], 0).unwrap();
    }

    #[test]
    fn packets_are_emitted_in_scheduled_order() {
        let mut engine = PacketEngine::new();
        engine.schedule(&[0xAA], 1).unwrap(); // 2 emissions
        engine.advance(); // pick up A
        let a = *engine.current_packet();
        engine.advance(); // still A (1 repeat left)
        assert_eq!(engine.current_packet().as_slice(), a.as_slice());

        engine.schedule(&[0xBB], 0).unwrap(); // staged while A is still current
        engine.advance(); // A's repeats exhausted -> pick up B
        assert_eq!(engine.current_packet().as_slice(), &[0xBB, 0xBB]);
    }
}
