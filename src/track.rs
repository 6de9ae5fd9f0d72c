//! A track: the device-facing half of the Packet Engine (component B).
//!
//! `Track` owns a [`PacketEngine`], the per-device speed memory, and the
//! hardware descriptor from which the command parser and service-mode
//! driver build DCC payloads. It does not own GPIO pins or the waveform
//! generator directly — those are driven from the interrupt side in
//! `main.rs`, against the same `PacketEngine` via a shared resource.

use crate::engine::{PacketEngine, ScheduleError};
use crate::error::Error;
use crate::waveform::ControlScheme;

/// Hardware wiring and calibration for one track. Pin assignments are
/// resolved at `main.rs`'s setup time; this descriptor only carries the
/// values the core logic needs (control scheme, current calibration,
/// overcurrent trigger).
#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct HardwareDescriptor {
    pub control_scheme: ControlScheme,
    /// Multiplier converting a smoothed ADC reading to milliamps.
    pub current_conversion_factor: f32,
    /// Overcurrent trip threshold, in milliamps.
    pub trigger_ma: f32,
}

/// Maximum number of addressable devices (cabs) a track's speed table
/// tracks locally. Index 0 is unused; valid device indices are `1..=numDev`.
pub const MAX_DEVICES: usize = 32;

/// Echoed back to the caller after `setThrottle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct ThrottleResponse {
    pub device: u8,
    pub speed: i8,
    pub direction: bool,
}

pub struct Track {
    pub engine: PacketEngine,
    hdw: HardwareDescriptor,
    num_dev: u8,
    /// Signed speed memory, 1-based; `speed_table[0]` is unused filler.
    speed_table: [i8; MAX_DEVICES + 1],
}

impl Track {
    /// `num_dev` must be at least 1 and at most [`MAX_DEVICES`].
    pub fn new(hdw: HardwareDescriptor, num_dev: u8) -> Self {
        debug_assert!(num_dev >= 1 && (num_dev as usize) <= MAX_DEVICES);
        Self {
            engine: PacketEngine::new(),
            hdw,
            num_dev,
            speed_table: [0; MAX_DEVICES + 1],
        }
    }

    pub fn hardware(&self) -> HardwareDescriptor {
        self.hdw
    }

    pub fn num_dev(&self) -> u8 {
        self.num_dev
    }

    /// Signed speed for `device` (1-based): positive = forward, negative = reverse.
    pub fn speed_table_entry(&self, device: u8) -> Option<i8> {
        if device < 1 || device > self.num_dev {
            return None;
        }
        Some(self.speed_table[device as usize])
    }

    /// Non-blocking attempt to stage a packet; the service-mode driver uses
    /// this directly so it can interleave waiting for the pending slot with
    /// other work (current-sense polling) instead of spinning blind.
    pub fn try_schedule(&mut self, payload: &[u8], repeats: u8) -> Result<(), ScheduleError> {
        self.engine.schedule(payload, repeats)
    }

    /// Busy-waits for the pending slot to clear, then schedules. This is the
    /// main path's only blocking point (see concurrency model); on real
    /// hardware the interrupt drains the slot within one packet's wire time.
    pub fn schedule_blocking(&mut self, payload: &[u8], repeats: u8) -> Result<(), Error> {
        loop {
            match self.try_schedule(payload, repeats) {
                Ok(()) => return Ok(()),
                Err(ScheduleError::PacketTooLong) => return Err(Error::PacketTooLong),
                Err(ScheduleError::PendingSlotOccupied) => continue,
            }
        }
    }

    /// 128-step speed control. `speed` is `-1` for emergency stop, else
    /// `0..=126`.
    pub fn set_throttle(
        &mut self,
        n_dev: u8,
        cab: u16,
        speed: i8,
        direction: bool,
    ) -> Result<ThrottleResponse, Error> {
        if n_dev < 1 || n_dev > self.num_dev {
            return Err(Error::OutOfRange);
        }

        let mut b = [0u8; 4];
        let mut n = 0usize;
        if cab > 127 {
            b[n] = ((cab >> 8) as u8) | 0xC0;
            n += 1;
        }
        b[n] = (cab & 0xFF) as u8;
        n += 1;
        b[n] = 0x3F;
        n += 1;

        let reported_speed;
        if speed >= 0 {
            let code = speed as u16 + u16::from(speed > 0) + u16::from(direction) * 128;
            b[n] = code as u8;
            n += 1;
            reported_speed = speed;
        } else {
            b[n] = 1;
            n += 1;
            reported_speed = 0;
        }

        self.schedule_blocking(&b[..n], 0)?;

        self.speed_table[n_dev as usize] = if direction {
            reported_speed
        } else {
            -reported_speed
        };

        Ok(ThrottleResponse {
            device: n_dev,
            speed: reported_speed,
            direction,
        })
    }

    /// Two-byte function group form (F0-F12).
    pub fn set_function(&mut self, cab: u16, byte1: u8) -> Result<(), Error> {
        let mut b = [0u8; 3];
        let mut n = 0usize;
        if cab > 127 {
            b[n] = ((cab >> 8) as u8) | 0xC0;
            n += 1;
        }
        b[n] = (cab & 0xFF) as u8;
        n += 1;
        b[n] = (byte1 | 0x80) & 0xBF;
        n += 1;

        self.schedule_blocking(&b[..n], 4)
    }

    /// Three-byte function group form (F13-F28).
    pub fn set_function_ext(&mut self, cab: u16, byte1: u8, byte2: u8) -> Result<(), Error> {
        let mut b = [0u8; 4];
        let mut n = 0usize;
        if cab > 127 {
            b[n] = ((cab >> 8) as u8) | 0xC0;
            n += 1;
        }
        b[n] = (cab & 0xFF) as u8;
        n += 1;
        b[n] = (byte1 | 0xDE) & 0xDF;
        n += 1;
        b[n] = byte2;
        n += 1;

        self.schedule_blocking(&b[..n], 4)
    }

    /// NMRA basic accessory decoder packet.
    pub fn set_accessory(&mut self, address: u16, number: u8, activate: bool) -> Result<(), Error> {
        let b0 = ((address % 64) + 128) as u8;
        let b1 = ((((address / 64) % 8) << 4) as u16 + ((number as u16 % 4) << 1) + u16::from(activate))
            as u8
            ^ 0xF8;

        self.schedule_blocking(&[b0, b1], 4)
    }

    /// Programming-on-the-main byte write: unverified, no ACK round trip.
    pub fn write_cv_byte_main(&mut self, cab: u16, cv: u16, value: u8) -> Result<(), Error> {
        let cv = cv.wrapping_sub(1);
        let mut b = [0u8; 5];
        let mut n = 0usize;
        if cab > 127 {
            b[n] = ((cab >> 8) as u8) | 0xC0;
            n += 1;
        }
        b[n] = (cab & 0xFF) as u8;
        n += 1;
        b[n] = 0xEC | ((cv >> 8) & 0x03) as u8;
        n += 1;
        b[n] = (cv & 0xFF) as u8;
        n += 1;
        b[n] = value;
        n += 1;

        self.schedule_blocking(&b[..n], 4)
    }

    /// Programming-on-the-main bit write: unverified.
    pub fn write_cv_bit_main(
        &mut self,
        cab: u16,
        cv: u16,
        bit: u8,
        value: u8,
    ) -> Result<(), Error> {
        let cv = cv.wrapping_sub(1);
        let value = value & 1;
        let bit = bit & 7;

        let mut b = [0u8; 5];
        let mut n = 0usize;
        if cab > 127 {
            b[n] = ((cab >> 8) as u8) | 0xC0;
            n += 1;
        }
        b[n] = (cab & 0xFF) as u8;
        n += 1;
        b[n] = 0xE8 | ((cv >> 8) & 0x03) as u8;
        n += 1;
        b[n] = (cv & 0xFF) as u8;
        n += 1;
        b[n] = 0xF0 | (value << 3) | bit;
        n += 1;

        self.schedule_blocking(&b[..n], 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdw() -> HardwareDescriptor {
        HardwareDescriptor {
            control_scheme: ControlScheme::DualDirection,
            current_conversion_factor: 1.0,
            trigger_ma: 2000.0,
        }
    }

    fn drain_pending(track: &mut Track) {
        // Tests don't run the interrupt side, so simulate pickup directly.
        track.engine.advance();
    }

    #[test]
    fn set_throttle_short_address_forward() {
        let mut track = Track::new(hdw(), 4);
        let resp = track.set_throttle(1, 3, 64, true).unwrap();
        assert_eq!(resp, ThrottleResponse { device: 1, speed: 64, direction: true });
        assert_eq!(track.speed_table_entry(1), Some(64));
        drain_pending(&mut track);
        assert_eq!(
            track.engine.current_packet().as_slice(),
            &[0x03, 0x3F, 64u8 + 1 + 128, 0x03 ^ 0x3F ^ (64u8 + 1 + 128)]
        );
    }

    #[test]
    fn set_throttle_long_address_uses_high_byte_marker() {
        let mut track = Track::new(hdw(), 4);
        track.set_throttle(1, 1000, 50, false).unwrap();
        drain_pending(&mut track);
        let addr_hi = ((1000u16 >> 8) as u8) | 0xC0;
        let addr_lo = (1000u16 & 0xFF) as u8;
        assert_eq!(
            track.engine.current_packet().as_slice()[0..2],
            [addr_hi, addr_lo]
        );
    }

    #[test]
    fn set_throttle_rejects_out_of_range_device() {
        let mut track = Track::new(hdw(), 2);
        assert_eq!(track.set_throttle(3, 3, 10, true), Err(Error::OutOfRange));
        assert_eq!(track.set_throttle(0, 3, 10, true), Err(Error::OutOfRange));
    }

    #[test]
    fn emergency_stop_zeroes_speed_table() {
        let mut track = Track::new(hdw(), 2);
        let resp = track.set_throttle(1, 3, -1, true).unwrap();
        assert_eq!(resp.speed, 0);
        assert_eq!(track.speed_table_entry(1), Some(0));
    }

    #[test]
    fn set_accessory_matches_worked_example() {
        let mut track = Track::new(hdw(), 1);
        track.set_accessory(22, 2, true).unwrap();
        drain_pending(&mut track);
        // byte1 = 22%64+128 = 150; byte2 = ((22/64%8)<<4)+(2<<1)+1 ^ 0xF8 = 0xFC
        assert_eq!(track.engine.current_packet().as_slice()[0..2], [150, 0xFC]);
    }

    #[test]
    fn write_cv_byte_main_decrements_cv_and_sets_instruction() {
        let mut track = Track::new(hdw(), 1);
        track.write_cv_byte_main(3, 29, 6).unwrap();
        drain_pending(&mut track);
        let cv = 29u16 - 1;
        assert_eq!(
            track.engine.current_packet().as_slice()[0..4],
            [3, 0xEC | ((cv >> 8) as u8 & 0x03), (cv & 0xFF) as u8, 6]
        );
    }

    #[test]
    fn write_cv_byte_main_accepts_long_address() {
        // cab > 127 adds the 0xC0 long-address marker byte, pushing the
        // payload to the full 5-byte `PACKET_MAX`; this must not be rejected.
        let mut track = Track::new(hdw(), 1);
        track.write_cv_byte_main(1000, 29, 6).unwrap();
        drain_pending(&mut track);
        let cv = 29u16 - 1;
        let addr_hi = ((1000u16 >> 8) as u8) | 0xC0;
        let addr_lo = (1000u16 & 0xFF) as u8;
        assert_eq!(
            track.engine.current_packet().as_slice()[0..5],
            [addr_hi, addr_lo, 0xEC | ((cv >> 8) as u8 & 0x03), (cv & 0xFF) as u8, 6]
        );
    }

    #[test]
    fn write_cv_bit_main_accepts_long_address() {
        let mut track = Track::new(hdw(), 1);
        track.write_cv_bit_main(1000, 29, 9, 5).unwrap();
        drain_pending(&mut track);
        let cv = 29u16 - 1;
        let addr_hi = ((1000u16 >> 8) as u8) | 0xC0;
        let addr_lo = (1000u16 & 0xFF) as u8;
        let expected_bit = 9 & 7;
        let expected_value = 5 & 1;
        assert_eq!(
            track.engine.current_packet().as_slice()[0..5],
            [
                addr_hi,
                addr_lo,
                0xE8 | ((cv >> 8) as u8 & 0x03),
                (cv & 0xFF) as u8,
                0xF0 | (expected_value << 3) | expected_bit
            ]
        );
    }

    #[test]
    fn write_cv_bit_main_masks_bit_and_value() {
        let mut track = Track::new(hdw(), 1);
        track.write_cv_bit_main(3, 29, 9, 5).unwrap();
        drain_pending(&mut track);
        let cv = 29u16 - 1;
        let expected_bit = 9 & 7;
        let expected_value = 5 & 1;
        assert_eq!(
            track.engine.current_packet().as_slice()[0..4],
            [
                3,
                0xE8 | ((cv >> 8) as u8 & 0x03),
                (cv & 0xFF) as u8,
                0xF0 | (expected_value << 3) | expected_bit
            ]
        );
    }
}
