//! Service-Mode Driver: the programming-track protocol for CV read/write,
//! with current-pulse ACK detection.
//!
//! Every operation here assumes exclusive use of the programming track's
//! packet engine for the duration of the call; the foreground blocks until
//! the sequence completes (tens to hundreds of milliseconds on real
//! hardware), which is fine because the command grammar never interleaves
//! another programming-track command while one is in flight.

#[cfg(test)]
use crate::engine::ScheduleError;
use crate::error::Error;
use crate::track::Track;

/// How many current-sense samples are averaged into the pre-operation baseline.
pub const ACK_BASE_COUNT: u16 = 50;
/// How many current-sense samples are taken (and smoothed) while watching for ACK.
pub const ACK_SAMPLE_COUNT: u16 = 500;
/// Smoothing factor for the exponential moving average over ACK samples.
pub const ACK_SAMPLE_SMOOTHING: f32 = 0.2;
/// Deviation above baseline, in raw ADC counts, that counts as a detected ACK pulse.
pub const ACK_SAMPLE_THRESHOLD: f32 = 30.0;

/// Reads the programming track's current-sense input. Infallible: a polling
/// ADC read never fails on this hardware.
pub trait CurrentSense {
    fn sample(&mut self) -> f32;
}

/// Result of a service-mode CV operation. `value` is `-1` when no ACK was
/// detected; `cv` is reported 1-based, matching the command's input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct ServiceModeResponse {
    pub callback: u16,
    pub callback_sub: u16,
    pub cv: u16,
    pub value: i16,
}

/// As [`ServiceModeResponse`], with the written/read bit number also echoed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct BitResponse {
    pub callback: u16,
    pub callback_sub: u16,
    pub cv: u16,
    pub bit: u8,
    pub value: i16,
}

fn average_samples<S: CurrentSense>(sense: &mut S, count: u16) -> f32 {
    let mut total = 0.0f32;
    for _ in 0..count {
        total += sense.sample();
    }
    total / count as f32
}

/// Samples `ACK_SAMPLE_COUNT` times against `base`, smoothing the deviation
/// with an exponential moving average. Returns whether the average ever
/// crossed `ACK_SAMPLE_THRESHOLD`.
fn detect_ack<S: CurrentSense>(sense: &mut S, base: f32) -> bool {
    let mut smoothed = 0.0f32;
    let mut detected = false;
    for _ in 0..ACK_SAMPLE_COUNT {
        let deviation = sense.sample() - base;
        smoothed = deviation * ACK_SAMPLE_SMOOTHING + smoothed * (1.0 - ACK_SAMPLE_SMOOTHING);
        if smoothed > ACK_SAMPLE_THRESHOLD {
            detected = true;
        }
    }
    detected
}

/// Stages `payload` on `track`, waiting out the pending slot as needed.
///
/// On real hardware the waveform generator's timer interrupt drains the
/// pending slot concurrently with this spin, so a plain busy-wait (as
/// `Track::schedule_blocking` does) is correct there. A host test build has
/// no concurrent interrupt, so here the wait step itself stands in for the
/// interrupt's pickup — safe because every service-mode operation has
/// exclusive use of the track for its duration, so nothing else can be
/// sitting in the pending slot.
#[cfg(not(test))]
fn issue(track: &mut Track, payload: &[u8], repeats: u8) -> Result<(), Error> {
    track.schedule_blocking(payload, repeats)
}

#[cfg(test)]
fn issue(track: &mut Track, payload: &[u8], repeats: u8) -> Result<(), Error> {
    loop {
        match track.try_schedule(payload, repeats) {
            Ok(()) => return Ok(()),
            Err(ScheduleError::PacketTooLong) => return Err(Error::PacketTooLong),
            Err(ScheduleError::PendingSlotOccupied) => track.engine.advance(),
        }
    }
}

fn schedule_reset(track: &mut Track, repeats: u8) -> Result<(), Error> {
    issue(track, &[0x00, 0x00], repeats)
}

fn schedule_idle(track: &mut Track, repeats: u8) -> Result<(), Error> {
    issue(track, &[0xFF, 0x00], repeats)
}

/// Write-Byte service-mode instruction, then Verify-Byte re-check, with ACK
/// detection between the two rounds.
pub fn write_cv_byte<S: CurrentSense>(
    track: &mut Track,
    sense: &mut S,
    cv: u16,
    value: u8,
    callback: u16,
    callback_sub: u16,
) -> Result<ServiceModeResponse, Error> {
    let cv0 = cv.wrapping_sub(1);
    let write_instr = 0x7C | ((cv0 >> 8) & 0x03) as u8;
    let verify_instr = 0x74 | ((cv0 >> 8) & 0x03) as u8;
    let payload_bytes = [(cv0 & 0xFF) as u8, value];

    schedule_reset(track, 3)?;
    issue(track, &[write_instr, payload_bytes[0], payload_bytes[1]], 5)?;
    issue(track, &[write_instr, payload_bytes[0], payload_bytes[1]], 6)?;

    let base = average_samples(sense, ACK_BASE_COUNT);

    schedule_reset(track, 3)?;
    issue(track, &[verify_instr, payload_bytes[0], payload_bytes[1]], 5)?;
    issue(track, &[verify_instr, payload_bytes[0], payload_bytes[1]], 6)?;

    let detected = detect_ack(sense, base);

    schedule_reset(track, 1)?;

    Ok(ServiceModeResponse {
        callback,
        callback_sub,
        cv: cv0 + 1,
        value: if detected { value as i16 } else { -1 },
    })
}

/// Write-Bit service-mode instruction, then Verify-Bit re-check.
pub fn write_cv_bit<S: CurrentSense>(
    track: &mut Track,
    sense: &mut S,
    cv: u16,
    bit: u8,
    value: u8,
    callback: u16,
    callback_sub: u16,
) -> Result<BitResponse, Error> {
    let cv0 = cv.wrapping_sub(1);
    let value = value & 1;
    let bit = bit & 7;

    let write_instr = 0x78 | ((cv0 >> 8) & 0x03) as u8;
    let verify_instr = write_instr & !0x10; // clear bit 4: Write Bit -> Verify Bit
    let data_byte = 0xF0 | (value << 3) | bit;

    schedule_reset(track, 3)?;
    issue(track, &[write_instr, (cv0 & 0xFF) as u8, data_byte], 5)?;
    issue(track, &[write_instr, (cv0 & 0xFF) as u8, data_byte], 6)?;

    let base = average_samples(sense, ACK_BASE_COUNT);

    schedule_reset(track, 3)?;
    issue(track, &[verify_instr, (cv0 & 0xFF) as u8, data_byte], 5)?;
    issue(track, &[verify_instr, (cv0 & 0xFF) as u8, data_byte], 6)?;

    let detected = detect_ack(sense, base);

    schedule_reset(track, 1)?;

    Ok(BitResponse {
        callback,
        callback_sub,
        cv: cv0 + 1,
        bit,
        value: if detected { value as i16 } else { -1 },
    })
}

/// Eight Verify-Bit probes (one per bit, value assumed 1) followed by a
/// Verify-Byte confirmation of the assembled byte.
pub fn read_cv<S: CurrentSense>(
    track: &mut Track,
    sense: &mut S,
    cv: u16,
    callback: u16,
    callback_sub: u16,
) -> Result<ServiceModeResponse, Error> {
    let cv0 = cv.wrapping_sub(1);
    let verify_instr = 0x78 | ((cv0 >> 8) & 0x03) as u8;

    let mut value: u8 = 0;
    for i in 0..8u8 {
        let base = average_samples(sense, ACK_BASE_COUNT);

        schedule_reset(track, 3)?;
        issue(track, &[verify_instr, (cv0 & 0xFF) as u8, 0xE8 | i], 5)?;
        schedule_idle(track, 6)?;

        if detect_ack(sense, base) {
            value |= 1 << i;
        }
    }

    let byte_verify_instr = 0x74 | ((cv0 >> 8) & 0x03) as u8;
    let base = average_samples(sense, ACK_BASE_COUNT);

    schedule_reset(track, 3)?;
    issue(track, &[byte_verify_instr, (cv0 & 0xFF) as u8, value], 5)?;
    schedule_idle(track, 6)?;

    let detected = detect_ack(sense, base);
    schedule_reset(track, 1)?;

    Ok(ServiceModeResponse {
        callback,
        callback_sub,
        cv: cv0 + 1,
        value: if detected { value as i16 } else { -1 },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::HardwareDescriptor;
    use crate::waveform::ControlScheme;

    fn track() -> Track {
        Track::new(
            HardwareDescriptor {
                control_scheme: ControlScheme::DualDirection,
                current_conversion_factor: 1.0,
                trigger_ma: 2000.0,
            },
            1,
        )
    }

    /// Always reports the same baseline: no ACK is ever detected.
    struct FlatSense;
    impl CurrentSense for FlatSense {
        fn sample(&mut self) -> f32 {
            100.0
        }
    }

    /// Reports an ACK pulse once `ACK_BASE_COUNT` baseline samples have gone by.
    struct PulseAfterBaseline {
        samples_seen: u32,
    }
    impl CurrentSense for PulseAfterBaseline {
        fn sample(&mut self) -> f32 {
            self.samples_seen += 1;
            if self.samples_seen > ACK_BASE_COUNT as u32 {
                160.0
            } else {
                100.0
            }
        }
    }

    #[test]
    fn write_cv_byte_reports_minus_one_without_ack() {
        let mut t = track();
        let mut sense = FlatSense;
        let resp = write_cv_byte(&mut t, &mut sense, 29, 6, 10, 20).unwrap();
        assert_eq!(resp.cv, 29);
        assert_eq!(resp.value, -1);
        assert_eq!(resp.callback, 10);
        assert_eq!(resp.callback_sub, 20);
    }

    #[test]
    fn write_cv_byte_reports_value_on_ack() {
        let mut t = track();
        let mut sense = PulseAfterBaseline { samples_seen: 0 };
        let resp = write_cv_byte(&mut t, &mut sense, 29, 6, 10, 20).unwrap();
        assert_eq!(resp.value, 6);
    }

    #[test]
    fn write_cv_bit_masks_bit_and_value() {
        let mut t = track();
        let mut sense = PulseAfterBaseline { samples_seen: 0 };
        let resp = write_cv_bit(&mut t, &mut sense, 5, 9, 7, 1, 2).unwrap();
        assert_eq!(resp.bit, 9 & 7);
        assert_eq!(resp.value, (7 & 1) as i16);
    }

    #[test]
    fn read_cv_without_ack_reports_minus_one() {
        let mut t = track();
        let mut sense = FlatSense;
        let resp = read_cv(&mut t, &mut sense, 1, 7, 8).unwrap();
        assert_eq!(resp.value, -1);
        assert_eq!(resp.cv, 1);
    }
}
