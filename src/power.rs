//! Power Supervisor: per-track overcurrent trip/retry state machine
//! (component D). Runs on a fixed periodic foreground tick, independent of
//! whatever the Packet Engine is currently transmitting.

/// Smoothing factor for the per-tick current reading.
pub const CURRENT_SAMPLE_SMOOTHING: f32 = 0.01;
/// How long a tripped track stays disabled before the supervisor retries.
pub const RETRY_MILLIS: u32 = 1000;

/// A monotonic millisecond clock. Backed by the RTIC monotonic timer on
/// real hardware; a plain counter in tests.
pub trait Clock {
    fn now_millis(&self) -> u32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
enum State {
    Armed,
    Tripped { since: u32 },
}

/// Per-track overcurrent supervisor. Owns the smoothed current reading and
/// the armed/tripped state; does not own the enable pin itself (the caller
/// drives it from [`PowerSupervisor::tick`]'s return value, or directly via
/// `power_on`/`power_off`).
pub struct PowerSupervisor {
    trigger_ma: f32,
    current_conversion_factor: f32,
    reading: f32,
    state: State,
    enabled: bool,
}

/// What the caller should do to the enable pin this tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub enum EnableAction {
    Hold,
    Assert,
    Deassert,
}

impl PowerSupervisor {
    pub fn new(trigger_ma: f32, current_conversion_factor: f32) -> Self {
        Self {
            trigger_ma,
            current_conversion_factor,
            reading: 0.0,
            state: State::Armed,
            enabled: false,
        }
    }

    /// Unconditionally arms and asserts the enable pin.
    pub fn power_on(&mut self) -> EnableAction {
        self.state = State::Armed;
        self.enabled = true;
        EnableAction::Assert
    }

    /// Deasserts the enable pin, regardless of trip state.
    pub fn power_off(&mut self) -> EnableAction {
        self.enabled = false;
        EnableAction::Deassert
    }

    /// Smoothed current reading, in mA.
    pub fn get_last_read(&self) -> f32 {
        self.reading * self.current_conversion_factor
    }

    pub fn is_tripped(&self) -> bool {
        matches!(self.state, State::Tripped { .. })
    }

    /// One periodic check (every `CURRENT_SAMPLE_TIME`, ~1 ms). `sample` is
    /// a raw current-sense reading; `clock` provides `now`.
    pub fn tick<C: Clock>(&mut self, sample: f32, clock: &C) -> EnableAction {
        self.reading = sample * CURRENT_SAMPLE_SMOOTHING + self.reading * (1.0 - CURRENT_SAMPLE_SMOOTHING);
        let current_ma = self.get_last_read();

        match self.state {
            State::Armed if current_ma > self.trigger_ma && self.enabled => {
                let now = clock.now_millis();
                self.state = State::Tripped { since: now };
                self.enabled = false;
                EnableAction::Deassert
            }
            State::Tripped { since } => {
                let now = clock.now_millis();
                if current_ma < self.trigger_ma && now.wrapping_sub(since) > RETRY_MILLIS {
                    self.state = State::Armed;
                    self.enabled = true;
                    EnableAction::Assert
                } else {
                    EnableAction::Hold
                }
            }
            State::Armed => EnableAction::Hold,
        }
    }
}
