//! Accessory object registries: turnouts, sensors, and general-purpose
//! output pins.
//!
//! The non-volatile store and the "real" registries are external
//! collaborators in the full system; this module defines the fixed
//! interface the command parser and service-mode driver need (`get`,
//! `create`, `remove`, iteration, activation) plus a small fixed-capacity
//! in-memory implementation usable standalone or as the default before a
//! persistent-backed one is wired in.

use crate::error::Error;
use crate::track::Track;
use heapless::Vec;

pub const MAX_TURNOUTS: usize = 32;
pub const MAX_OUTPUTS: usize = 32;
pub const MAX_SENSORS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct Turnout {
    pub address: u16,
    pub subaddress: u8,
    pub thrown: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct Output {
    pub pin: u8,
    pub active_low: bool,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, defmt::Format)]
pub struct Sensor {
    pub pin: u8,
    pub pullup: bool,
    pub active: bool,
}

pub trait TurnoutRegistry {
    fn get(&self, id: u16) -> Option<Turnout>;
    fn create(&mut self, id: u16, address: u16, subaddress: u8) -> Result<(), Error>;
    fn remove(&mut self, id: u16) -> Result<(), Error>;
    /// Drives the turnout's accessory decoder to `thrown` over `track`, and
    /// records the new state. Returns the state actually recorded.
    fn activate(&mut self, id: u16, thrown: bool, track: &mut Track) -> Result<bool, Error>;
    fn iter(&self) -> core::slice::Iter<'_, (u16, Turnout)>;
}

pub trait OutputRegistry {
    fn get(&self, id: u16) -> Option<Output>;
    fn create(&mut self, id: u16, pin: u8, active_low: bool) -> Result<(), Error>;
    fn remove(&mut self, id: u16) -> Result<(), Error>;
    fn activate(&mut self, id: u16, active: bool) -> Result<bool, Error>;
    fn iter(&self) -> core::slice::Iter<'_, (u16, Output)>;
}

pub trait SensorRegistry {
    fn get(&self, id: u16) -> Option<Sensor>;
    fn create(&mut self, id: u16, pin: u8, pullup: bool) -> Result<(), Error>;
    fn remove(&mut self, id: u16) -> Result<(), Error>;
    fn iter(&self) -> core::slice::Iter<'_, (u16, Sensor)>;
}

/// Persists (or discards) the current contents of the three registries.
/// The core only needs counts back, to report `<e nT nS nO>`.
///
/// Returns `Error::StorePending` if a previous `store` call is still being
/// written out (e.g. a flash-backed implementation mid-erase/write); the
/// registries are left untouched and the caller should retry.
pub trait Store {
    fn store(
        &mut self,
        turnouts: &dyn TurnoutRegistry,
        sensors: &dyn SensorRegistry,
        outputs: &dyn OutputRegistry,
    ) -> Result<(u16, u16, u16), Error>;

    fn clear(&mut self);
}

fn find<T: Copy>(items: &[(u16, T)], id: u16) -> Option<T> {
    items.iter().find(|(i, _)| *i == id).map(|(_, t)| *t)
}

fn find_mut<T>(items: &mut [(u16, T)], id: u16) -> Option<&mut T> {
    items.iter_mut().find(|(i, _)| *i == id).map(|(_, t)| t)
}

fn remove_by_id<T, const N: usize>(items: &mut Vec<(u16, T), N>, id: u16) -> Result<(), Error> {
    let pos = items.iter().position(|(i, _)| *i == id).ok_or(Error::NotFound)?;
    items.swap_remove(pos);
    Ok(())
}

/// Fixed-capacity, allocation-free registry set. Default wiring before a
/// persistent-backed store is plugged in; also what the unit tests use.
pub struct InMemoryRegistries {
    pub turnouts: Vec<(u16, Turnout), MAX_TURNOUTS>,
    pub outputs: Vec<(u16, Output), MAX_OUTPUTS>,
    pub sensors: Vec<(u16, Sensor), MAX_SENSORS>,
}

impl InMemoryRegistries {
    pub fn new() -> Self {
        Self {
            turnouts: Vec::new(),
            outputs: Vec::new(),
            sensors: Vec::new(),
        }
    }
}

impl Default for InMemoryRegistries {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnoutRegistry for InMemoryRegistries {
    fn get(&self, id: u16) -> Option<Turnout> {
        find(&self.turnouts, id)
    }

    fn create(&mut self, id: u16, address: u16, subaddress: u8) -> Result<(), Error> {
        self.turnouts
            .push((
                id,
                Turnout {
                    address,
                    subaddress,
                    thrown: false,
                },
            ))
            .map_err(|_| Error::OutOfRange)
    }

    fn remove(&mut self, id: u16) -> Result<(), Error> {
        remove_by_id(&mut self.turnouts, id)
    }

    fn activate(&mut self, id: u16, thrown: bool, track: &mut Track) -> Result<bool, Error> {
        let turnout = find_mut(&mut self.turnouts, id).ok_or(Error::NotFound)?;
        track.set_accessory(turnout.address, turnout.subaddress, thrown)?;
        turnout.thrown = thrown;
        Ok(thrown)
    }

    fn iter(&self) -> core::slice::Iter<'_, (u16, Turnout)> {
        self.turnouts.iter()
    }
}

impl OutputRegistry for InMemoryRegistries {
    fn get(&self, id: u16) -> Option<Output> {
        find(&self.outputs, id)
    }

    fn create(&mut self, id: u16, pin: u8, active_low: bool) -> Result<(), Error> {
        self.outputs
            .push((
                id,
                Output {
                    pin,
                    active_low,
                    active: false,
                },
            ))
            .map_err(|_| Error::OutOfRange)
    }

    fn remove(&mut self, id: u16) -> Result<(), Error> {
        remove_by_id(&mut self.outputs, id)
    }

    fn activate(&mut self, id: u16, active: bool) -> Result<bool, Error> {
        let output = find_mut(&mut self.outputs, id).ok_or(Error::NotFound)?;
        output.active = active;
        Ok(active)
    }

    fn iter(&self) -> core::slice::Iter<'_, (u16, Output)> {
        self.outputs.iter()
    }
}

impl SensorRegistry for InMemoryRegistries {
    fn get(&self, id: u16) -> Option<Sensor> {
        find(&self.sensors, id)
    }

    fn create(&mut self, id: u16, pin: u8, pullup: bool) -> Result<(), Error> {
        self.sensors
            .push((
                id,
                Sensor {
                    pin,
                    pullup,
                    active: false,
                },
            ))
            .map_err(|_| Error::OutOfRange)
    }

    fn remove(&mut self, id: u16) -> Result<(), Error> {
        remove_by_id(&mut self.sensors, id)
    }

    fn iter(&self) -> core::slice::Iter<'_, (u16, Sensor)> {
        self.sensors.iter()
    }
}

/// A `Store` that discards everything; used wherever persistence genuinely
/// isn't wired up (tests, or a build with no flash-backed store).
pub struct NullStore;

impl Store for NullStore {
    fn store(
        &mut self,
        turnouts: &dyn TurnoutRegistry,
        sensors: &dyn SensorRegistry,
        outputs: &dyn OutputRegistry,
    ) -> Result<(u16, u16, u16), Error> {
        Ok((
            turnouts.iter().count() as u16,
            sensors.iter().count() as u16,
            outputs.iter().count() as u16,
        ))
    }

    fn clear(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::ControlScheme;
    use crate::track::HardwareDescriptor;

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

    #[test]
    fn create_then_get_turnout() {
        let mut reg = InMemoryRegistries::new();
        TurnoutRegistry::create(&mut reg, 3, 100, 2).unwrap();
        assert_eq!(
            TurnoutRegistry::get(&reg, 3),
            Some(Turnout {
                address: 100,
                subaddress: 2,
                thrown: false
            })
        );
    }

    #[test]
    fn remove_unknown_turnout_is_not_found() {
        let mut reg = InMemoryRegistries::new();
        assert_eq!(
            TurnoutRegistry::remove(&mut reg, 9),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn activate_turnout_schedules_accessory_packet_and_records_state() {
        let mut reg = InMemoryRegistries::new();
        let mut t = track();
        TurnoutRegistry::create(&mut reg, 3, 100, 2).unwrap();
        let thrown = TurnoutRegistry::activate(&mut reg, 3, true, &mut t).unwrap();
        assert!(thrown);
        assert_eq!(TurnoutRegistry::get(&reg, 3).unwrap().thrown, true);
    }

    #[test]
    fn store_reports_counts_from_each_registry() {
        let mut reg = InMemoryRegistries::new();
        TurnoutRegistry::create(&mut reg, 1, 10, 0).unwrap();
        OutputRegistry::create(&mut reg, 1, 5, false).unwrap();
        SensorRegistry::create(&mut reg, 1, 6, true).unwrap();
        SensorRegistry::create(&mut reg, 2, 7, true).unwrap();

        let mut store = NullStore;
        let counts = store.store(&reg, &reg, &reg).unwrap();
        assert_eq!(counts, (1, 2, 1));
    }
}
