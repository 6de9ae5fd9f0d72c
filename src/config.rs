//! On-flash station configuration: per-track hardware descriptors and the
//! main track's device count.
//!
//! Grounded in the teacher's `Flash::read` / `erase_write_sector` /
//! `erase_write_page` persistence pattern; there's no `packed_struct`/
//! `serde` here, just a fixed byte layout, matching how little this struct
//! actually holds.

use hal::flash::{Bank, Flash};

use crate::track::HardwareDescriptor;
use crate::waveform::ControlScheme;

#[cfg(feature = "h7")]
const FLASH_CFG_SECTOR: usize = 7;
#[cfg(feature = "g4")]
const FLASH_CFG_PAGE: usize = 127;

const MAGIC: u32 = 0xDCC5_7A71;
const DESCRIPTOR_LEN: usize = 9; // 1 (scheme tag) + 4 (conversion factor) + 4 (trigger mA)
const CFG_LEN: usize = 4 + 2 * DESCRIPTOR_LEN + 1;

/// Persisted station configuration: both tracks' hardware descriptors plus
/// the main track's device count. The accessory registries and the
/// programming-track current-sense calibration live elsewhere (the
/// registries have their own [`crate::registry::Store`]).
#[derive(Clone, Copy, Debug, PartialEq, defmt::Format)]
pub struct StationCfg {
    pub main: HardwareDescriptor,
    pub prog: HardwareDescriptor,
    pub num_dev: u8,
}

impl Default for StationCfg {
    fn default() -> Self {
        Self {
            main: HardwareDescriptor {
                control_scheme: ControlScheme::DualDirection,
                current_conversion_factor: 1.0,
                trigger_ma: 2_000.0,
            },
            prog: HardwareDescriptor {
                control_scheme: ControlScheme::DualDirection,
                current_conversion_factor: 1.0,
                trigger_ma: 250.0,
            },
            num_dev: 10,
        }
    }
}

impl StationCfg {
    fn to_bytes(&self) -> [u8; CFG_LEN] {
        let mut buf = [0u8; CFG_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        encode_descriptor(&self.main, &mut buf[4..4 + DESCRIPTOR_LEN]);
        encode_descriptor(&self.prog, &mut buf[4 + DESCRIPTOR_LEN..4 + 2 * DESCRIPTOR_LEN]);
        buf[CFG_LEN - 1] = self.num_dev;
        buf
    }

    fn from_bytes(buf: &[u8; CFG_LEN]) -> Option<Self> {
        if buf[0..4] != MAGIC.to_le_bytes() {
            return None;
        }
        let main = decode_descriptor(&buf[4..4 + DESCRIPTOR_LEN])?;
        let prog = decode_descriptor(&buf[4 + DESCRIPTOR_LEN..4 + 2 * DESCRIPTOR_LEN])?;
        Some(Self {
            main,
            prog,
            num_dev: buf[CFG_LEN - 1],
        })
    }

    /// Loads the persisted configuration, falling back to [`Default`] if
    /// flash hasn't been written yet (erased flash reads back as `0xFF`,
    /// which never matches [`MAGIC`]).
    pub fn load(flash: &mut Flash) -> Self {
        let mut buf = [0u8; CFG_LEN];
        #[cfg(feature = "h7")]
        flash.read(Bank::B1, FLASH_CFG_SECTOR, 0, &mut buf);
        #[cfg(feature = "g4")]
        flash.read(Bank::B1, FLASH_CFG_PAGE, 0, &mut buf);
        Self::from_bytes(&buf).unwrap_or_default()
    }

    pub fn save(&self, flash: &mut Flash) {
        let buf = self.to_bytes();
        #[cfg(feature = "h7")]
        flash.erase_write_sector(Bank::B1, FLASH_CFG_SECTOR, &buf).ok();
        #[cfg(feature = "g4")]
        flash.erase_write_page(Bank::B1, FLASH_CFG_PAGE, &buf).ok();
    }
}

fn encode_descriptor(d: &HardwareDescriptor, out: &mut [u8]) {
    out[0] = match d.control_scheme {
        ControlScheme::DualDirection => 0,
        ControlScheme::DualDirectionInverted => 1,
        ControlScheme::DirectionBrakeEnable => 2,
    };
    out[1..5].copy_from_slice(&d.current_conversion_factor.to_le_bytes());
    out[5..9].copy_from_slice(&d.trigger_ma.to_le_bytes());
}

fn decode_descriptor(buf: &[u8]) -> Option<HardwareDescriptor> {
    let control_scheme = match buf[0] {
        0 => ControlScheme::DualDirection,
        1 => ControlScheme::DualDirectionInverted,
        2 => ControlScheme::DirectionBrakeEnable,
        _ => return None,
    };
    let current_conversion_factor = f32::from_le_bytes(buf[1..5].try_into().ok()?);
    let trigger_ma = f32::from_le_bytes(buf[5..9].try_into().ok()?);
    Some(HardwareDescriptor {
        control_scheme,
        current_conversion_factor,
        trigger_ma,
    })
}
