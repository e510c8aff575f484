use core::fmt;
use core::str::FromStr;

use serde::Serialize;

use crate::config::{PciClassCode, PCI_BAR_COUNT};

/// PCI bus/device/function identifier.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    /// The caller keeps the values within the PCI ranges: device < 32, function < 8.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Packs this BDF the way `AX`/`BX` carry it into an option ROM's init entry:
    /// bus in bits 15:8, device in 7:3, function in 2:0.
    pub const fn pack_u16(self) -> u16 {
        debug_assert!(self.device < 32);
        debug_assert!(self.function < 8);
        ((self.bus as u16) << 8) | ((self.device as u16) << 3) | (self.function as u16)
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("invalid PCI address {0:?} (expected BB:DD.F in hex)")]
pub struct ParseBdfError(String);

impl FromStr for PciBdf {
    type Err = ParseBdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseBdfError(s.to_string());
        let (bus, rest) = s.split_once(':').ok_or_else(err)?;
        let (device, function) = rest.split_once('.').ok_or_else(err)?;

        let bus = u8::from_str_radix(bus, 16).map_err(|_| err())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| err())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| err())?;
        if device >= 32 || function >= 8 {
            return Err(err());
        }
        Ok(Self::new(bus, device, function))
    }
}

/// What the engine is told about the emulated device when it is initialised.
///
/// Besides the raw header fields this carries the decoded BAR and ROM lengths, which are not part
/// of configuration space itself.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct PciDeviceInfo {
    pub bdf: PciBdf,
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub class_code: PciClassCode,
    pub header_type: u8,
    pub bar_base: [u32; PCI_BAR_COUNT],
    pub bar_len: [u32; PCI_BAR_COUNT],
    pub rom_base: u32,
    pub rom_len: u32,
}

#[cfg(test)]
mod tests {
    use super::PciBdf;

    #[test]
    fn bdf_text_form() {
        let bdf: PciBdf = "00:1f.3".parse().unwrap();
        assert_eq!(bdf, PciBdf::new(0, 0x1f, 3));
        assert_eq!(bdf.to_string(), "00:1f.3");
        assert!("00:20.0".parse::<PciBdf>().is_err());
        assert!("0:1".parse::<PciBdf>().is_err());
    }

    #[test]
    fn bdf_packs_like_the_rom_init_registers() {
        let bdf = PciBdf::new(1, 2, 3);
        assert_eq!(bdf.pack_u16(), 0x0113);
        assert_eq!(PciBdf::new(0, 0x1f, 7).pack_u16(), 0x00FF);
    }
}
