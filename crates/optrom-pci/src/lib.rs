//! A virtual PCI type-0 configuration space for running option ROMs.
//!
//! [`Device`] owns a 256-byte register image and the six BAR slots behind it. It is built once
//! from a [`DeviceDescriptor`] (plus the already-loaded ROM) and then serves every trapped
//! configuration access from the emulation engine through [`Device::access`] or the
//! function-code based [`PciConfigAccess`] contract.

mod access;
mod config;
mod descriptor;
mod device;
mod info;

pub use access::{AccessDirection, AccessError, AccessWidth, PciAccessFunc, PciConfigAccess};
pub use config::{
    bar_offset, PciClassCode, PciVendorDeviceId, PCI_BAR0_OFFSET, PCI_BAR_COUNT,
    PCI_BAR_MEM_ADDR_MASK, PCI_CLASS_CODE_OFFSET, PCI_COMMAND_OFFSET, PCI_CONFIG_SPACE_SIZE,
    PCI_DEVICE_ID_OFFSET, PCI_EXPANSION_ROM_OFFSET, PCI_HEADER_TYPE_OFFSET, PCI_STATUS_OFFSET,
    PCI_VENDOR_ID_OFFSET,
};
pub use descriptor::{DeviceDescriptor, FieldValue, ResolvedDescriptor};
pub use device::{BarSlot, BuildError, Device, RomRegion};
pub use info::{ParseBdfError, PciBdf, PciDeviceInfo};
