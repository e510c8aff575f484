use bitflags::bitflags;
use optrom_pci::{
    bar_offset, AccessError, PciAccessFunc, PciClassCode, PciConfigAccess, PciDeviceInfo,
    PCI_BAR_COUNT, PCI_BAR_MEM_ADDR_MASK, PCI_CLASS_CODE_OFFSET, PCI_DEVICE_ID_OFFSET,
    PCI_EXPANSION_ROM_OFFSET, PCI_HEADER_TYPE_OFFSET, PCI_VENDOR_ID_OFFSET,
};
use serde::Serialize;

use crate::rom::RomHeader;

bitflags! {
    /// Diagnostics the engine emits while running the ROM.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        const DECODE = 1 << 0;
        const TRACE_CALL = 1 << 1;
        const MEM_TRACE = 1 << 2;
        const TRACE = 1 << 3;
    }
}

impl Default for DebugFlags {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub debug: DebugFlags,
    /// Size of the real-mode memory the engine emulates.
    pub memory_size: u32,
}

pub const DEFAULT_ENGINE_MEMORY: u32 = 64 * 1024;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug: DebugFlags::default(),
            memory_size: DEFAULT_ENGINE_MEMORY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("engine used before init")]
    NotInitialized,

    #[error("engine memory size must be non-zero")]
    NoMemory,

    #[error("{0}")]
    Other(String),
}

/// The x86 emulation engine that runs an option ROM against a device.
///
/// `init` is called once with the device snapshot; `run` then drives every configuration access
/// through the accessor.
pub trait BiosEngine {
    fn init(
        &mut self,
        config: &EngineConfig,
        info: &PciDeviceInfo,
        rom: &RomHeader,
    ) -> Result<(), EngineError>;

    fn run(&mut self, device: &mut dyn PciConfigAccess) -> Result<ProbeReport, EngineError>;
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct BarProbe {
    pub index: u8,
    pub base: u32,
    pub mask: u32,
    pub size: u64,
}

/// What the engine saw of the device.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ProbeReport {
    /// Bus/device/function as `AX` carries it into the ROM's init entry.
    pub init_ax: u16,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: PciClassCode,
    pub header_type: u8,
    pub bars: Vec<BarProbe>,
    pub rom_base: u32,
    pub accesses: u64,
}

/// Built-in engine doing what option-ROM PCI setup code does first: identify the device, size
/// its BARs and locate the expansion ROM.
#[derive(Debug, Default)]
pub struct ConfigProbeEngine {
    session: Option<Session>,
}

#[derive(Debug)]
struct Session {
    config: EngineConfig,
    info: PciDeviceInfo,
}

impl ConfigProbeEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BiosEngine for ConfigProbeEngine {
    fn init(
        &mut self,
        config: &EngineConfig,
        info: &PciDeviceInfo,
        rom: &RomHeader,
    ) -> Result<(), EngineError> {
        if config.memory_size == 0 {
            return Err(EngineError::NoMemory);
        }
        if rom.declared_len > config.memory_size {
            tracing::warn!(
                declared = rom.declared_len,
                memory = config.memory_size,
                "option ROM is larger than the engine memory"
            );
        }
        if config.debug.contains(DebugFlags::DECODE) {
            tracing::debug!(
                bdf = %info.bdf,
                ax = format_args!("{:#06x}", info.bdf.pack_u16()),
                entry = format_args!("{:02x?}", rom.init_entry),
                rom_base = format_args!("{:#010x}", info.rom_base),
                "engine initialised"
            );
        }
        if config.debug.contains(DebugFlags::MEM_TRACE) {
            tracing::debug!(
                memory = config.memory_size,
                rom_len = info.rom_len,
                "engine memory layout"
            );
        }
        self.session = Some(Session {
            config: *config,
            info: info.clone(),
        });
        Ok(())
    }

    fn run(&mut self, device: &mut dyn PciConfigAccess) -> Result<ProbeReport, EngineError> {
        let session = self.session.as_ref().ok_or(EngineError::NotInitialized)?;
        let mut dev = Traced {
            inner: device,
            enabled: session.config.debug.contains(DebugFlags::TRACE),
            accesses: 0,
        };

        let vendor_id = dev.read_word(PCI_VENDOR_ID_OFFSET as u16)?;
        let device_id = dev.read_word(PCI_DEVICE_ID_OFFSET as u16)?;
        let class_dword = dev.read_dword(PCI_CLASS_CODE_OFFSET as u16)?;
        let class_code = PciClassCode::from_dword(class_dword);
        let header_type = dev.read_byte(PCI_HEADER_TYPE_OFFSET as u16)?;

        let mut bars = Vec::with_capacity(PCI_BAR_COUNT);
        for index in 0..PCI_BAR_COUNT {
            let offset = bar_offset(index) as u16;
            let base = dev.read_dword(offset)?;
            dev.write_dword(offset, 0xFFFF_FFFF)?;
            let mask = dev.read_dword(offset)?;
            dev.write_dword(offset, base)?;

            // A register that simply echoes all-ones back decodes nothing.
            let size = match mask & PCI_BAR_MEM_ADDR_MASK {
                _ if mask == 0xFFFF_FFFF => 0,
                0 => 0,
                bits => u64::from(!bits) + 1,
            };
            if session.config.debug.contains(DebugFlags::TRACE_CALL) {
                tracing::debug!(
                    bar = index,
                    base = format_args!("{base:#010x}"),
                    size,
                    "BAR sized"
                );
            }
            let declared = u64::from(session.info.bar_len[index]);
            if size < declared {
                tracing::warn!(
                    bar = index,
                    size,
                    declared,
                    "BAR reports a smaller window than declared"
                );
            }
            bars.push(BarProbe {
                index: index as u8,
                base,
                mask,
                size,
            });
        }

        let rom_base = dev.read_dword(PCI_EXPANSION_ROM_OFFSET as u16)?;
        if rom_base != session.info.rom_base {
            tracing::warn!(
                read = format_args!("{rom_base:#010x}"),
                expected = format_args!("{:#010x}", session.info.rom_base),
                "expansion ROM base differs from the loaded image"
            );
        }

        Ok(ProbeReport {
            init_ax: session.info.bdf.pack_u16(),
            vendor_id,
            device_id,
            class_code,
            header_type,
            bars,
            rom_base,
            accesses: dev.accesses,
        })
    }
}

/// Counts accesses and logs each one when tracing is on.
struct Traced<'a> {
    inner: &'a mut dyn PciConfigAccess,
    enabled: bool,
    accesses: u64,
}

impl PciConfigAccess for Traced<'_> {
    fn access_reg(
        &mut self,
        index: u16,
        value: u32,
        func: PciAccessFunc,
    ) -> Result<u32, AccessError> {
        self.accesses += 1;
        let result = self.inner.access_reg(index, value, func);
        if self.enabled {
            tracing::trace!(
                ?func,
                offset = format_args!("{index:#04x}"),
                value = format_args!("{value:#010x}"),
                ?result,
                "config access"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use optrom_pci::{
        AccessError, PciAccessFunc, PciBdf, PciClassCode, PciConfigAccess, PciDeviceInfo,
    };

    use super::{BiosEngine, ConfigProbeEngine, DebugFlags, EngineConfig, EngineError};
    use crate::rom::RomHeader;

    /// A bare register file with one 4 KiB BAR at slot 1. The other BAR registers store
    /// whatever is written to them.
    struct FakeBars {
        regs: [u32; 64],
        probing: bool,
    }

    impl PciConfigAccess for FakeBars {
        fn access_reg(
            &mut self,
            index: u16,
            value: u32,
            func: PciAccessFunc,
        ) -> Result<u32, AccessError> {
            let slot = usize::from(index / 4);
            let shift = u32::from(index % 4) * 8;
            match func {
                PciAccessFunc::ReadDword if index == 0x14 && self.probing => {
                    self.probing = false;
                    Ok(0xFFFF_F000)
                }
                PciAccessFunc::ReadDword => Ok(self.regs[slot]),
                PciAccessFunc::ReadWord => Ok((self.regs[slot] >> shift) & 0xFFFF),
                PciAccessFunc::ReadByte => Ok((self.regs[slot] >> shift) & 0xFF),
                PciAccessFunc::WriteDword if index == 0x14 && value == 0xFFFF_FFFF => {
                    self.probing = true;
                    Ok(value)
                }
                PciAccessFunc::WriteDword => {
                    self.regs[slot] = value;
                    Ok(value)
                }
                _ => Err(AccessError::OutOfRange {
                    offset: index,
                    width: func.width(),
                }),
            }
        }
    }

    fn info() -> PciDeviceInfo {
        PciDeviceInfo {
            bdf: PciBdf::new(0, 2, 0),
            vendor_id: 0x8086,
            device_id: 0x100E,
            command: 0,
            status: 0,
            class_code: PciClassCode {
                class: 0x02,
                ..Default::default()
            },
            header_type: 0,
            bar_base: [0, 0xE000_0000, 0, 0, 0, 0],
            bar_len: [0, 0x1000, 0, 0, 0, 0],
            rom_base: 0xC0000,
            rom_len: 0x800,
        }
    }

    fn header() -> RomHeader {
        RomHeader::parse(&[0x55, 0xAA, 0x04, 0xEB, 0x10, 0x90]).unwrap()
    }

    #[test]
    fn defaults_match_the_classic_engine_setup() {
        let config = EngineConfig::default();
        assert_eq!(config.memory_size, 0x1_0000);
        assert_eq!(config.debug, DebugFlags::all());
        assert!(config.debug.contains(DebugFlags::TRACE_CALL | DebugFlags::MEM_TRACE));
    }

    #[test]
    fn run_requires_init() {
        let mut dev = FakeBars {
            regs: [0; 64],
            probing: false,
        };
        let err = ConfigProbeEngine::new().run(&mut dev).unwrap_err();
        assert!(matches!(err, EngineError::NotInitialized));
    }

    #[test]
    fn zero_engine_memory_is_rejected() {
        let config = EngineConfig {
            memory_size: 0,
            ..Default::default()
        };
        let err = ConfigProbeEngine::new()
            .init(&config, &info(), &header())
            .unwrap_err();
        assert!(matches!(err, EngineError::NoMemory));
    }

    #[test]
    fn probes_identity_bars_and_rom() {
        let mut regs = [0u32; 64];
        regs[0] = 0x100E_8086;
        regs[2] = 0x0200_0003;
        regs[5] = 0xE000_0000;
        regs[12] = 0x000C_0000;
        let mut dev = FakeBars {
            regs,
            probing: false,
        };

        let mut engine = ConfigProbeEngine::new();
        engine
            .init(&EngineConfig::default(), &info(), &header())
            .unwrap();
        let report = engine.run(&mut dev).unwrap();

        assert_eq!((report.vendor_id, report.device_id), (0x8086, 0x100E));
        assert_eq!(report.class_code.class, 0x02);
        assert_eq!(report.class_code.revision_id, 0x03);
        assert_eq!(report.bars.len(), 6);
        assert_eq!(report.bars[1].base, 0xE000_0000);
        assert_eq!(report.bars[1].mask, 0xFFFF_F000);
        assert_eq!(report.bars[1].size, 0x1000);
        assert!(report.bars.iter().filter(|bar| bar.index != 1).all(|bar| bar.size == 0));
        assert_eq!(report.rom_base, 0xC0000);
        // 4 identity reads, 4 accesses per BAR, 1 ROM read.
        assert_eq!(report.accesses, 4 + 6 * 4 + 1);
        assert_eq!(dev.regs[5], 0xE000_0000);
        assert_eq!(dev.regs[4], 0);
        assert_eq!(report.bars[0].mask, 0xFFFF_FFFF);
        assert_eq!(report.init_ax, 0x0010);
    }
}
