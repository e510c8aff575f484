//! Runs a PCI option ROM against an emulated configuration space.
//!
//! [`analyze`] reads a JSON device descriptor, loads the ROM it names into low memory, builds the
//! [`Device`](optrom_pci::Device) and hands both to a [`BiosEngine`]. Every allocation made on the
//! way is released again whether the run succeeds or not.

pub mod engine;
pub mod error;
pub mod rom;

use std::fs;
use std::path::{Path, PathBuf};

use optrom_lowmem::LowMemory;
use optrom_pci::{Device, DeviceDescriptor, PciBdf, PciDeviceInfo};
use serde::Serialize;

pub use engine::{BiosEngine, ConfigProbeEngine, DebugFlags, EngineConfig, EngineError, ProbeReport};
pub use error::AnalyzerError;
pub use rom::{LoadedRom, RomHeader};

#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub bdf: PciBdf,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub descriptor: PathBuf,
    pub rom_path: PathBuf,
    pub rom: RomHeader,
    pub device: PciDeviceInfo,
    pub probe: ProbeReport,
}

/// Parses a descriptor file.
pub fn load_descriptor(path: &Path) -> Result<DeviceDescriptor, AnalyzerError> {
    let text = fs::read_to_string(path).map_err(|err| AnalyzerError::io(path, err))?;
    serde_json::from_str(&text).map_err(|source| AnalyzerError::DescriptorParse {
        path: path.to_path_buf(),
        source,
    })
}

/// `rom` is resolved against the descriptor's directory unless it is absolute.
pub fn rom_path(
    descriptor_path: &Path,
    descriptor: &DeviceDescriptor,
) -> Result<PathBuf, AnalyzerError> {
    let rom = descriptor
        .rom_path()
        .ok_or_else(|| AnalyzerError::MissingRomField(descriptor_path.to_path_buf()))?;
    let rom = Path::new(rom);
    Ok(match descriptor_path.parent() {
        Some(dir) if rom.is_relative() => dir.join(rom),
        _ => rom.to_path_buf(),
    })
}

pub fn analyze<M, E>(
    descriptor_path: &Path,
    mem: &mut M,
    engine: &mut E,
    options: &AnalyzeOptions,
) -> Result<AnalysisReport, AnalyzerError>
where
    M: LowMemory + ?Sized,
    E: BiosEngine + ?Sized,
{
    let descriptor = load_descriptor(descriptor_path)?;
    let rom_path = rom_path(descriptor_path, &descriptor)?;

    let rom = rom::load(&rom_path, mem)?;
    tracing::info!(
        rom = %rom_path.display(),
        address = %rom.region.address,
        size = rom.region.size,
        "option ROM loaded"
    );

    let mut device = Device::new(options.bdf);
    if let Err(err) = device.build(&descriptor, rom.region, mem) {
        rom.release(mem);
        return Err(err.into());
    }
    let info = device.info();
    rom.header.warn_on_mismatches(info.vendor_id, info.device_id);
    tracing::info!(
        bdf = %info.bdf,
        vendor_id = format_args!("{:#06x}", info.vendor_id),
        device_id = format_args!("{:#06x}", info.device_id),
        bars = device.allocated_bars(),
        "configuration space built"
    );

    let outcome = engine
        .init(&options.engine, &info, &rom.header)
        .and_then(|()| engine.run(&mut device));

    let freed = device.release(mem);
    let header = rom.header.clone();
    rom.release(mem);
    tracing::debug!(bars = freed, live = mem.live_allocations(), "allocations released");

    let probe = outcome?;
    tracing::info!(accesses = probe.accesses, "engine run finished");
    Ok(AnalysisReport {
        descriptor: descriptor_path.to_path_buf(),
        rom_path,
        rom: header,
        device: info,
        probe,
    })
}
