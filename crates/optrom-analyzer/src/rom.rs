//! Loading option-ROM images into low memory.
//!
//! An image starts with the `55 AA` signature, a length byte in 512-byte blocks and the init
//! entry point. The word at 0x18 points at the `PCIR` data structure carrying the PCI identity the
//! ROM was built for.

use std::fs;
use std::path::Path;

use optrom_lowmem::{AllocationHandle, LowMemory};
use optrom_pci::{PciClassCode, RomRegion};
use serde::Serialize;

use crate::error::AnalyzerError;

pub const ROM_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const ROM_BLOCK_SIZE: u32 = 512;

const LENGTH_OFFSET: usize = 0x02;
const INIT_ENTRY_OFFSET: usize = 0x03;
const PCIR_POINTER_OFFSET: usize = 0x18;
const PCIR_SIGNATURE: &[u8; 4] = b"PCIR";
const PCIR_MIN_LEN: usize = 0x18;

/// Identity fields of the `PCIR` data structure.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct PcirData {
    /// Offset of the structure within the image.
    pub offset: u16,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    /// Image length in 512-byte blocks as declared by the `PCIR` structure.
    pub image_blocks: u16,
    pub code_type: u8,
    pub last_image: bool,
}

impl PcirData {
    fn parse(image: &[u8], offset: u16) -> Option<Self> {
        let start = usize::from(offset);
        let pcir = image.get(start..start.checked_add(PCIR_MIN_LEN)?)?;
        if &pcir[0..4] != PCIR_SIGNATURE {
            return None;
        }
        let word = |at: usize| u16::from_le_bytes([pcir[at], pcir[at + 1]]);
        Some(Self {
            offset,
            vendor_id: word(0x04),
            device_id: word(0x06),
            prog_if: pcir[0x0D],
            subclass: pcir[0x0E],
            class: pcir[0x0F],
            image_blocks: word(0x10),
            code_type: pcir[0x14],
            last_image: pcir[0x15] & 0x80 != 0,
        })
    }

    /// Class code as it would appear in configuration space (revision left at zero).
    pub fn class_code(&self) -> PciClassCode {
        PciClassCode {
            class: self.class,
            subclass: self.subclass,
            prog_if: self.prog_if,
            revision_id: 0,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct RomHeader {
    /// Bytes actually present in the file.
    pub file_len: u32,
    /// Length byte at offset 2, converted to bytes.
    pub declared_len: u32,
    pub init_entry: [u8; 3],
    /// 8-bit sum over the declared length (clipped to the file); zero for a valid image.
    pub checksum: u8,
    pub pcir: Option<PcirData>,
}

impl RomHeader {
    /// Returns `None` unless the image starts with the option-ROM signature.
    pub fn parse(image: &[u8]) -> Option<Self> {
        if image.len() < ROM_SIGNATURE.len() || image[..2] != ROM_SIGNATURE {
            return None;
        }

        let byte = |at: usize| image.get(at).copied().unwrap_or(0);
        let declared_len = u32::from(byte(LENGTH_OFFSET)) * ROM_BLOCK_SIZE;
        let summed = image.len().min(declared_len as usize);
        let checksum = image[..summed]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));

        let pcir_offset =
            u16::from_le_bytes([byte(PCIR_POINTER_OFFSET), byte(PCIR_POINTER_OFFSET + 1)]);
        let pcir = if pcir_offset == 0 {
            None
        } else {
            PcirData::parse(image, pcir_offset)
        };

        Some(Self {
            file_len: image.len() as u32,
            declared_len,
            init_entry: [
                byte(INIT_ENTRY_OFFSET),
                byte(INIT_ENTRY_OFFSET + 1),
                byte(INIT_ENTRY_OFFSET + 2),
            ],
            checksum,
            pcir,
        })
    }

    pub fn checksum_ok(&self) -> bool {
        self.checksum == 0
    }

    /// Logs everything that looks wrong with the image. None of it stops the analysis.
    pub fn warn_on_mismatches(&self, vendor_id: u16, device_id: u16) {
        if self.declared_len == 0 {
            tracing::warn!("option ROM declares a zero length");
        } else if self.declared_len > self.file_len {
            tracing::warn!(
                declared = self.declared_len,
                actual = self.file_len,
                "option ROM is shorter than its declared length"
            );
        }
        if !self.checksum_ok() {
            tracing::warn!(
                checksum = format_args!("{:#04x}", self.checksum),
                "option ROM checksum mismatch"
            );
        }
        match &self.pcir {
            None => tracing::warn!("option ROM has no PCI data structure"),
            Some(pcir) if pcir.vendor_id != vendor_id || pcir.device_id != device_id => {
                tracing::warn!(
                    rom = format_args!("{:04x}:{:04x}", pcir.vendor_id, pcir.device_id),
                    device = format_args!("{vendor_id:04x}:{device_id:04x}"),
                    "option ROM was built for a different device"
                );
            }
            Some(_) => {}
        }
    }
}

/// An option ROM copied into allocator-backed memory.
#[derive(Debug)]
pub struct LoadedRom {
    pub region: RomRegion,
    pub handle: AllocationHandle,
    pub header: RomHeader,
}

impl LoadedRom {
    pub fn release<M: LowMemory + ?Sized>(self, mem: &mut M) {
        if let Err(err) = mem.free(self.handle) {
            tracing::warn!(%err, "failed to release option ROM memory");
        }
    }
}

/// Reads `path` into a fresh low-memory region and validates its signature.
///
/// The region is released again when the signature check fails.
pub fn load<M: LowMemory + ?Sized>(path: &Path, mem: &mut M) -> Result<LoadedRom, AnalyzerError> {
    let image = fs::read(path).map_err(|err| AnalyzerError::io(path, err))?;
    let bad_signature = || AnalyzerError::BadSignature {
        path: path.to_path_buf(),
        found: image.get(..2).map(|sig| [sig[0], sig[1]]),
    };
    if image.is_empty() {
        return Err(bad_signature());
    }

    let size = u32::try_from(image.len()).map_err(|_| AnalyzerError::RomOutOfRange {
        address: 0,
        size: u32::MAX,
    })?;
    let handle = mem
        .allocate(size)
        .map_err(|source| AnalyzerError::AllocationFailed {
            purpose: "the option ROM".to_string(),
            size,
            source,
        })?;

    match mem.bytes_mut(&handle) {
        Some(dst) => dst.copy_from_slice(&image),
        None => {
            let address = u64::from(handle.address());
            if let Err(err) = mem.free(handle) {
                tracing::warn!(%err, "failed to release option ROM memory");
            }
            return Err(AnalyzerError::RomOutOfRange { address, size });
        }
    }

    let Some(header) = RomHeader::parse(&image) else {
        if let Err(err) = mem.free(handle) {
            tracing::warn!(%err, "failed to release option ROM memory");
        }
        return Err(bad_signature());
    };

    Ok(LoadedRom {
        region: RomRegion::from(&handle),
        handle,
        header,
    })
}
