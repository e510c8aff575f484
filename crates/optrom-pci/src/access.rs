use core::fmt;

/// Width of a configuration-space access.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
}

impl AccessWidth {
    pub const fn len(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    pub const fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xFF,
            Self::Word => 0xFFFF,
            Self::Dword => 0xFFFF_FFFF,
        }
    }
}

impl fmt::Display for AccessWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Byte => "byte",
            Self::Word => "word",
            Self::Dword => "dword",
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AccessDirection {
    Read,
    Write,
}

/// Function codes the BIOS emulator passes with every configuration access.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum PciAccessFunc {
    ReadByte = 0,
    ReadWord = 1,
    ReadDword = 2,
    WriteByte = 3,
    WriteWord = 4,
    WriteDword = 5,
}

impl PciAccessFunc {
    pub const fn width(self) -> AccessWidth {
        match self {
            Self::ReadByte | Self::WriteByte => AccessWidth::Byte,
            Self::ReadWord | Self::WriteWord => AccessWidth::Word,
            Self::ReadDword | Self::WriteDword => AccessWidth::Dword,
        }
    }

    pub const fn direction(self) -> AccessDirection {
        match self {
            Self::ReadByte | Self::ReadWord | Self::ReadDword => AccessDirection::Read,
            Self::WriteByte | Self::WriteWord | Self::WriteDword => AccessDirection::Write,
        }
    }

    pub const fn new(width: AccessWidth, direction: AccessDirection) -> Self {
        match (direction, width) {
            (AccessDirection::Read, AccessWidth::Byte) => Self::ReadByte,
            (AccessDirection::Read, AccessWidth::Word) => Self::ReadWord,
            (AccessDirection::Read, AccessWidth::Dword) => Self::ReadDword,
            (AccessDirection::Write, AccessWidth::Byte) => Self::WriteByte,
            (AccessDirection::Write, AccessWidth::Word) => Self::WriteWord,
            (AccessDirection::Write, AccessWidth::Dword) => Self::WriteDword,
        }
    }
}

impl TryFrom<u32> for PciAccessFunc {
    type Error = AccessError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::ReadByte,
            1 => Self::ReadWord,
            2 => Self::ReadDword,
            3 => Self::WriteByte,
            4 => Self::WriteWord,
            5 => Self::WriteDword,
            _ => return Err(AccessError::InvalidFunction(code)),
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AccessError {
    #[error("{width} access at {offset:#x} falls outside the 256-byte configuration space")]
    OutOfRange { offset: u16, width: AccessWidth },

    #[error("unknown PCI access function code {0}")]
    InvalidFunction(u32),
}

/// The accessor the emulation engine calls for every trapped configuration-space access.
///
/// Reads return the register value; writes return the value written.
pub trait PciConfigAccess {
    fn access_reg(&mut self, index: u16, value: u32, func: PciAccessFunc)
        -> Result<u32, AccessError>;

    fn read_byte(&mut self, offset: u16) -> Result<u8, AccessError> {
        self.access_reg(offset, 0, PciAccessFunc::ReadByte)
            .map(|v| v as u8)
    }

    fn read_word(&mut self, offset: u16) -> Result<u16, AccessError> {
        self.access_reg(offset, 0, PciAccessFunc::ReadWord)
            .map(|v| v as u16)
    }

    fn read_dword(&mut self, offset: u16) -> Result<u32, AccessError> {
        self.access_reg(offset, 0, PciAccessFunc::ReadDword)
    }

    fn write_dword(&mut self, offset: u16, value: u32) -> Result<(), AccessError> {
        self.access_reg(offset, value, PciAccessFunc::WriteDword)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessDirection, AccessError, AccessWidth, PciAccessFunc};

    #[test]
    fn function_codes_match_the_emulator_abi() {
        for code in 0u32..6 {
            let func = PciAccessFunc::try_from(code).unwrap();
            assert_eq!(func as u32, code);
            assert_eq!(PciAccessFunc::new(func.width(), func.direction()), func);
        }
        assert_eq!(
            PciAccessFunc::try_from(6),
            Err(AccessError::InvalidFunction(6))
        );
        assert_eq!(PciAccessFunc::WriteWord.width(), AccessWidth::Word);
        assert_eq!(
            PciAccessFunc::ReadDword.direction(),
            AccessDirection::Read
        );
    }
}
