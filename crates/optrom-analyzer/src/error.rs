use std::io;
use std::path::PathBuf;

use optrom_lowmem::AllocationError;
use optrom_pci::{AccessError, BuildError};

use crate::engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to parse device descriptor {}", .path.display())]
    DescriptorParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("device descriptor {} has no \"rom\" entry", .0.display())]
    MissingRomField(PathBuf),

    #[error("could not allocate {size:#x} bytes for {purpose}")]
    AllocationFailed {
        purpose: String,
        size: u32,
        #[source]
        source: AllocationError,
    },

    #[error("option ROM at {address:#x}+{size:#x} is not addressable in 32 bits")]
    RomOutOfRange { address: u64, size: u32 },

    #[error("{} is not an option ROM: {}", .path.display(), describe_signature(.found))]
    BadSignature {
        path: PathBuf,
        found: Option<[u8; 2]>,
    },

    #[error("configuration access out of range")]
    AccessOutOfRange(#[source] AccessError),

    #[error(transparent)]
    Engine(EngineError),

    #[error("I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn describe_signature(found: &Option<[u8; 2]>) -> String {
    match found {
        Some([a, b]) => format!("expected signature 55 aa, found {a:02x} {b:02x}"),
        None => "image is shorter than its signature".to_string(),
    }
}

impl AnalyzerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Self::FileNotFound(path)
        } else {
            Self::Io { path, source }
        }
    }
}

impl From<BuildError> for AnalyzerError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::RomOutOfRange { address, size } => Self::RomOutOfRange { address, size },
            BuildError::AllocationFailed { bar, size, source } => Self::AllocationFailed {
                purpose: format!("BAR{bar}"),
                size,
                source,
            },
        }
    }
}

impl From<EngineError> for AnalyzerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Access(access) => Self::AccessOutOfRange(access),
            other => Self::Engine(other),
        }
    }
}
