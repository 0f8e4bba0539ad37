//! Error types.
//!
//! Every failure in the pipeline is fatal; nothing here is retried.

use crate::kexec::KexecError;
use crate::segment::Range;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed or truncated binary structure.
    #[error("malformed image: {0}")]
    Format(String),

    #[error("malformed PE image: {0}")]
    Object(#[from] object::read::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid input that this loader deliberately does not handle.
    #[error("unsupported image: {0}")]
    Unsupported(#[from] Unsupported),

    #[error("relocation at address {address:#x} could not be found in image")]
    RelocationOutOfRange { address: u64 },

    #[error("aligned segments do not map {phys} like the original segments")]
    NotSuperset { phys: Range },

    #[error("entry point {entry:#x} is not contained by any segment")]
    EntryNotMapped { entry: u64 },

    #[error("page size {0:#x} is not a power of two")]
    PageSize(u64),

    #[error(transparent)]
    LoadPrimitive(#[from] KexecError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Unsupported {
    #[error("32-bit PE images are not supported")]
    OptionalHeader32,

    #[error("machine type {0:#x} is not supported")]
    Machine(u16),

    #[error("relocation of type {kind} at address {address:#x} is not implemented")]
    RelocationType { kind: u16, address: u64 },
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Whether this is a malformed-structure error, from either our own checks
    /// or the PE parser.
    pub fn is_format(&self) -> bool {
        matches!(self, Error::Format(_) | Error::Object(_))
    }
}
