//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for PE32+ AMD64 images.

use super::Architecture;
use crate::error::{Error, Result};
use object::pe;

/// `KEXEC_ARCH_X86_64`, the EM_X86_64 machine number shifted into the flags word.
const KEXEC_ARCH_X86_64: u64 = 62 << 16;

/// The x86_64 architecture backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86_64;

impl Architecture for X86_64 {
    fn machine(&self) -> u16 {
        pe::IMAGE_FILE_MACHINE_AMD64
    }

    fn relocation_width(&self, kind: u16) -> Option<usize> {
        match kind {
            pe::IMAGE_REL_BASED_DIR64 => Some(8),
            _ => None,
        }
    }

    fn apply_relocation(&self, kind: u16, place: &mut [u8], diff: i64) -> Result<()> {
        match kind {
            // "The base relocation applies the difference to the 64-bit field at offset."
            pe::IMAGE_REL_BASED_DIR64 => {
                let len = place.len();
                let bytes: &mut [u8; 8] = place.try_into().map_err(|_| {
                    Error::format(format!("DIR64 relocation needs 8 bytes, got {len}"))
                })?;
                let value = u64::from_le_bytes(*bytes);
                *bytes = value.wrapping_add_signed(diff).to_le_bytes();
                Ok(())
            }
            _ => Err(Error::format(format!("relocation type {kind} has no x86_64 handler"))),
        }
    }

    fn kexec_arch(&self) -> u64 {
        KEXEC_ARCH_X86_64
    }
}
