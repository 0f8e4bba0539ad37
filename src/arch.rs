//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates the
//! machine-specific parts of loading: which PE machine code is accepted, which
//! base relocation types are understood, and how they patch the image. The
//! loader itself stays generic.

use crate::error::Result;

pub mod x86_64;

/// A trait representing a target architecture.
pub trait Architecture {
    /// PE `Machine` value of images this backend loads.
    fn machine(&self) -> u16;

    /// Number of bytes patched by base relocation `kind`, or `None` if the
    /// type is not implemented. `IMAGE_REL_BASED_ABSOLUTE` never reaches here.
    fn relocation_width(&self, kind: u16) -> Option<usize>;

    /// Applies a base relocation in place.
    ///
    /// # Arguments
    /// * `kind` - The base relocation type (top 4 bits of the entry).
    /// * `place` - The bytes being relocated, exactly `relocation_width(kind)` long.
    /// * `diff` - Chosen load base minus the linked image base.
    fn apply_relocation(&self, kind: u16, place: &mut [u8], diff: i64) -> Result<()>;

    /// Architecture bits for the `kexec_load(2)` flags word.
    fn kexec_arch(&self) -> u64;
}
