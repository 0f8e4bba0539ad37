//! Core loader logic.
//!
//! This module contains the `Loader` struct which orchestrates preparing an
//! image for kexec:
//! 1. Parse: reads the PE headers and section table.
//! 2. Layout: picks a load base and maps header and sections to physical segments.
//! 3. Relocation: patches absolute addresses in the image for the chosen base.
//! 4. Finalize: page-aligns and merges segments and checks the entry point.
//! 5. Handoff: passes the segments to the load primitive.
//!
//! Steps 1-4 only touch the caller's working copy of the image, so a failure
//! anywhere before the handoff leaves nothing behind.

use crate::arch::Architecture;
use crate::builder::{self, SegmentPlan};
use crate::config::LoaderConfig;
use crate::error::Result;
use crate::kexec::{self, KexecFlags, LoadPrimitive};
use crate::layout::Layout;
use crate::pe::PeImage;
use crate::reloc::{self, RelocStats};

/// An image that has been relocated and laid out, ready for handoff.
///
/// Holds no image bytes. It describes the buffer it was prepared from, which
/// must be passed unchanged to [`Loader::execute`].
#[derive(Debug, Clone)]
pub struct Prepared {
    pub pe: PeImage,
    pub plan: SegmentPlan,
    pub relocations: RelocStats,
    pub layout: Layout,
}

impl Prepared {
    pub fn entry(&self) -> u64 {
        self.plan.entry
    }
}

pub struct Loader<A: Architecture> {
    arch: A,
    config: LoaderConfig,
}

impl<A: Architecture> Loader<A> {
    pub fn new(arch: A, config: LoaderConfig) -> Self {
        Self { arch, config }
    }

    /// Runs every step up to the handoff, relocating `image` in place.
    pub fn prepare(&self, image: &mut [u8]) -> Result<Prepared> {
        let pe = PeImage::parse(image, &self.arch)?;
        let plan = builder::build(&pe, image.len() as u64, &self.config)?;
        // Relocation must see the unaligned segments the PE format describes.
        let relocations = reloc::relocate(&self.arch, &pe, &plan, image)?;
        let layout = Layout::finalize(&plan.segments, plan.entry, self.config.page_size)?;

        Ok(Prepared {
            pe,
            plan,
            relocations,
            layout,
        })
    }

    /// Hands a prepared image to `primitive`. On success with the real
    /// kexec_load(2), the image runs on the next kexec reboot.
    pub fn execute<P: LoadPrimitive>(
        &self,
        prepared: &Prepared,
        image: &[u8],
        primitive: &mut P,
        flags: KexecFlags,
    ) -> Result<()> {
        let staged = prepared.layout.stage(image)?;
        let flags = flags.with_arch(self.arch.kexec_arch());
        kexec::load(primitive, &prepared.layout, &staged, flags)
    }

    /// `prepare` followed by `execute`.
    pub fn load<P: LoadPrimitive>(
        &self,
        image: &mut [u8],
        primitive: &mut P,
        flags: KexecFlags,
    ) -> Result<Prepared> {
        let prepared = self.prepare(image)?;
        self.execute(&prepared, image, primitive, flags)?;
        Ok(prepared)
    }
}
