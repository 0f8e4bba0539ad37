//! Base relocations.
//!
//! Note that there is a difference between COFF relocations and PE image
//! relocations. COFF relocations are per-section and only appear in object
//! files. PE image relocations live in the `.reloc` section as a sequence of
//! blocks, one per 4K page, and are what a loader must apply when an image is
//! not placed at its preferred base.
//!
//! Every write goes through [`Segments::phys_mut`], so patches can only land
//! on bytes that some segment already places in memory.

use object::pe;
use object::read::Bytes;
use object::LittleEndian as LE;

use crate::arch::Architecture;
use crate::builder::SegmentPlan;
use crate::error::{Error, Result, Unsupported};
use crate::pe::PeImage;
use crate::segment::{Range, Segments};

/// Size of `IMAGE_BASE_RELOCATION`.
pub const BLOCK_HEADER_SIZE: u32 = 8;

/// A 16-bit relocation entry: 4 bits of type, 12 bits of page offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry(pub u16);

impl RelocationEntry {
    pub fn kind(self) -> u16 {
        self.0 >> 12
    }

    pub fn offset(self) -> u16 {
        self.0 & 0xfff
    }
}

/// One block of the `.reloc` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationBlock {
    pub page_rva: u32,
    pub total_size: u32,
    pub entries: Vec<RelocationEntry>,
}

/// Iterates over the blocks of a `.reloc` section.
///
/// Iteration ends at the end of the data or at a block whose size is zero.
/// A truncated header or a block claiming more entries than remain is an
/// error, after which iteration stops.
pub struct RelocationBlocks<'data> {
    data: Bytes<'data>,
}

impl<'data> RelocationBlocks<'data> {
    pub fn new(data: &'data [u8]) -> Self {
        Self { data: Bytes(data) }
    }

    fn parse_block(&mut self) -> Result<Option<RelocationBlock>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let header = self
            .data
            .read::<pe::ImageBaseRelocation>()
            .map_err(|()| Error::format("truncated relocation block header"))?;
        let page_rva = header.virtual_address.get(LE);
        let total_size = header.size_of_block.get(LE);
        tracing::trace!("pageRVA: {:#x}, totalsize: {}", page_rva, total_size);

        if total_size == 0 {
            return Ok(None);
        }
        if total_size < BLOCK_HEADER_SIZE {
            return Err(Error::format(format!(
                "relocation block at page {page_rva:#x} has size {total_size}, smaller than its header"
            )));
        }

        let count = ((total_size - BLOCK_HEADER_SIZE) / 2) as usize;
        let entries = self
            .data
            .read_slice::<object::U16<LE>>(count)
            .map_err(|()| {
                Error::format(format!(
                    "wrong number of elements {count} for total size {total_size}"
                ))
            })?
            .iter()
            .map(|e| RelocationEntry(e.get(LE)))
            .collect();

        Ok(Some(RelocationBlock {
            page_rva,
            total_size,
            entries,
        }))
    }
}

impl Iterator for RelocationBlocks<'_> {
    type Item = Result<RelocationBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.parse_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => None,
            Err(e) => {
                self.data = Bytes(&[]);
                Some(Err(e))
            }
        }
    }
}

/// What a relocation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocStats {
    pub blocks: usize,
    pub applied: usize,
    /// `IMAGE_REL_BASED_ABSOLUTE` padding entries.
    pub skipped: usize,
}

/// Applies the image's base relocations to `image` in place.
///
/// An image without a `.reloc` section needs no relocation.
pub fn relocate<A: Architecture>(
    arch: &A,
    pe: &PeImage,
    plan: &SegmentPlan,
    image: &mut [u8],
) -> Result<RelocStats> {
    let Some(section) = pe.reloc_section() else {
        tracing::debug!("no {} section, nothing to relocate", crate::pe::RELOC_SECTION);
        return Ok(RelocStats::default());
    };
    tracing::debug!(
        "reloc: size {:#x} virtual size {:#x}",
        section.file_size,
        section.virtual_size
    );

    // The table lives in the image being patched.
    let table = section.data(image)?.to_vec();
    apply_blocks(
        arch,
        RelocationBlocks::new(&table),
        &plan.segments,
        plan.chosen_base,
        plan.relocation_diff(),
        image,
    )
}

/// Applies relocation blocks for an image placed at `chosen_base`.
///
/// Each block is applied before the next one is read, so the first failure
/// in table order is the one reported.
pub fn apply_blocks<A, I>(
    arch: &A,
    blocks: I,
    segments: &Segments,
    chosen_base: u64,
    diff: i64,
    image: &mut [u8],
) -> Result<RelocStats>
where
    A: Architecture,
    I: IntoIterator<Item = Result<RelocationBlock>>,
{
    let mut stats = RelocStats::default();

    for block in blocks {
        let block = block?;
        stats.blocks += 1;
        for entry in &block.entries {
            let kind = entry.kind();
            if kind == pe::IMAGE_REL_BASED_ABSOLUTE {
                stats.skipped += 1;
                continue;
            }

            let image_offset = u64::from(block.page_rva) + u64::from(entry.offset());
            let address = chosen_base.wrapping_add(image_offset);
            let width = arch
                .relocation_width(kind)
                .ok_or(Unsupported::RelocationType { kind, address })?;

            let place = Range::new(address, width as u64)
                .and_then(|r| segments.phys_mut(image, r))
                .ok_or(Error::RelocationOutOfRange { address })?;
            arch.apply_relocation(kind, place, diff)?;
            stats.applied += 1;
        }
    }

    tracing::info!(
        "applied {} relocations from {} blocks (diff {:#x})",
        stats.applied,
        stats.blocks,
        diff
    );
    Ok(stats)
}
