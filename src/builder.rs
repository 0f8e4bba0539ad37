//! Segment construction.
//!
//! Decides where the image goes in physical memory and maps its header and
//! sections there. A note on terminology: PE calls the target address of a
//! section its "virtual address". For kexec the virtual target address is the
//! physical target address, so it is treated as physical throughout.

use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::pe::{PeImage, Section};
use crate::segment::{Range, Segment, Segments};

/// Unaligned segments plus the addresses chosen for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub segments: Segments,
    /// Preferred base from the optional header.
    pub image_base: u64,
    /// Base the image is actually placed at.
    pub chosen_base: u64,
    pub entry: u64,
}

impl SegmentPlan {
    /// Value added to every absolute address in the image.
    pub fn relocation_diff(&self) -> i64 {
        self.chosen_base.wrapping_sub(self.image_base) as i64
    }
}

/// Picks the physical load base for an image linked at `image_base`.
pub fn choose_base(image_base: u64, config: &LoaderConfig) -> Result<u64> {
    if image_base == 0 {
        return Ok(config.fallback_base);
    }
    image_base.checked_add(config.rebase_offset).ok_or_else(|| {
        Error::format(format!(
            "image base {image_base:#x} leaves no room for offset {:#x}",
            config.rebase_offset
        ))
    })
}

/// Lays out `pe` at its chosen base. `image_len` is the size of the file the
/// view was parsed from.
pub fn build(pe: &PeImage, image_len: u64, config: &LoaderConfig) -> Result<SegmentPlan> {
    let first = pe
        .sections
        .first()
        .ok_or_else(|| Error::format("image has no sections"))?;

    let chosen_base = choose_base(pe.image_base, config)?;
    let entry = chosen_base
        .checked_add(pe.address_of_entry_point.into())
        .ok_or_else(|| Error::format("entry point overflows the address space"))?;
    tracing::debug!("chosen base: {:#x}, entry: {:#x}", chosen_base, entry);

    let mut segments = Segments::new();

    // The PE loader contract expects the headers resident at the image base,
    // so everything before the first section becomes the first segment.
    let header_phys = phys_range(chosen_base, 0, first.virtual_address.into())?;
    let header_len = u64::from(first.file_offset)
        .min(image_len)
        .min(header_phys.size());
    let header = Segment::new(Range::new(0, header_len).unwrap_or_default(), header_phys);
    tracing::debug!("{} (headers)", header);
    segments.push(header);

    for section in &pe.sections {
        if section.is_discardable() {
            tracing::debug!("skipping discardable section {}", section.name);
            continue;
        }
        let segment = section_segment(section, chosen_base, image_len)?;
        tracing::debug!(
            "{} ({} - virtual range {})",
            segment,
            section.name,
            Range::new(section.virtual_address.into(), section.loaded_size().into())
                .unwrap_or_default()
        );
        segments.push(segment);
    }

    Ok(SegmentPlan {
        segments,
        image_base: pe.image_base,
        chosen_base,
        entry,
    })
}

fn section_segment(section: &Section, chosen_base: u64, image_len: u64) -> Result<Segment> {
    let raw = section.file_range();
    if raw.end() > image_len {
        return Err(Error::format(format!(
            "section {} raw data {} lies outside the {:#x} byte image",
            section.name, raw, image_len
        )));
    }
    let phys = phys_range(
        chosen_base,
        section.virtual_address.into(),
        section.loaded_size().into(),
    )?;
    // Raw data is padded to the file alignment and may run past the loaded
    // size; only the loaded part is placed.
    let buf = Range::new(raw.start(), raw.size().min(phys.size())).unwrap_or_default();
    Ok(Segment::new(buf, phys))
}

fn phys_range(base: u64, rva: u64, size: u64) -> Result<Range> {
    base.checked_add(rva)
        .and_then(|start| Range::new(start, size))
        .ok_or_else(|| {
            Error::format(format!(
                "range at rva {rva:#x} of size {size:#x} overflows from base {base:#x}"
            ))
        })
}
