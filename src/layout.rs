//! Layout finalization.
//!
//! kexec_load(2) wants page-aligned, non-overlapping physical segments. Once
//! the builder's segments are expanded to page boundaries, neighbours often
//! share a page, so overlapping or adjacent ones are merged into a single
//! `Reservation`. A reservation remembers which buffer bytes land at each of
//! its physical addresses; the alignment padding between them is zero.

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::segment::{Range, Segment, Segments};

/// What ends up at a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// The image byte at this buffer offset.
    Buffer(u64),
    Zero,
}

/// A run of physical memory filled from contiguous buffer bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub phys: Range,
    pub buf_start: u64,
}

impl Span {
    fn delta(&self) -> u64 {
        self.buf_start.wrapping_sub(self.phys.start())
    }
}

/// A page-aligned physical reservation built from one or more segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    phys: Range,
    members: Vec<Segment>,
    /// Sorted by physical address, never overlapping.
    spans: Vec<Span>,
}

impl Reservation {
    fn new(phys: Range, segment: Segment) -> Self {
        let mut r = Self {
            phys,
            members: Vec::new(),
            spans: Vec::new(),
        };
        r.absorb(phys, segment);
        r
    }

    fn absorb(&mut self, aligned: Range, segment: Segment) {
        self.phys = self.phys.union(&aligned);
        self.members.push(segment);

        // The new segment owns its whole physical range, zero tail included.
        let claimed = segment.phys();
        let mut spans = Vec::with_capacity(self.spans.len() + 2);
        for span in self.spans.drain(..) {
            if !span.phys.overlaps(&claimed) {
                spans.push(span);
                continue;
            }
            if span.phys.start() < claimed.start() {
                if let Some(phys) = Range::from_bounds(span.phys.start(), claimed.start()) {
                    spans.push(Span {
                        phys,
                        buf_start: span.buf_start,
                    });
                }
            }
            if span.phys.end() > claimed.end() {
                if let Some(phys) = Range::from_bounds(claimed.end(), span.phys.end()) {
                    spans.push(Span {
                        phys,
                        buf_start: span.buf_start + (claimed.end() - span.phys.start()),
                    });
                }
            }
        }
        if !segment.backed().is_empty() {
            spans.push(Span {
                phys: segment.backed(),
                buf_start: segment.buf().start(),
            });
        }
        spans.sort_by_key(|s| s.phys.start());
        self.spans = spans;
    }

    pub fn phys(&self) -> Range {
        self.phys
    }

    /// The unaligned segments this reservation was built from.
    pub fn members(&self) -> &[Segment] {
        &self.members
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// What is placed at `addr`, or `None` if it lies outside the reservation.
    pub fn backing(&self, addr: u64) -> Option<Backing> {
        if !self.phys.contains(addr) {
            return None;
        }
        Some(
            self.spans
                .iter()
                .find(|s| s.phys.contains(addr))
                .map_or(Backing::Zero, |s| {
                    Backing::Buffer(s.buf_start + (addr - s.phys.start()))
                }),
        )
    }

    /// Whether every physical address of `segment` maps to the same byte here.
    fn maps(&self, segment: &Segment) -> bool {
        if !self.phys.is_superset_of(&segment.phys()) {
            return false;
        }

        let backed = segment.backed();
        let delta = segment.buf().start().wrapping_sub(backed.start());
        let mut cursor = backed.start();
        for span in self.spans.iter().filter(|s| s.phys.overlaps(&backed)) {
            if span.phys.start() > cursor || span.delta() != delta {
                return false;
            }
            cursor = cursor.max(span.phys.end());
        }
        if cursor < backed.end() {
            return false;
        }

        let zero = segment.zero_filled();
        !self.spans.iter().any(|s| s.phys.overlaps(&zero))
    }

    /// Bytes placed at `r`, or `None` unless the reservation holds all of it.
    /// Alignment padding and zero-filled tails read as zero.
    pub fn view<'b>(&self, image: &'b [u8], r: Range) -> Option<Cow<'b, [u8]>> {
        if r.is_empty() || !self.phys.is_superset_of(&r) {
            return None;
        }
        if let Some(span) = self.spans.iter().find(|s| s.phys.is_superset_of(&r)) {
            return span_slice(span, image, r).map(Cow::Borrowed);
        }

        let mut out = vec![0u8; usize::try_from(r.size()).ok()?];
        for span in &self.spans {
            let Some(common) = span.phys.intersection(&r) else {
                continue;
            };
            let at = (common.start() - r.start()) as usize;
            let bytes = span_slice(span, image, common)?;
            out[at..at + bytes.len()].copy_from_slice(bytes);
        }
        Some(Cow::Owned(out))
    }

    /// Bytes to hand to the load primitive for this reservation.
    ///
    /// The primitive copies the buffer to the start of the physical range and
    /// zero-fills the rest. A reservation fed by a single span that starts at
    /// the reservation is passed through without copying; anything else is
    /// composed into a fresh staging buffer.
    pub fn stage<'b>(&self, image: &'b [u8]) -> Result<Cow<'b, [u8]>> {
        match self.spans.as_slice() {
            [] => Ok(Cow::Borrowed(&[])),
            [only] if only.phys.start() == self.phys.start() => {
                Ok(Cow::Borrowed(span_bytes(only, image)?))
            }
            spans => {
                let last = spans[spans.len() - 1].phys.end();
                let len = usize::try_from(last - self.phys.start())
                    .map_err(|_| Error::format(format!("reservation {} too large", self.phys)))?;
                let mut staged = vec![0u8; len];
                for span in spans {
                    let at = (span.phys.start() - self.phys.start()) as usize;
                    let bytes = span_bytes(span, image)?;
                    staged[at..at + bytes.len()].copy_from_slice(bytes);
                }
                Ok(Cow::Owned(staged))
            }
        }
    }
}

fn span_bytes<'b>(span: &Span, image: &'b [u8]) -> Result<&'b [u8]> {
    Range::new(span.buf_start, span.phys.size())
        .and_then(|r| r.as_usize())
        .and_then(|r| image.get(r))
        .ok_or_else(|| {
            Error::format(format!(
                "segment buffer at {:#x} runs past the {:#x} byte image",
                span.buf_start,
                image.len()
            ))
        })
}

/// Image bytes of `span` placed at `r`, which must lie inside the span.
fn span_slice<'b>(span: &Span, image: &'b [u8], r: Range) -> Option<&'b [u8]> {
    let start = span.buf_start + (r.start() - span.phys.start());
    image.get(Range::new(start, r.size())?.as_usize()?)
}

/// Aligns every segment to page boundaries and merges the ones that overlap
/// or touch. Segments with an empty physical range reserve nothing.
///
/// The result is sorted by physical address.
pub fn align_and_merge(segments: &Segments, page_size: u64) -> Result<Vec<Reservation>> {
    if !page_size.is_power_of_two() {
        return Err(Error::PageSize(page_size));
    }
    let mut aligned = segments
        .iter()
        .filter(|s| !s.phys().is_empty())
        .map(|s| {
            s.phys()
                .align(page_size)
                .map(|a| (a, *s))
                .ok_or_else(|| Error::format(format!("segment {s} cannot be page aligned")))
        })
        .collect::<Result<Vec<_>>>()?;
    aligned.sort_by_key(|(a, _)| a.start());

    let mut reservations: Vec<Reservation> = Vec::new();
    for (phys, segment) in aligned {
        match reservations.last_mut() {
            Some(last) if last.phys.overlaps(&phys) || last.phys.adjoins(&phys) => {
                last.absorb(phys, segment)
            }
            _ => reservations.push(Reservation::new(phys, segment)),
        }
    }
    Ok(reservations)
}

/// Segments ready for handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    reservations: Vec<Reservation>,
    entry: u64,
}

/// A reservation with the bytes that fill it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSegment<'b> {
    pub data: Cow<'b, [u8]>,
    pub phys: Range,
}

impl Layout {
    /// Aligns and merges `segments` and checks the result is safe to load.
    pub fn finalize(segments: &Segments, entry: u64, page_size: u64) -> Result<Self> {
        let layout = Self {
            reservations: align_and_merge(segments, page_size)?,
            entry,
        };

        // Not strictly necessary; alignment should only ever pad.
        layout.check_superset_of(segments)?;

        if !layout.phys_contains(entry) {
            return Err(Error::EntryNotMapped { entry });
        }

        for r in &layout.reservations {
            tracing::info!(
                "reserve {} ({} segments, {} spans)",
                r.phys,
                r.members.len(),
                r.spans.len()
            );
        }
        Ok(layout)
    }

    /// Fails if any physical address of `segments` maps to a different byte here.
    pub fn check_superset_of(&self, segments: &Segments) -> Result<()> {
        for segment in segments.iter().filter(|s| !s.phys().is_empty()) {
            if !self.reservations.iter().any(|r| r.maps(segment)) {
                return Err(Error::NotSuperset {
                    phys: segment.phys(),
                });
            }
        }
        Ok(())
    }

    pub fn phys_contains(&self, addr: u64) -> bool {
        self.reservations.iter().any(|r| r.phys.contains(addr))
    }

    /// The bytes placed at physical range `r`. `None` unless a single
    /// reservation contains all of `r`; otherwise exactly `r.size()` bytes.
    pub fn phys<'b>(&self, image: &'b [u8], r: Range) -> Option<Cow<'b, [u8]>> {
        self.reservations
            .iter()
            .find(|res| res.phys.is_superset_of(&r))?
            .view(image, r)
    }

    /// What is placed at `addr`, or `None` if nothing is reserved there.
    pub fn backing(&self, addr: u64) -> Option<Backing> {
        self.reservations.iter().find_map(|r| r.backing(addr))
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Stages every reservation against the (relocated) image.
    pub fn stage<'b>(&self, image: &'b [u8]) -> Result<Vec<StagedSegment<'b>>> {
        self.reservations
            .iter()
            .map(|r| {
                Ok(StagedSegment {
                    data: r.stage(image)?,
                    phys: r.phys,
                })
            })
            .collect()
    }
}
