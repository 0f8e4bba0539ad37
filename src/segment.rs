//! Physical memory segments.
//!
//! A `Segment` pairs a range of the image buffer with the physical range those
//! bytes must be placed at. Buffer ranges are offsets into the single image
//! buffer owned by the load operation, so segments never copy or own bytes;
//! views are handed out only against a buffer borrowed by the caller.

use std::fmt;

/// A half-open address range `[start, start + size)`.
///
/// Construction guarantees that `start + size` does not overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Range {
    start: u64,
    size: u64,
}

impl Range {
    /// Creates a range, or `None` if it would run past the end of the address space.
    pub fn new(start: u64, size: u64) -> Option<Self> {
        start.checked_add(size)?;
        Some(Self { start, size })
    }

    /// Creates the range `[start, end)`. `None` if `end < start`.
    pub fn from_bounds(start: u64, end: u64) -> Option<Self> {
        Some(Self {
            start,
            size: end.checked_sub(start)?,
        })
    }

    pub const fn start(&self) -> u64 {
        self.start
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Exclusive end address.
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `addr` lies inside the range. Empty ranges contain nothing.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Whether `other` lies entirely inside this range.
    ///
    /// An empty range is contained if its start lies within `[start, end]`.
    pub fn is_superset_of(&self, other: &Range) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }

    /// Whether the two ranges share at least one address.
    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Whether one range ends exactly where the other begins.
    pub fn adjoins(&self, other: &Range) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// The common part of both ranges, if any.
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        (start < end).then(|| Range {
            start,
            size: end - start,
        })
    }

    /// The smallest range covering both.
    pub fn union(&self, other: &Range) -> Range {
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        Range {
            start,
            size: end - start,
        }
    }

    /// Expands the range outward to `page_size` boundaries.
    ///
    /// `None` if the aligned end would overflow the address space.
    pub fn align(&self, page_size: u64) -> Option<Range> {
        let start = crate::utils::align_down(self.start, page_size);
        let end = crate::utils::align_up(self.end(), page_size)?;
        Range::from_bounds(start, end)
    }

    /// Whether both ends lie on `page_size` boundaries.
    pub fn is_aligned(&self, page_size: u64) -> bool {
        self.start % page_size == 0 && self.size % page_size == 0
    }

    pub(crate) fn as_usize(&self) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(self.start).ok()?;
        let end = usize::try_from(self.end()).ok()?;
        Some(start..end)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

/// Buffer bytes that must end up at a physical location.
///
/// `buf` may be shorter than `phys`: the remainder of the physical range is
/// zero-filled when loaded. It is never longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    buf: Range,
    phys: Range,
}

impl Segment {
    /// Pairs a buffer range with its physical destination.
    ///
    /// # Panics
    /// If `buf` is larger than `phys`.
    pub fn new(buf: Range, phys: Range) -> Self {
        assert!(
            buf.size() <= phys.size(),
            "segment buffer {buf} does not fit physical range {phys}"
        );
        Self { buf, phys }
    }

    pub fn buf(&self) -> Range {
        self.buf
    }

    pub fn phys(&self) -> Range {
        self.phys
    }

    /// The part of the physical range that is backed by buffer bytes.
    pub fn backed(&self) -> Range {
        Range {
            start: self.phys.start,
            size: self.buf.size,
        }
    }

    /// The part of the physical range that is zero-filled.
    pub fn zero_filled(&self) -> Range {
        Range {
            start: self.phys.start + self.buf.size,
            size: self.phys.size - self.buf.size,
        }
    }

    /// Buffer offset backing physical address `addr`, if any.
    pub fn buffer_offset(&self, addr: u64) -> Option<u64> {
        self.backed()
            .contains(addr)
            .then(|| self.buf.start + (addr - self.phys.start))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[buf {} -> phys {}]", self.buf, self.phys)
    }
}

/// An ordered sequence of segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segments(Vec<Segment>);

impl Segments {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, segment: Segment) {
        self.0.push(segment);
    }

    /// Buffer range backing the physical range `r`.
    ///
    /// The first segment whose buffer-backed physical range contains all of `r`
    /// wins. Ranges reaching into a zero-filled tail have no buffer bytes and
    /// are not found.
    ///
    /// Before finalization segments may overlap, and then the answer depends
    /// on their order. If overlapping segments disagree about the bytes,
    /// [`Layout::finalize`](crate::layout::Layout::finalize) rejects them, so
    /// an ambiguous lookup never reaches the load primitive. A finalized
    /// [`Layout`](crate::layout::Layout) has disjoint reservations and its
    /// `phys` lookup matches at most one.
    pub fn phys_to_buf(&self, r: Range) -> Option<Range> {
        self.0.iter().find_map(|s| {
            if r.is_empty() || !s.backed().is_superset_of(&r) {
                return None;
            }
            Range::new(s.buf.start + (r.start - s.phys.start), r.size)
        })
    }

    /// View of the buffer bytes that will be placed at physical range `r`.
    pub fn phys<'b>(&self, image: &'b [u8], r: Range) -> Option<&'b [u8]> {
        image.get(self.phys_to_buf(r)?.as_usize()?)
    }

    /// Mutable view of the buffer bytes that will be placed at physical range `r`.
    pub fn phys_mut<'b>(&self, image: &'b mut [u8], r: Range) -> Option<&'b mut [u8]> {
        image.get_mut(self.phys_to_buf(r)?.as_usize()?)
    }
}

impl std::ops::Deref for Segments {
    type Target = [Segment];

    fn deref(&self) -> &[Segment] {
        &self.0
    }
}

impl From<Vec<Segment>> for Segments {
    fn from(v: Vec<Segment>) -> Self {
        Self(v)
    }
}

impl FromIterator<Segment> for Segments {
    fn from_iter<I: IntoIterator<Item = Segment>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Segments {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
