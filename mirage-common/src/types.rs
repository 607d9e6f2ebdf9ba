// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Virtual address in guest memory (64-bit).
pub type VAddr = u64;

/// Size or offset of a host GPU allocation, in bytes.
pub type DeviceSize = u64;

/// Page size (4 KiB, matching ARM64 / Switch).
pub const PAGE_SIZE: usize = 0x1000;

/// Page size as u64 for address math.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Page shift (log2 of PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Page mask for alignment checks.
pub const PAGE_MASK: u64 = PAGE_SIZE_U64 - 1;

/// Guest address space size: 39-bit (512 GiB).
pub const ADDRESS_SPACE_SIZE: u64 = 1 << 39;

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Check if a value is page-aligned.
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}

/// A contiguous range of guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestSpan {
    pub addr: VAddr,
    pub size: u64,
}

impl GuestSpan {
    pub const fn new(addr: VAddr, size: u64) -> Self {
        Self { addr, size }
    }

    /// Build a span from a half-open `[start, end)` range.
    pub const fn from_range(start: VAddr, end: VAddr) -> Self {
        Self {
            addr: start,
            size: end - start,
        }
    }

    #[inline]
    pub const fn end(&self) -> VAddr {
        self.addr + self.size
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True if `other` lies entirely within this span.
    pub const fn contains(&self, other: &GuestSpan) -> bool {
        other.addr >= self.addr && other.end() <= self.end()
    }

    pub const fn overlaps(&self, other: &GuestSpan) -> bool {
        self.addr < other.end() && other.addr < self.end()
    }

    /// Expand the span outwards to page boundaries.
    pub const fn page_aligned(&self) -> Self {
        Self::from_range(
            align_down(self.addr, PAGE_SIZE_U64),
            align_up(self.end(), PAGE_SIZE_U64),
        )
    }
}

impl std::fmt::Display for GuestSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#X}..{:#X})", self.addr, self.end())
    }
}

/// An ordered list of guest spans that together form one logical buffer.
///
/// Every span after the first starts on a page boundary and every span
/// before the last ends on one, so the spans can be mirrored into a single
/// linear host mapping. Offsets into the buffer count through the spans in
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuestBuffer {
    spans: Vec<GuestSpan>,
}

impl GuestBuffer {
    /// Build a guest buffer from spans, returning `None` if the spans are
    /// empty or break the page-alignment rule between spans.
    pub fn new(spans: Vec<GuestSpan>) -> Option<Self> {
        if spans.is_empty() || spans.iter().any(GuestSpan::is_empty) {
            return None;
        }
        let last = spans.len() - 1;
        for (i, span) in spans.iter().enumerate() {
            if i != 0 && !is_page_aligned(span.addr) {
                return None;
            }
            if i != last && !is_page_aligned(span.end()) {
                return None;
            }
        }
        Some(Self { spans })
    }

    /// A guest buffer backed by a single contiguous span.
    pub fn contiguous(span: GuestSpan) -> Self {
        Self { spans: vec![span] }
    }

    pub fn spans(&self) -> &[GuestSpan] {
        &self.spans
    }

    pub fn is_contiguous(&self) -> bool {
        self.spans.len() == 1
    }

    /// Total size in bytes across all spans.
    pub fn size(&self) -> u64 {
        self.spans.iter().map(|s| s.size).sum()
    }

    /// Lowest guest address covered.
    pub fn start(&self) -> VAddr {
        self.spans[0].addr
    }

    /// One past the highest guest address covered.
    pub fn end(&self) -> VAddr {
        self.spans[self.spans.len() - 1].end()
    }

    /// The `[start, end)` hull of the buffer.
    pub fn hull(&self) -> GuestSpan {
        GuestSpan::from_range(self.start(), self.end())
    }

    /// Offset of `addr` within the buffer, if a span covers it.
    pub fn offset_of(&self, addr: VAddr) -> Option<u64> {
        let mut base = 0u64;
        for span in &self.spans {
            if addr >= span.addr && addr < span.end() {
                return Some(base + (addr - span.addr));
            }
            base += span.size;
        }
        None
    }

    /// True if `range` lies entirely within a single span of this buffer.
    pub fn contains(&self, range: &GuestSpan) -> bool {
        self.spans.iter().any(|s| s.contains(range))
    }

    pub fn overlaps(&self, range: &GuestSpan) -> bool {
        self.spans.iter().any(|s| s.overlaps(range))
    }
}

impl From<GuestSpan> for GuestBuffer {
    fn from(span: GuestSpan) -> Self {
        Self::contiguous(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, PAGE_SIZE_U64), 0);
        assert_eq!(align_up(1, PAGE_SIZE_U64), PAGE_SIZE_U64);
        assert_eq!(align_up(PAGE_SIZE_U64, PAGE_SIZE_U64), PAGE_SIZE_U64);
        assert_eq!(
            align_up(PAGE_SIZE_U64 + 1, PAGE_SIZE_U64),
            PAGE_SIZE_U64 * 2
        );
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0, PAGE_SIZE_U64), 0);
        assert_eq!(align_down(1, PAGE_SIZE_U64), 0);
        assert_eq!(
            align_down(PAGE_SIZE_U64 + 1, PAGE_SIZE_U64),
            PAGE_SIZE_U64
        );
    }

    #[test]
    fn test_span_page_aligned() {
        let span = GuestSpan::new(0x1010, 0x20);
        assert_eq!(span.page_aligned(), GuestSpan::new(0x1000, 0x1000));

        let span = GuestSpan::new(0x1FF0, 0x20);
        assert_eq!(span.page_aligned(), GuestSpan::new(0x1000, 0x2000));
    }

    #[test]
    fn test_span_overlap_and_contains() {
        let a = GuestSpan::new(0x1000, 0x1000);
        assert!(a.contains(&GuestSpan::new(0x1800, 0x800)));
        assert!(!a.contains(&GuestSpan::new(0x1800, 0x801)));
        assert!(a.overlaps(&GuestSpan::new(0x1FFF, 0x10)));
        assert!(!a.overlaps(&GuestSpan::new(0x2000, 0x10)));
    }

    #[test]
    fn test_guest_buffer_rejects_misaligned_interior() {
        // Second span must start on a page boundary.
        let spans = vec![GuestSpan::new(0x1000, 0x1000), GuestSpan::new(0x5010, 0x100)];
        assert!(GuestBuffer::new(spans).is_none());

        // First span must end on a page boundary when more follow.
        let spans = vec![GuestSpan::new(0x1000, 0x800), GuestSpan::new(0x5000, 0x100)];
        assert!(GuestBuffer::new(spans).is_none());

        assert!(GuestBuffer::new(Vec::new()).is_none());
    }

    #[test]
    fn test_guest_buffer_offsets() {
        let buffer = GuestBuffer::new(vec![
            GuestSpan::new(0x1800, 0x800),
            GuestSpan::new(0x8000, 0x1000),
        ])
        .unwrap();

        assert_eq!(buffer.size(), 0x1800);
        assert_eq!(buffer.start(), 0x1800);
        assert_eq!(buffer.end(), 0x9000);
        assert_eq!(buffer.offset_of(0x1800), Some(0));
        assert_eq!(buffer.offset_of(0x8004), Some(0x804));
        assert_eq!(buffer.offset_of(0x4000), None);
        assert!(buffer.contains(&GuestSpan::new(0x8000, 0x10)));
        assert!(!buffer.contains(&GuestSpan::new(0x1FF0, 0x20)));
    }
}
