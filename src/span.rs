/// Span describes the size and position of a half-open range [from, to) of
/// stream bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    /// First byte in the span.
    pub from: u64,
    /// First byte not belonging to the span.
    pub to: u64,
}

impl Span {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of bytes in the span. Inverted spans are empty.
    pub fn size(&self) -> u64 {
        if self.from >= self.to {
            return 0;
        }
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    pub fn is_zero(&self) -> bool {
        self.from == 0 && self.to == 0
    }

    pub fn has_overlap(&self, other: Span) -> bool {
        other.to > self.from && self.to > other.from
    }

    /// The common sub-range of two spans, or the zero span when they do not
    /// overlap.
    pub fn intersect(&self, other: Span) -> Span {
        if !self.has_overlap(other) {
            return Span::default();
        }
        Span {
            from: self.from.max(other.from),
            to: self.to.min(other.to),
        }
    }
}
