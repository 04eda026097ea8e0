use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A closed interval of byte offsets `[start, end]`, `0 <= start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: i64,
    pub end: i64,
}

impl ByteRange {
    /// Build a range, rejecting negative offsets and inverted bounds.
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start < 0 || end < start {
            None
        } else {
            Some(Self { start, end })
        }
    }

    /// Build a range from an offset and a byte count. Zero-length is rejected.
    pub fn from_len(offset: i64, len: i64) -> Option<Self> {
        if len <= 0 {
            return None;
        }
        Self::try_new(offset, offset + len - 1)
    }

    pub fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Sorted set of disjoint, non-touching closed intervals over `i64`.
///
/// Adjacent intervals are merged: `[a,b]` and `[b+1,c]` become `[a,c]`.
/// The empty set is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an arbitrary list of ranges into a normalized set.
    pub fn merge(ranges: impl IntoIterator<Item = ByteRange>) -> Self {
        let mut v: Vec<ByteRange> = ranges.into_iter().collect();
        v.sort_by_key(|r| r.start);
        let mut set = Self { ranges: v };
        set.coalesce();
        set
    }

    /// Insert a range, merging overlapping and adjacent neighbors.
    pub fn add(&mut self, r: ByteRange) {
        let idx = self.ranges.partition_point(|x| x.start < r.start);
        self.ranges.insert(idx, r);
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut out: Vec<ByteRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match out.last_mut() {
                Some(last) if r.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(r.end);
                }
                _ => out.push(r),
            }
        }
        self.ranges = out;
    }

    /// True iff a single interval wholly covers `r`.
    pub fn contains(&self, r: &ByteRange) -> bool {
        let idx = self.ranges.partition_point(|x| x.start <= r.start);
        idx > 0 && self.ranges[idx - 1].contains(r)
    }

    /// Intervals intersecting `r`, in order.
    pub fn overlapping<'a>(&'a self, r: &ByteRange) -> impl Iterator<Item = ByteRange> + 'a {
        let r = *r;
        let idx = self.ranges.partition_point(|x| x.end < r.start);
        self.ranges[idx..]
            .iter()
            .take_while(move |x| x.start <= r.end)
            .copied()
    }

    /// First missing offset at or after `from`.
    pub fn next_gap(&self, from: i64) -> i64 {
        let idx = self.ranges.partition_point(|x| x.start <= from);
        if idx > 0 && self.ranges[idx - 1].end >= from {
            self.ranges[idx - 1].end + 1
        } else {
            from
        }
    }

    pub fn total_len(&self) -> i64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn as_slice(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ByteRange> {
        self.ranges.iter()
    }
}

// Persisted as a sequence of [start, end] pairs. Malformed pairs are dropped
// and the rest re-normalized on load.
impl Serialize for RangeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.ranges.len()))?;
        for r in &self.ranges {
            seq.serialize_element(&(r.start, r.end))?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for RangeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = RangeSet;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a sequence of [start, end] pairs")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<RangeSet, A::Error> {
                let mut ranges = Vec::new();
                while let Some((start, end)) = seq.next_element::<(i64, i64)>()? {
                    if let Some(r) = ByteRange::try_new(start, end) {
                        ranges.push(r);
                    }
                }
                Ok(RangeSet::merge(ranges))
            }
        }

        deserializer.deserialize_seq(PairsVisitor)
    }
}
