//! Half-open byte-range sets used for send, receive and ack bookkeeping.

use std::fmt;

/// A half-open `[start, end)` range of stream offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    /// Inclusive lower bound.
    pub start: u64,
    /// Exclusive upper bound.
    pub end: u64,
}

impl Interval {
    /// Create a new interval. An `end` below `start` yields an empty interval.
    pub const fn new(start: u64, end: u64) -> Self {
        if end < start {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Number of offsets covered.
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True if the interval covers nothing.
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True if `other` lies entirely inside this interval.
    pub fn covers(&self, other: &Interval) -> bool {
        other.is_empty() || (self.start <= other.start && other.end <= self.end)
    }

    fn touches(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl From<(u64, u64)> for Interval {
    fn from((start, end): (u64, u64)) -> Self {
        Self::new(start, end)
    }
}

/// A normalised set of disjoint, non-adjacent intervals in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    runs: Vec<Interval>,
}

impl IntervalSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from arbitrary (possibly overlapping) intervals.
    pub fn from_intervals<I, T>(intervals: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Interval>,
    {
        let mut set = Self::new();
        set.extend(intervals);
        set
    }

    /// Add one interval, merging with any run it overlaps or touches.
    pub fn insert(&mut self, interval: impl Into<Interval>) {
        let mut new = interval.into();
        if new.is_empty() {
            return;
        }

        // First run that could touch `new`.
        let first = self.runs.partition_point(|r| r.end < new.start);
        let mut last = first;
        while last < self.runs.len() && self.runs[last].touches(&new) {
            new.start = new.start.min(self.runs[last].start);
            new.end = new.end.max(self.runs[last].end);
            last += 1;
        }
        self.runs.splice(first..last, std::iter::once(new));
    }

    /// Add every interval from an iterator.
    pub fn extend<I, T>(&mut self, intervals: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<Interval>,
    {
        for interval in intervals {
            self.insert(interval);
        }
    }

    /// Remove one interval from the set.
    pub fn remove(&mut self, interval: impl Into<Interval>) {
        let cut = interval.into();
        if cut.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.runs.len() + 1);
        for run in self.runs.drain(..) {
            if run.end <= cut.start || cut.end <= run.start {
                out.push(run);
                continue;
            }
            if run.start < cut.start {
                out.push(Interval::new(run.start, cut.start));
            }
            if cut.end < run.end {
                out.push(Interval::new(cut.end, run.end));
            }
        }
        self.runs = out;
    }

    /// Remove every run of `other` from this set in place.
    pub fn subtract(&mut self, other: &IntervalSet) {
        for run in &other.runs {
            self.remove(*run);
        }
    }

    /// Set union.
    pub fn union(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = self.clone();
        out.extend(other.runs.iter().copied());
        out
    }

    /// Offsets in `self` that are not in `other`.
    pub fn difference(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = self.clone();
        out.subtract(other);
        out
    }

    /// Offsets in both sets.
    pub fn intersection(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.runs.len() && j < other.runs.len() {
            let a = self.runs[i];
            let b = other.runs[j];
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start < end {
                out.push(Interval::new(start, end));
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        IntervalSet { runs: out }
    }

    /// True if any offset of `interval` is in the set.
    pub fn intersects(&self, interval: &Interval) -> bool {
        !interval.is_empty()
            && self
                .runs
                .iter()
                .any(|r| r.start < interval.end && interval.start < r.end)
    }

    /// True if every offset of `interval` is in the set.
    pub fn contains(&self, interval: &Interval) -> bool {
        if interval.is_empty() {
            return true;
        }
        let idx = self.runs.partition_point(|r| r.end < interval.end);
        self.runs.get(idx).is_some_and(|r| r.covers(interval))
    }

    /// True if `offset` is in the set.
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset < u64::MAX && self.contains(&Interval::new(offset, offset + 1))
    }

    /// Smallest offset in the set.
    pub fn lower_bound(&self) -> Option<u64> {
        self.runs.first().map(|r| r.start)
    }

    /// Exclusive upper bound of the set.
    pub fn upper_bound(&self) -> Option<u64> {
        self.runs.last().map(|r| r.end)
    }

    /// Number of disjoint runs.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// True if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// True if the set is a single run starting at 0.
    pub fn is_contiguous_from_zero(&self) -> bool {
        matches!(self.runs.as_slice(), [only] if only.start == 0)
    }

    /// Iterate over runs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &Interval> + '_ {
        self.runs.iter()
    }

    /// Borrow the runs.
    pub fn as_slice(&self) -> &[Interval] {
        &self.runs
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, run) in self.runs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{run}")?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a IntervalSet {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.runs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(runs: &[(u64, u64)]) -> IntervalSet {
        IntervalSet::from_intervals(runs.iter().copied())
    }

    fn runs(s: &IntervalSet) -> Vec<(u64, u64)> {
        s.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn test_insert_merges_overlap_and_adjacency() {
        let mut s = set(&[(0, 5), (10, 15)]);
        s.insert((5, 7));
        assert_eq!(runs(&s), vec![(0, 7), (10, 15)]);

        s.insert((6, 12));
        assert_eq!(runs(&s), vec![(0, 15)]);
    }

    #[test]
    fn test_insert_out_of_order() {
        let s = set(&[(20, 30), (0, 10), (40, 50), (10, 20)]);
        assert_eq!(runs(&s), vec![(0, 30), (40, 50)]);
    }

    #[test]
    fn test_empty_interval_ignored() {
        let mut s = IntervalSet::new();
        s.insert((5, 5));
        assert!(s.is_empty());
        assert_eq!(Interval::new(9, 3), Interval::new(9, 9));
    }

    #[test]
    fn test_difference() {
        let a = set(&[(0, 100)]);
        let b = set(&[(10, 20), (50, 60)]);
        assert_eq!(runs(&a.difference(&b)), vec![(0, 10), (20, 50), (60, 100)]);
        assert!(b.difference(&a).is_empty());
    }

    #[test]
    fn test_intersection() {
        let a = set(&[(0, 10), (20, 30)]);
        let b = set(&[(5, 25)]);
        assert_eq!(runs(&a.intersection(&b)), vec![(5, 10), (20, 25)]);
    }

    #[test]
    fn test_contains_and_intersects() {
        let s = set(&[(0, 10), (20, 30)]);
        assert!(s.contains(&Interval::new(2, 8)));
        assert!(s.contains(&Interval::new(20, 30)));
        assert!(!s.contains(&Interval::new(5, 25)));
        assert!(s.intersects(&Interval::new(9, 21)));
        assert!(!s.intersects(&Interval::new(10, 20)));
        assert!(s.contains_offset(0));
        assert!(!s.contains_offset(10));
    }

    #[test]
    fn test_bounds() {
        let s = set(&[(4, 10), (20, 30)]);
        assert_eq!(s.lower_bound(), Some(4));
        assert_eq!(s.upper_bound(), Some(30));
        assert!(!s.is_contiguous_from_zero());
        assert!(set(&[(0, 30)]).is_contiguous_from_zero());
        assert_eq!(IntervalSet::new().lower_bound(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(set(&[(0, 1), (3, 4)]).to_string(), "{[0, 1), [3, 4)}");
    }
}
