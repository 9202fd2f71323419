//! Index-space expressions as normalized interval sets.
//!
//! An expression names a set of linearized index points. The representation
//! is a sorted list of disjoint, non-adjacent inclusive intervals, so
//! equality of point sets is structural equality and all set algebra is a
//! linear merge.

use std::fmt;

use smallvec::SmallVec;
use weft_types::{append_u64_le, read_u64_le};

/// Inclusive interval of index points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Interval {
    pub lo: u64,
    pub hi: u64,
}

/// A set of index points in normalized interval form.
#[derive(Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct IndexSpaceExpr {
    intervals: SmallVec<[Interval; 2]>,
}

impl IndexSpaceExpr {
    /// The empty expression.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single inclusive interval `[lo, hi]`; empty if `lo > hi`.
    #[must_use]
    pub fn interval(lo: u64, hi: u64) -> Self {
        if lo > hi {
            return Self::empty();
        }
        Self {
            intervals: SmallVec::from_slice(&[Interval { lo, hi }]),
        }
    }

    /// A single point.
    #[must_use]
    pub fn point(p: u64) -> Self {
        Self::interval(p, p)
    }

    /// Build from arbitrary intervals, normalizing overlap and adjacency.
    #[must_use]
    pub fn from_intervals<I: IntoIterator<Item = (u64, u64)>>(intervals: I) -> Self {
        let mut list: Vec<Interval> = intervals
            .into_iter()
            .filter(|&(lo, hi)| lo <= hi)
            .map(|(lo, hi)| Interval { lo, hi })
            .collect();
        list.sort_by_key(|iv| iv.lo);
        let mut normalized: SmallVec<[Interval; 2]> = SmallVec::new();
        for iv in list {
            match normalized.last_mut() {
                Some(last) if iv.lo <= last.hi.saturating_add(1) => {
                    last.hi = last.hi.max(iv.hi);
                }
                _ => normalized.push(iv),
            }
        }
        Self {
            intervals: normalized,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Number of points in the set.
    #[must_use]
    pub fn volume(&self) -> u64 {
        self.intervals.iter().map(|iv| iv.hi - iv.lo + 1).sum()
    }

    /// The normalized intervals, ascending.
    #[must_use]
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Set union.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self::from_intervals(
            self.intervals
                .iter()
                .chain(&other.intervals)
                .map(|iv| (iv.lo, iv.hi)),
        )
    }

    /// Set intersection.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let mut result: SmallVec<[Interval; 2]> = SmallVec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            let a = self.intervals[i];
            let b = other.intervals[j];
            let lo = a.lo.max(b.lo);
            let hi = a.hi.min(b.hi);
            if lo <= hi {
                result.push(Interval { lo, hi });
            }
            if a.hi < b.hi {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self { intervals: result }
    }

    /// Set difference `self - other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        let mut result: SmallVec<[Interval; 2]> = SmallVec::new();
        for &iv in &self.intervals {
            let mut lo = iv.lo;
            let mut alive = true;
            for &cut in &other.intervals {
                if cut.hi < lo {
                    continue;
                }
                if cut.lo > iv.hi {
                    break;
                }
                if cut.lo > lo {
                    result.push(Interval {
                        lo,
                        hi: cut.lo - 1,
                    });
                }
                if cut.hi >= iv.hi {
                    alive = false;
                    break;
                }
                lo = cut.hi + 1;
            }
            if alive && lo <= iv.hi {
                result.push(Interval { lo, hi: iv.hi });
            }
        }
        Self { intervals: result }
    }

    /// Whether `self` contains every point of `other`.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        other.difference(self).is_empty()
    }

    /// Whether the two sets share a point.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.intervals.len() && j < other.intervals.len() {
            let a = self.intervals[i];
            let b = other.intervals[j];
            if a.lo.max(b.lo) <= a.hi.min(b.hi) {
                return true;
            }
            if a.hi < b.hi {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// Append the wire encoding: interval count then `(lo, hi)` pairs, all
    /// `u64` little-endian.
    pub fn pack(&self, buf: &mut Vec<u8>) {
        append_u64_le(buf, self.intervals.len() as u64);
        for iv in &self.intervals {
            append_u64_le(buf, iv.lo);
            append_u64_le(buf, iv.hi);
        }
    }

    /// Read the wire encoding written by [`IndexSpaceExpr::pack`].
    #[must_use]
    pub fn unpack(buf: &[u8], offset: &mut usize) -> Option<Self> {
        let mut probe = *offset;
        let count = read_u64_le(buf, &mut probe)?;
        let mut intervals = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let lo = read_u64_le(buf, &mut probe)?;
            let hi = read_u64_le(buf, &mut probe)?;
            intervals.push((lo, hi));
        }
        *offset = probe;
        Some(Self::from_intervals(intervals))
    }
}

impl fmt::Debug for IndexSpaceExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr[")?;
        for (idx, iv) in self.intervals.iter().enumerate() {
            if idx > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}..={}", iv.lo, iv.hi)?;
        }
        write!(f, "]")
    }
}
