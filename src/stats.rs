//! Order statistics over a trial's latency samples.
//!
//! Percentiles use the ceiling-rank convention: the p-th percentile of `n`
//! sorted samples is the element at index `⌈p·n⌉ − 1`. There is no
//! interpolation, so for small `n` the 99th percentile is often the maximum.
//! Percentiles are given in basis points (`P99 == 9900`) to keep the rank
//! computation in integers.

use itertools::Itertools;
use std::fmt;

pub const P90: u64 = 9_000;
pub const P99: u64 = 9_900;
pub const P999: u64 = 9_990;

const BASIS: u64 = 10_000;

/// Returns an ascending copy; the arrival-ordered input is left untouched.
pub fn sorted(samples: &[u64]) -> Vec<u64> {
    samples.iter().copied().sorted_unstable().collect()
}

/// Ceiling-rank percentile of an already sorted slice.
pub fn percentile_of_sorted(sorted: &[u64], basis_points: u64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len() as u128;
    let rank = (n * basis_points as u128 + (BASIS as u128 - 1)) / BASIS as u128;
    let idx = rank.max(1).min(n) as usize - 1;
    Some(sorted[idx])
}

/// Median of an already sorted slice. For an even count this is the mean of
/// the two central values, truncated toward zero.
pub fn median_of_sorted(sorted: &[u64]) -> Option<u64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        let lo = sorted[n / 2 - 1];
        let hi = sorted[n / 2];
        Some(lo + (hi - lo) / 2)
    }
}

pub fn median(samples: &[u64]) -> Option<u64> {
    median_of_sorted(&sorted(samples))
}

pub fn p99(samples: &[u64]) -> Option<u64> {
    percentile_of_sorted(&sorted(samples), P99)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: usize,
    pub min: u64,
    pub median: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
}

impl LatencySummary {
    /// `None` for an empty sample set.
    pub fn from_samples(samples: &[u64]) -> Option<LatencySummary> {
        let sorted = sorted(samples);
        let (min, max) = match (sorted.first(), sorted.last()) {
            (Some(&min), Some(&max)) => (min, max),
            _ => return None,
        };
        Some(LatencySummary {
            count: sorted.len(),
            min,
            median: median_of_sorted(&sorted)?,
            p90: percentile_of_sorted(&sorted, P90)?,
            p99: percentile_of_sorted(&sorted, P99)?,
            p999: percentile_of_sorted(&sorted, P999)?,
            max,
        })
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "n={} min={} median={} p90={} p99={} p99.9={} max={} (ns)",
            self.count, self.min, self.median, self.p90, self.p99, self.p999, self.max
        )
    }
}
