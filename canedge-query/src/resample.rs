//! Resampler
//!
//! Picks at most one real sample per fixed time window. Windows are aligned to
//! absolute time (`floor(t / interval) * interval`), so the same data always
//! lands in the same windows regardless of the query range. Emitted points
//! keep the value and timestamp of the chosen sample; nothing is interpolated.

use crate::types::{PhysicalSample, SampleMethod, TimeSeriesPoint};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

const NS_PER_MS: u64 = 1_000_000;

/// Start of the window holding `timestamp_ns`
pub fn window_start(timestamp_ns: u64, interval_ms: u64) -> u64 {
    let interval_ns = interval_ms.max(1).saturating_mul(NS_PER_MS);
    timestamp_ns / interval_ns * interval_ns
}

/// Resample one signal's samples onto `interval_ms` windows
///
/// * `Nearest` keeps the sample closest to the window start, i.e. the first
///   one in the window; equal timestamps resolve to the earlier input sample.
/// * `Min` / `Max` keep the sample with the smallest / largest value; ties
///   resolve to the earliest sample. Missing values never win.
///
/// Afterwards points repeating an already emitted timestamp and points with a
/// missing value are dropped. The output never has more points than the input.
pub fn resample<'a, I>(samples: I, interval_ms: u64, method: SampleMethod) -> Vec<TimeSeriesPoint>
where
    I: IntoIterator<Item = &'a PhysicalSample>,
{
    let mut windows: BTreeMap<u64, Vec<&PhysicalSample>> = BTreeMap::new();
    for sample in samples {
        windows
            .entry(window_start(sample.timestamp_ns, interval_ms))
            .or_default()
            .push(sample);
    }

    let mut emitted = HashSet::new();
    windows
        .values()
        .filter_map(|window| select(window, method))
        .filter(|sample| emitted.insert(sample.timestamp_ns))
        .filter(|sample| !sample.value.is_missing())
        .map(|sample| TimeSeriesPoint::new(sample.value.clone(), sample.timestamp_ns))
        .collect()
}

fn select<'a>(window: &[&'a PhysicalSample], method: SampleMethod) -> Option<&'a PhysicalSample> {
    match method {
        SampleMethod::Nearest => window
            .iter()
            .copied()
            .reduce(|best, s| if s.timestamp_ns < best.timestamp_ns { s } else { best }),
        SampleMethod::Min => extreme(window, Ordering::Less),
        SampleMethod::Max => extreme(window, Ordering::Greater),
    }
}

/// First sample whose value compares `wanted` against every other
fn extreme<'a>(window: &[&'a PhysicalSample], wanted: Ordering) -> Option<&'a PhysicalSample> {
    window
        .iter()
        .copied()
        .filter(|s| !s.value.is_missing())
        .reduce(|best, s| {
            match s.value.total_cmp(&best.value) {
                ord if ord == wanted => s,
                // Equal values: keep the earlier sample
                Ordering::Equal if s.timestamp_ns < best.timestamp_ns => s,
                _ => best,
            }
        })
}
