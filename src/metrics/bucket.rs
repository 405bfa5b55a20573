// Bucket label codec
//
// Devices report duration histograms as a map of human-readable range labels
// ("0.0-1.0ms", "20.0+ms") to per-range counts. This module turns those labels
// into numeric upper bounds and the per-range counts into a cumulative series.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Upper bound reported for open-ended buckets ("20.0+ms")
///
/// Finite so that it sorts and formats like any other boundary.
pub const OPEN_BUCKET_BOUND: f64 = 1e9;

/// Largest bound a closed bucket may report; keeps the open bucket strictly on top
pub const MAX_CLOSED_BOUND: f64 = 999_999_999.0;

static BUCKET_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)(\+)?ms$").expect("static regex is valid"));

/// Parses the upper bound out of a bucket label
///
/// # Examples
/// - `"0.0-1.0ms"` -> `1.0`
/// - `"20.0+ms"`   -> [`OPEN_BUCKET_BOUND`]
/// - `"garbage"`   -> `0.0`
///
/// Unrecognized labels fall back to `0.0` so a single bad label cannot abort
/// a collection cycle. Closed bounds are clamped to [`MAX_CLOSED_BOUND`].
pub fn parse_upper_bound(label: &str) -> f64 {
    let Some(caps) = BUCKET_LABEL.captures(label.trim()) else {
        return 0.0;
    };

    // "+" before the unit marks the open-ended bucket
    if caps.get(2).is_some() {
        return OPEN_BUCKET_BOUND;
    }

    caps.get(1)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|bound| bound.min(MAX_CLOSED_BOUND))
        .unwrap_or(0.0)
}

/// Formats a boundary for the `le` label in shortest decimal form
pub fn format_bound(bound: f64) -> String {
    bound.to_string()
}

/// Converts per-bucket counts into cumulative counts ordered by upper bound
///
/// Labels that parse to the same boundary are merged into one entry.
pub fn cumulative_buckets(buckets: &HashMap<String, f64>) -> Vec<(f64, f64)> {
    let mut bounded: Vec<(f64, f64)> = buckets
        .iter()
        .map(|(label, count)| (parse_upper_bound(label), *count))
        .collect();

    bounded.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut result: Vec<(f64, f64)> = Vec::with_capacity(bounded.len());
    let mut running = 0.0;
    for (bound, count) in bounded {
        running += count;
        // several labels can land on one bound (fallbacks, clamping)
        match result.last_mut() {
            Some(last) if last.0 == bound => last.1 = running,
            _ => result.push((bound, running)),
        }
    }

    result
}
