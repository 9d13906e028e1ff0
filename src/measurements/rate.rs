//! Per-second rates from two samples of a monotonic counter.
//!
//! Samples that share a `start_timestamp` belong to the same counter epoch and
//! are differenced directly. If the epoch changed between them the counter
//! was reset, so only the newer sample is usable: its value is the count since
//! its own start.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::RateMetric;

/// Round to two decimal places.
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Rate between `first` and `last`, which must be in chronological order.
///
/// # Errors
/// - [`Error::NonChronological`] when `first` is newer than `last`
/// - [`Error::NonPositiveDuration`] when the span to divide by is not positive
pub fn rate(first: &RateMetric, last: &RateMetric) -> Result<RateMetric> {
    if let Ok(ahead) = first.timestamp.duration_since(last.timestamp) {
        if ahead > Duration::ZERO {
            return Err(Error::NonChronological { ahead });
        }
    }

    let (delta, duration, epoch_start) = if first.start_timestamp == last.start_timestamp {
        let mut delta = last.value - first.value;
        if delta < 0.0 {
            delta = last.value;
        }
        let duration = last
            .timestamp
            .duration_since(first.timestamp)
            .unwrap_or(Duration::ZERO);
        (delta, duration, first.start_timestamp)
    } else {
        let duration = last
            .timestamp
            .duration_since(last.start_timestamp)
            .unwrap_or(Duration::ZERO);
        (last.value, duration, last.start_timestamp)
    };

    if duration.is_zero() {
        return Err(Error::NonPositiveDuration);
    }

    Ok(RateMetric {
        timestamp: last.timestamp,
        start_timestamp: epoch_start,
        value: round2(delta / duration.as_secs_f64()),
    })
}
