//! Consumption-rate estimates over cumulative usage or cost counters.
//!
//! Counters are expected to grow; a decrease is read as a reset and
//! contributes nothing instead of a negative delta. Rates are per hour.

use crate::models::UtilizationPoint;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Sorts by timestamp and keeps the last value seen for a repeated timestamp.
fn eligible_points(series: &[UtilizationPoint]) -> Vec<UtilizationPoint> {
    let mut points: Vec<UtilizationPoint> = series
        .iter()
        .copied()
        .filter(|p| p.value.is_finite())
        .collect();
    points.sort_by_key(|p| p.timestamp);

    let mut out: Vec<UtilizationPoint> = Vec::with_capacity(points.len());
    for p in points {
        match out.last_mut() {
            Some(last) if last.timestamp == p.timestamp => *last = p,
            _ => out.push(p),
        }
    }
    out
}

fn hours_between(earlier: &UtilizationPoint, later: &UtilizationPoint) -> f64 {
    (later.timestamp - earlier.timestamp).num_milliseconds() as f64 / MILLIS_PER_HOUR
}

/// Total non-negative growth across the series divided by its full time span.
pub fn average_burn_rate(series: &[UtilizationPoint]) -> Option<f64> {
    let points = eligible_points(series);
    if points.len() < 2 {
        return None;
    }

    let growth: f64 = points
        .windows(2)
        .map(|w| w[1].value - w[0].value)
        .filter(|delta| *delta >= 0.0)
        .sum();

    let first = points.first()?;
    let last = points.last()?;
    let hours = hours_between(first, last);
    if hours <= 0.0 {
        return None;
    }
    Some(growth / hours)
}

/// Rate between the most recent pair of points that did not reset.
pub fn current_burn_rate(series: &[UtilizationPoint]) -> Option<f64> {
    let points = eligible_points(series);
    points.windows(2).rev().find_map(|w| {
        let delta = w[1].value - w[0].value;
        let hours = hours_between(&w[0], &w[1]);
        (delta >= 0.0 && hours > 0.0).then(|| delta / hours)
    })
}
