//! Reduces a window of stored points down to a single exported value, implementing the
//! three reduction modes selectable via `data source` (`EXPORTING_SOURCE_DATA_*`).
//!
//! AS_COLLECTED bypasses the stored-data algorithm entirely: it reports the last raw
//! collected point in the tick's unmodified `[after, before]` window, exactly as
//! `rd->last_collected_value`/`rd->last_collected_time` do. AVERAGE and SUM instead
//! walk `exporting_calculate_value_from_stored_data`'s window-shift/floor/clamp
//! algorithm (§4.1) before summing.

use crate::tsdb::Point;

/// The selected reduction mode for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionMode {
    /// Export the most recent raw collected value in the window, unmodified.
    AsCollected,
    /// Export the arithmetic mean of the points in the window.
    Average,
    /// Export the sum of the points in the window.
    Sum,
}

/// The result of reducing a dimension's points over `[after, before]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reduced {
    pub value: f64,
    pub last_timestamp: i64,
}

/// Applies §4.1 steps 2-3 to a stored-data reduction window: shift both ends back by
/// `2*ue`, floor both to a multiple of `ue` (the most recent, possibly-partial bucket
/// is dropped so it can be reported next tick), then clamp to the dimension's
/// `[oldest, latest]` coverage. Returns `None` if the clamped window is empty.
fn align_window(ue: i64, after: i64, before: i64, oldest: i64, latest: i64) -> Option<(i64, i64)> {
    let ue = ue.max(1);
    let mut after = after - 2 * ue;
    let mut before = before - 2 * ue;
    after -= after.rem_euclid(ue);
    before -= before.rem_euclid(ue);
    before -= ue;

    let after = after.max(oldest);
    let before = before.min(latest);
    if after > before {
        None
    } else {
        Some((after, before))
    }
}

/// Reduces a dimension's window to one value. `fetch(after, before)` queries the
/// dimension's stored points over whatever window the algorithm settles on (the raw
/// tick window for AS_COLLECTED, the aligned-and-clamped window for AVERAGE/SUM).
/// `oldest_latest` is the dimension's stored-data coverage, required (and used) only
/// for AVERAGE/SUM; pass `None` when the dimension holds no points, which yields
/// "no data" for those modes without ever calling `fetch`.
///
/// Returns `None` ("no data", not an error) when the window contains no usable points,
/// or when the reduced value would be NaN/Inf.
pub fn reduce(
    ue: i64,
    after: i64,
    before: i64,
    oldest_latest: Option<(i64, i64)>,
    mode: ReductionMode,
    fetch: impl Fn(i64, i64) -> Vec<Point>,
) -> Option<Reduced> {
    match mode {
        ReductionMode::AsCollected => {
            let points = fetch(after, before);
            let last = points.last()?;
            last.value.is_finite().then_some(Reduced { value: last.value, last_timestamp: last.timestamp })
        }
        ReductionMode::Average | ReductionMode::Sum => {
            let (oldest, latest) = oldest_latest?;
            let (after, before) = align_window(ue, after, before, oldest, latest)?;

            let mut sum = 0.0;
            let mut counter = 0usize;
            for p in fetch(after, before) {
                // "not collected" stored points surface as NaN; skip them rather than
                // poisoning the sum.
                if p.value.is_nan() {
                    continue;
                }
                sum += p.value;
                counter += 1;
            }
            if counter == 0 {
                return None;
            }

            let value = if mode == ReductionMode::Sum { sum } else { sum / counter as f64 };
            value.is_finite().then_some(Reduced { value, last_timestamp: before })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(vals: &[(i64, f64)]) -> Vec<Point> {
        vals.iter().map(|&(timestamp, value)| Point { timestamp, value }).collect()
    }

    fn fetcher(points: Vec<Point>) -> impl Fn(i64, i64) -> Vec<Point> {
        move |after, before| points.iter().copied().filter(|p| p.timestamp >= after && p.timestamp <= before).collect()
    }

    #[test]
    fn as_collected_ignores_windowing_and_returns_last_raw_value() {
        let points = pts(&[(1, 10.0), (2, 20.0), (3, 30.0)]);
        let r = reduce(1, 1, 3, None, ReductionMode::AsCollected, fetcher(points)).unwrap();
        assert_eq!(r.value, 30.0);
        assert_eq!(r.last_timestamp, 3);
    }

    #[test]
    fn as_collected_with_no_points_in_tick_window_yields_none() {
        let points = pts(&[(1, 10.0)]);
        assert_eq!(reduce(1, 5, 6, None, ReductionMode::AsCollected, fetcher(points)), None);
    }

    #[test]
    fn average_window_is_shifted_floored_and_clamped_before_reducing() {
        // ue=1, tick window [10,11) -> after -= 2 -> 8, before -= 2 -> 9, floor to
        // multiples of 1 is a no-op, before -= 1 -> 8. Window becomes [8, 8].
        let points = pts(&[(8, 10.0), (9, 20.0), (10, 30.0)]);
        let r = reduce(1, 10, 11, Some((0, 10)), ReductionMode::Average, fetcher(points)).unwrap();
        assert_eq!(r.value, 10.0);
        assert_eq!(r.last_timestamp, 8);
    }

    #[test]
    fn average_divides_by_point_count_over_aligned_window() {
        // ue=1, tick window [5,8) -> after=5-2=3, before=8-2=6, floor is a no-op,
        // before -= 1 -> 5. Aligned window is [3,5], covering all three points.
        let points = pts(&[(3, 10.0), (4, 20.0), (5, 30.0)]);
        let r = reduce(1, 5, 8, Some((0, 10)), ReductionMode::Average, fetcher(points)).unwrap();
        assert_eq!(r.value, 20.0);
    }

    #[test]
    fn sum_adds_all_points_in_aligned_window() {
        let points = pts(&[(3, 10.0), (4, 20.0), (5, 30.0)]);
        let r = reduce(1, 5, 8, Some((0, 10)), ReductionMode::Sum, fetcher(points)).unwrap();
        assert_eq!(r.value, 60.0);
    }

    #[test]
    fn window_outside_oldest_latest_coverage_yields_no_data() {
        let points = pts(&[(100, 1.0)]);
        assert_eq!(reduce(1, 0, 1, Some((100, 100)), ReductionMode::Average, fetcher(points)), None);
    }

    #[test]
    fn stored_data_mode_without_any_points_yields_no_data() {
        assert_eq!(reduce(1, 5, 6, None, ReductionMode::Average, fetcher(vec![])), None);
    }

    #[test]
    fn not_collected_points_are_skipped_not_summed() {
        let points = pts(&[(3, 10.0), (4, f64::NAN), (5, 30.0)]);
        let r = reduce(1, 5, 8, Some((0, 10)), ReductionMode::Average, fetcher(points)).unwrap();
        assert_eq!(r.value, 20.0);
    }

    #[test]
    fn all_points_not_collected_yields_no_data() {
        let points = pts(&[(0, f64::NAN), (1, f64::NAN)]);
        assert_eq!(reduce(1, 2, 3, Some((0, 1)), ReductionMode::Average, fetcher(points)), None);
    }
}
