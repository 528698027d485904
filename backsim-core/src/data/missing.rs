//! Missing-data resolution for a single ticker at a single index position.

use crate::config::MissingDataPolicy;
use crate::domain::Bar;
use chrono::NaiveDateTime;

fn valid(slot: &Option<Bar>) -> Option<&Bar> {
    slot.as_ref().filter(|b| b.is_sane())
}

/// Resolve the bar for `series[idx]` under `policy`.
///
/// Filled bars are stamped with `timestamp`. Returns `None` when the ticker is
/// unavailable at this position.
pub fn resolve_bar(
    series: &[Option<Bar>],
    idx: usize,
    timestamp: NaiveDateTime,
    policy: MissingDataPolicy,
) -> Option<Bar> {
    let slot = series.get(idx)?;
    if let Some(bar) = valid(slot) {
        return Some(bar.clone());
    }
    match policy {
        MissingDataPolicy::Skip => None,
        MissingDataPolicy::ForwardFill => {
            let prev = series[..idx].iter().rev().find_map(valid)?;
            Some(Bar::flat(timestamp, prev.close))
        }
        MissingDataPolicy::Interpolate => {
            let (prev_idx, prev) = series[..idx]
                .iter()
                .enumerate()
                .rev()
                .find_map(|(i, s)| valid(s).map(|b| (i, b)))?;
            let (next_off, next) = series[idx + 1..]
                .iter()
                .enumerate()
                .find_map(|(i, s)| valid(s).map(|b| (i, b)))?;
            let next_idx = idx + 1 + next_off;
            let w = (idx - prev_idx) as f64 / (next_idx - prev_idx) as f64;
            let lerp = |a: f64, b: f64| a + (b - a) * w;
            Some(Bar::new(
                timestamp,
                lerp(prev.open, next.open),
                lerp(prev.high, next.high),
                lerp(prev.low, next.low),
                lerp(prev.close, next.close),
                lerp(prev.volume, next.volume),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn bar(day: u32, close: f64) -> Option<Bar> {
        Some(Bar::new(ts(day), close, close, close, close, 100.0))
    }

    fn gappy() -> Vec<Option<Bar>> {
        vec![None, bar(3, 10.0), None, None, bar(6, 13.0), None]
    }

    #[test]
    fn valid_bar_passes_through() {
        let s = gappy();
        for policy in [
            MissingDataPolicy::Skip,
            MissingDataPolicy::ForwardFill,
            MissingDataPolicy::Interpolate,
        ] {
            assert_eq!(resolve_bar(&s, 1, ts(3), policy).map(|b| b.close), Some(10.0));
        }
    }

    #[test]
    fn skip_leaves_gap() {
        assert!(resolve_bar(&gappy(), 2, ts(4), MissingDataPolicy::Skip).is_none());
    }

    #[test]
    fn forward_fill_uses_last_close() {
        let s = gappy();
        let b = resolve_bar(&s, 3, ts(5), MissingDataPolicy::ForwardFill).unwrap();
        assert_eq!(b.close, 10.0);
        assert_eq!(b.open, 10.0);
        assert_eq!(b.volume, 0.0);
        assert!(resolve_bar(&s, 0, ts(2), MissingDataPolicy::ForwardFill).is_none());
        assert_eq!(
            resolve_bar(&s, 5, ts(7), MissingDataPolicy::ForwardFill).map(|b| b.close),
            Some(13.0)
        );
    }

    #[test]
    fn interpolate_is_linear_and_bounded() {
        let s = gappy();
        let b2 = resolve_bar(&s, 2, ts(4), MissingDataPolicy::Interpolate).unwrap();
        let b3 = resolve_bar(&s, 3, ts(5), MissingDataPolicy::Interpolate).unwrap();
        assert!((b2.close - 11.0).abs() < 1e-12);
        assert!((b3.close - 12.0).abs() < 1e-12);
        assert!(resolve_bar(&s, 0, ts(2), MissingDataPolicy::Interpolate).is_none());
        assert!(resolve_bar(&s, 5, ts(7), MissingDataPolicy::Interpolate).is_none());
    }

    #[test]
    fn void_bar_treated_as_missing() {
        let mut s = gappy();
        s[2] = Some(Bar::new(ts(4), f64::NAN, f64::NAN, f64::NAN, f64::NAN, 0.0));
        assert!(resolve_bar(&s, 2, ts(4), MissingDataPolicy::Skip).is_none());
        let b = resolve_bar(&s, 2, ts(4), MissingDataPolicy::ForwardFill).unwrap();
        assert_eq!(b.timestamp, ts(4));
        assert_eq!(b.close, 10.0);
    }
}
