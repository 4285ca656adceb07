//! Pertinent-times calculator: the evaluation grid for one intake
//! interval (spec §4.1). Uniform spacing of `1/nb_points_per_hour`,
//! with an extra break point at `Tinf` or `Tlag` to preserve
//! non-differentiable transitions.

/// Build the time grid, in hours relative to intake start, for an
/// interval of length `interval_hours`, sampled at `nb_points_per_hour`
/// points per hour, with an optional break point (infusion end or lag
/// end) inserted and de-duplicated.
pub fn pertinent_times(
    interval_hours: f64,
    nb_points_per_hour: f64,
    break_point_hours: Option<f64>,
) -> Vec<f64> {
    let n = ((interval_hours * nb_points_per_hour).round() as usize).max(1) + 1;
    let mut times: Vec<f64> = (0..n)
        .map(|i| (i as f64) * interval_hours / ((n - 1) as f64))
        .collect();

    if let Some(bp) = break_point_hours {
        if bp > 0.0 && bp < interval_hours {
            let already_present = times.iter().any(|t| (*t - bp).abs() < 1e-9);
            if !already_present {
                times.push(bp);
            }
        }
    }

    times.sort_by(|a, b| a.total_cmp(b));
    times.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
    times
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_is_uniform_without_break_point() {
        let times = pertinent_times(1.0, 4.0, None);
        assert_eq!(times.len(), 5);
        assert!((times[0]).abs() < 1e-12);
        assert!((times[4] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn grid_inserts_break_point() {
        let times = pertinent_times(12.0, 1.0, Some(2.5));
        assert!(times.iter().any(|t| (*t - 2.5).abs() < 1e-9));
        // still sorted
        for w in times.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn break_point_outside_interval_is_ignored() {
        let times = pertinent_times(1.0, 4.0, Some(5.0));
        assert!(!times.iter().any(|t| (*t - 5.0).abs() < 1e-9));
    }
}
