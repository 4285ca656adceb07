//! `ComputingResponse` assembly: cycles, statistics, unit conversion
//! (spec §4.6 "Response assembly", §6).
//!
//! Grounded on the teacher's `response_old::save_concentration_data` /
//! `PopulationSummary` (per-patient Cmax/AUC/Tmax via trapezoidal
//! integration), generalised here from a per-patient CSV row into a
//! per-cycle record the orchestrator attaches to its typed response.

use crate::concentration::Prediction;
use crate::error::PkResult;
use crate::single_points::SinglePointRecord;
use crate::units;

/// Per-cycle peak/trough/AUC/mean/Tmax, computed when the trait
/// requests statistics (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleStatistics {
    pub peak: f64,
    pub trough: f64,
    pub auc: f64,
    pub mean: f64,
    pub tmax_hours: f64,
}

fn trapezoidal_auc(times_hours: &[f64], values: &[f64]) -> f64 {
    times_hours
        .windows(2)
        .zip(values.windows(2))
        .map(|(t, v)| (t[1] - t[0]) * (v[0] + v[1]) / 2.0)
        .sum()
}

impl CycleStatistics {
    pub fn compute(times_hours: &[f64], values_ug_l: &[f64]) -> Option<Self> {
        if values_ug_l.is_empty() {
            return None;
        }
        let peak = values_ug_l.iter().copied().fold(f64::MIN, f64::max);
        let trough = values_ug_l.iter().copied().fold(f64::MAX, f64::min);
        let mean = values_ug_l.iter().sum::<f64>() / values_ug_l.len() as f64;
        let tmax_hours = times_hours
            .iter()
            .zip(values_ug_l.iter())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(t, _)| *t)
            .unwrap_or(0.0);
        Some(Self {
            peak,
            trough,
            auc: trapezoidal_auc(times_hours, values_ug_l),
            mean,
            tmax_hours,
        })
    }
}

/// One reported dosing cycle, in the caller's requested unit (spec
/// §4.6 "Response assembly").
#[derive(Debug, Clone)]
pub struct CycleData {
    pub start_hours: f64,
    pub end_hours: f64,
    pub unit: String,
    /// `concentrations[compartment][time_index]`, in `unit`.
    pub concentrations: Vec<Vec<f64>>,
    pub times_hours: Vec<f64>,
    pub statistics: Option<CycleStatistics>,
}

/// Convert a `Prediction` (always in the canonical `ug/l` unit) into
/// the reported cycle list, in `unit` unless `force_ug_l` overrides it
/// (spec §6 "Units").
pub fn build_cycles(
    prediction: &Prediction,
    unit: &str,
    force_ug_l: bool,
    retrieve_statistics: bool,
) -> PkResult<Vec<CycleData>> {
    let mut cycles = Vec::with_capacity(prediction.cycles.len());
    for cycle in &prediction.cycles {
        let mut concentrations = Vec::with_capacity(cycle.concentrations.len());
        for compartment in &cycle.concentrations {
            let converted: Vec<f64> = compartment
                .iter()
                .map(|&v| units::from_ug_l(v, unit, force_ug_l))
                .collect::<PkResult<Vec<f64>>>()?;
            concentrations.push(converted);
        }

        let statistics = if retrieve_statistics {
            CycleStatistics::compute(&cycle.times_hours, &cycle.concentrations[0])
        } else {
            None
        };

        cycles.push(CycleData {
            start_hours: cycle.start_hours,
            end_hours: cycle.end_hours,
            unit: if force_ug_l { "ug/l".to_string() } else { unit.to_string() },
            concentrations,
            times_hours: cycle.times_hours.clone(),
            statistics,
        });
    }
    Ok(cycles)
}

/// Convert single-point predictions into the reported cycle list, one
/// degenerate (single-sample) cycle per requested time, in the order
/// the caller asked for them (spec §6 "`SinglePointsData`... carries
/// cycles of `CycleData`").
pub fn build_single_point_cycles(
    records: &[SinglePointRecord],
    unit: &str,
    force_ug_l: bool,
    retrieve_statistics: bool,
) -> PkResult<Vec<CycleData>> {
    let mut cycles = Vec::with_capacity(records.len());
    for record in records {
        let concentrations: Vec<Vec<f64>> = record
            .concentrations
            .iter()
            .map(|&v| units::from_ug_l(v, unit, force_ug_l).map(|converted| vec![converted]))
            .collect::<PkResult<Vec<Vec<f64>>>>()?;

        let statistics = if retrieve_statistics {
            CycleStatistics::compute(&[record.time_hours], &concentrations[0])
        } else {
            None
        };

        cycles.push(CycleData {
            start_hours: record.time_hours,
            end_hours: record.time_hours,
            unit: if force_ug_l { "ug/l".to_string() } else { unit.to_string() },
            concentrations,
            times_hours: vec![record.time_hours],
            statistics,
        });
    }
    Ok(cycles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concentration::PredictionCycle;

    fn sample_prediction() -> Prediction {
        Prediction {
            cycles: vec![PredictionCycle {
                start_hours: 0.0,
                end_hours: 1.0,
                times_hours: vec![0.0, 0.5, 1.0],
                concentrations: vec![vec![1.1527, 1.127, 1.1036]],
                out_residuals: vec![1.1036],
            }],
        }
    }

    #[test]
    fn statistics_match_trapezoidal_auc() {
        let stats = CycleStatistics::compute(&[0.0, 0.5, 1.0], &[1.0, 2.0, 1.0]).unwrap();
        assert!((stats.auc - 1.5).abs() < 1e-9);
        assert_eq!(stats.peak, 2.0);
        assert_eq!(stats.trough, 1.0);
        assert!((stats.tmax_hours - 0.5).abs() < 1e-9);
    }

    #[test]
    fn build_cycles_converts_units() {
        let prediction = sample_prediction();
        let cycles = build_cycles(&prediction, "mg/l", false, true).unwrap();
        assert_eq!(cycles.len(), 1);
        assert!((cycles[0].concentrations[0][0] - 0.0011527).abs() < 1e-9);
        assert!(cycles[0].statistics.is_some());
    }

    #[test]
    fn force_ug_l_bypasses_conversion() {
        let prediction = sample_prediction();
        let cycles = build_cycles(&prediction, "mg/l", true, false).unwrap();
        assert_eq!(cycles[0].unit, "ug/l");
        assert!((cycles[0].concentrations[0][0] - 1.1527).abs() < 1e-9);
        assert!(cycles[0].statistics.is_none());
    }

    #[test]
    fn single_point_cycles_are_degenerate_one_sample_cycles() {
        let records = vec![
            SinglePointRecord { time_hours: 6.0, concentrations: vec![1.0] },
            SinglePointRecord { time_hours: 18.0, concentrations: vec![0.5] },
        ];
        let cycles = build_single_point_cycles(&records, "ug/l", false, true).unwrap();
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0].start_hours, cycles[0].end_hours);
        assert_eq!(cycles[1].times_hours, vec![18.0]);
        assert!(cycles[0].statistics.is_some());
    }
}
