//! Single-points engine: evaluates caller-supplied arbitrary times
//! directly via `calculateIntakeSinglePoint`, rather than expanding an
//! evenly spaced grid (spec §4.6 "`ComputingTraitAtMeasures` → single-
//! points engine over sample times", "`ComputingTraitSinglePoints` →
//! single-points engine over arbitrary times").
//!
//! Walks intakes in the same chronological order as
//! `concentration::predict` to recover the residual state entering
//! each intake, then evaluates every requested time against whichever
//! intake covers it, without expanding that intake's full trajectory.

use crate::calculators::IntakeCalculatorHandle;
use crate::error::{PkError, PkResult};
use crate::events::{IntakeEvent, IntakeSeries, ParameterSetSeries};
use crate::model::CompartmentCount;

/// One requested time's result: absolute time and per-compartment
/// concentration, both in the canonical `ug/l` unit.
#[derive(Debug, Clone)]
pub struct SinglePointRecord {
    pub time_hours: f64,
    pub concentrations: Vec<f64>,
}

struct IntakeEntry<'a> {
    intake: &'a IntakeEvent,
    params: Vec<(String, f64)>,
    residuals_at_start: Vec<f64>,
}

fn calculator_of<'a>(intake: &'a IntakeEvent) -> PkResult<&'a IntakeCalculatorHandle> {
    intake.calculator.as_ref().ok_or(PkError::ConcentrationCalculatorNoParameters)
}

/// Evaluate `times_hours` (any order, possibly unsorted) against
/// `intakes`, chaining residuals intake-to-intake exactly as
/// `concentration::predict` does.
pub fn predict_at_times(
    intakes: &IntakeSeries,
    parameters: &ParameterSetSeries,
    compartments: CompartmentCount,
    times_hours: &[f64],
) -> PkResult<Vec<SinglePointRecord>> {
    if intakes.intakes.is_empty() {
        return Err(PkError::NoDosageHistory);
    }

    let mut entries = Vec::with_capacity(intakes.intakes.len());
    let mut residuals = vec![0.0; compartments.as_usize()];

    for intake in &intakes.intakes {
        let calculator = calculator_of(intake)?;
        let param_set = parameters.at(intake.time_hours).ok_or(PkError::ConcentrationCalculatorNoParameters)?;
        let params: Vec<(String, f64)> = param_set.as_map().iter().map(|(k, v)| (k.to_string(), *v)).collect();
        calculator.validate_parameters(&params)?;

        if residuals.len() < calculator.n_compartments() {
            residuals.resize(calculator.n_compartments(), 0.0);
        }
        let residuals_at_start = residuals[..calculator.n_compartments()].to_vec();

        let end_output =
            calculator.calculate_single_point(intake, &params, &residuals_at_start, intake.interval_hours)?;
        residuals = end_output.out_residuals;

        entries.push(IntakeEntry { intake, params, residuals_at_start });
    }

    let mut records = Vec::with_capacity(times_hours.len());
    for &t in times_hours {
        let entry = entries
            .iter()
            .rev()
            .find(|e| t >= e.intake.time_hours)
            .or_else(|| entries.first())
            .ok_or(PkError::RecordedIntakesSizeError)?;

        let calculator = calculator_of(entry.intake)?;
        let offset = t - entry.intake.time_hours;
        let output =
            calculator.calculate_single_point(entry.intake, &entry.params, &entry.residuals_at_start, offset)?;

        if output.concentrations.iter().flatten().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(PkError::BadConcentration);
        }

        records.push(SinglePointRecord {
            time_hours: t,
            concentrations: output.concentrations.into_iter().map(|c| c[0]).collect(),
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculators::{self, CalculatorFamily};
    use crate::events::ParameterSetEvent;
    use crate::model::{AbsorptionModel, ParameterForm};

    fn bolus_series() -> IntakeSeries {
        let calculator = calculators::resolve_calculator(
            CompartmentCount::One,
            AbsorptionModel::Intravascular,
            ParameterForm::Micro,
            CalculatorFamily::Analytical,
        )
        .unwrap();
        IntakeSeries {
            intakes: vec![
                IntakeEvent {
                    time_hours: 0.0,
                    offset_hours: 0.0,
                    dose_mg: 400.0,
                    interval_hours: 12.0,
                    formulation_index: 0,
                    absorption_model: AbsorptionModel::Intravascular,
                    infusion_time_hours: 0.0,
                    nb_points: 2,
                    calculator: Some(calculator.clone()),
                },
                IntakeEvent {
                    time_hours: 12.0,
                    offset_hours: 12.0,
                    dose_mg: 400.0,
                    interval_hours: 12.0,
                    formulation_index: 0,
                    absorption_model: AbsorptionModel::Intravascular,
                    infusion_time_hours: 0.0,
                    nb_points: 2,
                    calculator: Some(calculator),
                },
            ],
        }
    }

    fn parameters() -> ParameterSetSeries {
        ParameterSetSeries {
            events: vec![ParameterSetEvent {
                time_hours: 0.0,
                values: vec![("V".to_string(), 347.0), ("Ke".to_string(), 0.0435)],
            }],
        }
    }

    #[test]
    fn evaluates_arbitrary_times_in_submission_order() {
        let records =
            predict_at_times(&bolus_series(), &parameters(), CompartmentCount::One, &[6.0, 0.0, 18.0]).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].time_hours, 6.0);
        assert_eq!(records[1].time_hours, 0.0);
        assert!((records[1].concentrations[0] - 400.0 / 347.0).abs() < 1e-6);
    }

    #[test]
    fn matches_multi_point_engine_at_t_equals_interval() {
        let single = predict_at_times(&bolus_series(), &parameters(), CompartmentCount::One, &[12.0]).unwrap();
        let prediction =
            crate::concentration::predict(&bolus_series(), &parameters(), CompartmentCount::One, 10.0).unwrap();
        let last_of_first_cycle = *prediction.cycles[0].concentrations[0].last().unwrap();
        assert!((single[0].concentrations[0] - last_of_first_cycle).abs() < 1e-4);
    }

    #[test]
    fn empty_intake_series_is_rejected() {
        let series = IntakeSeries::default();
        let err = predict_at_times(&series, &parameters(), CompartmentCount::One, &[1.0]).unwrap_err();
        assert_eq!(err, PkError::NoDosageHistory);
    }
}
