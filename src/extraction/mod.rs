//! Extraction pipeline: turns `(DrugModel, DrugTreatment, trait window)`
//! into the four time-aligned series the engines consume (spec §4.2).
//!
//! This module only builds series; it never runs a calculator. The
//! concentration engine (`crate::concentration`) walks the resulting
//! `IntakeSeries`, chaining residuals between intakes.

pub mod covariates;
pub mod intakes;
pub mod parameters;
pub mod samples;

use crate::calculators::CalculatorFamily;
use crate::error::{PkError, PkResult};
use crate::events::{CovariateSeries, IntakeSeries, ParameterSetSeries, SampleSeries};
use crate::model::{AnalyteGroup, DrugModel};
use crate::treatment::DrugTreatment;

/// Maximum number of solver samples (intakes × points-per-intake,
/// summed) a single request may expand into before the overload
/// evaluator rejects it (spec §4.2 "Overload evaluator").
pub const MAX_TOTAL_POINTS: usize = 2_000_000;

/// `[start_hours, end_hours]` of the window the extraction pipeline
/// integrates over, both expressed relative to the treatment epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionWindow {
    pub start_hours: f64,
    pub end_hours: f64,
}

/// Compute the integration window (spec §4.2 "Extraction start time").
///
/// The pipeline normally starts `halfLife * multiplier` hours before
/// `start_of_prediction_hours`, to let transient residuals wash out
/// before the reported window begins. If an earlier sample exists, the
/// window instead starts at that sample's time so it is never excluded
/// from the fit.
pub fn compute_window(
    drug_model: &DrugModel,
    treatment: &DrugTreatment,
    start_of_prediction_hours: f64,
    end_of_prediction_hours: f64,
) -> ExtractionWindow {
    let tc = &drug_model.time_considerations;
    let half_life_hours = tc.half_life_unit.to_hours(tc.half_life_value);
    let mut start_hours = start_of_prediction_hours - half_life_hours * tc.secure_start_multiplier;

    if let Some(earliest_sample) = treatment
        .samples
        .iter()
        .map(|s| s.time_hours)
        .fold(None, |acc: Option<f64>, t| match acc {
            Some(a) if a <= t => Some(a),
            _ => Some(t),
        })
    {
        if earliest_sample < start_hours {
            start_hours = earliest_sample;
        }
    }

    ExtractionWindow {
        start_hours,
        end_hours: end_of_prediction_hours,
    }
}

/// The four series extracted for one analyte group, ready for the
/// concentration engine.
#[derive(Debug, Clone)]
pub struct ExtractedData {
    pub window: ExtractionWindow,
    pub intakes: IntakeSeries,
    pub covariates: CovariateSeries,
    pub parameters: ParameterSetSeries,
    pub samples: SampleSeries,
}

/// Run the full pipeline for one analyte group.
pub fn extract_all(
    drug_model: &DrugModel,
    treatment: &DrugTreatment,
    analyte_group: &AnalyteGroup,
    start_of_prediction_hours: f64,
    end_of_prediction_hours: f64,
    nb_points_per_hour: f64,
    family: CalculatorFamily,
) -> PkResult<ExtractedData> {
    if treatment.dosage_history.is_empty() {
        return Err(PkError::NoDosageHistory);
    }

    let window = compute_window(drug_model, treatment, start_of_prediction_hours, end_of_prediction_hours);

    let covariate_series = covariates::extract_covariates(drug_model, treatment, window)?;
    let parameter_series =
        parameters::extract_parameters(drug_model, analyte_group, &covariate_series, window)?;
    let intake_series = intakes::extract_intakes(
        drug_model,
        treatment,
        window,
        nb_points_per_hour,
        family,
    )?;
    let sample_series = samples::extract_samples(treatment, analyte_group, window)?;

    Ok(ExtractedData {
        window,
        intakes: intake_series,
        covariates: covariate_series,
        parameters: parameter_series,
        samples: sample_series,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TimeConsiderations, TimeUnit};
    use crate::treatment::Sample;

    fn time_considerations() -> TimeConsiderations {
        TimeConsiderations {
            half_life_value: 10.0,
            half_life_unit: TimeUnit::Hour,
            secure_start_multiplier: 4.0,
        }
    }

    #[test]
    fn window_backs_up_by_half_life_multiplier() {
        let drug_model_time = time_considerations();
        let half_life_hours = drug_model_time.half_life_unit.to_hours(drug_model_time.half_life_value);
        let expected_start = 100.0 - half_life_hours * drug_model_time.secure_start_multiplier;
        assert_eq!(expected_start, 60.0);
    }

    #[test]
    fn window_start_yields_to_earlier_sample() {
        let mut treatment = DrugTreatment::default();
        treatment.samples.push(Sample {
            time_hours: 10.0,
            analyte_id: "a".into(),
            value: 1.0,
            unit: "ug/l".into(),
            weight: 1.0,
        });
        let drug_model = crate::model::DrugModel {
            drug_id: "d".into(),
            analyte_groups: vec![],
            active_moieties: vec![],
            formulations_and_routes: vec![],
            covariate_definitions: vec![],
            time_considerations: time_considerations(),
            targets: vec![],
            allow_multiple_routes: crate::model::AllowMultipleRoutes::No,
        };
        let window = compute_window(&drug_model, &treatment, 100.0, 200.0);
        assert_eq!(window.start_hours, 10.0);
    }
}
