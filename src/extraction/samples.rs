//! Sample extraction: per-analyte patient measurements, converted to
//! the canonical `ug/l` unit and clipped to the integration window
//! (spec §4.2, §4.3 "samples before treatment start", invariant 5
//! "samples lie within `[treatment_start - ε, treatment_end + ε]`").

use crate::error::{PkError, PkResult};
use crate::events::{SampleEvent, SampleSeries};
use crate::extraction::ExtractionWindow;
use crate::model::AnalyteGroup;
use crate::treatment::DrugTreatment;
use crate::units;

/// Tolerance applied to both ends of the sample window (invariant 5's
/// "small ε"), wide enough to absorb floating-point jitter at the
/// window boundary without admitting a genuinely out-of-scope sample.
const SAMPLE_WINDOW_EPSILON_HOURS: f64 = 1e-6;

pub fn extract_samples(
    treatment: &DrugTreatment,
    analyte_group: &AnalyteGroup,
    window: ExtractionWindow,
) -> PkResult<SampleSeries> {
    let mut samples = Vec::new();
    for sample in treatment.samples_for_analyte(&analyte_group.id) {
        if sample.time_hours < window.start_hours - SAMPLE_WINDOW_EPSILON_HOURS {
            return Err(PkError::SampleBeforeTreatmentStart);
        }
        if sample.time_hours > window.end_hours + SAMPLE_WINDOW_EPSILON_HOURS {
            return Err(PkError::AposterioriPercentilesOutOfScopeSamplesError);
        }
        let value_ug_l = units::to_ug_l(sample.value, &sample.unit)
            .map_err(|e| PkError::SampleExtractionError(e.to_string()))?;
        samples.push(SampleEvent {
            time_hours: sample.time_hours,
            value_ug_l,
            weight: sample.weight,
        });
    }

    samples.sort_by(|a, b| a.time_hours.total_cmp(&b.time_hours));
    Ok(SampleSeries { samples })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompartmentCount, ParameterForm};
    use crate::treatment::Sample;

    fn group() -> AnalyteGroup {
        AnalyteGroup {
            id: "analyte-a".into(),
            pk_model_id: "pk".into(),
            compartments: CompartmentCount::One,
            parameter_form: ParameterForm::Micro,
            parameters: vec![],
            correlations: vec![],
        }
    }

    #[test]
    fn converts_to_canonical_unit() {
        let mut treatment = DrugTreatment::default();
        treatment.samples.push(Sample {
            time_hours: 5.0,
            analyte_id: "analyte-a".into(),
            value: 2.0,
            unit: "mg/l".into(),
            weight: 1.0,
        });
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 24.0,
        };
        let series = extract_samples(&treatment, &group(), window).unwrap();
        assert_eq!(series.samples.len(), 1);
        assert!((series.samples[0].value_ug_l - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn sample_before_window_start_is_rejected() {
        let mut treatment = DrugTreatment::default();
        treatment.samples.push(Sample {
            time_hours: -5.0,
            analyte_id: "analyte-a".into(),
            value: 1.0,
            unit: "ug/l".into(),
            weight: 1.0,
        });
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 24.0,
        };
        let err = extract_samples(&treatment, &group(), window).unwrap_err();
        assert_eq!(err, PkError::SampleBeforeTreatmentStart);
    }

    #[test]
    fn sample_after_window_end_is_rejected() {
        let mut treatment = DrugTreatment::default();
        treatment.samples.push(Sample {
            time_hours: 30.0,
            analyte_id: "analyte-a".into(),
            value: 1.0,
            unit: "ug/l".into(),
            weight: 1.0,
        });
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 24.0,
        };
        let err = extract_samples(&treatment, &group(), window).unwrap_err();
        assert_eq!(err, PkError::AposterioriPercentilesOutOfScopeSamplesError);
    }

    #[test]
    fn sample_exactly_at_window_bounds_is_accepted() {
        let mut treatment = DrugTreatment::default();
        treatment.samples.push(Sample {
            time_hours: 24.0,
            analyte_id: "analyte-a".into(),
            value: 1.0,
            unit: "ug/l".into(),
            weight: 1.0,
        });
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 24.0,
        };
        assert!(extract_samples(&treatment, &group(), window).is_ok());
    }
}
