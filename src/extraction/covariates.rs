//! Covariate extraction: merge drug-model defaults with patient
//! overrides into a step-function timeline (spec §4.2).

use crate::error::PkResult;
use crate::events::{CovariateEvent, CovariateSeries};
use crate::extraction::ExtractionWindow;
use crate::model::DrugModel;
use crate::treatment::DrugTreatment;

/// Build the covariate timeline for one treatment: one event per
/// covariate at the window start (the drug-model default), plus one
/// event per patient override, all carried forward by
/// [`CovariateSeries::value_at`].
pub fn extract_covariates(
    drug_model: &DrugModel,
    treatment: &DrugTreatment,
    window: ExtractionWindow,
) -> PkResult<CovariateSeries> {
    let covariate_ids: Vec<String> = drug_model
        .covariate_definitions
        .iter()
        .map(|c| c.id.clone())
        .collect();

    let mut events = Vec::new();
    for (idx, def) in drug_model.covariate_definitions.iter().enumerate() {
        events.push(CovariateEvent {
            time_hours: window.start_hours,
            covariate_id_index: idx,
            value: def.default_value,
        });
    }

    for patient_override in &treatment.covariates {
        let Some(idx) = covariate_ids.iter().position(|id| id == &patient_override.covariate_id) else {
            continue;
        };
        events.push(CovariateEvent {
            time_hours: patient_override.time_hours,
            covariate_id_index: idx,
            value: patient_override.value,
        });
    }

    events.sort_by(|a, b| a.time_hours.total_cmp(&b.time_hours));

    Ok(CovariateSeries { covariate_ids, events })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AllowMultipleRoutes, CovariateDataType, CovariateDefinition, TimeConsiderations, TimeUnit};
    use crate::treatment::PatientCovariate;

    fn drug_model_with_weight() -> DrugModel {
        DrugModel {
            drug_id: "d".into(),
            analyte_groups: vec![],
            active_moieties: vec![],
            formulations_and_routes: vec![],
            covariate_definitions: vec![CovariateDefinition {
                id: "weight".into(),
                default_value: 70.0,
                data_type: CovariateDataType::Double,
                unit: "kg".into(),
                validation_formula: None,
            }],
            time_considerations: TimeConsiderations {
                half_life_value: 1.0,
                half_life_unit: TimeUnit::Hour,
                secure_start_multiplier: 0.0,
            },
            targets: vec![],
            allow_multiple_routes: AllowMultipleRoutes::No,
        }
    }

    #[test]
    fn default_applies_before_any_override() {
        let drug_model = drug_model_with_weight();
        let treatment = DrugTreatment::default();
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 24.0,
        };
        let series = extract_covariates(&drug_model, &treatment, window).unwrap();
        assert_eq!(series.value_at("weight", 0.0), Some(70.0));
        assert_eq!(series.value_at("weight", 1000.0), Some(70.0));
    }

    #[test]
    fn patient_override_takes_effect_at_its_time() {
        let drug_model = drug_model_with_weight();
        let mut treatment = DrugTreatment::default();
        treatment.covariates.push(PatientCovariate {
            time_hours: 12.0,
            covariate_id: "weight".into(),
            value: 82.0,
        });
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 24.0,
        };
        let series = extract_covariates(&drug_model, &treatment, window).unwrap();
        assert_eq!(series.value_at("weight", 6.0), Some(70.0));
        assert_eq!(series.value_at("weight", 12.0), Some(82.0));
        assert_eq!(series.value_at("weight", 23.0), Some(82.0));
    }
}
