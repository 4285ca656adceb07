//! Parameter extraction: evaluate each parameter's formula at every
//! covariate-change time, then consolidate into a full-set timeline
//! (spec §4.2).
//!
//! Formulas may only reference covariate values (time-varying) and
//! other parameters' *population* value via the `<id>_population`
//! suffix (spec §9) — population values are each parameter's constant
//! `theta`, never another parameter's time-varying evaluation, so no
//! dependency cycle between sibling parameters is possible by
//! construction and no topological sort is needed here.

use std::collections::HashMap;

use crate::error::PkResult;
use crate::events::{CovariateSeries, ParameterSetEvent, ParameterSetSeries};
use crate::extraction::ExtractionWindow;
use crate::model::AnalyteGroup;

fn population_env(analyte_group: &AnalyteGroup) -> HashMap<String, f64> {
    analyte_group
        .parameters
        .iter()
        .map(|p| (format!("{}_population", p.id), p.theta))
        .collect()
}

fn evaluate_all(
    analyte_group: &AnalyteGroup,
    covariates_env: &HashMap<String, f64>,
    population_env: &HashMap<String, f64>,
) -> PkResult<Vec<(String, f64)>> {
    let mut env = covariates_env.clone();
    env.extend(population_env.iter().map(|(k, v)| (k.clone(), *v)));

    let mut values = Vec::with_capacity(analyte_group.parameters.len());
    for param in &analyte_group.parameters {
        let value = match &param.formula {
            Some(expr) => crate::formula::evaluate(expr, &env)?,
            None => param.theta,
        };
        values.push((param.id.clone(), value));
    }
    Ok(values)
}

/// Build the sparse-then-consolidated parameter timeline for one
/// analyte group (spec §4.2 "Parameter extraction").
pub fn extract_parameters(
    _drug_model: &crate::model::DrugModel,
    analyte_group: &AnalyteGroup,
    covariates: &CovariateSeries,
    window: ExtractionWindow,
) -> PkResult<ParameterSetSeries> {
    let population = population_env(analyte_group);

    let mut change_times: Vec<f64> = covariates
        .events
        .iter()
        .map(|e| e.time_hours)
        .filter(|t| *t >= window.start_hours && *t <= window.end_hours)
        .collect();
    change_times.push(window.start_hours);
    change_times.sort_by(|a, b| a.total_cmp(b));
    change_times.dedup_by(|a, b| (*a - *b).abs() < 1e-12);

    let mut sparse: Vec<ParameterSetEvent> = Vec::new();
    let mut last_values: HashMap<String, f64> = HashMap::new();

    for t in change_times {
        let covariate_env: HashMap<String, f64> = covariates
            .covariate_ids
            .iter()
            .filter_map(|id| covariates.value_at(id, t).map(|v| (id.clone(), v)))
            .collect();

        let full = evaluate_all(analyte_group, &covariate_env, &population)?;

        let changed: Vec<(String, f64)> = full
            .iter()
            .filter(|(id, value)| {
                last_values
                    .get(id)
                    .map(|prev| (*prev - *value).abs() > 1e-12)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        for (id, value) in &full {
            last_values.insert(id.clone(), *value);
        }

        if !changed.is_empty() {
            sparse.push(ParameterSetEvent {
                time_hours: t,
                values: changed,
            });
        }
    }

    Ok(consolidate(&sparse))
}

/// Carry-forward pass: every event in the returned series contains
/// every parameter id seen so far (invariant 3).
fn consolidate(sparse: &[ParameterSetEvent]) -> ParameterSetSeries {
    let mut running: HashMap<String, f64> = HashMap::new();
    let mut events = Vec::with_capacity(sparse.len());
    for event in sparse {
        for (id, value) in &event.values {
            running.insert(id.clone(), *value);
        }
        let mut values: Vec<(String, f64)> = running.iter().map(|(k, v)| (k.clone(), *v)).collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        events.push(ParameterSetEvent {
            time_hours: event.time_hours,
            values,
        });
    }
    ParameterSetSeries { events }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompartmentCount, ParameterDefinition, ParameterForm, VariabilityType};

    fn group_with_weight_banded_clearance() -> AnalyteGroup {
        AnalyteGroup {
            id: "g".into(),
            pk_model_id: "pk".into(),
            compartments: CompartmentCount::One,
            parameter_form: ParameterForm::Micro,
            parameters: vec![
                ParameterDefinition {
                    id: "V".into(),
                    formula: None,
                    theta: 347.0,
                    variability_type: VariabilityType::None,
                    omega: 0.0,
                },
                ParameterDefinition {
                    id: "Ke".into(),
                    formula: Some("Ke_population * weight / 70".to_string()),
                    theta: 0.0435,
                    variability_type: VariabilityType::Exponential,
                    omega: 0.2,
                },
            ],
            correlations: vec![],
        }
    }

    #[test]
    fn formula_parameter_tracks_covariate_change() {
        let drug_model = crate::model::DrugModel {
            drug_id: "d".into(),
            analyte_groups: vec![],
            active_moieties: vec![],
            formulations_and_routes: vec![],
            covariate_definitions: vec![],
            time_considerations: crate::model::TimeConsiderations {
                half_life_value: 1.0,
                half_life_unit: crate::model::TimeUnit::Hour,
                secure_start_multiplier: 0.0,
            },
            targets: vec![],
            allow_multiple_routes: crate::model::AllowMultipleRoutes::No,
        };
        let group = group_with_weight_banded_clearance();
        let covariates = CovariateSeries {
            covariate_ids: vec!["weight".to_string()],
            events: vec![
                crate::events::CovariateEvent {
                    time_hours: 0.0,
                    covariate_id_index: 0,
                    value: 70.0,
                },
                crate::events::CovariateEvent {
                    time_hours: 12.0,
                    covariate_id_index: 0,
                    value: 84.0,
                },
            ],
        };
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 24.0,
        };
        let series = extract_parameters(&drug_model, &group, &covariates, window).unwrap();
        assert_eq!(series.at(0.0).unwrap().get("Ke"), Some(0.0435));
        let ke_at_12 = series.at(12.0).unwrap().get("Ke").unwrap();
        assert!((ke_at_12 - 0.0435 * 84.0 / 70.0).abs() < 1e-9);
        assert_eq!(series.at(12.0).unwrap().get("V"), Some(347.0));
    }

    #[test]
    fn every_consolidated_event_has_the_full_parameter_set() {
        let drug_model = crate::model::DrugModel {
            drug_id: "d".into(),
            analyte_groups: vec![],
            active_moieties: vec![],
            formulations_and_routes: vec![],
            covariate_definitions: vec![],
            time_considerations: crate::model::TimeConsiderations {
                half_life_value: 1.0,
                half_life_unit: crate::model::TimeUnit::Hour,
                secure_start_multiplier: 0.0,
            },
            targets: vec![],
            allow_multiple_routes: crate::model::AllowMultipleRoutes::No,
        };
        let group = group_with_weight_banded_clearance();
        let covariates = CovariateSeries {
            covariate_ids: vec!["weight".to_string()],
            events: vec![crate::events::CovariateEvent {
                time_hours: 0.0,
                covariate_id_index: 0,
                value: 70.0,
            }],
        };
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 24.0,
        };
        let series = extract_parameters(&drug_model, &group, &covariates, window).unwrap();
        for event in &series.events {
            assert!(event.get("V").is_some());
            assert!(event.get("Ke").is_some());
        }
    }
}
