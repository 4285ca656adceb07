//! Derived time-series entities owned by the extraction pipeline,
//! scoped to one request (spec §3).

use std::collections::HashMap;

use crate::calculators::IntakeCalculatorHandle;
use crate::model::AbsorptionModel;

/// One discrete dosing event expanded from the dosage history.
#[derive(Debug, Clone)]
pub struct IntakeEvent {
    pub time_hours: f64,
    pub offset_hours: f64,
    pub dose_mg: f64,
    pub interval_hours: f64,
    pub formulation_index: usize,
    pub absorption_model: AbsorptionModel,
    pub infusion_time_hours: f64,
    pub nb_points: usize,
    /// Attached after route-resolution; every intake in a fully built
    /// `IntakeSeries` must have one before integration (invariant 1).
    pub calculator: Option<IntakeCalculatorHandle>,
}

impl IntakeEvent {
    pub fn end_time_hours(&self) -> f64 {
        self.time_hours + self.interval_hours
    }
}

/// Time-ordered, contiguous (invariant 2) sequence of intakes for one
/// analyte group.
#[derive(Debug, Clone, Default)]
pub struct IntakeSeries {
    pub intakes: Vec<IntakeEvent>,
}

impl IntakeSeries {
    /// Back-patch intervals so intake *i* ends exactly where intake
    /// *i+1* begins (invariant 2).
    pub fn enforce_contiguity(&mut self) {
        for i in 0..self.intakes.len().saturating_sub(1) {
            let next_time = self.intakes[i + 1].time_hours;
            self.intakes[i].interval_hours = next_time - self.intakes[i].time_hours;
        }
    }

    pub fn all_calculators_attached(&self) -> bool {
        self.intakes.iter().all(|i| i.calculator.is_some())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CovariateEvent {
    pub time_hours: f64,
    pub covariate_id_index: usize,
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CovariateSeries {
    pub covariate_ids: Vec<String>,
    pub events: Vec<CovariateEvent>,
}

impl CovariateSeries {
    /// Value of a covariate at `time_hours`, via last-value-carried-forward.
    pub fn value_at(&self, covariate_id: &str, time_hours: f64) -> Option<f64> {
        let idx = self.covariate_ids.iter().position(|c| c == covariate_id)?;
        self.events
            .iter()
            .filter(|e| e.covariate_id_index == idx && e.time_hours <= time_hours)
            .max_by(|a, b| a.time_hours.total_cmp(&b.time_hours))
            .map(|e| e.value)
    }
}

/// One consolidated snapshot: every parameter of the group has a
/// defined value (invariant 3, after `ParameterSetSeries::consolidate`).
#[derive(Debug, Clone)]
pub struct ParameterSetEvent {
    pub time_hours: f64,
    pub values: Vec<(String, f64)>,
}

impl ParameterSetEvent {
    pub fn get(&self, id: &str) -> Option<f64> {
        self.values.iter().find(|(k, _)| k == id).map(|(_, v)| v)
    }

    pub fn as_map(&self) -> HashMap<&str, f64> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v)).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterSetSeries {
    pub events: Vec<ParameterSetEvent>,
}

impl ParameterSetSeries {
    /// The full parameter set in effect at `time_hours` (last value
    /// carried forward; invariant 3 guarantees this is always `Some`
    /// once the series has at least one event at or before `time_hours`).
    pub fn at(&self, time_hours: f64) -> Option<&ParameterSetEvent> {
        self.events
            .iter()
            .filter(|e| e.time_hours <= time_hours)
            .max_by(|a, b| a.time_hours.total_cmp(&b.time_hours))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SampleEvent {
    pub time_hours: f64,
    pub value_ug_l: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SampleSeries {
    pub samples: Vec<SampleEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforce_contiguity_closes_gaps() {
        let mut series = IntakeSeries {
            intakes: vec![
                IntakeEvent {
                    time_hours: 0.0,
                    offset_hours: 0.0,
                    dose_mg: 100.0,
                    interval_hours: 999.0,
                    formulation_index: 0,
                    absorption_model: AbsorptionModel::Intravascular,
                    infusion_time_hours: 0.0,
                    nb_points: 10,
                    calculator: None,
                },
                IntakeEvent {
                    time_hours: 12.0,
                    offset_hours: 12.0,
                    dose_mg: 100.0,
                    interval_hours: 12.0,
                    formulation_index: 0,
                    absorption_model: AbsorptionModel::Intravascular,
                    infusion_time_hours: 0.0,
                    nb_points: 10,
                    calculator: None,
                },
            ],
        };
        series.enforce_contiguity();
        assert_eq!(series.intakes[0].interval_hours, 12.0);
    }

    #[test]
    fn parameter_set_series_carries_forward() {
        let series = ParameterSetSeries {
            events: vec![
                ParameterSetEvent {
                    time_hours: 0.0,
                    values: vec![("CL".into(), 5.0)],
                },
                ParameterSetEvent {
                    time_hours: 10.0,
                    values: vec![("CL".into(), 6.0)],
                },
            ],
        };
        assert_eq!(series.at(5.0).unwrap().get("CL"), Some(5.0));
        assert_eq!(series.at(10.0).unwrap().get("CL"), Some(6.0));
        assert_eq!(series.at(100.0).unwrap().get("CL"), Some(6.0));
    }
}
