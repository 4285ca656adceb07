//! `DrugTreatment`: a patient's dosage history, covariates, samples and
//! clinical target overrides (spec §3).

use serde::{Deserialize, Serialize};

use crate::model::{AbsorptionModel, TargetKind};

/// One entry in a dosage history: either a single dose, a repeated
/// dose, a looped block, or a daily-dose pattern, bounded to a time
/// range (spec §3). Times are hours from the treatment's epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DosageTimeRange {
    pub start_hours: f64,
    pub end_hours: Option<f64>,
    pub content: DosageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DosageContent {
    Single(DoseSpec),
    /// A single dose repeated `count` times at `interval_hours` spacing.
    Repeat {
        dose: DoseSpec,
        interval_hours: f64,
        count: u32,
    },
    /// A repeat whose repetition count is implied by the enclosing
    /// range's `end_hours`, rather than stated explicitly.
    Loop {
        dose: DoseSpec,
        interval_hours: f64,
    },
    /// A dose given once per calendar day at a fixed time-of-day offset.
    DailyDose {
        dose: DoseSpec,
        time_of_day_hours: f64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DoseSpec {
    pub amount: f64,
    pub unit_to_mg: f64,
    pub formulation_index: usize,
    pub absorption_model: AbsorptionModel,
    /// `None` for non-infusion routes; `Some(0.0)` is re-labelled to
    /// `Intravascular` by the extraction pipeline (spec §4.1).
    pub infusion_time_hours: Option<f64>,
    pub interval_hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DosageHistory {
    pub ranges: Vec<DosageTimeRange>,
}

impl DosageHistory {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Distinct formulation/route pairs present across the history
    /// (spec §4.6 pre-flight "every formulation appears in the drug
    /// model" check looks these up).
    pub fn distinct_formulations(&self) -> Vec<(usize, AbsorptionModel)> {
        let mut seen = Vec::new();
        for range in &self.ranges {
            let specs: Vec<&DoseSpec> = match &range.content {
                DosageContent::Single(d) => vec![d],
                DosageContent::Repeat { dose, .. } => vec![dose],
                DosageContent::Loop { dose, .. } => vec![dose],
                DosageContent::DailyDose { dose, .. } => vec![dose],
            };
            for d in specs {
                let key = (d.formulation_index, d.absorption_model);
                if !seen.contains(&key) {
                    seen.push(key);
                }
            }
        }
        seen
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientCovariate {
    pub time_hours: f64,
    pub covariate_id: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub time_hours: f64,
    pub analyte_id: String,
    pub value: f64,
    pub unit: String,
    pub weight: f64,
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            time_hours: 0.0,
            analyte_id: String::new(),
            value: 0.0,
            unit: "ug/l".to_string(),
            weight: 1.0,
        }
    }
}

/// A drug-treatment-level override of one of the drug model's default
/// targets (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicalTargetOverride {
    pub active_moiety_id: String,
    pub kind: TargetKind,
    pub min: f64,
    pub best: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DrugTreatment {
    pub dosage_history: DosageHistory,
    pub covariates: Vec<PatientCovariate>,
    pub samples: Vec<Sample>,
    pub target_overrides: Vec<ClinicalTargetOverride>,
}

impl DrugTreatment {
    pub fn samples_for_analyte(&self, analyte_id: &str) -> Vec<&Sample> {
        self.samples
            .iter()
            .filter(|s| s.analyte_id == analyte_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_formulations_deduplicates() {
        let dose = DoseSpec {
            amount: 100.0,
            unit_to_mg: 1.0,
            formulation_index: 0,
            absorption_model: AbsorptionModel::Extravascular,
            infusion_time_hours: None,
            interval_hours: 12.0,
        };
        let history = DosageHistory {
            ranges: vec![
                DosageTimeRange {
                    start_hours: 0.0,
                    end_hours: Some(24.0),
                    content: DosageContent::Repeat {
                        dose,
                        interval_hours: 12.0,
                        count: 2,
                    },
                },
                DosageTimeRange {
                    start_hours: 24.0,
                    end_hours: None,
                    content: DosageContent::Single(dose),
                },
            ],
        };
        assert_eq!(
            history.distinct_formulations(),
            vec![(0, AbsorptionModel::Extravascular)]
        );
    }
}
