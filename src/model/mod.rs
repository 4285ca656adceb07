//! `DrugModel`: the immutable, caller-owned description of a drug's
//! population PK model, its formulations/routes, its covariates and its
//! clinical targets (spec §3).
//!
//! The core never parses a `DrugModel` from XML or any other wire
//! format — construction from an external drug-model file is explicitly
//! out of scope (spec §1). Callers build one with plain struct literals
//! or via [`DrugModelBuilder`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{PkError, PkResult};

/// Number of linear compartments a PK model integrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompartmentCount {
    One,
    Two,
    Three,
}

impl CompartmentCount {
    pub fn as_usize(self) -> usize {
        match self {
            CompartmentCount::One => 1,
            CompartmentCount::Two => 2,
            CompartmentCount::Three => 3,
        }
    }
}

/// How a dose enters the central compartment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbsorptionModel {
    Intravascular,
    Infusion,
    Extravascular,
    ExtravascularLag,
}

/// Parameter value is a micro (rate constants) or macro (CL/Q/V) set.
/// Macro parameters are converted to micro before any solver runs
/// (spec §4.1 supplement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterForm {
    Micro,
    Macro,
}

/// Inter-individual variability type for one parameter (spec §4.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariabilityType {
    None,
    Proportional,
    Exponential,
    LogNormal,
    Normal,
    Logit,
}

/// Definition of a single model parameter: its nominal (population)
/// value formula inputs are resolved at extraction time; here we only
/// carry the typical value and variability metadata needed to build
/// the Ω matrix and to apply η.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub id: String,
    /// Formula text evaluated by the extraction pipeline. `None` means
    /// the parameter is a constant equal to `theta`.
    pub formula: Option<String>,
    pub theta: f64,
    pub variability_type: VariabilityType,
    /// Standard deviation (or CV, depending on `variability_type`) used
    /// to populate the diagonal of Ω. Ignored when `variability_type`
    /// is `None`.
    pub omega: f64,
}

/// An analyte group: a set of analytes sharing one PK model identifier
/// and one parameter-set definition (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyteGroup {
    pub id: String,
    pub pk_model_id: String,
    pub compartments: CompartmentCount,
    pub parameter_form: ParameterForm,
    pub parameters: Vec<ParameterDefinition>,
    /// Pairwise correlations `(param_i, param_j, correlation)` among
    /// variable parameters, used to fill Ω's off-diagonals (invariant 4).
    pub correlations: Vec<(String, String, f64)>,
}

impl AnalyteGroup {
    /// Parameter ids whose variability type is not `None` — the ones
    /// that make up the Ω matrix dimension (invariant 4).
    pub fn variable_parameter_ids(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.variability_type != VariabilityType::None)
            .map(|p| p.id.as_str())
            .collect()
    }
}

/// An algebraic combination of analyte concentrations used for targets
/// (spec §3, §4.4 multi-analyte flow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveMoiety {
    pub id: String,
    pub analyte_ids: Vec<String>,
    /// Combination formula, e.g. `"analyte_a + 0.5 * analyte_b"`.
    /// A single-analyte moiety uses the identity formula.
    pub formula: String,
    pub unit: String,
}

impl ActiveMoiety {
    /// Evaluate the combination for one time index given each
    /// analyte's concentration. Supports the two shapes the formula
    /// language in this core needs: a lone identifier, or a sum of
    /// `coeff * id` terms separated by `+`.
    pub fn combine(&self, concentrations: &HashMap<&str, f64>) -> PkResult<f64> {
        let mut total = 0.0;
        for term in self.formula.split('+') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let (coeff, id) = match term.split_once('*') {
                Some((c, id)) => (
                    c.trim().parse::<f64>().map_err(|_| {
                        PkError::AnalyteConversionError(format!(
                            "invalid coefficient in active moiety formula: {term}"
                        ))
                    })?,
                    id.trim(),
                ),
                None => (1.0, term),
            };
            let conc = concentrations.get(id).ok_or_else(|| {
                PkError::AnalyteConversionError(format!("unknown analyte in formula: {id}"))
            })?;
            total += coeff * conc;
        }
        Ok(total)
    }
}

/// Data type of a covariate value (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovariateDataType {
    Int,
    Double,
    Bool,
    Date,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CovariateDefinition {
    pub id: String,
    pub default_value: f64,
    pub data_type: CovariateDataType,
    pub unit: String,
    /// Optional validation formula; test-evaluated with all-1/all-true
    /// inputs during the orchestrator's pre-flight checks (spec §4.6).
    pub validation_formula: Option<String>,
}

/// Half-life and the secure-start multiplier used to back up the
/// extraction window (spec §4.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeConsiderations {
    pub half_life_value: f64,
    pub half_life_unit: TimeUnit,
    pub secure_start_multiplier: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TimeUnit {
    Hour,
    Day,
    Minute,
}

impl TimeUnit {
    pub fn to_hours(self, value: f64) -> f64 {
        match self {
            TimeUnit::Hour => value,
            TimeUnit::Day => value * 24.0,
            TimeUnit::Minute => value / 60.0,
        }
    }
}

/// One clinical target kind (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    Residual,
    Peak,
    Auc,
    Tmax,
    CumulativeAuc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDefinition {
    pub active_moiety_id: String,
    pub kind: TargetKind,
    pub min: f64,
    pub best: f64,
    pub max: f64,
    pub unit: String,
}

/// Per-route dosing envelope: valid doses, intervals, infusion times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulationAndRoute {
    pub formulation: String,
    pub absorption_model: AbsorptionModel,
    pub valid_doses: Vec<f64>,
    pub valid_intervals_hours: Vec<f64>,
    pub valid_infusion_times_hours: Vec<f64>,
    /// Per-analyte-group parameter overrides keyed by analyte group id.
    pub parameter_overrides: HashMap<String, Vec<ParameterDefinition>>,
}

/// Whether a PK model allows a dosage history mixing multiple routes
/// (spec §4.6 pre-flight check).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllowMultipleRoutes {
    Yes,
    No,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrugModel {
    pub drug_id: String,
    pub analyte_groups: Vec<AnalyteGroup>,
    pub active_moieties: Vec<ActiveMoiety>,
    pub formulations_and_routes: Vec<FormulationAndRoute>,
    pub covariate_definitions: Vec<CovariateDefinition>,
    pub time_considerations: TimeConsiderations,
    pub targets: Vec<TargetDefinition>,
    pub allow_multiple_routes: AllowMultipleRoutes,
}

impl DrugModel {
    pub fn analyte_group(&self, id: &str) -> Option<&AnalyteGroup> {
        self.analyte_groups.iter().find(|g| g.id == id)
    }

    pub fn active_moiety(&self, id: &str) -> Option<&ActiveMoiety> {
        self.active_moieties.iter().find(|m| m.id == id)
    }

    pub fn formulation_and_route(
        &self,
        formulation: &str,
        absorption_model: AbsorptionModel,
    ) -> Option<&FormulationAndRoute> {
        self.formulations_and_routes
            .iter()
            .find(|f| f.formulation == formulation && f.absorption_model == absorption_model)
    }

    pub fn covariate_definition(&self, id: &str) -> Option<&CovariateDefinition> {
        self.covariate_definitions.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_moiety_single_analyte_identity() {
        let moiety = ActiveMoiety {
            id: "m".into(),
            analyte_ids: vec!["a".into()],
            formula: "a".into(),
            unit: "ug/l".into(),
        };
        let mut map = HashMap::new();
        map.insert("a", 5.0);
        assert_eq!(moiety.combine(&map).unwrap(), 5.0);
    }

    #[test]
    fn active_moiety_weighted_sum() {
        let moiety = ActiveMoiety {
            id: "m".into(),
            analyte_ids: vec!["a".into(), "b".into()],
            formula: "a + 0.5 * b".into(),
            unit: "ug/l".into(),
        };
        let mut map = HashMap::new();
        map.insert("a", 4.0);
        map.insert("b", 2.0);
        assert_eq!(moiety.combine(&map).unwrap(), 5.0);
    }

    #[test]
    fn variable_parameter_ids_skips_none_type() {
        let group = AnalyteGroup {
            id: "g".into(),
            pk_model_id: "pk".into(),
            compartments: CompartmentCount::One,
            parameter_form: ParameterForm::Micro,
            parameters: vec![
                ParameterDefinition {
                    id: "V".into(),
                    formula: None,
                    theta: 10.0,
                    variability_type: VariabilityType::None,
                    omega: 0.0,
                },
                ParameterDefinition {
                    id: "Ke".into(),
                    formula: None,
                    theta: 0.1,
                    variability_type: VariabilityType::Exponential,
                    omega: 0.2,
                },
            ],
            correlations: vec![],
        };
        assert_eq!(group.variable_parameter_ids(), vec!["Ke"]);
    }
}
