//! Intake interval calculators (spec §4.1).
//!
//! For one intake event, a calculator computes either the full
//! concentration trajectory over `N` evenly spaced times, or the
//! concentration at one arbitrary offset, plus the residual
//! compartment amounts at end-of-interval for chaining into the next
//! intake. Dynamic dispatch over the combinatorial grid (compartment
//! count × route × micro/macro × analytical/RK4) is handled by a small
//! trait plus a factory registry (spec §9 design notes), rather than a
//! deep inheritance hierarchy.

pub mod one_compartment;
pub mod pertinent_times;
pub mod rk4;
pub mod three_compartment;
pub mod two_compartment;

use std::sync::Arc;

use crate::error::{PkError, PkResult};
use crate::events::IntakeEvent;
use crate::model::{AbsorptionModel, CompartmentCount, ParameterForm};

/// Output of one calculator invocation: per-compartment concentration
/// columns, and the residual amounts to carry into the next intake.
#[derive(Debug, Clone)]
pub struct CalculatorOutput {
    /// `concentrations[compartment][time_index]`.
    pub concentrations: Vec<Vec<f64>>,
    pub out_residuals: Vec<f64>,
}

impl CalculatorOutput {
    pub fn single_point(concentrations: Vec<f64>, out_residuals: Vec<f64>) -> Self {
        Self {
            concentrations: concentrations.into_iter().map(|c| vec![c]).collect(),
            out_residuals,
        }
    }

    /// Central-compartment (index 0) concentration at the last time index.
    pub fn last_central(&self) -> f64 {
        self.concentrations[0]
            .last()
            .copied()
            .unwrap_or(0.0)
    }
}

/// Parameter id metadata + the two solving entry points every
/// calculator publishes (spec §4.1 public contract).
pub trait IntakeIntervalCalculator: Send + Sync {
    /// Ordered set of parameter ids this calculator requires, e.g.
    /// `["V", "Ke", "Ka", "F"]` for the 1-compartment extravascular
    /// micro calculator.
    fn required_parameter_ids(&self) -> Vec<&'static str>;

    fn n_compartments(&self) -> usize;

    /// Validate that every required parameter is present, finite, and
    /// satisfies the calculator's positivity constraints.
    fn validate_parameters(&self, parameters: &[(String, f64)]) -> PkResult<()> {
        for id in self.required_parameter_ids() {
            let value = parameters
                .iter()
                .find(|(k, _)| k == id)
                .map(|(_, v)| *v)
                .ok_or_else(|| PkError::BadParameters(format!("missing parameter {id}")))?;
            if !value.is_finite() {
                return Err(PkError::BadParameters(format!(
                    "parameter {id} is not finite: {value}"
                )));
            }
            let must_be_positive = matches!(id, "V" | "V1" | "V2" | "V3" | "Ke" | "Ka" | "F");
            if must_be_positive && value <= 0.0 {
                return Err(PkError::BadParameters(format!(
                    "parameter {id} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }

    fn calculate_points(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        nb_points_per_hour: f64,
    ) -> PkResult<CalculatorOutput>;

    fn calculate_single_point(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        t_hours: f64,
    ) -> PkResult<CalculatorOutput>;
}

pub type IntakeCalculatorHandle = Arc<dyn IntakeIntervalCalculator>;

/// Convert macro parameters (CL, Q, V1, V2, V3) to micro rate constants
/// (Ke, K12, K21, K13, K31). Shared by every macro calculator so the
/// analytical solver body is written once, in micro form (SPEC_FULL §4.1).
pub fn macro_to_micro(parameters: &[(String, f64)]) -> PkResult<Vec<(String, f64)>> {
    let get = |id: &str| -> Option<f64> { parameters.iter().find(|(k, _)| k == id).map(|(_, v)| *v) };
    let mut out: Vec<(String, f64)> = parameters.to_vec();
    let cl = get("CL");
    let v1 = get("V1").or_else(|| get("V"));
    if let (Some(cl), Some(v1)) = (cl, v1) {
        out.push(("Ke".to_string(), cl / v1));
        out.push(("V".to_string(), v1));
    }
    if let (Some(q), Some(v1), Some(v2)) = (get("Q2").or_else(|| get("Q")), v1, get("V2")) {
        out.push(("K12".to_string(), q / v1));
        out.push(("K21".to_string(), q / v2));
    }
    if let (Some(q3), Some(v1), Some(v3)) = (get("Q3"), v1, get("V3")) {
        out.push(("K13".to_string(), q3 / v1));
        out.push(("K31".to_string(), q3 / v3));
    }
    Ok(out)
}

/// Re-label an infusion intake with `Tinf = 0` as intravascular rather
/// than failing (spec §4.1).
pub fn normalize_absorption_model(
    absorption_model: AbsorptionModel,
    infusion_time_hours: f64,
) -> AbsorptionModel {
    if absorption_model == AbsorptionModel::Infusion && infusion_time_hours <= 0.0 {
        AbsorptionModel::Intravascular
    } else {
        absorption_model
    }
}

/// Selects the calculator family: closed-form analytical, or the RK4
/// integrator family (used for the same routes plus nonstandard
/// absorption kinetics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculatorFamily {
    Analytical,
    Rk4,
}

/// Registry mapping `(compartments, absorption_model, parameter_form, family)`
/// to a calculator instance. Calculators are stateless between calls
/// (spec §9 ownership notes), so one instance is shared for every
/// intake requesting the same combination.
pub fn resolve_calculator(
    compartments: CompartmentCount,
    absorption_model: AbsorptionModel,
    parameter_form: ParameterForm,
    family: CalculatorFamily,
) -> PkResult<IntakeCalculatorHandle> {
    use AbsorptionModel::*;
    use CalculatorFamily::*;
    use CompartmentCount::*;

    match (compartments, absorption_model, family) {
        (One, Intravascular, Analytical) => {
            Ok(Arc::new(one_compartment::OneCompartmentBolus::new(parameter_form)))
        }
        (One, Infusion, Analytical) => {
            Ok(Arc::new(one_compartment::OneCompartmentInfusion::new(parameter_form)))
        }
        (One, Extravascular, Analytical) => {
            Ok(Arc::new(one_compartment::OneCompartmentExtra::new(parameter_form)))
        }
        (One, ExtravascularLag, Analytical) => {
            Ok(Arc::new(one_compartment::OneCompartmentExtraLag::new(parameter_form)))
        }
        (One, Extravascular, Rk4) => Ok(Arc::new(rk4::RkOneCompartmentExtra::new(parameter_form))),
        (Two, Intravascular, Analytical) => {
            Ok(Arc::new(two_compartment::TwoCompartmentBolus::new(parameter_form)))
        }
        (Two, Infusion, Analytical) => {
            Ok(Arc::new(two_compartment::TwoCompartmentInfusion::new(parameter_form)))
        }
        (Two, Extravascular, Analytical) => {
            Ok(Arc::new(two_compartment::TwoCompartmentExtra::new(parameter_form)))
        }
        (Two, ExtravascularLag, Analytical) => {
            Ok(Arc::new(two_compartment::TwoCompartmentExtraLag::new(parameter_form)))
        }
        (Two, ExtravascularLag, Rk4) => {
            Ok(Arc::new(rk4::RkTwoCompartmentExtraLag::new(parameter_form)))
        }
        (Three, Intravascular, Analytical) => {
            Ok(Arc::new(three_compartment::ThreeCompartmentBolus::new(parameter_form)))
        }
        (Three, Infusion, Analytical) => {
            Ok(Arc::new(three_compartment::ThreeCompartmentInfusion::new(parameter_form)))
        }
        (Three, Extravascular, Analytical) => {
            Ok(Arc::new(three_compartment::ThreeCompartmentExtra::new(parameter_form)))
        }
        (Three, ExtravascularLag, Analytical) => {
            Ok(Arc::new(three_compartment::ThreeCompartmentExtraLag::new(parameter_form)))
        }
        (compartments, absorption_model, family) => Err(PkError::UnsupportedRoute(format!(
            "no calculator for {compartments:?}/{absorption_model:?}/{family:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_to_micro_one_compartment() {
        let params = vec![("CL".to_string(), 2.0), ("V1".to_string(), 10.0)];
        let micro = macro_to_micro(&params).unwrap();
        let ke = micro.iter().find(|(k, _)| k == "Ke").unwrap().1;
        assert!((ke - 0.2).abs() < 1e-12);
    }

    #[test]
    fn infusion_with_zero_time_relabels_to_intravascular() {
        assert_eq!(
            normalize_absorption_model(AbsorptionModel::Infusion, 0.0),
            AbsorptionModel::Intravascular
        );
        assert_eq!(
            normalize_absorption_model(AbsorptionModel::Infusion, 1.0),
            AbsorptionModel::Infusion
        );
    }
}
