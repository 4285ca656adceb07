//! 2-compartment analytical calculators, hybrid rate constants
//! `alpha`/`beta` (spec §4.1). Central/peripheral amounts are tracked as
//! concentration-equivalent states (amount / V1), matching the
//! 1-compartment convention so residuals chain without unit conversion.

use super::{macro_to_micro, pertinent_times::pertinent_times, CalculatorOutput, IntakeIntervalCalculator};
use crate::error::{PkError, PkResult};
use crate::events::IntakeEvent;
use crate::model::ParameterForm;

fn param(parameters: &[(String, f64)], id: &str) -> PkResult<f64> {
    parameters
        .iter()
        .find(|(k, _)| k == id)
        .map(|(_, v)| *v)
        .ok_or_else(|| PkError::BadParameters(format!("missing parameter {id}")))
}

fn resolve_micro(form: ParameterForm, parameters: &[(String, f64)]) -> PkResult<Vec<(String, f64)>> {
    match form {
        ParameterForm::Micro => Ok(parameters.to_vec()),
        ParameterForm::Macro => macro_to_micro(parameters),
    }
}

fn check_non_negative(residuals: &[f64]) -> PkResult<()> {
    if residuals.iter().any(|r| !r.is_finite() || *r < -1e-9) {
        return Err(PkError::BadConcentration);
    }
    Ok(())
}

/// Micro rate constants plus the hybrid eigenvalues `alpha`/`beta`.
struct HybridConstants {
    k10: f64,
    k12: f64,
    k21: f64,
    alpha: f64,
    beta: f64,
}

fn hybrid_constants(micro: &[(String, f64)]) -> PkResult<HybridConstants> {
    let v1 = param(micro, "V")?;
    let ke = param(micro, "Ke")?;
    let k12 = param(micro, "K12")?;
    let k21 = param(micro, "K21")?;
    let _ = v1;
    let a = ke + k12 + k21;
    let b = ke * k21;
    let discriminant = (a * a - 4.0 * b).max(0.0);
    let sqrt_disc = discriminant.sqrt();
    Ok(HybridConstants {
        k10: ke,
        k12,
        k21,
        alpha: (a + sqrt_disc) / 2.0,
        beta: (a - sqrt_disc) / 2.0,
    })
}

/// Transition of the homogeneous two-state system (no forcing input)
/// from `(state1_0, state2_0)` to `t`.
fn homogeneous(hc: &HybridConstants, state1_0: f64, state2_0: f64, t: f64) -> (f64, f64) {
    let (alpha, beta, k12, k21, k10) = (hc.alpha, hc.beta, hc.k12, hc.k21, hc.k10);
    let denom = alpha - beta;
    if denom.abs() < 1e-12 {
        // degenerate (repeated root); fall back to pure central decay
        return (state1_0 * (-alpha * t).exp(), state2_0 * (-alpha * t).exp());
    }
    let e_alpha = (-alpha * t).exp();
    let e_beta = (-beta * t).exp();
    let state1 = state1_0 * ((alpha - k21) / denom * e_alpha + (k21 - beta) / denom * e_beta)
        + state2_0 * (k21 / denom) * (e_beta - e_alpha);
    let state2 = state2_0 * ((alpha - k10 - k12) / denom * e_alpha + (k10 + k12 - beta) / denom * e_beta)
        + state1_0 * (k12 / denom) * (e_alpha - e_beta);
    (state1, state2)
}

/// Central-compartment response to a constant-rate input `rate` applied
/// into compartment 1 from `u=0` to `u=t`, zero initial conditions
/// (integral of the bolus impulse response; spec §4.1).
fn particular_central(hc: &HybridConstants, rate: f64, t: f64) -> f64 {
    let denom = hc.alpha - hc.beta;
    if denom.abs() < 1e-12 || rate == 0.0 {
        return 0.0;
    }
    let a_coeff = (hc.alpha - hc.k21) / denom;
    let b_coeff = (hc.k21 - hc.beta) / denom;
    rate * (a_coeff * (1.0 - (-hc.alpha * t).exp()) / hc.alpha + b_coeff * (1.0 - (-hc.beta * t).exp()) / hc.beta)
}

fn particular_peripheral(hc: &HybridConstants, rate: f64, t: f64) -> f64 {
    let denom = hc.alpha - hc.beta;
    if denom.abs() < 1e-12 || rate == 0.0 {
        return 0.0;
    }
    rate * hc.k12 / denom
        * ((1.0 - (-hc.beta * t).exp()) / hc.beta - (1.0 - (-hc.alpha * t).exp()) / hc.alpha)
}

/// Central/peripheral response to first-order absorption from a depot
/// holding `depot0` at `t=0` (standard closed form, spec §4.1).
fn extra_response(hc: &HybridConstants, depot0: f64, ka: f64, t: f64) -> (f64, f64) {
    if depot0 == 0.0 {
        return (0.0, 0.0);
    }
    let denom = hc.alpha - hc.beta;
    if denom.abs() < 1e-12 || (ka - hc.alpha).abs() < 1e-10 || (ka - hc.beta).abs() < 1e-10 {
        // degenerate overlap between Ka and a hybrid rate; approximate
        // via a perturbed Ka to avoid division by zero.
        let ka = ka * 1.0001;
        return extra_response_inner(hc, depot0, ka, t);
    }
    extra_response_inner(hc, depot0, ka, t)
}

fn extra_response_inner(hc: &HybridConstants, depot0: f64, ka: f64, t: f64) -> (f64, f64) {
    let denom = hc.alpha - hc.beta;
    let a_coeff = (hc.alpha - hc.k21) / denom;
    let b_coeff = (hc.k21 - hc.beta) / denom;
    let e_alpha = (-hc.alpha * t).exp();
    let e_beta = (-hc.beta * t).exp();
    let e_ka = (-ka * t).exp();

    let central = depot0
        * ka
        * (a_coeff / (ka - hc.alpha) * e_alpha + b_coeff / (ka - hc.beta) * e_beta
            + e_ka / ((hc.alpha - ka) * (hc.beta - ka)));

    let peripheral = depot0
        * ka
        * hc.k12
        * (1.0 / ((hc.alpha - ka) * (hc.alpha - hc.beta)) * e_alpha
            + 1.0 / ((hc.beta - ka) * (hc.beta - hc.alpha)) * e_beta
            + 1.0 / ((ka - hc.alpha) * (ka - hc.beta)) * e_ka);

    (central, peripheral)
}

pub struct TwoCompartmentBolus {
    form: ParameterForm,
}

impl TwoCompartmentBolus {
    pub fn new(form: ParameterForm) -> Self {
        Self { form }
    }

    fn solve(&self, dose_mg: f64, t: &[f64], micro: &[(String, f64)], in_residuals: &[f64]) -> PkResult<(Vec<f64>, Vec<f64>)> {
        let v = param(micro, "V")?;
        let hc = hybrid_constants(micro)?;
        let state1_0 = in_residuals.first().copied().unwrap_or(0.0) + dose_mg / v;
        let state2_0 = in_residuals.get(1).copied().unwrap_or(0.0);
        let mut central = Vec::with_capacity(t.len());
        let mut peripheral = Vec::with_capacity(t.len());
        for &ti in t {
            let (s1, s2) = homogeneous(&hc, state1_0, state2_0, ti);
            central.push(s1);
            peripheral.push(s2);
        }
        Ok((central, peripheral))
    }
}

impl IntakeIntervalCalculator for TwoCompartmentBolus {
    fn required_parameter_ids(&self) -> Vec<&'static str> {
        match self.form {
            ParameterForm::Micro => vec!["V", "Ke", "K12", "K21"],
            ParameterForm::Macro => vec!["CL", "V1", "Q2", "V2"],
        }
    }

    fn n_compartments(&self) -> usize {
        2
    }

    fn calculate_points(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        nb_points_per_hour: f64,
    ) -> PkResult<CalculatorOutput> {
        let micro = resolve_micro(self.form, parameters)?;
        self.validate_parameters(&micro)?;
        let times = pertinent_times(intake.interval_hours, nb_points_per_hour, None);
        let (central, peripheral) = self.solve(intake.dose_mg, &times, &micro, in_residuals)?;
        let out_residuals = vec![*central.last().unwrap_or(&0.0), *peripheral.last().unwrap_or(&0.0)];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput {
            concentrations: vec![central, peripheral],
            out_residuals,
        })
    }

    fn calculate_single_point(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        t_hours: f64,
    ) -> PkResult<CalculatorOutput> {
        let micro = resolve_micro(self.form, parameters)?;
        self.validate_parameters(&micro)?;
        let (central_at, peripheral_at) = self.solve(intake.dose_mg, &[t_hours], &micro, in_residuals)?;
        let (central_end, peripheral_end) =
            self.solve(intake.dose_mg, &[intake.interval_hours], &micro, in_residuals)?;
        let out_residuals = vec![central_end[0], peripheral_end[0]];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput::single_point(
            vec![central_at[0], peripheral_at[0]],
            out_residuals,
        ))
    }
}

pub struct TwoCompartmentInfusion {
    form: ParameterForm,
}

impl TwoCompartmentInfusion {
    pub fn new(form: ParameterForm) -> Self {
        Self { form }
    }

    fn solve(
        &self,
        dose_mg: f64,
        tinf: f64,
        t: &[f64],
        micro: &[(String, f64)],
        in_residuals: &[f64],
    ) -> PkResult<(Vec<f64>, Vec<f64>)> {
        let v = param(micro, "V")?;
        let hc = hybrid_constants(micro)?;
        let rate = if tinf > 0.0 { dose_mg / (tinf * v) } else { 0.0 };
        let state1_0 = in_residuals.first().copied().unwrap_or(0.0);
        let state2_0 = in_residuals.get(1).copied().unwrap_or(0.0);

        let (central_at_tinf_h, peripheral_at_tinf_h) = homogeneous(&hc, state1_0, state2_0, tinf);
        let central_at_tinf = central_at_tinf_h + particular_central(&hc, rate, tinf);
        let peripheral_at_tinf = peripheral_at_tinf_h + particular_peripheral(&hc, rate, tinf);

        let mut central = Vec::with_capacity(t.len());
        let mut peripheral = Vec::with_capacity(t.len());
        for &ti in t {
            if ti <= tinf {
                let (h1, h2) = homogeneous(&hc, state1_0, state2_0, ti);
                central.push(h1 + particular_central(&hc, rate, ti));
                peripheral.push(h2 + particular_peripheral(&hc, rate, ti));
            } else {
                let dt = ti - tinf;
                let (h1, h2) = homogeneous(&hc, central_at_tinf, peripheral_at_tinf, dt);
                central.push(h1);
                peripheral.push(h2);
            }
        }
        Ok((central, peripheral))
    }
}

impl IntakeIntervalCalculator for TwoCompartmentInfusion {
    fn required_parameter_ids(&self) -> Vec<&'static str> {
        match self.form {
            ParameterForm::Micro => vec!["V", "Ke", "K12", "K21"],
            ParameterForm::Macro => vec!["CL", "V1", "Q2", "V2"],
        }
    }

    fn n_compartments(&self) -> usize {
        2
    }

    fn calculate_points(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        nb_points_per_hour: f64,
    ) -> PkResult<CalculatorOutput> {
        let micro = resolve_micro(self.form, parameters)?;
        self.validate_parameters(&micro)?;
        let tinf = intake.infusion_time_hours.min(intake.interval_hours);
        let times = pertinent_times(intake.interval_hours, nb_points_per_hour, Some(tinf));
        let (central, peripheral) = self.solve(intake.dose_mg, tinf, &times, &micro, in_residuals)?;
        let out_residuals = vec![*central.last().unwrap_or(&0.0), *peripheral.last().unwrap_or(&0.0)];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput {
            concentrations: vec![central, peripheral],
            out_residuals,
        })
    }

    fn calculate_single_point(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        t_hours: f64,
    ) -> PkResult<CalculatorOutput> {
        let micro = resolve_micro(self.form, parameters)?;
        self.validate_parameters(&micro)?;
        let tinf = intake.infusion_time_hours.min(intake.interval_hours);
        let (central_at, peripheral_at) = self.solve(intake.dose_mg, tinf, &[t_hours], &micro, in_residuals)?;
        let (central_end, peripheral_end) =
            self.solve(intake.dose_mg, tinf, &[intake.interval_hours], &micro, in_residuals)?;
        let out_residuals = vec![central_end[0], peripheral_end[0]];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput::single_point(
            vec![central_at[0], peripheral_at[0]],
            out_residuals,
        ))
    }
}

/// Central/peripheral/depot, no lag.
pub struct TwoCompartmentExtra {
    form: ParameterForm,
}

impl TwoCompartmentExtra {
    pub fn new(form: ParameterForm) -> Self {
        Self { form }
    }

    fn solve(
        &self,
        dose_mg: f64,
        t: &[f64],
        micro: &[(String, f64)],
        in_residuals: &[f64],
    ) -> PkResult<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        let v = param(micro, "V")?;
        let ka = param(micro, "Ka")?;
        let f = param(micro, "F").unwrap_or(1.0);
        let hc = hybrid_constants(micro)?;
        let state1_0 = in_residuals.first().copied().unwrap_or(0.0);
        let state2_0 = in_residuals.get(1).copied().unwrap_or(0.0);
        let depot0 = in_residuals.get(2).copied().unwrap_or(0.0) + f * dose_mg / v;

        let mut central = Vec::with_capacity(t.len());
        let mut peripheral = Vec::with_capacity(t.len());
        let mut depot = Vec::with_capacity(t.len());
        for &ti in t {
            let (h1, h2) = homogeneous(&hc, state1_0, state2_0, ti);
            let (e1, e2) = extra_response(&hc, depot0, ka, ti);
            central.push(h1 + e1);
            peripheral.push(h2 + e2);
            depot.push(depot0 * (-ka * ti).exp());
        }
        Ok((central, peripheral, depot))
    }
}

impl IntakeIntervalCalculator for TwoCompartmentExtra {
    fn required_parameter_ids(&self) -> Vec<&'static str> {
        match self.form {
            ParameterForm::Micro => vec!["V", "Ke", "K12", "K21", "Ka", "F"],
            ParameterForm::Macro => vec!["CL", "V1", "Q2", "V2", "Ka", "F"],
        }
    }

    fn n_compartments(&self) -> usize {
        3
    }

    fn calculate_points(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        nb_points_per_hour: f64,
    ) -> PkResult<CalculatorOutput> {
        let micro = resolve_micro(self.form, parameters)?;
        self.validate_parameters(&micro)?;
        let times = pertinent_times(intake.interval_hours, nb_points_per_hour, None);
        let (central, peripheral, depot) = self.solve(intake.dose_mg, &times, &micro, in_residuals)?;
        let out_residuals = vec![
            *central.last().unwrap_or(&0.0),
            *peripheral.last().unwrap_or(&0.0),
            *depot.last().unwrap_or(&0.0),
        ];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput {
            concentrations: vec![central, peripheral, depot],
            out_residuals,
        })
    }

    fn calculate_single_point(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        t_hours: f64,
    ) -> PkResult<CalculatorOutput> {
        let micro = resolve_micro(self.form, parameters)?;
        self.validate_parameters(&micro)?;
        let (central_at, peripheral_at, depot_at) = self.solve(intake.dose_mg, &[t_hours], &micro, in_residuals)?;
        let (central_end, peripheral_end, depot_end) =
            self.solve(intake.dose_mg, &[intake.interval_hours], &micro, in_residuals)?;
        let out_residuals = vec![central_end[0], peripheral_end[0], depot_end[0]];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput::single_point(
            vec![central_at[0], peripheral_at[0], depot_at[0]],
            out_residuals,
        ))
    }
}

/// Central/peripheral/depot, absorption deferred until `t >= Tlag`
/// (same splicing strategy as [`super::one_compartment::OneCompartmentExtraLag`]).
pub struct TwoCompartmentExtraLag {
    form: ParameterForm,
}

impl TwoCompartmentExtraLag {
    pub fn new(form: ParameterForm) -> Self {
        Self { form }
    }

    fn solve(
        &self,
        dose_mg: f64,
        tlag: f64,
        t: &[f64],
        micro: &[(String, f64)],
        in_residuals: &[f64],
    ) -> PkResult<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        let v = param(micro, "V")?;
        let ka = param(micro, "Ka")?;
        let f = param(micro, "F").unwrap_or(1.0);
        let hc = hybrid_constants(micro)?;
        let state1_0 = in_residuals.first().copied().unwrap_or(0.0);
        let state2_0 = in_residuals.get(1).copied().unwrap_or(0.0);
        let depot_pre = in_residuals.get(2).copied().unwrap_or(0.0);

        let pre_lag = |ti: f64| -> (f64, f64, f64) {
            let (h1, h2) = homogeneous(&hc, state1_0, state2_0, ti);
            let (e1, e2) = extra_response(&hc, depot_pre, ka, ti);
            (h1 + e1, h2 + e2, depot_pre * (-ka * ti).exp())
        };

        let (central_at_lag, peripheral_at_lag, depot_at_lag) = pre_lag(tlag);
        let depot_post_lag0 = depot_at_lag + f * dose_mg / v;

        let mut central = Vec::with_capacity(t.len());
        let mut peripheral = Vec::with_capacity(t.len());
        let mut depot = Vec::with_capacity(t.len());
        for &ti in t {
            if ti <= tlag {
                let (c, p, d) = pre_lag(ti);
                central.push(c);
                peripheral.push(p);
                depot.push(d);
            } else {
                let dt = ti - tlag;
                let (h1, h2) = homogeneous(&hc, central_at_lag, peripheral_at_lag, dt);
                let (e1, e2) = extra_response(&hc, depot_post_lag0, ka, dt);
                central.push(h1 + e1);
                peripheral.push(h2 + e2);
                depot.push(depot_post_lag0 * (-ka * dt).exp());
            }
        }
        Ok((central, peripheral, depot))
    }
}

impl IntakeIntervalCalculator for TwoCompartmentExtraLag {
    fn required_parameter_ids(&self) -> Vec<&'static str> {
        match self.form {
            ParameterForm::Micro => vec!["V", "Ke", "K12", "K21", "Ka", "F", "Tlag"],
            ParameterForm::Macro => vec!["CL", "V1", "Q2", "V2", "Ka", "F", "Tlag"],
        }
    }

    fn n_compartments(&self) -> usize {
        3
    }

    fn calculate_points(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        nb_points_per_hour: f64,
    ) -> PkResult<CalculatorOutput> {
        let micro = resolve_micro(self.form, parameters)?;
        self.validate_parameters(&micro)?;
        let tlag = param(&micro, "Tlag").unwrap_or(0.0).max(0.0);
        let times = pertinent_times(intake.interval_hours, nb_points_per_hour, Some(tlag));
        let (central, peripheral, depot) = self.solve(intake.dose_mg, tlag, &times, &micro, in_residuals)?;
        let out_residuals = vec![
            *central.last().unwrap_or(&0.0),
            *peripheral.last().unwrap_or(&0.0),
            *depot.last().unwrap_or(&0.0),
        ];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput {
            concentrations: vec![central, peripheral, depot],
            out_residuals,
        })
    }

    fn calculate_single_point(
        &self,
        intake: &IntakeEvent,
        parameters: &[(String, f64)],
        in_residuals: &[f64],
        t_hours: f64,
    ) -> PkResult<CalculatorOutput> {
        let micro = resolve_micro(self.form, parameters)?;
        self.validate_parameters(&micro)?;
        let tlag = param(&micro, "Tlag").unwrap_or(0.0).max(0.0);
        let (central_at, peripheral_at, depot_at) =
            self.solve(intake.dose_mg, tlag, &[t_hours], &micro, in_residuals)?;
        let (central_end, peripheral_end, depot_end) =
            self.solve(intake.dose_mg, tlag, &[intake.interval_hours], &micro, in_residuals)?;
        let out_residuals = vec![central_end[0], peripheral_end[0], depot_end[0]];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput::single_point(
            vec![central_at[0], peripheral_at[0], depot_at[0]],
            out_residuals,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AbsorptionModel;
    use approx::assert_relative_eq;

    fn intake(interval: f64, dose: f64, infusion: f64) -> IntakeEvent {
        IntakeEvent {
            time_hours: 0.0,
            offset_hours: 0.0,
            dose_mg: dose,
            interval_hours: interval,
            formulation_index: 0,
            absorption_model: AbsorptionModel::Intravascular,
            infusion_time_hours: infusion,
            nb_points: 251,
            calculator: None,
        }
    }

    fn micro_params() -> Vec<(String, f64)> {
        vec![
            ("V".to_string(), 10.0),
            ("Ke".to_string(), 0.2),
            ("K12".to_string(), 0.1),
            ("K21".to_string(), 0.05),
        ]
    }

    #[test]
    fn bolus_initial_concentration_matches_dose_over_v() {
        let calc = TwoCompartmentBolus::new(ParameterForm::Micro);
        let params = micro_params();
        let intake = intake(12.0, 100.0, 0.0);
        let out = calc.calculate_points(&intake, &params, &[0.0, 0.0], 20.0).unwrap();
        assert_relative_eq!(out.concentrations[0][0], 10.0, epsilon = 1e-6);
    }

    #[test]
    fn bolus_central_concentration_decreases_initially() {
        let calc = TwoCompartmentBolus::new(ParameterForm::Micro);
        let params = micro_params();
        let intake = intake(12.0, 100.0, 0.0);
        let out = calc.calculate_points(&intake, &params, &[0.0, 0.0], 20.0).unwrap();
        let c0 = out.concentrations[0][0];
        let c_mid = out.concentrations[0][out.concentrations[0].len() / 2];
        assert!(c_mid < c0);
    }

    #[test]
    fn residuals_non_negative_across_routes() {
        let bolus = TwoCompartmentBolus::new(ParameterForm::Micro);
        let params = micro_params();
        let intake = intake(12.0, 100.0, 0.0);
        let out = bolus.calculate_points(&intake, &params, &[0.0, 0.0], 20.0).unwrap();
        assert!(out.out_residuals.iter().all(|r| *r >= 0.0));
    }

    #[test]
    fn macro_to_micro_equivalence() {
        let micro_calc = TwoCompartmentBolus::new(ParameterForm::Micro);
        let macro_calc = TwoCompartmentBolus::new(ParameterForm::Macro);
        let macro_params = vec![
            ("CL".to_string(), 2.0),
            ("V1".to_string(), 10.0),
            ("Q2".to_string(), 1.0),
            ("V2".to_string(), 20.0),
        ];
        let intake = intake(12.0, 100.0, 0.0);
        let micro_params = vec![
            ("V".to_string(), 10.0),
            ("Ke".to_string(), 0.2),
            ("K12".to_string(), 0.1),
            ("K21".to_string(), 0.05),
        ];
        let a = micro_calc.calculate_points(&intake, &micro_params, &[0.0, 0.0], 20.0).unwrap();
        let b = macro_calc.calculate_points(&intake, &macro_params, &[0.0, 0.0], 20.0).unwrap();
        assert_relative_eq!(a.out_residuals[0], b.out_residuals[0], epsilon = 1e-3);
    }

    #[test]
    fn extra_lag_defers_depot_mass() {
        let calc = TwoCompartmentExtraLag::new(ParameterForm::Micro);
        let mut params = micro_params();
        params.push(("Ka".to_string(), 1.0));
        params.push(("F".to_string(), 1.0));
        params.push(("Tlag".to_string(), 2.0));
        let intake = intake(12.0, 100.0, 0.0);
        let out = calc.calculate_points(&intake, &params, &[0.0, 0.0, 0.0], 20.0).unwrap();
        let times = pertinent_times(12.0, 20.0, Some(2.0));
        for (i, t) in times.iter().enumerate() {
            if *t < 2.0 - 1e-9 {
                assert!(out.concentrations[2][i].abs() < 1e-9);
            }
        }
    }
}
