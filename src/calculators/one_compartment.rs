//! 1-compartment analytical calculators: bolus, infusion, extravascular
//! (first-order absorption), extravascular with lag (spec §4.1).
//!
//! Each struct exists in micro form (Ke, Ka, V, F) and is reachable in
//! macro form (CL, V) by converting through [`macro_to_micro`] before
//! solving — the solver body itself is written once, in micro form.

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

/// IV bolus: `C(t) = (C0 + D/V) * exp(-Ke*t)`.
pub struct OneCompartmentBolus {
    form: ParameterForm,
}

impl OneCompartmentBolus {
    pub fn new(form: ParameterForm) -> Self {
        Self { form }
    }

    fn solve(&self, dose_mg: f64, t: &[f64], micro: &[(String, f64)], in_residuals: &[f64]) -> PkResult<Vec<f64>> {
        let v = param(micro, "V")?;
        let ke = param(micro, "Ke")?;
        let resid0 = in_residuals.first().copied().unwrap_or(0.0);
        let c0 = resid0 + dose_mg / v;
        Ok(t.iter().map(|&ti| c0 * (-ke * ti).exp()).collect())
    }
}

impl IntakeIntervalCalculator for OneCompartmentBolus {
    fn required_parameter_ids(&self) -> Vec<&'static str> {
        match self.form {
            ParameterForm::Micro => vec!["V", "Ke"],
            ParameterForm::Macro => vec!["CL", "V1"],
        }
    }

    fn n_compartments(&self) -> usize {
        1
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
        let conc = self.solve(intake.dose_mg, &times, &micro, in_residuals)?;
        let out_residuals = vec![*conc.last().unwrap_or(&0.0)];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput {
            concentrations: vec![conc],
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
        let at = self.solve(intake.dose_mg, &[t_hours], &micro, in_residuals)?[0];
        let end = self.solve(intake.dose_mg, &[intake.interval_hours], &micro, in_residuals)?[0];
        let out_residuals = vec![end];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput::single_point(vec![at], out_residuals))
    }
}

/// Constant-rate IV infusion, `Tinf <= interval`.
pub struct OneCompartmentInfusion {
    form: ParameterForm,
}

impl OneCompartmentInfusion {
    pub fn new(form: ParameterForm) -> Self {
        Self { form }
    }

    fn solve(&self, dose_mg: f64, tinf: f64, t: &[f64], micro: &[(String, f64)], in_residuals: &[f64]) -> PkResult<Vec<f64>> {
        let v = param(micro, "V")?;
        let ke = param(micro, "Ke")?;
        let resid0 = in_residuals.first().copied().unwrap_or(0.0);
        let rate = if tinf > 0.0 { dose_mg / tinf } else { 0.0 };
        Ok(t
            .iter()
            .map(|&ti| {
                if ti <= tinf {
                    resid0 * (-ke * ti).exp() + (rate / (v * ke)) * (1.0 - (-ke * ti).exp())
                } else {
                    let c_end_infusion =
                        resid0 * (-ke * tinf).exp() + (rate / (v * ke)) * (1.0 - (-ke * tinf).exp());
                    c_end_infusion * (-ke * (ti - tinf)).exp()
                }
            })
            .collect())
    }
}

impl IntakeIntervalCalculator for OneCompartmentInfusion {
    fn required_parameter_ids(&self) -> Vec<&'static str> {
        match self.form {
            ParameterForm::Micro => vec!["V", "Ke"],
            ParameterForm::Macro => vec!["CL", "V1"],
        }
    }

    fn n_compartments(&self) -> usize {
        1
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
        let conc = self.solve(intake.dose_mg, tinf, &times, &micro, in_residuals)?;
        let out_residuals = vec![*conc.last().unwrap_or(&0.0)];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput {
            concentrations: vec![conc],
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
        let at = self.solve(intake.dose_mg, tinf, &[t_hours], &micro, in_residuals)?[0];
        let end = self.solve(intake.dose_mg, tinf, &[intake.interval_hours], &micro, in_residuals)?[0];
        let out_residuals = vec![end];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput::single_point(vec![at], out_residuals))
    }
}

/// Extravascular (first-order absorption), two latent compartments:
/// `[central, depot]`, both expressed as amount/V (i.e. concentration
/// units) so residuals chain directly.
pub struct OneCompartmentExtra {
    form: ParameterForm,
}

impl OneCompartmentExtra {
    pub fn new(form: ParameterForm) -> Self {
        Self { form }
    }

    fn solve(
        &self,
        dose_mg: f64,
        t: &[f64],
        micro: &[(String, f64)],
        in_residuals: &[f64],
    ) -> PkResult<(Vec<f64>, Vec<f64>)> {
        let v = param(micro, "V")?;
        let ke = param(micro, "Ke")?;
        let ka = param(micro, "Ka")?;
        let f = param(micro, "F").unwrap_or(1.0);
        let resid_central = in_residuals.first().copied().unwrap_or(0.0);
        let resid_depot = in_residuals.get(1).copied().unwrap_or(0.0) + f * dose_mg / v;

        if (ka - ke).abs() < 1e-10 {
            // flip-flop kinetics
            let central: Vec<f64> = t
                .iter()
                .map(|&ti| resid_central * (-ke * ti).exp() + resid_depot * ke * ti * (-ke * ti).exp())
                .collect();
            let depot: Vec<f64> = t.iter().map(|&ti| resid_depot * (-ka * ti).exp()).collect();
            return Ok((central, depot));
        }

        let part2 = ka * resid_depot / (ke - ka);
        let central: Vec<f64> = t
            .iter()
            .map(|&ti| resid_central * (-ke * ti).exp() + part2 * ((-ke * ti).exp() - (-ka * ti).exp()))
            .collect();
        let depot: Vec<f64> = t.iter().map(|&ti| resid_depot * (-ka * ti).exp()).collect();
        Ok((central, depot))
    }
}

impl IntakeIntervalCalculator for OneCompartmentExtra {
    fn required_parameter_ids(&self) -> Vec<&'static str> {
        match self.form {
            ParameterForm::Micro => vec!["V", "Ke", "Ka", "F"],
            ParameterForm::Macro => vec!["CL", "V1", "Ka", "F"],
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
        let (central, depot) = self.solve(intake.dose_mg, &times, &micro, in_residuals)?;
        let out_residuals = vec![*central.last().unwrap_or(&0.0), *depot.last().unwrap_or(&0.0)];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput {
            concentrations: vec![central, depot],
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
        let (central_at, depot_at) = self.solve(intake.dose_mg, &[t_hours], &micro, in_residuals)?;
        let (central_end, depot_end) =
            self.solve(intake.dose_mg, &[intake.interval_hours], &micro, in_residuals)?;
        let out_residuals = vec![central_end[0], depot_end[0]];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput::single_point(
            vec![central_at[0], depot_at[0]],
            out_residuals,
        ))
    }
}

/// Extravascular with absorption lag `Tlag`: dose delivery into the
/// depot compartment is deferred until `t >= Tlag` (spec §4.1), mirroring
/// the residual-splicing approach of the reference one-compartment
/// extravascular-with-lag solver (pre-lag decay of carried-over
/// residuals, dose injected into the depot exactly at `Tlag`, then a
/// second exponential segment shifted by `t - Tlag`).
pub struct OneCompartmentExtraLag {
    form: ParameterForm,
}

impl OneCompartmentExtraLag {
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
    ) -> PkResult<(Vec<f64>, Vec<f64>)> {
        let v = param(micro, "V")?;
        let ke = param(micro, "Ke")?;
        let ka = param(micro, "Ka")?;
        let f = param(micro, "F").unwrap_or(1.0);
        let resid_central0 = in_residuals.first().copied().unwrap_or(0.0);
        let resid_depot0 = in_residuals.get(1).copied().unwrap_or(0.0);

        let decay = |ti: f64| -> (f64, f64) {
            // pre-lag: no dose yet in the depot, simple exponential decay
            // of whatever was carried over.
            let part2 = if (ka - ke).abs() > 1e-10 {
                ka * resid_depot0 / (ke - ka)
            } else {
                0.0
            };
            let central = if (ka - ke).abs() > 1e-10 {
                resid_central0 * (-ke * ti).exp() + part2 * ((-ke * ti).exp() - (-ka * ti).exp())
            } else {
                resid_central0 * (-ke * ti).exp() + resid_depot0 * ke * ti * (-ke * ti).exp()
            };
            let depot = resid_depot0 * (-ka * ti).exp();
            (central, depot)
        };

        let mut central = Vec::with_capacity(t.len());
        let mut depot = Vec::with_capacity(t.len());

        // State right at Tlag, just before the dose is added.
        let (central_at_lag, depot_at_lag) = decay(tlag);
        let depot_post_lag0 = depot_at_lag + f * dose_mg / v;

        for &ti in t {
            if ti <= tlag {
                let (c, d) = decay(ti);
                central.push(c);
                depot.push(d);
            } else {
                let dt = ti - tlag;
                let part2 = if (ka - ke).abs() > 1e-10 {
                    ka * depot_post_lag0 / (ke - ka)
                } else {
                    0.0
                };
                let c = if (ka - ke).abs() > 1e-10 {
                    central_at_lag * (-ke * dt).exp() + part2 * ((-ke * dt).exp() - (-ka * dt).exp())
                } else {
                    central_at_lag * (-ke * dt).exp() + depot_post_lag0 * ke * dt * (-ke * dt).exp()
                };
                let d = depot_post_lag0 * (-ka * dt).exp();
                central.push(c);
                depot.push(d);
            }
        }

        Ok((central, depot))
    }
}

impl IntakeIntervalCalculator for OneCompartmentExtraLag {
    fn required_parameter_ids(&self) -> Vec<&'static str> {
        match self.form {
            ParameterForm::Micro => vec!["V", "Ke", "Ka", "F", "Tlag"],
            ParameterForm::Macro => vec!["CL", "V1", "Ka", "F", "Tlag"],
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
        let tlag = param(&micro, "Tlag").unwrap_or(0.0).max(0.0);
        let times = pertinent_times(intake.interval_hours, nb_points_per_hour, Some(tlag));
        let (central, depot) = self.solve(intake.dose_mg, tlag, &times, &micro, in_residuals)?;
        let out_residuals = vec![*central.last().unwrap_or(&0.0), *depot.last().unwrap_or(&0.0)];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput {
            concentrations: vec![central, depot],
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
        let (central_at, depot_at) = self.solve(intake.dose_mg, tlag, &[t_hours], &micro, in_residuals)?;
        let (central_end, depot_end) =
            self.solve(intake.dose_mg, tlag, &[intake.interval_hours], &micro, in_residuals)?;
        let out_residuals = vec![central_end[0], depot_end[0]];
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput::single_point(
            vec![central_at[0], depot_at[0]],
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

    #[test]
    fn s1_bolus_scenario() {
        // S1: V=347, Ke=0.0435, dose=400mg, interval=1h, nbPoints=251
        let calc = OneCompartmentBolus::new(ParameterForm::Micro);
        let params = vec![("V".to_string(), 347.0), ("Ke".to_string(), 0.0435)];
        let intake = intake(1.0, 400.0, 0.0);
        let out = calc
            .calculate_points(&intake, &params, &[0.0], 250.0)
            .unwrap();
        assert_relative_eq!(out.concentrations[0][0], 400.0 / 347.0, epsilon = 1e-6);
        let expected_end = (400.0 / 347.0) * (-0.0435f64).exp();
        assert_relative_eq!(*out.concentrations[0].last().unwrap(), expected_end, epsilon = 1e-4);
    }

    #[test]
    fn single_vs_multi_point_consistency() {
        let calc = OneCompartmentBolus::new(ParameterForm::Micro);
        let params = vec![("V".to_string(), 10.0), ("Ke".to_string(), 0.2)];
        let intake = intake(12.0, 100.0, 0.0);
        let multi = calc.calculate_points(&intake, &params, &[0.0], 20.0).unwrap();
        let single = calc
            .calculate_single_point(&intake, &params, &[0.0], 12.0)
            .unwrap();
        assert_relative_eq!(
            single.out_residuals[0],
            multi.out_residuals[0],
            epsilon = 1e-4
        );
    }

    #[test]
    fn steady_state_convergence() {
        let calc = OneCompartmentBolus::new(ParameterForm::Micro);
        let params = vec![("V".to_string(), 10.0), ("Ke".to_string(), 0.2)];
        let intake = intake(12.0, 100.0, 0.0);
        let mut residuals = vec![0.0];
        for _ in 0..300 {
            let out = calc
                .calculate_points(&intake, &params, &residuals, 10.0)
                .unwrap();
            let diff = (out.out_residuals[0] - residuals[0]).abs() / residuals[0].max(1.0);
            residuals = out.out_residuals;
            if diff <= 0.01 {
                return;
            }
        }
        panic!("steady state did not converge within 300 iterations");
    }

    #[test]
    fn extra_residuals_are_non_negative() {
        let calc = OneCompartmentExtra::new(ParameterForm::Micro);
        let params = vec![
            ("V".to_string(), 347.0),
            ("Ke".to_string(), 0.0435),
            ("Ka".to_string(), 0.609),
            ("F".to_string(), 1.0),
        ];
        let intake = intake(12.0, 400.0, 0.0);
        let out = calc.calculate_points(&intake, &params, &[0.0, 0.0], 20.0).unwrap();
        assert!(out.out_residuals.iter().all(|r| *r >= 0.0));
    }

    #[test]
    fn micro_macro_equivalence_bolus() {
        let micro_calc = OneCompartmentBolus::new(ParameterForm::Micro);
        let macro_calc = OneCompartmentBolus::new(ParameterForm::Macro);
        let micro_params = vec![("V".to_string(), 10.0), ("Ke".to_string(), 0.2)];
        let macro_params = vec![("CL".to_string(), 2.0), ("V1".to_string(), 10.0)];
        let intake = intake(5.0, 100.0, 0.0);
        let micro_out = micro_calc.calculate_points(&intake, &micro_params, &[0.0], 20.0).unwrap();
        let macro_out = macro_calc.calculate_points(&intake, &macro_params, &[0.0], 20.0).unwrap();
        assert_relative_eq!(
            micro_out.out_residuals[0],
            macro_out.out_residuals[0],
            epsilon = 1e-3
        );
    }

    #[test]
    fn bad_parameters_rejected() {
        let calc = OneCompartmentBolus::new(ParameterForm::Micro);
        let params = vec![("V".to_string(), -1.0), ("Ke".to_string(), 0.2)];
        let intake = intake(1.0, 100.0, 0.0);
        let err = calc.calculate_points(&intake, &params, &[0.0], 10.0).unwrap_err();
        assert!(matches!(err, PkError::BadParameters(_)));
    }

    #[test]
    fn lag_defers_dose_until_tlag() {
        let calc = OneCompartmentExtraLag::new(ParameterForm::Micro);
        let params = vec![
            ("V".to_string(), 10.0),
            ("Ke".to_string(), 0.1),
            ("Ka".to_string(), 1.0),
            ("F".to_string(), 1.0),
            ("Tlag".to_string(), 2.0),
        ];
        let intake = intake(12.0, 100.0, 0.0);
        let out = calc.calculate_points(&intake, &params, &[0.0, 0.0], 20.0).unwrap();
        // before Tlag the depot concentration must stay at zero
        let times = pertinent_times(12.0, 20.0, Some(2.0));
        for (i, t) in times.iter().enumerate() {
            if *t < 2.0 - 1e-9 {
                assert!(out.concentrations[1][i].abs() < 1e-9);
            }
        }
    }
}
