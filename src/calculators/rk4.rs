//! RK4-integrated calculators for absorption kinetics that have no
//! convenient closed form: gamma-distributed (Erlang transit-compartment)
//! absorption into a 1-compartment or 2-compartment disposition model
//! (spec §4.1, §9 design notes).
//!
//! Transit-compartment absorption models a finite number of sequential
//! first-order transit stages ahead of the depot, which approximates a
//! delayed, gamma-shaped absorption profile without needing a true lag
//! time. `n_transit` stages plus the depot plus the disposition
//! compartments together form the ODE state vector integrated here.

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

/// Fixed-step RK4 for an arbitrary-length state vector, given a
/// right-hand-side closure `f(state) -> derivative`.
fn rk4_advance<F: Fn(&[f64]) -> Vec<f64>>(state: &[f64], dt: f64, f: &F) -> Vec<f64> {
    if dt <= 0.0 {
        return state.to_vec();
    }
    let n_substeps = ((dt / 0.01).ceil() as usize).max(4);
    let h = dt / n_substeps as f64;
    let mut s = state.to_vec();
    for _ in 0..n_substeps {
        let k1 = f(&s);
        let s2: Vec<f64> = s.iter().zip(&k1).map(|(v, k)| v + 0.5 * h * k).collect();
        let k2 = f(&s2);
        let s3: Vec<f64> = s.iter().zip(&k2).map(|(v, k)| v + 0.5 * h * k).collect();
        let k3 = f(&s3);
        let s4: Vec<f64> = s.iter().zip(&k3).map(|(v, k)| v + h * k).collect();
        let k4 = f(&s4);
        for i in 0..s.len() {
            s[i] += (h / 6.0) * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
        }
    }
    s
}

/// State layout: `[transit_1, .., transit_n, depot, central]`.
/// Each transit stage and the depot share the same rate `Ktr`; `Ka`
/// governs the depot-to-central step.
pub struct RkOneCompartmentExtra {
    form: ParameterForm,
    n_transit: usize,
}

impl RkOneCompartmentExtra {
    pub fn new(form: ParameterForm) -> Self {
        Self { form, n_transit: 3 }
    }

    fn trajectory(
        &self,
        dose_mg: f64,
        t: &[f64],
        micro: &[(String, f64)],
        in_residuals: &[f64],
    ) -> PkResult<Vec<Vec<f64>>> {
        let v = param(micro, "V")?;
        let ke = param(micro, "Ke")?;
        let ka = param(micro, "Ka")?;
        let ktr = micro.iter().find(|(k, _)| k == "Ktr").map(|(_, v)| *v).unwrap_or(ka);
        let f = micro.iter().find(|(k, _)| k == "F").map(|(_, v)| *v).unwrap_or(1.0);

        let n = self.n_transit + 2; // transit stages + depot + central
        let mut state: Vec<f64> = (0..n)
            .map(|i| in_residuals.get(i).copied().unwrap_or(0.0))
            .collect();
        state[0] += f * dose_mg / v;

        let rhs = |s: &[f64]| -> Vec<f64> {
            let mut d = vec![0.0; n];
            for i in 0..self.n_transit {
                let inflow = if i == 0 { 0.0 } else { ktr * s[i - 1] };
                d[i] = inflow - ktr * s[i];
            }
            let depot_idx = self.n_transit;
            let central_idx = self.n_transit + 1;
            let inflow_to_depot = if self.n_transit > 0 { ktr * s[self.n_transit - 1] } else { 0.0 };
            d[depot_idx] = inflow_to_depot - ka * s[depot_idx];
            d[central_idx] = ka * s[depot_idx] - ke * s[central_idx];
            d
        };

        let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(t.len()); n];
        let mut last_t = 0.0;
        for &ti in t {
            state = rk4_advance(&state, ti - last_t, &rhs);
            last_t = ti;
            for (i, col) in columns.iter_mut().enumerate() {
                col.push(state[i]);
            }
        }
        Ok(columns)
    }
}

impl IntakeIntervalCalculator for RkOneCompartmentExtra {
    fn required_parameter_ids(&self) -> Vec<&'static str> {
        match self.form {
            ParameterForm::Micro => vec!["V", "Ke", "Ka", "F"],
            ParameterForm::Macro => vec!["CL", "V1", "Ka", "F"],
        }
    }

    fn n_compartments(&self) -> usize {
        self.n_transit + 2
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
        let columns = self.trajectory(intake.dose_mg, &times, &micro, in_residuals)?;
        let out_residuals: Vec<f64> = columns.iter().map(|c| *c.last().unwrap_or(&0.0)).collect();
        check_non_negative(&out_residuals)?;
        // central compartment (last column) is the clinically reported one.
        let central_idx = columns.len() - 1;
        Ok(CalculatorOutput {
            concentrations: vec![columns[central_idx].clone()]
                .into_iter()
                .chain(columns.into_iter().take(central_idx))
                .collect(),
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
        let at_columns = self.trajectory(intake.dose_mg, &[t_hours], &micro, in_residuals)?;
        let end_columns = self.trajectory(intake.dose_mg, &[intake.interval_hours], &micro, in_residuals)?;
        let out_residuals: Vec<f64> = end_columns.iter().map(|c| c[0]).collect();
        check_non_negative(&out_residuals)?;
        let central_idx = at_columns.len() - 1;
        Ok(CalculatorOutput::single_point(
            vec![at_columns[central_idx][0]],
            out_residuals,
        ))
    }
}

/// `[depot, central, peripheral]`, absorption deferred until `t >= Tlag`,
/// disposition integrated exactly alongside absorption instead of being
/// solved analytically and spliced (spec §4.1 RK4 family).
pub struct RkTwoCompartmentExtraLag {
    form: ParameterForm,
}

impl RkTwoCompartmentExtraLag {
    pub fn new(form: ParameterForm) -> Self {
        Self { form }
    }

    fn trajectory(
        &self,
        dose_mg: f64,
        tlag: f64,
        t: &[f64],
        micro: &[(String, f64)],
        in_residuals: &[f64],
    ) -> PkResult<Vec<Vec<f64>>> {
        let v = param(micro, "V")?;
        let ke = param(micro, "Ke")?;
        let ka = param(micro, "Ka")?;
        let k12 = param(micro, "K12")?;
        let k21 = param(micro, "K21")?;
        let f = micro.iter().find(|(k, _)| k == "F").map(|(_, v)| *v).unwrap_or(1.0);

        let rhs = |s: &[f64]| -> Vec<f64> {
            let (depot, central, peripheral) = (s[0], s[1], s[2]);
            vec![
                -ka * depot,
                ka * depot - (ke + k12) * central + k21 * peripheral,
                k12 * central - k21 * peripheral,
            ]
        };

        let mut state = vec![
            in_residuals.first().copied().unwrap_or(0.0),
            in_residuals.get(1).copied().unwrap_or(0.0),
            in_residuals.get(2).copied().unwrap_or(0.0),
        ];

        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); 3];
        let mut last_t = 0.0;
        let mut dose_added = false;
        for &ti in t {
            if !dose_added && ti >= tlag {
                state = rk4_advance(&state, tlag - last_t, &rhs);
                last_t = tlag;
                state[0] += f * dose_mg / v;
                dose_added = true;
            }
            state = rk4_advance(&state, ti - last_t, &rhs);
            last_t = ti;
            for (i, col) in columns.iter_mut().enumerate() {
                col.push(state[i]);
            }
        }
        Ok(columns)
    }
}

impl IntakeIntervalCalculator for RkTwoCompartmentExtraLag {
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
        let columns = self.trajectory(intake.dose_mg, tlag, &times, &micro, in_residuals)?;
        let out_residuals: Vec<f64> = columns.iter().map(|c| *c.last().unwrap_or(&0.0)).collect();
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput {
            concentrations: vec![columns[1].clone(), columns[2].clone(), columns[0].clone()],
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
        let at_columns = self.trajectory(intake.dose_mg, tlag, &[t_hours], &micro, in_residuals)?;
        let end_columns = self.trajectory(intake.dose_mg, tlag, &[intake.interval_hours], &micro, in_residuals)?;
        let out_residuals: Vec<f64> = end_columns.iter().map(|c| c[0]).collect();
        check_non_negative(&out_residuals)?;
        Ok(CalculatorOutput::single_point(
            vec![at_columns[1][0], at_columns[2][0], at_columns[0][0]],
            out_residuals,
        ))
    }
}
