//! Monte Carlo percentile engine (spec §4.4).
//!
//! Draws N η vectors from `Normal(0, Ω)` (or, for a-posteriori, from
//! the Laplace posterior centred at the MAP η*), simulates N
//! concentration trajectories, adds residual error, and reduces to the
//! requested percentile curves. The only component in this core
//! allowed to fan out across a worker pool (spec §5) — grounded on the
//! teacher's `percentiles_old::Simulator::simulate_population` patient
//! loop, parallelised with `rayon` the way `jamaas-jamtwopoolps` uses
//! it for per-patient independent work.

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::aposteriori::{apply_eta, ResidualErrorModel};
use crate::concentration::{self};
use crate::error::{PkError, PkResult};
use crate::events::{IntakeSeries, ParameterSetEvent, ParameterSetSeries};
use crate::model::{CompartmentCount, ParameterDefinition};

/// Queried at coarse checkpoints so a long-running simulation can be
/// cancelled without leaving partial state behind (spec §5).
pub trait Aborter: Send + Sync {
    fn should_abort(&self) -> bool;
}

/// Default no-op aborter for callers that never cancel.
pub struct NeverAbort;

impl Aborter for NeverAbort {
    fn should_abort(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct PercentileCurves {
    pub ranks: Vec<f64>,
    pub times_hours: Vec<f64>,
    /// `values[rank_index][time_index]`.
    pub values: Vec<Vec<f64>>,
}

/// Everything the engine needs to simulate one analyte group's
/// trajectories, already extracted and resolved.
pub struct PercentileEngineInput<'a> {
    pub intakes: &'a IntakeSeries,
    pub nominal_parameters: &'a ParameterSetSeries,
    /// Parameters with a variability type, in the same order as
    /// `sampling_covariance`'s rows/columns.
    pub variable_parameters: &'a [ParameterDefinition],
    /// `Ω` for a-priori sampling, or the Laplace posterior covariance
    /// around the MAP η* for a-posteriori sampling.
    pub sampling_covariance: &'a DMatrix<f64>,
    /// `None` for a-priori; `Some(eta_star)` centres a-posteriori draws.
    pub centre: Option<&'a [f64]>,
    pub compartments: CompartmentCount,
    pub nb_points_per_hour: f64,
    pub error_model: ResidualErrorModel,
    pub n_patients: usize,
    pub seed: Option<u64>,
}

pub(crate) fn perturb_parameters(
    nominal: &ParameterSetSeries,
    variable_parameters: &[ParameterDefinition],
    eta: &[f64],
) -> PkResult<ParameterSetSeries> {
    let mut events = Vec::with_capacity(nominal.events.len());
    for event in &nominal.events {
        let mut values = event.values.clone();
        for (param, &eta_i) in variable_parameters.iter().zip(eta.iter()) {
            if let Some(slot) = values.iter_mut().find(|(id, _)| id == &param.id) {
                slot.1 = apply_eta(slot.1, param.variability_type, eta_i)?;
            }
        }
        events.push(ParameterSetEvent {
            time_hours: event.time_hours,
            values,
        });
    }
    Ok(ParameterSetSeries { events })
}

fn simulate_one(
    input: &PercentileEngineInput,
    cholesky: &Cholesky<f64, nalgebra::Dyn>,
    patient_index: usize,
) -> PkResult<(Vec<f64>, Vec<f64>)> {
    let seed = input.seed.unwrap_or(0) ^ (patient_index as u64).wrapping_mul(0x9E3779B97F4A7C15);
    let mut rng = StdRng::seed_from_u64(seed);

    let n = input.variable_parameters.len();
    let z: DVector<f64> = DVector::from_iterator(n, (0..n).map(|_| StandardNormal.sample(&mut rng)));
    let mut eta_vector = cholesky.l() * z;
    if let Some(centre) = input.centre {
        for (i, c) in centre.iter().enumerate() {
            eta_vector[i] += c;
        }
    }
    let eta: Vec<f64> = eta_vector.iter().copied().collect();

    let perturbed = perturb_parameters(input.nominal_parameters, input.variable_parameters, &eta)?;
    let prediction = concentration::predict(
        input.intakes,
        &perturbed,
        input.compartments,
        input.nb_points_per_hour,
    )?;

    let times: Vec<f64> = prediction.cycles.iter().flat_map(|c| c.times_hours.iter().copied()).collect();
    let mut values = prediction.central_concentrations();
    for value in &mut values {
        let noisy = *value + input.error_model.sample_noise(*value, &mut rng);
        *value = noisy.max(0.0);
    }

    Ok((times, values))
}

/// Linear-interpolated percentile of `sorted_values` at rank `rank` in
/// `[0, 100]` (spec §4.4 step 4).
fn percentile_of_sorted(sorted_values: &[f64], rank: f64) -> f64 {
    if sorted_values.len() == 1 {
        return sorted_values[0];
    }
    let position = rank / 100.0 * (sorted_values.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        sorted_values[lower]
    } else {
        let fraction = position - lower as f64;
        sorted_values[lower] * (1.0 - fraction) + sorted_values[upper] * fraction
    }
}

/// Run the Monte Carlo percentile engine (spec §4.4).
pub fn run_percentiles(
    input: &PercentileEngineInput,
    ranks: &[f64],
    aborter: &dyn Aborter,
) -> PkResult<PercentileCurves> {
    if ranks.iter().any(|r| !(0.0..=100.0).contains(r)) {
        return Err(PkError::OutOfBoundsPercentileRank);
    }

    let cholesky = Cholesky::new(input.sampling_covariance.clone())
        .ok_or_else(|| PkError::DensityError("sampling covariance is not positive-definite".to_string()))?;

    let trajectories: Vec<Option<(Vec<f64>, Vec<f64>)>> = (0..input.n_patients)
        .into_par_iter()
        .map(|k| {
            if aborter.should_abort() {
                return None;
            }
            simulate_one(input, &cholesky, k).ok()
        })
        .collect();

    if aborter.should_abort() {
        return Err(PkError::Aborted);
    }

    let valid: Vec<(Vec<f64>, Vec<f64>)> = trajectories.into_iter().flatten().collect();
    if valid.len() < 2 {
        return Err(PkError::PercentilesNoValidPrediction);
    }

    let times_hours = valid[0].0.clone();
    let nb_times = times_hours.len();

    let mut values = vec![vec![0.0; nb_times]; ranks.len()];
    for time_index in 0..nb_times {
        let mut column: Vec<f64> = valid
            .iter()
            .filter_map(|(_, v)| v.get(time_index).copied())
            .collect();
        column.sort_by(|a, b| a.total_cmp(b));
        for (rank_index, &rank) in ranks.iter().enumerate() {
            values[rank_index][time_index] = percentile_of_sorted(&column, rank);
        }
    }

    Ok(PercentileCurves {
        ranks: ranks.to_vec(),
        times_hours,
        values,
    })
}

impl ResidualErrorModel {
    fn sample_noise(&self, predicted: f64, rng: &mut StdRng) -> f64 {
        use rand_distr::Normal;
        match *self {
            ResidualErrorModel::Additive { sigma } => {
                Normal::new(0.0, sigma.max(1e-12)).unwrap().sample(rng)
            }
            ResidualErrorModel::Proportional { cv } => {
                let eps: f64 = Normal::new(0.0, cv.max(1e-12)).unwrap().sample(rng);
                predicted * eps
            }
            ResidualErrorModel::Exponential { sigma } => {
                let eps: f64 = Normal::new(0.0, sigma.max(1e-12)).unwrap().sample(rng);
                predicted * (eps.exp() - 1.0)
            }
            ResidualErrorModel::Mixed { additive, proportional } => {
                let add: f64 = Normal::new(0.0, additive.max(1e-12)).unwrap().sample(rng);
                let prop: f64 = Normal::new(0.0, proportional.max(1e-12)).unwrap().sample(rng);
                predicted * prop + add
            }
        }
    }
}
