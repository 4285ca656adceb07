//! Adjustment engine: proposes dosage regimens that meet a treatment's
//! clinical targets (spec §4.5).
//!
//! Candidates are driven to steady state directly through the attached
//! `IntakeIntervalCalculator`, chaining `out_residuals` into the next
//! iteration exactly as the concentration engine does for a real
//! dosage history — grounded on the steady-state convergence pattern
//! already exercised in `calculators::one_compartment`'s test suite.

use crate::calculators::IntakeCalculatorHandle;
use crate::error::{PkError, PkResult};
use crate::events::IntakeEvent;
use crate::model::{AbsorptionModel, TargetDefinition, TargetKind};
use crate::response::CycleStatistics;

const MAX_STEADY_STATE_ITERATIONS: usize = 300;
const STEADY_STATE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
pub struct CandidateDose {
    pub dose_mg: f64,
    pub interval_hours: f64,
    pub infusion_time_hours: f64,
}

/// Which formulation-and-route candidates to consider (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulationAndRouteSelectionOption {
    LastUsed,
    Default,
    All,
}

/// How many ranked candidates to return (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestCandidatesOption {
    AllValid,
    BestOnly,
    BestPerUniqueInterval,
}

/// Cartesian product of valid doses × intervals × infusion times for a
/// formulation and route. Non-infusion routes are fixed at
/// `infusion_time_hours = 0.0` (spec §4.5 "Candidate enumeration").
pub fn enumerate_candidates(
    absorption_model: AbsorptionModel,
    valid_doses: &[f64],
    valid_intervals_hours: &[f64],
    valid_infusion_times_hours: &[f64],
) -> Vec<CandidateDose> {
    let infusion_times: Vec<f64> = if absorption_model == AbsorptionModel::Infusion {
        valid_infusion_times_hours.to_vec()
    } else {
        vec![0.0]
    };

    let mut out = Vec::new();
    for &dose_mg in valid_doses {
        for &interval_hours in valid_intervals_hours {
            for &infusion_time_hours in &infusion_times {
                out.push(CandidateDose {
                    dose_mg,
                    interval_hours,
                    infusion_time_hours,
                });
            }
        }
    }
    out
}

/// Run one intake, repeated with `in := out` residual chaining, until
/// the relative change in every residual component is within
/// `STEADY_STATE_TOLERANCE` (spec §4.5 "at steady state"; universal
/// property 4). Returns the converged cycle's central-compartment
/// trajectory and time grid, or `NoSteadyState`.
pub fn run_to_steady_state(
    calculator: &IntakeCalculatorHandle,
    absorption_model: AbsorptionModel,
    formulation_index: usize,
    candidate: CandidateDose,
    parameters: &[(String, f64)],
    nb_points_per_hour: f64,
) -> PkResult<(Vec<f64>, Vec<f64>, Vec<f64>)> {
    let intake = IntakeEvent {
        time_hours: 0.0,
        offset_hours: 0.0,
        dose_mg: candidate.dose_mg,
        interval_hours: candidate.interval_hours,
        formulation_index,
        absorption_model,
        infusion_time_hours: candidate.infusion_time_hours,
        nb_points: ((candidate.interval_hours * nb_points_per_hour).ceil() as usize + 1).max(2),
        calculator: None,
    };

    let mut residuals = vec![0.0; calculator.n_compartments()];
    let mut last_output = calculator.calculate_points(&intake, parameters, &residuals, nb_points_per_hour)?;

    for _ in 0..MAX_STEADY_STATE_ITERATIONS {
        let output = calculator.calculate_points(&intake, parameters, &last_output.out_residuals, nb_points_per_hour)?;

        let converged = output
            .out_residuals
            .iter()
            .zip(last_output.out_residuals.iter())
            .all(|(new, old)| {
                let denom = old.abs().max(1e-9);
                ((new - old).abs() / denom) <= STEADY_STATE_TOLERANCE
            });

        residuals = output.out_residuals.clone();
        last_output = output;

        if converged {
            let nb_points = last_output.concentrations[0].len();
            let times_hours: Vec<f64> = (0..nb_points)
                .map(|i| {
                    if nb_points <= 1 {
                        0.0
                    } else {
                        (i as f64) * candidate.interval_hours / ((nb_points - 1) as f64)
                    }
                })
                .collect();
            return Ok((times_hours, last_output.concentrations[0].clone(), residuals));
        }
    }

    Err(PkError::NoSteadyState)
}

/// Score one target against the converged cycle's statistics (spec
/// §4.5 "Target scoring"). Returns `InvalidCandidate` if the metric
/// falls outside `[min, max]`.
pub fn score_target(target: &TargetDefinition, stats: &CycleStatistics, cumulative_auc: f64) -> PkResult<f64> {
    let value = match target.kind {
        TargetKind::Residual => stats.trough,
        TargetKind::Peak => stats.peak,
        TargetKind::Auc => stats.auc,
        TargetKind::Tmax => stats.tmax_hours,
        TargetKind::CumulativeAuc => cumulative_auc,
    };

    if !value.is_finite() {
        return Err(PkError::TargetEvaluationError(format!(
            "non-finite value for target kind {:?}",
            target.kind
        )));
    }
    if value < target.min || value > target.max {
        return Err(PkError::InvalidCandidate);
    }

    let score = if (target.best - target.min).abs() < 1e-12 || (target.max - target.best).abs() < 1e-12 {
        1.0
    } else if value <= target.best {
        (value - target.min) / (target.best - target.min)
    } else {
        (target.max - value) / (target.max - target.best)
    };

    Ok(score.clamp(0.0, 1.0))
}

/// Global score for one candidate: the product of its per-target
/// scores (spec §4.5). `None` means the candidate was invalid.
pub fn global_score(targets: &[TargetDefinition], stats: &CycleStatistics, cumulative_auc: f64) -> Option<f64> {
    let mut product = 1.0;
    for target in targets {
        match score_target(target, stats, cumulative_auc) {
            Ok(score) => product *= score,
            Err(_) => return None,
        }
    }
    Some(product)
}

#[derive(Debug, Clone, Copy)]
pub struct ScoredCandidate {
    pub candidate: CandidateDose,
    pub score: f64,
}

/// Sort candidates by descending global score, then apply the
/// `BestCandidatesOption` filter (spec §4.5 "Ranking and filtering").
pub fn rank_and_filter(mut scored: Vec<ScoredCandidate>, option: BestCandidatesOption) -> Vec<ScoredCandidate> {
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    match option {
        BestCandidatesOption::AllValid => scored,
        BestCandidatesOption::BestOnly => scored.into_iter().take(1).collect(),
        BestCandidatesOption::BestPerUniqueInterval => {
            let mut seen_intervals = Vec::new();
            scored
                .into_iter()
                .filter(|sc| {
                    let already_seen = seen_intervals.iter().any(|i: &f64| (*i - sc.candidate.interval_hours).abs() < 1e-9);
                    if already_seen {
                        false
                    } else {
                        seen_intervals.push(sc.candidate.interval_hours);
                        true
                    }
                })
                .collect()
        }
    }
}

/// A one-interval dose prepended to drive the predicted residual
/// toward the steady-state residual (spec §4.5 "Loading dose and rest
/// period search"). Returns `None` if no dose strictly improves the
/// absolute residual gap, or if the improving dose equals the
/// candidate's own dose.
pub fn search_loading_or_rest(
    calculator: &IntakeCalculatorHandle,
    absorption_model: AbsorptionModel,
    formulation_index: usize,
    candidate: CandidateDose,
    steady_state_residual: f64,
    parameters: &[(String, f64)],
    nb_points_per_hour: f64,
    candidate_doses_to_try: &[f64],
) -> PkResult<Option<f64>> {
    let intake_at_candidate_dose = IntakeEvent {
        time_hours: 0.0,
        offset_hours: 0.0,
        dose_mg: candidate.dose_mg,
        interval_hours: candidate.interval_hours,
        formulation_index,
        absorption_model,
        infusion_time_hours: candidate.infusion_time_hours,
        nb_points: 2,
        calculator: None,
    };
    let baseline = calculator.calculate_points(&intake_at_candidate_dose, parameters, &vec![0.0; calculator.n_compartments()], nb_points_per_hour)?;
    let baseline_gap = (baseline.last_central() - steady_state_residual).abs();

    // Rest period: a one-interval dose of 0.
    let rest_intake = intake_at_candidate_dose.clone_with_dose(0.0);
    let rest_output = calculator.calculate_points(&rest_intake, parameters, &vec![0.0; calculator.n_compartments()], nb_points_per_hour)?;
    let rest_gap = (rest_output.last_central() - steady_state_residual).abs();
    if rest_gap < baseline_gap && (0.0 - candidate.dose_mg).abs() > 1e-9 {
        return Ok(Some(0.0));
    }

    // Loading dose: try each candidate dose higher than the adjustment dose.
    let mut best: Option<(f64, f64)> = None;
    for &dose_mg in candidate_doses_to_try {
        if dose_mg <= candidate.dose_mg {
            continue;
        }
        let loading_intake = intake_at_candidate_dose.clone_with_dose(dose_mg);
        let output = calculator.calculate_points(&loading_intake, parameters, &vec![0.0; calculator.n_compartments()], nb_points_per_hour)?;
        let gap = (output.last_central() - steady_state_residual).abs();
        if gap < baseline_gap {
            if best.map(|(_, g)| gap < g).unwrap_or(true) {
                best = Some((dose_mg, gap));
            }
        }
    }

    Ok(best.map(|(dose_mg, _)| dose_mg))
}

impl IntakeEvent {
    fn clone_with_dose(&self, dose_mg: f64) -> IntakeEvent {
        IntakeEvent {
            time_hours: self.time_hours,
            offset_hours: self.offset_hours,
            dose_mg,
            interval_hours: self.interval_hours,
            formulation_index: self.formulation_index,
            absorption_model: self.absorption_model,
            infusion_time_hours: self.infusion_time_hours,
            nb_points: self.nb_points,
            calculator: self.calculator.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculators::{self, CalculatorFamily};
    use crate::model::{CompartmentCount, ParameterForm};

    fn bolus_calculator() -> IntakeCalculatorHandle {
        calculators::resolve_calculator(
            CompartmentCount::One,
            AbsorptionModel::Intravascular,
            ParameterForm::Micro,
            CalculatorFamily::Analytical,
        )
        .unwrap()
    }

    #[test]
    fn enumerate_candidates_fixes_infusion_time_for_non_infusion_routes() {
        let candidates = enumerate_candidates(
            AbsorptionModel::Intravascular,
            &[100.0, 200.0],
            &[12.0, 24.0],
            &[0.5, 1.0],
        );
        assert_eq!(candidates.len(), 4);
        assert!(candidates.iter().all(|c| c.infusion_time_hours == 0.0));
    }

    #[test]
    fn steady_state_converges_for_reasonable_parameters() {
        let calculator = bolus_calculator();
        let candidate = CandidateDose {
            dose_mg: 400.0,
            interval_hours: 12.0,
            infusion_time_hours: 0.0,
        };
        let params = vec![("V".to_string(), 347.0), ("Ke".to_string(), 0.0435)];
        let (_times, concentrations, residuals) =
            run_to_steady_state(&calculator, AbsorptionModel::Intravascular, 0, candidate, &params, 10.0).unwrap();
        assert!(!concentrations.is_empty());
        assert!(residuals[0] >= 0.0);
    }

    #[test]
    fn rank_and_filter_best_per_interval_deduplicates() {
        let scored = vec![
            ScoredCandidate {
                candidate: CandidateDose {
                    dose_mg: 100.0,
                    interval_hours: 12.0,
                    infusion_time_hours: 0.0,
                },
                score: 0.8,
            },
            ScoredCandidate {
                candidate: CandidateDose {
                    dose_mg: 200.0,
                    interval_hours: 12.0,
                    infusion_time_hours: 0.0,
                },
                score: 0.9,
            },
            ScoredCandidate {
                candidate: CandidateDose {
                    dose_mg: 200.0,
                    interval_hours: 24.0,
                    infusion_time_hours: 0.0,
                },
                score: 0.7,
            },
        ];
        let filtered = rank_and_filter(scored, BestCandidatesOption::BestPerUniqueInterval);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].candidate.dose_mg, 200.0);
    }

    #[test]
    fn score_target_rejects_out_of_range_value() {
        let target = TargetDefinition {
            active_moiety_id: "m".into(),
            kind: TargetKind::Residual,
            min: 1.0,
            best: 5.0,
            max: 10.0,
            unit: "ug/l".into(),
        };
        let stats = CycleStatistics {
            peak: 20.0,
            trough: 0.5,
            auc: 50.0,
            mean: 10.0,
            tmax_hours: 1.0,
        };
        let err = score_target(&target, &stats, 0.0).unwrap_err();
        assert_eq!(err, PkError::InvalidCandidate);
    }
}
