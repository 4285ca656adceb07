//! Intake extraction: dosage history → discrete, contiguous
//! `IntakeEvent`s clipped to the integration window (spec §4.2).
//!
//! Grounded on the teacher's `extraction/dosing_old::DosingRegimen::from_config`,
//! which expanded a single dosing route into a flat `Vec<DoseEvent>`;
//! this module generalises that walk to the richer `DosageHistory`
//! shape (mixed routes, repeats, loops, daily doses) and adds window
//! clipping, contiguity enforcement, and calculator attachment, which
//! the teacher's single-route CLI never needed.

use crate::calculators::{self, CalculatorFamily};
use crate::error::{PkError, PkResult};
use crate::events::{IntakeEvent, IntakeSeries};
use crate::extraction::{ExtractionWindow, MAX_TOTAL_POINTS};
use crate::model::{AbsorptionModel, DrugModel, ParameterForm};
use crate::treatment::{DosageContent, DoseSpec, DrugTreatment};

/// One expanded, not-yet-clipped occurrence of a dose.
struct RawIntake {
    time_hours: f64,
    dose: DoseSpec,
}

fn expand_range(range: &crate::treatment::DosageTimeRange, window_end_hours: f64) -> Vec<RawIntake> {
    let mut out = Vec::new();
    let range_end = range.end_hours.unwrap_or(window_end_hours);
    match &range.content {
        DosageContent::Single(dose) => out.push(RawIntake {
            time_hours: range.start_hours,
            dose: *dose,
        }),
        DosageContent::Repeat {
            dose,
            interval_hours,
            count,
        } => {
            for i in 0..*count {
                out.push(RawIntake {
                    time_hours: range.start_hours + (i as f64) * interval_hours,
                    dose: *dose,
                });
            }
        }
        DosageContent::Loop { dose, interval_hours } => {
            let mut t = range.start_hours;
            while t < range_end {
                out.push(RawIntake {
                    time_hours: t,
                    dose: *dose,
                });
                t += interval_hours;
            }
        }
        DosageContent::DailyDose {
            dose,
            time_of_day_hours,
        } => {
            let first_day_start = (range.start_hours / 24.0).floor() * 24.0;
            let mut day_start = first_day_start;
            while day_start < range_end {
                let t = day_start + time_of_day_hours;
                if t >= range.start_hours && t < range_end {
                    out.push(RawIntake {
                        time_hours: t,
                        dose: *dose,
                    });
                }
                day_start += 24.0;
            }
        }
    }
    out
}

fn nb_points_for(interval_hours: f64, nb_points_per_hour: f64) -> usize {
    ((interval_hours * nb_points_per_hour).ceil() as usize + 1).max(2)
}

/// Expand, clip, and solve-ready an `IntakeSeries` for the full
/// treatment (all formulations share one window; per-analyte-group
/// calculator resolution happens per intake using that intake's own
/// formulation/route, so a mixed-route history is supported as long as
/// `AllowMultipleRoutes::Yes` was already checked by the orchestrator).
pub fn extract_intakes(
    drug_model: &DrugModel,
    treatment: &DrugTreatment,
    window: ExtractionWindow,
    nb_points_per_hour: f64,
    family: CalculatorFamily,
) -> PkResult<IntakeSeries> {
    let mut raw: Vec<RawIntake> = Vec::new();
    for range in &treatment.dosage_history.ranges {
        raw.extend(expand_range(range, window.end_hours));
    }
    raw.sort_by(|a, b| a.time_hours.total_cmp(&b.time_hours));

    let mut intakes: Vec<IntakeEvent> = Vec::new();
    let mut total_points: usize = 0;

    for r in raw {
        if r.time_hours < window.start_hours || r.time_hours >= window.end_hours {
            continue;
        }

        let absorption_model = calculators::normalize_absorption_model(
            r.dose.absorption_model,
            r.dose.infusion_time_hours.unwrap_or(0.0),
        );

        let formulation = drug_model
            .formulations_and_routes
            .get(r.dose.formulation_index)
            .ok_or(PkError::CouldNotFindSuitableFormulationAndRoute)?;
        if formulation.absorption_model != absorption_model {
            return Err(PkError::CouldNotFindSuitableFormulationAndRoute);
        }

        let interval_hours = r.dose.interval_hours.min(window.end_hours - r.time_hours);
        if interval_hours <= 0.0 {
            continue;
        }
        let nb_points = nb_points_for(interval_hours, nb_points_per_hour);
        total_points += nb_points;
        if total_points > MAX_TOTAL_POINTS {
            return Err(PkError::TooBig(format!(
                "expanded intake series exceeds {MAX_TOTAL_POINTS} total solver points"
            )));
        }

        intakes.push(IntakeEvent {
            time_hours: r.time_hours,
            offset_hours: r.time_hours - window.start_hours,
            dose_mg: r.dose.amount * r.dose.unit_to_mg,
            interval_hours,
            formulation_index: r.dose.formulation_index,
            absorption_model,
            infusion_time_hours: r.dose.infusion_time_hours.unwrap_or(0.0),
            nb_points,
            calculator: None,
        });
    }

    if let Some(last) = intakes.last() {
        let tail_start = last.end_time_hours();
        if tail_start < window.end_hours {
            let interval_hours = window.end_hours - tail_start;
            let nb_points = nb_points_for(interval_hours, nb_points_per_hour);
            total_points += nb_points;
            if total_points > MAX_TOTAL_POINTS {
                return Err(PkError::TooBig(format!(
                    "expanded intake series exceeds {MAX_TOTAL_POINTS} total solver points"
                )));
            }
            intakes.push(IntakeEvent {
                time_hours: tail_start,
                offset_hours: tail_start - window.start_hours,
                dose_mg: 0.0,
                interval_hours,
                formulation_index: last.formulation_index,
                absorption_model: last.absorption_model,
                infusion_time_hours: 0.0,
                nb_points,
                calculator: None,
            });
        }
    } else {
        return Err(PkError::IntakeExtractionError(
            "no intake falls within the integration window".to_string(),
        ));
    }

    let mut series = IntakeSeries { intakes };
    series.enforce_contiguity();

    let analyte_group = drug_model
        .analyte_groups
        .first()
        .ok_or(PkError::NoAnalytesGroup)?;
    for intake in &mut series.intakes {
        intake.calculator = Some(calculators::resolve_calculator(
            analyte_group.compartments,
            intake.absorption_model,
            analyte_group.parameter_form,
            family,
        )?);
    }

    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::treatment::*;

    fn one_compartment_iv_model() -> DrugModel {
        DrugModel {
            drug_id: "d".into(),
            analyte_groups: vec![AnalyteGroup {
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
                        formula: None,
                        theta: 0.0435,
                        variability_type: VariabilityType::Exponential,
                        omega: 0.2,
                    },
                ],
                correlations: vec![],
            }],
            active_moieties: vec![],
            formulations_and_routes: vec![FormulationAndRoute {
                formulation: "iv".into(),
                absorption_model: AbsorptionModel::Intravascular,
                valid_doses: vec![400.0],
                valid_intervals_hours: vec![1.0],
                valid_infusion_times_hours: vec![0.0],
                parameter_overrides: Default::default(),
            }],
            covariate_definitions: vec![],
            time_considerations: TimeConsiderations {
                half_life_value: 1.0,
                half_life_unit: TimeUnit::Hour,
                secure_start_multiplier: 0.0,
            },
            targets: vec![],
            allow_multiple_routes: AllowMultipleRoutes::No,
        }
    }

    fn dose() -> DoseSpec {
        DoseSpec {
            amount: 400.0,
            unit_to_mg: 1.0,
            formulation_index: 0,
            absorption_model: AbsorptionModel::Intravascular,
            infusion_time_hours: None,
            interval_hours: 1.0,
        }
    }

    #[test]
    fn single_dose_expands_and_gets_a_tail() {
        let drug_model = one_compartment_iv_model();
        let mut treatment = DrugTreatment::default();
        treatment.dosage_history.ranges.push(DosageTimeRange {
            start_hours: 0.0,
            end_hours: None,
            content: DosageContent::Single(dose()),
        });
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 3.0,
        };
        let series = extract_intakes(&drug_model, &treatment, window, 10.0, CalculatorFamily::Analytical).unwrap();
        assert_eq!(series.intakes.len(), 2);
        assert_eq!(series.intakes[0].dose_mg, 400.0);
        assert_eq!(series.intakes[1].dose_mg, 0.0);
        assert!(series.all_calculators_attached());
    }

    #[test]
    fn repeat_dose_expands_to_count_intakes() {
        let drug_model = one_compartment_iv_model();
        let mut treatment = DrugTreatment::default();
        treatment.dosage_history.ranges.push(DosageTimeRange {
            start_hours: 0.0,
            end_hours: Some(3.0),
            content: DosageContent::Repeat {
                dose: dose(),
                interval_hours: 1.0,
                count: 3,
            },
        });
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 3.0,
        };
        let series = extract_intakes(&drug_model, &treatment, window, 10.0, CalculatorFamily::Analytical).unwrap();
        assert_eq!(series.intakes.len(), 3);
        for w in series.intakes.windows(2) {
            assert_eq!(w[0].end_time_hours(), w[1].time_hours);
        }
    }

    #[test]
    fn intakes_before_window_start_are_dropped() {
        let drug_model = one_compartment_iv_model();
        let mut treatment = DrugTreatment::default();
        treatment.dosage_history.ranges.push(DosageTimeRange {
            start_hours: -100.0,
            end_hours: Some(-50.0),
            content: DosageContent::Single(dose()),
        });
        treatment.dosage_history.ranges.push(DosageTimeRange {
            start_hours: 0.0,
            end_hours: None,
            content: DosageContent::Single(dose()),
        });
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 2.0,
        };
        let series = extract_intakes(&drug_model, &treatment, window, 10.0, CalculatorFamily::Analytical).unwrap();
        assert!(series.intakes.iter().all(|i| i.time_hours >= 0.0));
    }

    #[test]
    fn empty_dosage_history_window_errors() {
        let drug_model = one_compartment_iv_model();
        let treatment = DrugTreatment::default();
        let window = ExtractionWindow {
            start_hours: 0.0,
            end_hours: 2.0,
        };
        let err = extract_intakes(&drug_model, &treatment, window, 10.0, CalculatorFamily::Analytical).unwrap_err();
        assert_eq!(err, PkError::IntakeExtractionError(
            "no intake falls within the integration window".to_string()
        ));
    }
}
