use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

mod adjustment;
mod aposteriori;
mod calculators;
mod concentration;
mod config;
mod error;
mod events;
mod extraction;
mod formula;
mod model;
mod orchestrator;
mod percentiles;
mod response;
mod single_points;
mod treatment;
mod units;

use crate::config::DemoFixture;
use crate::error::PkError;
use crate::orchestrator::{
    AdjustmentTrait, AtMeasuresTrait, BestCandidatesOption, ComputingOption, ComputingRequest, ComputingTrait,
    ConcentrationTrait, FormulationAndRouteSelectionOption, PercentilesTrait, SinglePointsTrait,
};

/// Which trait the demo binary computes for the loaded fixture.
#[derive(Clone, clap::ValueEnum)]
enum Query {
    Concentration,
    Percentiles,
    Adjustment,
    AtMeasures,
    SinglePoints,
}

#[derive(Parser)]
#[command(name = "pk_decision_support")]
#[command(about = "Clinical PK/PD decision-support computation core")]
struct Cli {
    /// Fixture file bundling a drug model, a treatment and engine knobs.
    #[arg(short, long)]
    fixture: PathBuf,

    /// Which computing trait to run against the fixture.
    #[arg(short, long, value_enum, default_value = "concentration")]
    query: Query,

    /// Analyte group the trait is evaluated against.
    #[arg(short, long)]
    analyte_group: String,

    /// Prediction window end, in hours from the start of the treatment.
    #[arg(short, long, default_value = "168")]
    end_hours: f64,

    /// Random seed for reproducibility (percentiles only).
    #[arg(short, long)]
    seed: Option<u64>,

    /// Comma-separated hours to evaluate (single-points query only).
    #[arg(short, long, value_delimiter = ',')]
    times: Vec<f64>,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn build_request(cli: &Cli, fixture: &DemoFixture) -> ComputingRequest {
    let nb_points_per_hour = fixture.engine.default_nb_points_per_hour;
    let trait_ = match cli.query {
        Query::Concentration => ComputingTrait::Concentration(ConcentrationTrait {
            id: "demo-concentration".to_string(),
            analyte_group_id: cli.analyte_group.clone(),
            start_hours: 0.0,
            end_hours: cli.end_hours,
            nb_points_per_hour,
            options: ComputingOption::default(),
        }),
        Query::Percentiles => ComputingTrait::Percentiles(PercentilesTrait {
            id: "demo-percentiles".to_string(),
            analyte_group_id: cli.analyte_group.clone(),
            start_hours: 0.0,
            end_hours: cli.end_hours,
            ranks: vec![5.0, 50.0, 95.0],
            nb_points_per_hour,
            n_patients: fixture.engine.monte_carlo.default_n_patients,
            seed: cli.seed.or(fixture.engine.monte_carlo.seed),
            options: ComputingOption::default(),
        }),
        Query::Adjustment => ComputingTrait::Adjustment(AdjustmentTrait {
            id: "demo-adjustment".to_string(),
            analyte_group_id: cli.analyte_group.clone(),
            adjustment_time_hours: cli.end_hours / 2.0,
            end_hours: cli.end_hours,
            nb_points_per_hour,
            best_candidates_option: BestCandidatesOption::BestPerUniqueInterval,
            formulation_and_route_selection: FormulationAndRouteSelectionOption::LastUsed,
            options: ComputingOption::default(),
        }),
        Query::AtMeasures => ComputingTrait::AtMeasures(AtMeasuresTrait {
            id: "demo-at-measures".to_string(),
            analyte_group_id: cli.analyte_group.clone(),
            options: ComputingOption::default(),
        }),
        Query::SinglePoints => ComputingTrait::SinglePoints(SinglePointsTrait {
            id: "demo-single-points".to_string(),
            analyte_group_id: cli.analyte_group.clone(),
            times_hours: cli.times.clone(),
            options: ComputingOption::default(),
        }),
    };
    ComputingRequest { request_id: "demo-request".to_string(), traits: vec![trait_] }
}

fn run(cli: &Cli) -> Result<(), PkError> {
    let fixture = DemoFixture::from_file(&cli.fixture)?;
    info!("Loaded fixture from {:?}", cli.fixture);

    let request = build_request(cli, &fixture);
    let response = orchestrator::run_request(&fixture.drug_model, &fixture.treatment, &request)?;

    for trait_result in &response.results {
        match &trait_result.result {
            Ok(data) => info!("trait {}: {:?}", trait_result.id, data),
            Err(e) => error!("trait {} failed: {}", trait_result.id, e),
        }
    }
    Ok(())
}

fn main() -> Result<(), PkError> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env().filter_level(log::LevelFilter::Debug).init();
    } else {
        env_logger::Builder::from_default_env().filter_level(log::LevelFilter::Info).init();
    }

    run(&cli)
}
