//! Engine-tunable configuration (spec §2 "ambient stack"): Monte Carlo
//! sample count, RNG seed, default `nbPointsPerHour`, loaded from JSON
//! the same way the teacher's `Config::from_file` loads a population
//! simulation run.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PkError, PkResult};

/// Knobs the orchestrator falls back on when a `ComputingTrait` leaves
/// them unspecified, plus the demo binary's input/output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub monte_carlo: MonteCarloConfig,
    #[serde(default = "default_nb_points_per_hour")]
    pub default_nb_points_per_hour: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    #[serde(default = "default_n_patients")]
    pub default_n_patients: usize,
    pub seed: Option<u64>,
}

fn default_nb_points_per_hour() -> f64 {
    4.0
}

fn default_n_patients() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            monte_carlo: MonteCarloConfig { default_n_patients: default_n_patients(), seed: None },
            default_nb_points_per_hour: default_nb_points_per_hour(),
        }
    }
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> PkResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PkError::TooBig(format!("cannot read config file: {e}")))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| PkError::ParameterExtractionError(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PkResult<()> {
        if self.monte_carlo.default_n_patients == 0 {
            return Err(PkError::ParameterExtractionError(
                "monte_carlo.default_n_patients must be positive".to_string(),
            ));
        }
        if self.default_nb_points_per_hour <= 0.0 {
            return Err(PkError::ParameterExtractionError(
                "default_nb_points_per_hour must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-memory fixture bundling the `DrugModel`/`DrugTreatment` JSON the
/// demo binary loads, mirroring the teacher's single `Config` file but
/// split across the two domain entities this core actually consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoFixture {
    pub drug_model: crate::model::DrugModel,
    pub treatment: crate::treatment::DrugTreatment,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl DemoFixture {
    pub fn from_file<P: AsRef<Path>>(path: P) -> PkResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PkError::TooBig(format!("cannot read fixture file: {e}")))?;
        let fixture: DemoFixture = serde_json::from_str(&content)
            .map_err(|e| PkError::ParameterExtractionError(format!("invalid fixture JSON: {e}")))?;
        fixture.engine.validate()?;
        Ok(fixture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_engine_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_patient_count() {
        let config = EngineConfig {
            monte_carlo: MonteCarloConfig { default_n_patients: 0, seed: Some(1) },
            default_nb_points_per_hour: 4.0,
        };
        assert!(config.validate().is_err());
    }
}
