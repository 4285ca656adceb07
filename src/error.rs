//! Single status/error taxonomy for the computation core (spec §7).
//!
//! Every internal operation returns a [`PkResult`]. The first non-`Ok`
//! status terminates the enclosing phase and propagates to the caller;
//! there is no local recovery except where the adjustment engine
//! explicitly drops a candidate (`InvalidCandidate`, `NoSteadyState`).

use thiserror::Error;

/// The single status enumeration (spec §7). `Ok` is not represented here:
/// a successful operation returns its value through `PkResult`'s `Ok(T)`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PkError {
    // -- Pre-flight --
    #[error("the dosage history is incompatible with the drug model")]
    IncompatibleTreatmentModel,
    #[error("the drug model declares no PK models")]
    NoPkModels,
    #[error("the request contains no computing traits")]
    NoComputingTraits,
    #[error("the drug domain is not compatible with the treatment")]
    UncompatibleDrugDomain,
    #[error("the drug model declares no analyte group")]
    NoAnalytesGroup,
    #[error("the treatment has no dosage history")]
    NoDosageHistory,

    // -- Extraction --
    #[error("covariate extraction error: {0}")]
    CovariateExtractionError(String),
    #[error("intake extraction error: {0}")]
    IntakeExtractionError(String),
    #[error("parameter extraction error: {0}")]
    ParameterExtractionError(String),
    #[error("sample extraction error: {0}")]
    SampleExtractionError(String),
    #[error("residual error model extraction error: {0}")]
    ErrorModelExtractionError(String),
    #[error("request exceeds implementation limits: {0}")]
    TooBig(String),
    #[error("unsupported absorption route: {0}")]
    UnsupportedRoute(String),
    #[error("could not find a suitable formulation and route for the treatment")]
    CouldNotFindSuitableFormulationAndRoute,
    #[error("multiple formulations and routes are not supported by this PK model")]
    MultipleFormulationAndRoutesNotSupported,
    #[error("analyte conversion error: {0}")]
    AnalyteConversionError(String),

    // -- Numerical --
    #[error("bad parameters: {0}")]
    BadParameters(String),
    #[error("bad concentration (negative residual or non-finite value)")]
    BadConcentration,
    #[error("density error: {0}")]
    DensityError(String),
    #[error("concentration calculator has no parameters")]
    ConcentrationCalculatorNoParameters,
    #[error("concentration size error")]
    ConcentrationSizeError,
    #[error("recorded intakes size error")]
    RecordedIntakesSizeError,
    #[error("selected intakes size error")]
    SelectedIntakesSizeError,

    // -- A-posteriori --
    #[error("the omega matrix is empty")]
    AposterioriEtasCalculationEmptyOmega,
    #[error("the omega matrix is not square")]
    AposterioriEtasCalculationNoSquareOmega,
    #[error("a-posteriori percentiles require samples but none were provided")]
    AposterioriPercentilesNoSamplesError,
    #[error("a sample lies outside the treatment window")]
    AposterioriPercentilesOutOfScopeSamplesError,
    #[error("no likely eta sample could be found")]
    AposterioriPercentilesNoLikelySample,
    #[error("a sample is dated before the treatment start")]
    SampleBeforeTreatmentStart,

    // -- Percentiles --
    #[error("no percentile calculation could be performed")]
    NoPercentilesCalculation,
    #[error("fewer than two valid trajectories survived numerical failures")]
    PercentilesNoValidPrediction,
    #[error("a percentile rank is outside [0, 100]")]
    OutOfBoundsPercentileRank,

    // -- Adjustment --
    #[error("no available dose for the selected formulation and route")]
    NoAvailableDose,
    #[error("no available interval for the selected formulation and route")]
    NoAvailableInterval,
    #[error("no available infusion time for the selected formulation and route")]
    NoAvailableInfusionTime,
    #[error("no formulation and route available for adjustment")]
    NoFormulationAndRouteForAdjustment,
    #[error("steady state could not be reached")]
    NoSteadyState,
    #[error("internal error in the adjustment engine: {0}")]
    AdjustmentsInternalError(String),
    #[error("candidate is invalid")]
    InvalidCandidate,
    #[error("target evaluation error: {0}")]
    TargetEvaluationError(String),

    // -- Control-flow --
    #[error("undefined status")]
    Undefined,
    #[error("computation was aborted")]
    Aborted,
    #[error("an unexpected exception occurred in a numeric component: {0}")]
    ComputingComponentExceptionError(String),
    #[error("a computing component was not initialized")]
    ComputingComponentNotInitialized,

    // -- Ambient stack (I/O, parsing) --
    #[error("IO error: {0}")]
    Io(String),
    #[error("JSON parsing error: {0}")]
    Json(String),
    #[error("CSV error: {0}")]
    Csv(String),
}

impl From<std::io::Error> for PkError {
    fn from(e: std::io::Error) -> Self {
        PkError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PkError {
    fn from(e: serde_json::Error) -> Self {
        PkError::Json(e.to_string())
    }
}

impl From<csv::Error> for PkError {
    fn from(e: csv::Error) -> Self {
        PkError::Csv(e.to_string())
    }
}

pub type PkResult<T> = Result<T, PkError>;

/// Human-readable message for a status, mirroring `getErrorString` (spec §7).
pub fn error_string(error: &PkError) -> String {
    error.to_string()
}
