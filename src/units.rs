//! Concentration unit conversion (spec §6).
//!
//! `ug/l` is the canonical internal unit; calculators and the residual
//! chain never see anything else. Conversion to/from the active
//! moiety's declared unit happens only at the extraction boundary (when
//! reading samples) and the response boundary (when reporting cycles).

use crate::error::{PkError, PkResult};

/// Conversion factor from `unit` to `ug/l`, i.e. `value_in_ug_l = value * factor`.
fn factor_to_ug_l(unit: &str) -> PkResult<f64> {
    match unit {
        "ug/l" | "mcg/l" | "ng/ml" => Ok(1.0),
        "mg/l" | "ug/ml" | "mcg/ml" => Ok(1_000.0),
        "g/l" | "mg/ml" => Ok(1_000_000.0),
        "ng/l" | "pg/ml" => Ok(0.001),
        other => Err(PkError::AnalyteConversionError(format!("unknown concentration unit: {other}"))),
    }
}

/// Convert a concentration value between two recognised units.
pub fn convert_concentration(value: f64, from_unit: &str, to_unit: &str) -> PkResult<f64> {
    if from_unit == to_unit {
        return Ok(value);
    }
    let to_canonical = factor_to_ug_l(from_unit)?;
    let from_canonical = factor_to_ug_l(to_unit)?;
    Ok(value * to_canonical / from_canonical)
}

/// Shorthand used throughout the core: convert into the `ug/l` canonical unit.
pub fn to_ug_l(value: f64, unit: &str) -> PkResult<f64> {
    convert_concentration(value, unit, "ug/l")
}

/// Shorthand: convert out of the `ug/l` canonical unit into `unit`,
/// unless `force` requests the canonical unit regardless (spec §4.6,
/// `forceUgPerLiter`).
pub fn from_ug_l(value_ug_l: f64, unit: &str, force_ug_l: bool) -> PkResult<f64> {
    if force_ug_l {
        return Ok(value_ug_l);
    }
    convert_concentration(value_ug_l, "ug/l", unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mg_per_l_round_trips_through_ug_per_l() {
        let ug_l = to_ug_l(1.5, "mg/l").unwrap();
        assert!((ug_l - 1500.0).abs() < 1e-9);
        let back = from_ug_l(ug_l, "mg/l", false).unwrap();
        assert!((back - 1.5).abs() < 1e-9);
    }

    #[test]
    fn force_ug_l_skips_conversion() {
        let value = from_ug_l(42.0, "mg/l", true).unwrap();
        assert_eq!(value, 42.0);
    }

    #[test]
    fn unknown_unit_is_rejected() {
        assert!(convert_concentration(1.0, "mol/l", "ug/l").is_err());
    }
}
