//! Search space, concrete values and the unit-cube encoding used by oracles.

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use recyclebot_core::{ParamSpec, Sampling};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, Result};

/// A single hyperparameter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HpValue {
    Int(i64),
    Float(f64),
}

impl HpValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            HpValue::Int(v) => *v as f64,
            HpValue::Float(v) => *v,
        }
    }
}

impl fmt::Display for HpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HpValue::Int(v) => write!(f, "{v}"),
            HpValue::Float(v) if *v != 0.0 && v.abs() < 1e-3 => write!(f, "{v:e}"),
            HpValue::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Concrete values for a set of hyperparameters, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HyperValues(BTreeMap<String, HpValue>);

impl HyperValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: HpValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<HpValue> {
        self.0.get(name).copied()
    }

    /// Float value; integers are widened.
    pub fn get_float(&self, name: &str) -> Result<f64> {
        self.get(name)
            .map(|v| v.as_f64())
            .ok_or_else(|| MlError::invalid_input(format!("missing hyperparameter '{name}'")))
    }

    pub fn get_int(&self, name: &str) -> Result<i64> {
        match self.get(name) {
            Some(HpValue::Int(v)) => Ok(v),
            Some(HpValue::Float(v)) => Err(MlError::invalid_input(format!(
                "hyperparameter '{name}' is a float ({v}), expected an integer"
            ))),
            None => Err(MlError::invalid_input(format!("missing hyperparameter '{name}'"))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HpValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical string used to detect repeated points.
    pub fn fingerprint(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| match v {
                HpValue::Int(i) => format!("{k}={i}"),
                HpValue::Float(x) => format!("{k}={:.12e}", x),
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for HyperValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Per-entry mapping between values and `[0, 1]`.
pub trait UnitEncoding {
    fn to_unit(&self, value: HpValue) -> Result<f64>;
    fn from_unit(&self, prob: f64) -> HpValue;
    fn default_value(&self) -> HpValue;
    fn parse_value(&self, raw: &str) -> Result<HpValue>;
}

impl UnitEncoding for ParamSpec {
    fn to_unit(&self, value: HpValue) -> Result<f64> {
        let p = match self {
            ParamSpec::Float {
                min, max, sampling, ..
            } => {
                let v = value.as_f64();
                if max <= min {
                    0.5
                } else {
                    match sampling {
                        Sampling::Linear => (v - min) / (max - min),
                        Sampling::Log => (v / min).ln() / (max / min).ln(),
                    }
                }
            }
            ParamSpec::Int { name, min, max } => {
                let HpValue::Int(v) = value else {
                    return Err(MlError::invalid_input(format!(
                        "hyperparameter '{name}' expects an integer"
                    )));
                };
                ((v - min) as f64 + 0.5) / ((max - min + 1) as f64)
            }
        };
        if p.is_nan() {
            return Err(MlError::invalid_input(format!(
                "value {value} cannot be encoded for '{}'",
                self.name()
            )));
        }
        Ok(p.clamp(0.0, 1.0))
    }

    fn from_unit(&self, prob: f64) -> HpValue {
        let p = prob.clamp(0.0, 1.0);
        match self {
            ParamSpec::Float {
                min, max, sampling, ..
            } => {
                let v = match sampling {
                    Sampling::Linear => min + p * (max - min),
                    Sampling::Log => min * ((max / min).ln() * p).exp(),
                };
                HpValue::Float(v.clamp(*min, *max))
            }
            ParamSpec::Int { min, max, .. } => {
                let buckets = (max - min + 1) as f64;
                let v = min + (p * buckets).floor() as i64;
                HpValue::Int(v.min(*max))
            }
        }
    }

    fn default_value(&self) -> HpValue {
        match self {
            ParamSpec::Float { min, .. } => HpValue::Float(*min),
            ParamSpec::Int { min, .. } => HpValue::Int(*min),
        }
    }

    fn parse_value(&self, raw: &str) -> Result<HpValue> {
        let raw = raw.trim();
        let value = match self {
            ParamSpec::Float { name, .. } => raw.parse::<f64>().map(HpValue::Float).map_err(|_| {
                MlError::invalid_input(format!("'{raw}' is not a valid float for '{name}'"))
            })?,
            ParamSpec::Int { name, .. } => raw.parse::<i64>().map(HpValue::Int).map_err(|_| {
                MlError::invalid_input(format!("'{raw}' is not a valid integer for '{name}'"))
            })?,
        };
        check_range(self, value)?;
        Ok(value)
    }
}

fn check_range(spec: &ParamSpec, value: HpValue) -> Result<()> {
    let ok = match (spec, value) {
        (ParamSpec::Float { min, max, .. }, HpValue::Float(v)) => (*min..=*max).contains(&v),
        (ParamSpec::Float { min, max, .. }, HpValue::Int(v)) => (*min..=*max).contains(&(v as f64)),
        (ParamSpec::Int { min, max, .. }, HpValue::Int(v)) => (*min..=*max).contains(&v),
        (ParamSpec::Int { .. }, HpValue::Float(_)) => false,
    };
    if ok {
        Ok(())
    } else {
        Err(MlError::invalid_input(format!(
            "value {value} outside the range of '{}'",
            spec.name()
        )))
    }
}

/// An ordered search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParameters {
    specs: Vec<ParamSpec>,
}

impl HyperParameters {
    pub fn from_specs(specs: Vec<ParamSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(MlError::invalid_input("search space is empty"));
        }
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|s| s.name() == spec.name()) {
                return Err(MlError::invalid_input(format!(
                    "duplicate hyperparameter '{}'",
                    spec.name()
                )));
            }
        }
        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn dims(&self) -> usize {
        self.specs.len()
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name() == name)
    }

    /// Every entry at its minimum.
    pub fn defaults(&self) -> HyperValues {
        let mut values = HyperValues::new();
        for spec in &self.specs {
            values.set(spec.name(), spec.default_value());
        }
        values
    }

    /// Encode `values` as a point in the unit cube, in space order.
    pub fn to_unit(&self, values: &HyperValues) -> Result<Vec<f64>> {
        self.specs
            .iter()
            .map(|spec| {
                let value = values.get(spec.name()).ok_or_else(|| {
                    MlError::invalid_input(format!("missing hyperparameter '{}'", spec.name()))
                })?;
                spec.to_unit(value)
            })
            .collect()
    }

    pub fn from_unit(&self, point: &[f64]) -> Result<HyperValues> {
        if point.len() != self.specs.len() {
            return Err(MlError::invalid_input(format!(
                "point has {} dimensions, space has {}",
                point.len(),
                self.specs.len()
            )));
        }
        let mut values = HyperValues::new();
        for (spec, &p) in self.specs.iter().zip(point) {
            values.set(spec.name(), spec.from_unit(p));
        }
        Ok(values)
    }

    /// Uniform sample in the unit cube, decoded.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> HyperValues {
        let mut values = HyperValues::new();
        for spec in &self.specs {
            values.set(spec.name(), spec.from_unit(rng.gen_range(0.0..1.0)));
        }
        values
    }

    /// Check that `values` covers the space with in-range values.
    pub fn validate(&self, values: &HyperValues) -> Result<()> {
        for spec in &self.specs {
            let value = values.get(spec.name()).ok_or_else(|| {
                MlError::invalid_input(format!("missing hyperparameter '{}'", spec.name()))
            })?;
            check_range(spec, value)?;
        }
        Ok(())
    }

    /// Apply `name=value` assignments on top of `values`.
    pub fn apply_assignments(&self, values: &mut HyperValues, assignments: &[String]) -> Result<()> {
        for assignment in assignments {
            let (name, raw) = assignment.split_once('=').ok_or_else(|| {
                MlError::invalid_input(format!("expected name=value, got '{assignment}'"))
            })?;
            let name = name.trim();
            let spec = self
                .spec(name)
                .ok_or_else(|| MlError::invalid_input(format!("unknown hyperparameter '{name}'")))?;
            values.set(name, spec.parse_value(raw)?);
        }
        Ok(())
    }
}

/// Typed view of the six two-phase fine-tuning hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FineTuneParams {
    pub learning_rate: f64,
    pub num_epochs: usize,
    pub fine_learning_rate: f64,
    pub fine_num_epochs: usize,
    pub dropout: f64,
    pub num_unfreeze_layers: usize,
}

impl FineTuneParams {
    pub fn from_values(values: &HyperValues) -> Result<Self> {
        Ok(Self {
            learning_rate: values.get_float("learning_rate")?,
            num_epochs: non_negative(values, "num_epochs")?,
            fine_learning_rate: values.get_float("fine_learning_rate")?,
            fine_num_epochs: non_negative(values, "fine_num_epochs")?,
            dropout: values.get_float("dropout")?,
            num_unfreeze_layers: non_negative(values, "num_unfreeze_layers")?,
        })
    }

    /// Total epochs across both phases.
    pub fn total_epochs(&self) -> usize {
        self.num_epochs + self.fine_num_epochs
    }
}

fn non_negative(values: &HyperValues, name: &str) -> Result<usize> {
    let v = values.get_int(name)?;
    usize::try_from(v)
        .map_err(|_| MlError::invalid_input(format!("hyperparameter '{name}' must be >= 0, got {v}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use recyclebot_core::config::default_space;

    fn space() -> HyperParameters {
        HyperParameters::from_specs(default_space()).unwrap()
    }

    #[test]
    fn test_defaults_are_minimums() {
        let defaults = space().defaults();
        assert_eq!(defaults.get("learning_rate"), Some(HpValue::Float(1e-5)));
        assert_eq!(defaults.get("num_epochs"), Some(HpValue::Int(50)));
        assert_eq!(defaults.get("num_unfreeze_layers"), Some(HpValue::Int(0)));
        assert_eq!(defaults.len(), 6);
    }

    #[test]
    fn test_log_encoding() {
        let spec = ParamSpec::float("lr", 1e-5, 1e-3, Sampling::Log);
        let mid = spec.to_unit(HpValue::Float(1e-4)).unwrap();
        assert!((mid - 0.5).abs() < 1e-9);
        let HpValue::Float(v) = spec.from_unit(0.5) else {
            panic!("expected float");
        };
        assert!((v - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_int_bucket_encoding() {
        let spec = ParamSpec::int("n", 0, 3);
        // four buckets: [0, .25) -> 0, ..., [.75, 1] -> 3
        assert_eq!(spec.from_unit(0.0), HpValue::Int(0));
        assert_eq!(spec.from_unit(0.24), HpValue::Int(0));
        assert_eq!(spec.from_unit(0.25), HpValue::Int(1));
        assert_eq!(spec.from_unit(1.0), HpValue::Int(3));
        assert!((spec.to_unit(HpValue::Int(1)).unwrap() - 0.375).abs() < 1e-12);
        assert!(spec.to_unit(HpValue::Float(1.0)).is_err());
    }

    #[test]
    fn test_sample_is_valid_and_reproducible() {
        let hp = space();
        let mut a = ChaCha8Rng::seed_from_u64(3);
        let mut b = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..20 {
            let va = hp.sample(&mut a);
            hp.validate(&va).unwrap();
            assert_eq!(va, hp.sample(&mut b));
        }
    }

    #[test]
    fn test_get_int_and_float() {
        let mut values = HyperValues::new();
        values.set("epochs", HpValue::Int(5));
        values.set("lr", HpValue::Float(0.1));
        assert_eq!(values.get_float("epochs").unwrap(), 5.0);
        assert!(values.get_int("lr").is_err());
        assert!(values.get_float("missing").is_err());
    }

    #[test]
    fn test_apply_assignments() {
        let hp = space();
        let mut values = hp.defaults();
        hp.apply_assignments(
            &mut values,
            &["num_epochs=60".to_string(), "dropout = 0.25".to_string()],
        )
        .unwrap();
        assert_eq!(values.get("num_epochs"), Some(HpValue::Int(60)));
        assert_eq!(values.get("dropout"), Some(HpValue::Float(0.25)));

        assert!(hp.apply_assignments(&mut values, &["bogus=1".to_string()]).is_err());
        assert!(hp.apply_assignments(&mut values, &["num_epochs=1.5".to_string()]).is_err());
        assert!(hp.apply_assignments(&mut values, &["num_epochs=5".to_string()]).is_err());
        assert!(hp.apply_assignments(&mut values, &["dropout".to_string()]).is_err());
    }

    #[test]
    fn test_fine_tune_params() {
        let params = FineTuneParams::from_values(&space().defaults()).unwrap();
        assert_eq!(params.num_epochs, 50);
        assert_eq!(params.fine_num_epochs, 10);
        assert_eq!(params.total_epochs(), 60);
        assert_eq!(params.num_unfreeze_layers, 0);

        let mut values = space().defaults();
        values.set("num_epochs", HpValue::Int(-1));
        assert!(FineTuneParams::from_values(&values).is_err());
    }

    #[test]
    fn test_values_serde_keeps_types() {
        let values = space().defaults();
        let json = serde_json::to_string(&values).unwrap();
        let back: HyperValues = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_rejects_duplicates() {
        let specs = vec![ParamSpec::int("a", 0, 1), ParamSpec::int("a", 0, 2)];
        assert!(HyperParameters::from_specs(specs).is_err());
    }
}
