// Layer and filler parameters
//
// Configuration arrives already parsed. A `LayerParameter` names the layer
// type, says where it runs (`Mode`), and carries an open map of named options
// whose meaning depends on the layer type. Nothing here reads text; callers
// build parameters in code or deserialize them from whatever structured value
// they already hold (e.g. a `serde_json::Value`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use caffeine_core::error::{Error, Result};
use caffeine_core::Mode;

/// A single option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// Immutable configuration captured by a layer at construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerParameter {
    /// Instance name, used in errors and logs.
    pub name: String,
    /// Layer type, e.g. "ReLU".
    #[serde(rename = "type")]
    pub layer_type: String,
    /// Where Forward/Backward run.
    pub mode: Mode,
    /// Layer-type-specific options.
    pub options: BTreeMap<String, ParamValue>,
}

impl LayerParameter {
    pub fn new(layer_type: impl Into<String>) -> Self {
        LayerParameter {
            layer_type: layer_type.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Name for errors and logs: the instance name, or the type if unnamed.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.layer_type
        } else {
            &self.name
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.options.get(key)
    }

    /// A numeric option; integers are widened.
    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.options.get(key) {
            None => Ok(None),
            Some(ParamValue::Float(v)) => Ok(Some(*v)),
            Some(ParamValue::Int(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(Error::invalid_parameter(
                key,
                format!("expected a number, got {other:?}"),
            )),
        }
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self.get_f64(key)?.unwrap_or(default))
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.options.get(key) {
            None => Ok(default),
            Some(ParamValue::Bool(v)) => Ok(*v),
            Some(other) => Err(Error::invalid_parameter(
                key,
                format!("expected a bool, got {other:?}"),
            )),
        }
    }
}

/// Distribution used by a filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillerKind {
    #[default]
    Constant,
    Uniform,
    Gaussian,
    PositiveUnitball,
    Xavier,
}

/// Parameters for a filler. Unused fields are ignored by each kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillerParameter {
    #[serde(rename = "type")]
    pub kind: FillerKind,
    /// Constant value.
    pub value: f64,
    /// Uniform lower bound.
    pub min: f64,
    /// Uniform upper bound.
    pub max: f64,
    /// Gaussian mean.
    pub mean: f64,
    /// Gaussian standard deviation.
    pub std: f64,
    /// Seed for reproducible fills; fresh entropy when absent.
    pub seed: Option<u64>,
}

impl Default for FillerParameter {
    fn default() -> Self {
        FillerParameter {
            kind: FillerKind::Constant,
            value: 0.0,
            min: 0.0,
            max: 1.0,
            mean: 0.0,
            std: 1.0,
            seed: None,
        }
    }
}

impl FillerParameter {
    pub fn new(kind: FillerKind) -> Self {
        FillerParameter {
            kind,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_getters() {
        let p = LayerParameter::new("ReLU")
            .with_name("relu1")
            .with_mode(Mode::Gpu)
            .with_option("negative_slope", 0.1)
            .with_option("in_place", false)
            .with_option("count", 3i64);
        assert_eq!(p.display_name(), "relu1");
        assert_eq!(p.get_f64("negative_slope").unwrap(), Some(0.1));
        assert_eq!(p.get_f64("count").unwrap(), Some(3.0));
        assert_eq!(p.get_f64_or("missing", 2.5).unwrap(), 2.5);
        assert!(!p.get_bool_or("in_place", true).unwrap());
        assert!(matches!(
            p.get_f64("in_place"),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_display_name_falls_back_to_type() {
        assert_eq!(LayerParameter::new("TanH").display_name(), "TanH");
    }

    #[test]
    fn test_layer_parameter_from_value() {
        let v = serde_json::json!({
            "name": "act",
            "type": "ReLU",
            "mode": "gpu",
            "options": { "negative_slope": 0.2 }
        });
        let p: LayerParameter = serde_json::from_value(v).unwrap();
        assert_eq!(p.layer_type, "ReLU");
        assert_eq!(p.mode, Mode::Gpu);
        assert_eq!(p.get_f64("negative_slope").unwrap(), Some(0.2));
    }

    #[test]
    fn test_filler_parameter_defaults() {
        let p: FillerParameter =
            serde_json::from_value(serde_json::json!({ "type": "gaussian" })).unwrap();
        assert_eq!(p.kind, FillerKind::Gaussian);
        assert_eq!(p.mean, 0.0);
        assert_eq!(p.std, 1.0);
        assert_eq!(p.seed, None);
    }
}
