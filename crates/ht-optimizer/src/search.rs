//! Search space definitions and concrete parameter values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use ht_types::ConfigError;

/// A concrete parameter value produced by a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
        }
    }
}

/// One proposed parameter vector, keyed by parameter name.
pub type Params = BTreeMap<String, ParamValue>;

/// Domain of a single tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParamDomain {
    /// Continuous range [min, max].
    Float {
        min: f64,
        max: f64,
        #[serde(default, alias = "log")]
        log_scale: bool,
    },
    /// Integer range [min, max] inclusive.
    Int {
        min: i64,
        max: i64,
        #[serde(default, alias = "log")]
        log_scale: bool,
    },
}

impl ParamDomain {
    pub fn log_scale(&self) -> bool {
        match self {
            Self::Float { log_scale, .. } | Self::Int { log_scale, .. } => *log_scale,
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            Self::Float { min, max, .. } => (min, max),
            Self::Int { min, max, .. } => (min as f64, max as f64),
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let (min, max) = self.bounds();
        if !min.is_finite() || !max.is_finite() {
            return Err(ConfigError::NonFiniteBound {
                name: name.to_string(),
            });
        }
        // Integer bounds compare exactly; past 2^53 distinct values share an f64
        let inverted = match *self {
            Self::Float { min, max, .. } => min > max,
            Self::Int { min, max, .. } => min > max,
        };
        if inverted {
            return Err(ConfigError::InvalidBounds {
                name: name.to_string(),
                min,
                max,
            });
        }
        if self.log_scale() && min <= 0.0 {
            return Err(ConfigError::InvalidLogBounds {
                name: name.to_string(),
                min,
            });
        }
        let (lo, hi) = self.internal_bounds();
        if !(hi - lo).is_finite() {
            return Err(ConfigError::Invalid(format!(
                "parameter '{name}' range [{min}, {max}] is too wide to sample"
            )));
        }
        Ok(())
    }

    /// Whether `value` has the right kind and lies inside the bounds.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (Self::Float { min, max, .. }, ParamValue::Float(v)) => *v >= *min && *v <= *max,
            (Self::Int { min, max, .. }, ParamValue::Int(v)) => *v >= *min && *v <= *max,
            _ => false,
        }
    }

    /// Bounds in the space samplers search in: natural log for log-scale
    /// domains, identity otherwise.
    pub fn internal_bounds(&self) -> (f64, f64) {
        let (min, max) = self.bounds();
        if self.log_scale() {
            (min.ln(), max.ln())
        } else {
            (min, max)
        }
    }

    pub fn to_internal(&self, value: &ParamValue) -> f64 {
        let v = value.as_f64();
        if self.log_scale() {
            v.ln()
        } else {
            v
        }
    }

    /// Map an internal-space coordinate back to a legal value.
    ///
    /// The result is clamped into the domain, so rounding or floating point
    /// error in `exp` never produces an out-of-bounds proposal.
    pub fn from_internal(&self, x: f64) -> ParamValue {
        let natural = if self.log_scale() { x.exp() } else { x };
        match *self {
            Self::Float { min, max, .. } => ParamValue::Float(natural.clamp(min, max)),
            Self::Int { min, max, .. } => {
                let rounded = natural.round();
                let clamped = rounded.clamp(min as f64, max as f64) as i64;
                ParamValue::Int(clamped.clamp(min, max))
            }
        }
    }
}

/// The full search space: parameter name → domain.
///
/// Iteration order is the sorted parameter name, which keeps seeded samplers
/// reproducible regardless of how the space was declared.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    pub parameters: BTreeMap<String, ParamDomain>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_float(mut self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.parameters.insert(
            name.into(),
            ParamDomain::Float {
                min,
                max,
                log_scale: false,
            },
        );
        self
    }

    pub fn add_log_float(mut self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.parameters.insert(
            name.into(),
            ParamDomain::Float {
                min,
                max,
                log_scale: true,
            },
        );
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, min: i64, max: i64) -> Self {
        self.parameters.insert(
            name.into(),
            ParamDomain::Int {
                min,
                max,
                log_scale: false,
            },
        );
        self
    }

    pub fn add_log_int(mut self, name: impl Into<String>, min: i64, max: i64) -> Self {
        self.parameters.insert(
            name.into(),
            ParamDomain::Int {
                min,
                max,
                log_scale: true,
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParamDomain> {
        self.parameters.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamDomain)> {
        self.parameters.iter()
    }

    /// Check every domain invariant. The first violation wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parameters.is_empty() {
            return Err(ConfigError::EmptySearchSpace);
        }
        for (name, domain) in &self.parameters {
            domain.validate(name)?;
        }
        Ok(())
    }

    /// Whether `params` names exactly this space's parameters, each in bounds.
    pub fn contains(&self, params: &Params) -> bool {
        params.len() == self.parameters.len()
            && self.parameters.iter().all(|(name, domain)| {
                params
                    .get(name)
                    .map(|value| domain.contains(value))
                    .unwrap_or(false)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_space() -> SearchSpace {
        SearchSpace::new()
            .add_log_float("lr0", 1e-5, 1e-2)
            .add_float("momentum", 0.8, 0.99)
            .add_int("warmup_epochs", 1, 10)
    }

    #[test]
    fn search_space_builder_chain() {
        let space = sample_space().add_log_int("batch", 8, 256);
        assert_eq!(space.len(), 4);
        assert!(space.get("batch").unwrap().log_scale());
        assert!(space.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let space = SearchSpace::new().add_float("x", 1.0, 0.0);
        assert!(matches!(
            space.validate(),
            Err(ConfigError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn validate_compares_int_bounds_exactly() {
        let top = 1_i64 << 53;
        let space = SearchSpace::new().add_int("n", top + 1, top);
        assert!(matches!(
            space.validate(),
            Err(ConfigError::InvalidBounds { .. })
        ));
        assert!(SearchSpace::new().add_int("n", top, top + 1).validate().is_ok());
        assert!(SearchSpace::new().add_int("n", i64::MIN, i64::MAX).validate().is_ok());
    }

    #[test]
    fn validate_rejects_unsampleable_width() {
        let space = SearchSpace::new().add_float("x", -1e308, 1e308);
        assert!(matches!(space.validate(), Err(ConfigError::Invalid(_))));
        assert!(SearchSpace::new().add_float("x", -1e307, 1e307).validate().is_ok());
    }

    #[test]
    fn validate_rejects_log_scale_with_non_positive_min() {
        let space = SearchSpace::new().add_log_float("wd", 0.0, 1e-2);
        assert!(matches!(
            space.validate(),
            Err(ConfigError::InvalidLogBounds { .. })
        ));
    }

    #[test]
    fn validate_rejects_empty_and_nan() {
        assert_eq!(SearchSpace::new().validate(), Err(ConfigError::EmptySearchSpace));
        let space = SearchSpace::new().add_float("x", f64::NAN, 1.0);
        assert!(matches!(
            space.validate(),
            Err(ConfigError::NonFiniteBound { .. })
        ));
    }

    #[test]
    fn degenerate_range_is_valid() {
        let space = SearchSpace::new().add_float("x", 0.5, 0.5);
        assert!(space.validate().is_ok());
    }

    #[test]
    fn contains_checks_kind_bounds_and_names() {
        let space = sample_space();
        let mut params = Params::new();
        params.insert("lr0".into(), ParamValue::Float(1e-3));
        params.insert("momentum".into(), ParamValue::Float(0.9));
        params.insert("warmup_epochs".into(), ParamValue::Int(3));
        assert!(space.contains(&params));

        params.insert("warmup_epochs".into(), ParamValue::Float(3.0));
        assert!(!space.contains(&params));

        params.insert("warmup_epochs".into(), ParamValue::Int(11));
        assert!(!space.contains(&params));

        params.remove("warmup_epochs");
        assert!(!space.contains(&params));
    }

    #[test]
    fn from_internal_clamps_and_rounds() {
        let domain = ParamDomain::Int {
            min: 1,
            max: 10,
            log_scale: false,
        };
        assert_eq!(domain.from_internal(4.6), ParamValue::Int(5));
        assert_eq!(domain.from_internal(42.0), ParamValue::Int(10));

        let log = ParamDomain::Float {
            min: 1e-5,
            max: 1e-2,
            log_scale: true,
        };
        let (lo, hi) = log.internal_bounds();
        assert_eq!(log.from_internal(lo - 1.0), ParamValue::Float(1e-5));
        assert_eq!(log.from_internal(hi + 1.0), ParamValue::Float(1e-2));
    }

    #[test]
    fn yaml_domain_accepts_log_alias() {
        let yaml = "lr0: {kind: float, min: 1.0e-5, max: 1.0e-2, log: true}\n\
                    warmup_epochs: {kind: int, min: 1, max: 10}\n";
        let space: SearchSpace = serde_yaml::from_str(yaml).unwrap();
        assert!(space.get("lr0").unwrap().log_scale());
        assert_eq!(
            space.get("warmup_epochs"),
            Some(&ParamDomain::Int {
                min: 1,
                max: 10,
                log_scale: false
            })
        );
    }

    #[test]
    fn untagged_value_keeps_ints_and_floats_apart() {
        let json = r#"{"a": 3, "b": 0.25}"#;
        let params: Params = serde_json::from_str(json).unwrap();
        assert_eq!(params["a"], ParamValue::Int(3));
        assert_eq!(params["b"], ParamValue::Float(0.25));
    }
}
