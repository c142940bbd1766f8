//! Strategy parameter tables.
//!
//! Each variant declares its known keys; anything else in the flat
//! `strategies.<name>.params` table fails validation at load time.

use std::collections::BTreeMap;

use crate::config::ConfigError;

/// Every variant accepts a deterministic seed for its random choices.
pub const SEED_KEY: &str = "seed";

#[derive(Debug)]
pub struct ParamTable<'a> {
    strategy: &'a str,
    params: &'a BTreeMap<String, toml::Value>,
}

impl<'a> ParamTable<'a> {
    /// Wrap a parameter table, rejecting unknown keys.
    pub fn new(
        strategy: &'a str,
        params: &'a BTreeMap<String, toml::Value>,
        known: &[&str],
    ) -> Result<Self, ConfigError> {
        for key in params.keys() {
            if key != SEED_KEY && !known.contains(&key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "strategies.{strategy}.params: unknown key '{key}' (known: {})",
                    known.join(", ")
                )));
            }
        }
        Ok(Self { strategy, params })
    }

    pub fn f64(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(toml::Value::Float(v)) => Ok(*v),
            Some(toml::Value::Integer(v)) => Ok(*v as f64),
            Some(other) => Err(self.type_error(key, "number", other)),
        }
    }

    pub fn u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(v)) if *v >= 0 => Ok(*v as u64),
            Some(other) => Err(self.type_error(key, "non-negative integer", other)),
        }
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.params.get(key) {
            None => Ok(default),
            Some(toml::Value::Boolean(v)) => Ok(*v),
            Some(other) => Err(self.type_error(key, "boolean", other)),
        }
    }

    pub fn string_list(&self, key: &str, default: &[&str]) -> Result<Vec<String>, ConfigError> {
        match self.params.get(key) {
            None => Ok(default.iter().map(|s| s.to_string()).collect()),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "strategies.{}.params.{key}: expected array of strings",
                            self.strategy
                        ))
                    })
                })
                .collect(),
            Some(other) => Err(self.type_error(key, "array of strings", other)),
        }
    }

    pub fn seed(&self) -> Result<u64, ConfigError> {
        self.u64(SEED_KEY, 0)
    }

    fn type_error(&self, key: &str, expected: &str, got: &toml::Value) -> ConfigError {
        ConfigError::Invalid(format!(
            "strategies.{}.params.{key}: expected {expected}, got {}",
            self.strategy,
            got.type_str()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, toml::Value)]) -> BTreeMap<String, toml::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn unknown_key_fails_at_load() {
        let params = table(&[("min_imbalance", toml::Value::Float(0.5))]);
        assert!(ParamTable::new("book_imbalance", &params, &["min_imbalance"]).is_ok());

        let params = table(&[("min_imblance", toml::Value::Float(0.5))]);
        let err = ParamTable::new("book_imbalance", &params, &["min_imbalance"]).unwrap_err();
        assert!(err.to_string().contains("unknown key"));
    }

    #[test]
    fn numeric_coercion_and_defaults() {
        let params = table(&[("a", toml::Value::Integer(3))]);
        let t = ParamTable::new("s", &params, &["a", "b"]).unwrap();
        assert_eq!(t.f64("a", 0.0).unwrap(), 3.0);
        assert_eq!(t.f64("b", 1.5).unwrap(), 1.5);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let params = table(&[("a", toml::Value::String("x".to_string()))]);
        let t = ParamTable::new("s", &params, &["a"]).unwrap();
        assert!(t.f64("a", 0.0).is_err());
    }

    #[test]
    fn seed_is_always_recognized() {
        let params = table(&[(SEED_KEY, toml::Value::Integer(42))]);
        let t = ParamTable::new("s", &params, &[]).unwrap();
        assert_eq!(t.seed().unwrap(), 42);
    }
}
