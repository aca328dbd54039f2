//! Runtime configuration: grouped name/value parameters with stage gating.
//!
//! The document groups (`setup`, `markets`, `curves`, `npv`, `cashflow`,
//! `simulation`, `xva`, `sensitivity`) each hold flat name/value pairs; the
//! `active` key gates whether a pipeline stage runs. Only `setup` is
//! mandatory. The on-disk carrier is JSON with the same group/key layout.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration: {0}")]
    Malformed(String),

    #[error("missing required key {group}/{key}")]
    MissingKey { group: String, key: String },

    #[error("invalid value for {group}/{key}: {message}")]
    InvalidValue {
        group: String,
        key: String,
        message: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Parameters {
    groups: BTreeMap<String, BTreeMap<String, String>>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let payload = std::fs::read_to_string(path)?;
        Self::from_json(&payload)
    }

    pub fn from_json(payload: &str) -> Result<Self, ConfigError> {
        let document: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;
        let object = document
            .as_object()
            .ok_or_else(|| ConfigError::Malformed("top level must be an object".to_string()))?;
        let mut groups = BTreeMap::new();
        for (group, entries) in object {
            let entries_object = entries.as_object().ok_or_else(|| {
                ConfigError::Malformed(format!("group '{group}' must be an object"))
            })?;
            let mut flat = BTreeMap::new();
            for (key, value) in entries_object {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => {
                        if *b {
                            "Y".to_string()
                        } else {
                            "N".to_string()
                        }
                    }
                    other => {
                        return Err(ConfigError::Malformed(format!(
                            "value of {group}/{key} must be scalar, got {other}"
                        )))
                    }
                };
                flat.insert(key.clone(), rendered);
            }
            groups.insert(group.clone(), flat);
        }
        let parameters = Self { groups };
        if !parameters.has_group("setup") {
            return Err(ConfigError::Malformed(
                "mandatory group 'setup' is missing".to_string(),
            ));
        }
        Ok(parameters)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn has(&self, group: &str, key: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|g| g.contains_key(key))
    }

    /// Required key lookup.
    pub fn get(&self, group: &str, key: &str) -> Result<&str, ConfigError> {
        self.groups
            .get(group)
            .and_then(|g| g.get(key))
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingKey {
                group: group.to_string(),
                key: key.to_string(),
            })
    }

    pub fn get_or<'a>(&'a self, group: &str, key: &str, default: &'a str) -> &'a str {
        self.groups
            .get(group)
            .and_then(|g| g.get(key))
            .map(String::as_str)
            .unwrap_or(default)
    }

    /// Whether a stage group exists and has `active = Y`.
    pub fn stage_active(&self, group: &str) -> bool {
        self.has_group(group) && self.get_or(group, "active", "N") == "Y"
    }

    pub fn get_bool(&self, group: &str, key: &str) -> Result<bool, ConfigError> {
        match self.get(group, key)? {
            "Y" | "true" | "True" | "1" => Ok(true),
            "N" | "false" | "False" | "0" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                group: group.to_string(),
                key: key.to_string(),
                message: format!("expected Y/N, got '{other}'"),
            }),
        }
    }

    pub fn get_real(&self, group: &str, key: &str) -> Result<f64, ConfigError> {
        let raw = self.get(group, key)?;
        raw.parse().map_err(|_| ConfigError::InvalidValue {
            group: group.to_string(),
            key: key.to_string(),
            message: format!("expected a number, got '{raw}'"),
        })
    }

    pub fn get_integer(&self, group: &str, key: &str) -> Result<i64, ConfigError> {
        let raw = self.get(group, key)?;
        raw.parse().map_err(|_| ConfigError::InvalidValue {
            group: group.to_string(),
            key: key.to_string(),
            message: format!("expected an integer, got '{raw}'"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "setup": {
            "inputPath": "input",
            "outputPath": "output",
            "logMask": 15,
            "asofDate": "2026-08-01"
        },
        "npv": { "active": "Y", "outputFileName": "npv.csv" },
        "xva": { "active": false, "quantile": 0.95 }
    }"#;

    #[test]
    fn parses_groups_and_scalars() {
        let params = Parameters::from_json(SAMPLE).unwrap();
        assert_eq!(params.get("setup", "inputPath").unwrap(), "input");
        assert_eq!(params.get_integer("setup", "logMask").unwrap(), 15);
        assert!(params.stage_active("npv"));
        assert!(!params.stage_active("xva"));
        assert!((params.get_real("xva", "quantile").unwrap() - 0.95).abs() < 1e-12);
    }

    #[test]
    fn missing_setup_group_is_rejected() {
        let err = Parameters::from_json(r#"{"npv": {"active": "Y"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn missing_key_reports_group_and_key() {
        let params = Parameters::from_json(SAMPLE).unwrap();
        let err = params.get("setup", "portfolioFile").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
        assert!(err.to_string().contains("setup/portfolioFile"));
    }
}
