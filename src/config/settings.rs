// src/config/settings.rs: raw settings source

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;
use serde_json::Value;

use crate::config::defs::PipelineError;

/// Section name -> option name -> value. The orchestrator only relies on this
/// mapping-of-mappings shape; how the mapping was authored is not its concern.
pub type RawSettings = BTreeMap<String, BTreeMap<String, Value>>;

pub const GENERAL_SECTION: &str = "general";
pub const PIPELINE_SECTION: &str = "pipeline";


/// Loads a JSON settings file into `RawSettings`.
///
/// # Arguments
///
/// * `path` - Settings file, usually `<project>/Settings.json`.
///
/// # Returns
/// RawSettings, or an empty mapping if the file does not exist.
pub fn load_settings(path: &Path) -> Result<RawSettings, PipelineError> {
    if !path.exists() {
        debug!("No settings file at {}; using defaults", path.display());
        return Ok(RawSettings::new());
    }
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| {
        PipelineError::config("settings", &path.display().to_string(), e.to_string())
    })
}


/// Typed view over one section of the raw settings.
pub struct Section<'a> {
    name: &'a str,
    values: Option<&'a BTreeMap<String, Value>>,
}

impl<'a> Section<'a> {
    pub fn new(raw: &'a RawSettings, name: &'a str) -> Self {
        Section {
            name,
            values: raw.get(name),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.values
            .and_then(|v| v.get(key))
            .filter(|v| !v.is_null())
    }

    fn error(&self, key: &str, reason: impl Into<String>) -> PipelineError {
        PipelineError::config(self.name, key, reason)
    }

    /// Signed integers are accepted here so that a negative value can be
    /// reported as out of range rather than as a type mismatch.
    pub fn integer(&self, key: &str) -> Result<Option<i64>, PipelineError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| self.error(key, format!("expected an integer, got {}", n))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| self.error(key, format!("expected an integer, got '{}'", s))),
            Some(other) => Err(self.error(key, format!("expected an integer, got {}", other))),
        }
    }

    pub fn float(&self, key: &str) -> Result<Option<f64>, PipelineError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.error(key, format!("expected a number, got {}", n))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| self.error(key, format!("expected a number, got '{}'", s))),
            Some(other) => Err(self.error(key, format!("expected a number, got {}", other))),
        }
    }

    pub fn boolean(&self, key: &str) -> Result<Option<bool>, PipelineError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                _ => Err(self.error(key, format!("expected true or false, got '{}'", s))),
            },
            Some(other) => Err(self.error(key, format!("expected true or false, got {}", other))),
        }
    }

    /// Empty strings count as unset.
    pub fn string(&self, key: &str) -> Result<Option<String>, PipelineError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(other) => Err(self.error(key, format!("expected text, got {}", other))),
        }
    }

    pub fn positive_integer(&self, key: &str, default: u64) -> Result<u64, PipelineError> {
        match self.integer(key)? {
            None => Ok(default),
            Some(v) if v >= 1 => Ok(v as u64),
            Some(v) => Err(self.error(key, format!("must be at least 1, got {}", v))),
        }
    }

    pub fn non_negative_integer(&self, key: &str, default: u64) -> Result<u64, PipelineError> {
        match self.integer(key)? {
            None => Ok(default),
            Some(v) if v >= 0 => Ok(v as u64),
            Some(v) => Err(self.error(key, format!("must not be negative, got {}", v))),
        }
    }

    pub fn required_integer(&self, key: &str) -> Result<u64, PipelineError> {
        match self.integer(key)? {
            None => Err(self.error(key, "required value is missing")),
            Some(v) if v >= 1 => Ok(v as u64),
            Some(v) => Err(self.error(key, format!("must be at least 1, got {}", v))),
        }
    }

    pub fn required_string(&self, key: &str) -> Result<String, PipelineError> {
        self.string(key)?
            .ok_or_else(|| self.error(key, "required value is missing"))
    }

    pub fn invalid(&self, key: &str, reason: impl Into<String>) -> PipelineError {
        self.error(key, reason)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawSettings {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_section_coercions() {
        let settings = raw(json!({
            "general": {"cores_to_use": "4", "compression_level": 6.0, "flag": "yes", "empty": ""}
        }));
        let section = Section::new(&settings, "general");
        assert_eq!(section.integer("cores_to_use").unwrap(), Some(4));
        assert_eq!(section.integer("compression_level").unwrap(), Some(6));
        assert_eq!(section.boolean("flag").unwrap(), Some(true));
        assert_eq!(section.string("empty").unwrap(), None);
        assert_eq!(section.integer("missing").unwrap(), None);
    }

    #[test]
    fn test_section_type_errors_name_the_key() {
        let settings = raw(json!({"general": {"cores_to_use": "many"}}));
        let section = Section::new(&settings, "general");
        let err = section.integer("cores_to_use").unwrap_err();
        assert!(err.to_string().contains("general.cores_to_use"));
    }

    #[test]
    fn test_load_missing_settings_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("Settings.json")).unwrap();
        assert!(settings.is_empty());
    }
}
