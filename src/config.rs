use crate::diagnostics::Severity;
use anyhow::Context;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scanner and filter settings, shared read-only by every message run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSettings {
    pub scanner_path: PathBuf,
    pub scanner_args: String,
    pub reject_threshold: f64,
    pub max_message_size: u64,
    pub skip_received_headers: usize,
    pub log_level: u8,
    pub log_file: Option<PathBuf>,
    pub scan_timeout_secs: u64,
    pub socket_path: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings {
            scanner_path: PathBuf::from("/usr/bin/spamc"),
            scanner_args: String::new(),
            reject_threshold: 10.0,
            max_message_size: 10 * 1024 * 1024,
            skip_received_headers: 0,
            log_level: Severity::Warning.code(),
            log_file: None,
            scan_timeout_secs: 120,
            socket_path: "/var/run/spamc-milter.sock".to_string(),
        }
    }
}

impl ScanSettings {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {path}"))?;
        Self::from_yaml_str(&content).with_context(|| format!("Invalid settings file: {path}"))
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Starts from the defaults and applies every recognised key that holds
    /// a usable value. Missing or invalid values leave the default in place.
    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let mut settings = ScanSettings::default();
        let value: Value = serde_yaml::from_str(content)?;
        match value {
            Value::Null => {}
            Value::Mapping(map) => settings.apply(&map),
            _ => anyhow::bail!("settings document must be a mapping"),
        }
        Ok(settings)
    }

    fn apply(&mut self, map: &Mapping) {
        for (key, value) in map {
            let Some(key) = key.as_str() else {
                log::warn!("Ignoring non-string settings key: {key:?}");
                continue;
            };
            let applied = match key {
                "scanner_path" => non_empty_string(value).map(|v| self.scanner_path = v.into()),
                "scanner_args" => non_empty_string(value).map(|v| self.scanner_args = v),
                "reject_threshold" => number(value)
                    .filter(|v| *v > 0.0)
                    .map(|v| self.reject_threshold = v),
                "max_message_size" => integer(value)
                    .filter(|v| *v > 0)
                    .map(|v| self.max_message_size = v as u64),
                "skip_received_headers" => integer(value)
                    .filter(|v| *v >= 0)
                    .map(|v| self.skip_received_headers = v as usize),
                "log_level" => integer(value)
                    .and_then(Severity::from_code)
                    .map(|v| self.log_level = v.code()),
                "log_file" => non_empty_string(value).map(|v| self.log_file = Some(v.into())),
                "scan_timeout_secs" => integer(value)
                    .filter(|v| *v > 0)
                    .map(|v| self.scan_timeout_secs = v as u64),
                "socket_path" => non_empty_string(value).map(|v| self.socket_path = v),
                _ => {
                    log::debug!("Ignoring unknown settings key: {key}");
                    continue;
                }
            };
            if applied.is_none() {
                log::warn!("Invalid value for '{key}': {value:?}, keeping default");
            }
        }
    }

    pub fn log_severity(&self) -> Severity {
        Severity::from_code(i64::from(self.log_level)).unwrap_or_default()
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn scanner_exists(&self) -> bool {
        Path::new(&self.scanner_path).is_file()
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ScanSettings::default();
        assert_eq!(settings.reject_threshold, 10.0);
        assert_eq!(settings.max_message_size, 10_485_760);
        assert_eq!(settings.skip_received_headers, 0);
        assert_eq!(settings.log_severity(), Severity::Warning);
        assert_eq!(settings.scan_timeout(), Duration::from_secs(120));
        assert!(settings.scanner_args.is_empty());
    }

    #[test]
    fn test_empty_document_keeps_defaults() {
        assert_eq!(ScanSettings::from_yaml_str("").unwrap(), ScanSettings::default());
    }

    #[test]
    fn test_partial_override() {
        let yaml = r#"
scanner_path: /opt/sa/bin/spamc
reject_threshold: 7.5
skip_received_headers: 2
log_level: 4
"#;
        let settings = ScanSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.scanner_path, PathBuf::from("/opt/sa/bin/spamc"));
        assert_eq!(settings.reject_threshold, 7.5);
        assert_eq!(settings.skip_received_headers, 2);
        assert_eq!(settings.log_severity(), Severity::Debug);
        assert_eq!(settings.max_message_size, 10_485_760);
        assert_eq!(settings.socket_path, "/var/run/spamc-milter.sock");
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let yaml = r#"
scanner_path: ""
reject_threshold: "lots"
max_message_size: -5
skip_received_headers: -1
log_level: 9
scan_timeout_secs: 0
scanner_args: [1, 2]
unknown_key: true
"#;
        let settings = ScanSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings, ScanSettings::default());
    }

    #[test]
    fn test_quoted_numbers_accepted() {
        let yaml = "reject_threshold: \"12.25\"\nmax_message_size: \"2048\"\n";
        let settings = ScanSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.reject_threshold, 12.25);
        assert_eq!(settings.max_message_size, 2048);
    }

    #[test]
    fn test_non_mapping_rejected() {
        assert!(ScanSettings::from_yaml_str("- a\n- b\n").is_err());
        assert!(ScanSettings::from_yaml_str("key: [unclosed").is_err());
    }

    #[test]
    fn test_generated_file_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        let path = path.to_str().unwrap();

        let settings = ScanSettings {
            scanner_args: "-x".to_string(),
            log_file: Some(PathBuf::from("/var/log/spamc-milter.log")),
            ..Default::default()
        };
        settings.to_file(path).unwrap();
        assert_eq!(ScanSettings::from_file(path).unwrap(), settings);
    }
}
