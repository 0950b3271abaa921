// Plugin return protocol
//
// A plugin prints exactly one JSON envelope object on stdout; every other
// stdout line is treated as a log line and folded into the envelope's logs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured result a plugin reports on stdout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
}

impl PluginEnvelope {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
            error: None,
            logs: Vec::new(),
            execution_time_ms: None,
        }
    }

    pub fn failure(error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            success: false,
            message: None,
            data: None,
            error: Some(error.into()),
            logs,
            execution_time_ms: None,
        }
    }

    /// Extract the envelope from raw stdout
    ///
    /// The whole output or, failing that, the last line parsing as an object
    /// with a boolean `success` wins; remaining non-empty lines become logs.
    /// Returns None when no envelope is present anywhere.
    pub fn from_stdout(stdout: &str) -> Option<Self> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(envelope) = Self::parse_candidate(trimmed) {
            return Some(envelope);
        }

        let lines: Vec<&str> = trimmed.lines().collect();
        let envelope_idx = lines
            .iter()
            .rposition(|line| Self::parse_candidate(line.trim()).is_some())?;

        let mut envelope = Self::parse_candidate(lines[envelope_idx].trim())?;
        let strays: Vec<String> = lines
            .iter()
            .enumerate()
            .filter(|(i, line)| *i != envelope_idx && !line.trim().is_empty())
            .map(|(_, line)| line.trim().to_string())
            .collect();
        envelope.logs.extend(strays);
        Some(envelope)
    }

    fn parse_candidate(text: &str) -> Option<Self> {
        if !text.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(text).ok()?;
        value.get("success")?.as_bool()?;
        serde_json::from_value(value).ok()
    }

    /// Last portion of raw output, attached to parse-failure errors
    pub fn tail(raw: &str, max_chars: usize) -> String {
        let chars: Vec<char> = raw.chars().collect();
        let start = chars.len().saturating_sub(max_chars);
        chars[start..].iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whole_stdout_as_envelope() {
        let out = r#"{"success": true, "message": "Hi, World!", "executionTimeMs": 12.5}"#;
        let env = PluginEnvelope::from_stdout(out).unwrap();
        assert!(env.success);
        assert_eq!(env.message.as_deref(), Some("Hi, World!"));
        assert_eq!(env.execution_time_ms, Some(12.5));
    }

    #[test]
    fn folds_stray_lines_into_logs() {
        let out = "starting up\n{\"success\": true, \"logs\": [\"declared\"]}\ntrailing noise";
        let env = PluginEnvelope::from_stdout(out).unwrap();
        assert!(env.success);
        assert_eq!(env.logs, vec!["declared", "starting up", "trailing noise"]);
    }

    #[test]
    fn last_envelope_line_wins() {
        let out = "{\"success\": false, \"error\": \"first\"}\n{\"success\": true}";
        let env = PluginEnvelope::from_stdout(out).unwrap();
        assert!(env.success);
    }

    #[test]
    fn json_without_success_field_is_not_an_envelope() {
        assert!(PluginEnvelope::from_stdout("{\"status\": \"ok\"}").is_none());
        assert!(PluginEnvelope::from_stdout("plain text only").is_none());
        assert!(PluginEnvelope::from_stdout("").is_none());
    }

    #[test]
    fn tail_clips_from_the_end() {
        assert_eq!(PluginEnvelope::tail("abcdef", 3), "def");
        assert_eq!(PluginEnvelope::tail("ab", 10), "ab");
    }
}
