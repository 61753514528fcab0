use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.githubcopilot.com";
pub const DEFAULT_PROXY_API_KEY: &str = "changeme_proxy_secret";
pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_TOKEN_COMMAND: &str = "gh auth token";

pub const CREDENTIAL_TTL: Duration = Duration::from_secs(5 * 60);
pub const CREDENTIAL_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
pub const MODELS_TIMEOUT: Duration = Duration::from_secs(30);
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(120);
pub const CHAT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);
pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream wait bounds. Each applies to a single suspension: sending a
/// request and receiving its headers, or one read of the response body.
/// None of them caps the total length of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamTimeouts {
    pub models: Duration,
    pub chat: Duration,
    pub chat_stream: Duration,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            models: MODELS_TIMEOUT,
            chat: CHAT_TIMEOUT,
            chat_stream: CHAT_STREAM_TIMEOUT,
        }
    }
}

/// Optional generation parameters copied from the caller's body into the
/// upstream payload. Anything else the caller sends is dropped.
pub const FORWARDED_CHAT_FIELDS: [&str; 11] = [
    "max_tokens",
    "temperature",
    "top_p",
    "stop",
    "n",
    "presence_penalty",
    "frequency_penalty",
    "logit_bias",
    "user",
    "tools",
    "tool_choice",
];

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModelMapEntry {
    pub logical_model: String,
    pub upstream_model: String,
}

impl ModelMapEntry {
    pub fn new(logical_model: impl Into<String>, upstream_model: impl Into<String>) -> Self {
        Self {
            logical_model: logical_model.into(),
            upstream_model: upstream_model.into(),
        }
    }
}

/// Built-in alias table. Declaration order is the order aliases are listed
/// in `/v1/models`.
pub fn default_model_map() -> Vec<ModelMapEntry> {
    vec![
        ModelMapEntry::new("copilot-opus-45", "claude-opus-4.5"),
        ModelMapEntry::new("copilot-opus-4.5", "claude-opus-4.5"),
        ModelMapEntry::new("copilot-sonnet-4.5", "claude-sonnet-4.5"),
        ModelMapEntry::new("copilot-haiku-4.5", "claude-haiku-4.5"),
        ModelMapEntry::new("claude-opus-4-5", "claude-opus-4.5"),
        ModelMapEntry::new("claude-sonnet-4-5", "claude-sonnet-4.5"),
    ]
}

pub fn parse_model_map(raw: &str) -> Result<Vec<ModelMapEntry>, String> {
    serde_json::from_str(raw).map_err(|err| format!("invalid model map: {err}"))
}

/// Splits a command line such as `gh auth token` into program and arguments.
pub fn parse_command(raw: &str) -> Option<(String, Vec<String>)> {
    let mut parts = raw.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

#[cfg(test)]
mod tests {
    use super::{ModelMapEntry, default_model_map, parse_command, parse_model_map};

    #[test]
    fn model_map_parses_entries_in_order() {
        let map = parse_model_map(
            r#"[{"logical_model":"fast","upstream_model":"gpt-4o-mini"},
                {"logical_model":"smart","upstream_model":"claude-opus-4.5"}]"#,
        )
        .unwrap();
        assert_eq!(
            map,
            vec![
                ModelMapEntry::new("fast", "gpt-4o-mini"),
                ModelMapEntry::new("smart", "claude-opus-4.5"),
            ]
        );
    }

    #[test]
    fn model_map_rejects_unknown_keys() {
        let err = parse_model_map(r#"[{"logical_model":"a","upstream_model":"b","x":1}]"#)
            .unwrap_err();
        assert!(err.starts_with("invalid model map"));
    }

    #[test]
    fn default_map_starts_with_opus_alias() {
        let map = default_model_map();
        assert_eq!(map.len(), 6);
        assert_eq!(map[0], ModelMapEntry::new("copilot-opus-45", "claude-opus-4.5"));
    }

    #[test]
    fn parse_command_splits_program_and_args() {
        let (program, args) = parse_command("  gh auth   token ").unwrap();
        assert_eq!(program, "gh");
        assert_eq!(args, vec!["auth".to_string(), "token".to_string()]);
        assert!(parse_command("   ").is_none());
    }
}
