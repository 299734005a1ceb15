//! Configuration: webhook endpoints, tenant, timeouts and field aliases

use crate::error::{Error, Result};
use crate::normalize::AliasTable;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Production webhook root (all tenants share it; the tenant rides in `x-org-id`)
pub const DEFAULT_WEBHOOK_BASE: &str = "https://n8n.tenear.com/webhook/welfare";

/// Per-request timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Chat polling cadence
pub const DEFAULT_POLL_SECS: u64 = 10;

/// Tenant header name
pub const ORG_HEADER: &str = "x-org-id";

/// All configurable endpoints and constants
#[derive(Debug, Clone)]
pub struct Config {
    pub webhook_base: String,
    pub org_id: Option<i64>,
    pub request_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub state_dir: PathBuf,
    pub session_file: PathBuf,
    pub aliases: AliasTable,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let state_dir = home.join(".welfare-chat");

        Self {
            webhook_base: DEFAULT_WEBHOOK_BASE.to_string(),
            org_id: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_SECS,
            session_file: state_dir.join("current_user.json"),
            state_dir,
            aliases: AliasTable::default(),
        }
    }
}

impl Config {
    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &std::path::Path) -> Self {
        Self {
            webhook_base: "http://127.0.0.1:9/webhook/welfare".to_string(),
            org_id: Some(1),
            request_timeout_secs: 2,
            poll_interval_secs: 1,
            state_dir: temp_dir.join("state"),
            session_file: temp_dir.join("state/current_user.json"),
            aliases: AliasTable::default(),
        }
    }

    /// Defaults overlaid with `WELFARE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(base) = lookup("WELFARE_WEBHOOK_BASE") {
            config.webhook_base = base.trim_end_matches('/').to_string();
        }
        if let Some(org) = lookup("WELFARE_ORG_ID") {
            config.org_id = Some(parse_number("WELFARE_ORG_ID", &org)?);
        }
        if let Some(secs) = lookup("WELFARE_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_number("WELFARE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("WELFARE_POLL_SECS") {
            config.poll_interval_secs = parse_number("WELFARE_POLL_SECS", &secs)?;
        }
        if let Some(dir) = lookup("WELFARE_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
            config.session_file = config.state_dir.join("current_user.json");
        }
        if let Some(path) = lookup("WELFARE_ALIASES") {
            config.aliases = load_aliases(Path::new(&path))?;
        }

        if config.request_timeout_secs == 0 || config.poll_interval_secs == 0 {
            return Err(Error::Config("timeouts and intervals must be positive".to_string()));
        }

        Ok(config)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::from_base(&self.webhook_base)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Tenant alias table from a JSON file. Fields left out keep their defaults.
fn load_aliases(path: &Path) -> Result<AliasTable> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("WELFARE_ALIASES {}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("WELFARE_ALIASES {}: {}", path.display(), e)))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} is not a number: {:?}", key, value)))
}

/// Chat support webhook URLs
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub send_chat_message: String,
    pub chat_history: String,
    pub all_chat_conversations: String,
    pub admin_chat_conversations: String,
    pub chat_messages: String,
    pub chat_reply: String,
}

impl Endpoints {
    pub fn from_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        let url = |path: &str| format!("{}/{}", base, path);
        Self {
            send_chat_message: url("chat"),
            chat_history: url("chat-history"),
            all_chat_conversations: url("chat-conversations"),
            admin_chat_conversations: url("admin-chat-conversations"),
            chat_messages: url("chat-messages"),
            chat_reply: url("chat-reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.webhook_base, DEFAULT_WEBHOOK_BASE);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert!(config.session_file.starts_with(&config.state_dir));
    }

    #[test]
    fn test_test_config() {
        let temp = std::env::temp_dir();
        let config = Config::for_test(&temp);
        assert!(config.state_dir.starts_with(&temp));
        assert_eq!(config.org_id, Some(1));
    }

    #[test]
    fn test_endpoints() {
        let endpoints = Endpoints::from_base("https://hooks.example.org/webhook/welfare/");
        assert_eq!(
            endpoints.chat_history,
            "https://hooks.example.org/webhook/welfare/chat-history"
        );
        assert_eq!(
            endpoints.admin_chat_conversations,
            "https://hooks.example.org/webhook/welfare/admin-chat-conversations"
        );
        assert_eq!(
            endpoints.send_chat_message,
            "https://hooks.example.org/webhook/welfare/chat"
        );
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("WELFARE_WEBHOOK_BASE", "http://localhost:5678/webhook/welfare/"),
            ("WELFARE_ORG_ID", "3"),
            ("WELFARE_POLL_SECS", "5"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.webhook_base, "http://localhost:5678/webhook/welfare");
        assert_eq!(config.org_id, Some(3));
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.request_timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = Config::from_lookup(|k| (k == "WELFARE_ORG_ID").then(|| "three".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_lookup(|k| (k == "WELFARE_TIMEOUT_SECS").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_aliases_file_overrides_some_fields() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("aliases.json");
        std::fs::write(&path, r#"{"text": ["body", "message"], "user_id": ["member_no"]}"#)
            .unwrap();
        let path = path.display().to_string();

        let config =
            Config::from_lookup(|k| (k == "WELFARE_ALIASES").then(|| path.clone())).unwrap();
        assert_eq!(config.aliases.text, vec!["body", "message"]);
        assert_eq!(config.aliases.user_id, vec!["member_no"]);
        assert_eq!(config.aliases.timestamp, AliasTable::default().timestamp);

        let rec = crate::normalize::normalize(
            &serde_json::json!({"member_no": 12, "body": "Habari"}),
            &config.aliases,
        )
        .unwrap();
        assert_eq!(rec.message.text, "Habari");
    }

    #[test]
    fn test_aliases_file_errors_are_config_errors() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let bad = temp_dir.path().join("aliases.json");
        std::fs::write(&bad, r#"{"text": "body"}"#).unwrap();

        for path in [bad, temp_dir.path().join("missing.json")] {
            let path = path.display().to_string();
            let err = Config::from_lookup(|k| (k == "WELFARE_ALIASES").then(|| path.clone()))
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)));
        }
    }
}
