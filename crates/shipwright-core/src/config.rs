use std::{collections::HashMap, path::Path, time::Duration};

use thiserror::Error;

use crate::types::RegistryAuth;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no slack token is provided (set SHIPWRIGHT_SLACK_TOKEN)")]
    MissingToken,
    #[error("no docker image is provided (set SHIPWRIGHT_DOCKER_IMAGE)")]
    MissingImage,
}

/// Full application configuration, read once at startup.
/// Process env wins over `.env`; unparsable values fall back to defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub slack_token: String,
    pub bot_name: String,
    /// Channel name commands must be issued in. Empty = any group channel
    /// the bot is a member of.
    pub command_channel: String,
    pub enable_dm: bool,
    pub debug: bool,
    pub log_json: bool,
    pub conn_attempts: u32,
    pub poll_interval_ms: u64,

    // Devops image
    pub image: String,
    pub tag: String,
    pub disable_pull: bool,
    pub registry: RegistryAuth,
    /// Catalog path inside the image.
    pub catalog_file: String,
    pub hold_after_ms: u64,
    pub run_timeout_s: u64,
    pub pull_inactivity_s: u64,
}

pub fn parse_dotenv(path: impl AsRef<Path>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get_str(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    vars.get(key).cloned().unwrap_or_else(|| default.to_string())
}

fn get_bool(vars: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match vars.get(key).map(String::as_str) {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_u32(vars: &HashMap<String, String>, key: &str, default: u32) -> u32 {
    vars.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(vars: &HashMap<String, String>, key: &str, default: u64) -> u64 {
    vars.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Split `registry:5000/org/image:tag` into image and tag. The tag defaults
/// to `latest`; a colon before the last `/` belongs to the registry host.
pub fn parse_image(reference: &str) -> (String, String) {
    let reference = reference.trim();
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (reference[..split].to_string(), reference[split + 1..].to_string())
        }
        None => (reference.to_string(), "latest".to_string()),
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut vars = parse_dotenv(".env");
        vars.extend(std::env::vars());
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let (image, tag) = match vars.get("SHIPWRIGHT_DOCKER_IMAGE") {
            Some(r) if !r.trim().is_empty() => parse_image(r),
            _ => (String::new(), String::new()),
        };

        Config {
            slack_token: get_str(vars, "SHIPWRIGHT_SLACK_TOKEN", ""),
            bot_name: get_str(vars, "SHIPWRIGHT_BOT_NAME", "shipwright"),
            command_channel: get_str(vars, "SHIPWRIGHT_COMMAND_CHANNEL", "")
                .trim_start_matches('#')
                .to_string(),
            enable_dm: get_bool(vars, "SHIPWRIGHT_ENABLE_DM", false),
            debug: get_bool(vars, "SHIPWRIGHT_DEBUG", false),
            log_json: get_str(vars, "LOG_FORMAT", "") == "json",
            conn_attempts: get_u32(vars, "SHIPWRIGHT_CONN_ATTEMPTS", 20).max(1),
            poll_interval_ms: get_u64(vars, "SHIPWRIGHT_POLL_INTERVAL_MS", 2000),
            image,
            tag,
            disable_pull: get_bool(vars, "SHIPWRIGHT_DISABLE_PULL", false),
            registry: RegistryAuth {
                username: get_str(vars, "SHIPWRIGHT_REGISTRY_USER", ""),
                password: get_str(vars, "SHIPWRIGHT_REGISTRY_PASSWORD", ""),
                email: get_str(vars, "SHIPWRIGHT_REGISTRY_EMAIL", ""),
                server_address: get_str(vars, "SHIPWRIGHT_REGISTRY_ADDRESS", ""),
            },
            catalog_file: get_str(vars, "SHIPWRIGHT_CATALOG_FILE", "shipwright.yml"),
            hold_after_ms: get_u64(vars, "SHIPWRIGHT_HOLD_AFTER_MS", 3000),
            run_timeout_s: get_u64(vars, "SHIPWRIGHT_RUN_TIMEOUT_S", 1800),
            pull_inactivity_s: get_u64(vars, "SHIPWRIGHT_PULL_INACTIVITY_S", 30),
        }
    }

    /// Reject configurations the bot cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slack_token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.image.is_empty() {
            return Err(ConfigError::MissingImage);
        }
        Ok(())
    }

    pub fn hold_after(&self) -> Duration {
        Duration::from_millis(self.hold_after_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
