use std::fs;
use std::path::PathBuf;

use crate::models::{AppConfig, ProviderKind};

const CONFIG_FILE: &str = "cruise_config.json";

/// Data directory for config, database and logs: `<home>/.cruise`
pub fn get_data_dir() -> Result<PathBuf, String> {
    let data_dir = dirs::home_dir()
        .ok_or_else(|| "cannot resolve home directory".to_string())?
        .join(".cruise");

    if !data_dir.exists() {
        fs::create_dir_all(&data_dir)
            .map_err(|e| format!("failed to create data directory: {}", e))?;
    }

    Ok(data_dir)
}

/// Default database path: `<home>/.cruise/usage.db`
pub fn default_db_path() -> Result<PathBuf, String> {
    Ok(get_data_dir()?.join("usage.db"))
}

/// Load application configuration
pub fn load_app_config() -> Result<AppConfig, String> {
    let data_dir = get_data_dir()?;
    let config_path = data_dir.join(CONFIG_FILE);

    if !config_path.exists() {
        let config = AppConfig::new();
        let _ = save_app_config(&config);
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("failed_to_read_config_file: {}", e))?;

    let config: AppConfig = serde_json::from_str(&content)
        .map_err(|e| format!("failed_to_parse_config_file: {}", e))?;

    Ok(config)
}

/// Save application configuration
pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    let data_dir = get_data_dir()?;
    let config_path = data_dir.join(CONFIG_FILE);

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_config: {}", e))?;

    fs::write(&config_path, content)
        .map_err(|e| format!("failed_to_save_config: {}", e))
}

fn env_flag_enabled(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Overlay environment variables onto a loaded config.
///
/// `ANTHROPIC_API_KEY` keys the primary provider; `OPENROUTER_API_KEY` keys
/// and enables the OpenAI-compatible provider; `OLLAMA_ENABLED` /
/// `OLLAMA_ENDPOINT` control the local-chat provider.
pub fn apply_env_overrides(config: &mut AppConfig) {
    let anthropic_key = std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty());
    let openrouter_key = std::env::var("OPENROUTER_API_KEY").ok().filter(|k| !k.is_empty());
    let ollama_enabled = env_flag_enabled("OLLAMA_ENABLED");
    let ollama_endpoint = std::env::var("OLLAMA_ENDPOINT").ok().filter(|e| !e.is_empty());

    for provider in &mut config.router.providers {
        match provider.kind {
            ProviderKind::Primary => {
                if provider.api_key.is_none() {
                    provider.api_key = anthropic_key.clone();
                }
            }
            ProviderKind::OpenaiCompatible => {
                if let Some(ref key) = openrouter_key {
                    if provider.api_key.is_none() {
                        provider.api_key = Some(key.clone());
                    }
                    provider.enabled = true;
                }
            }
            ProviderKind::LocalChat => {
                if ollama_enabled {
                    provider.enabled = true;
                }
                if let Some(ref endpoint) = ollama_endpoint {
                    provider.endpoint = endpoint.clone();
                }
            }
        }
    }
}
