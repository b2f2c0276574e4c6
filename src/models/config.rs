use serde::{Deserialize, Serialize};

/// Upstream provider schema family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Primary,
    OpenaiCompatible,
    LocalChat,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Primary => write!(f, "primary"),
            ProviderKind::OpenaiCompatible => write!(f, "openai-compatible"),
            ProviderKind::LocalChat => write!(f, "local-chat"),
        }
    }
}

/// Router operating mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RouterMode {
    Manual,
    SemiAuto,
    FullAuto,
}

impl std::fmt::Display for RouterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterMode::Manual => write!(f, "manual"),
            RouterMode::SemiAuto => write!(f, "semi-auto"),
            RouterMode::FullAuto => write!(f, "full-auto"),
        }
    }
}

/// One configured upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    /// API key; resolved from env at startup when absent in the file
    #[serde(default)]
    pub api_key: Option<String>,
    /// Models served by this provider, preferred first
    pub models: Vec<String>,
    pub enabled: bool,
    /// Lower = tried earlier during rate-limit fallback
    pub priority: u32,
}

/// Usage-percent thresholds that drive the routing cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteThresholds {
    pub switch_to_haiku: f64,
    pub switch_to_openrouter: f64,
    pub switch_to_local: f64,
}

impl Default for RouteThresholds {
    fn default() -> Self {
        Self {
            switch_to_haiku: 70.0,
            switch_to_openrouter: 85.0,
            switch_to_local: 95.0,
        }
    }
}

/// Router configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    pub mode: RouterMode,
    pub enabled: bool,
    #[serde(default)]
    pub thresholds: RouteThresholds,
    pub providers: Vec<ProviderEntry>,
}

impl RouterSettings {
    pub fn new() -> Self {
        Self {
            mode: RouterMode::FullAuto,
            enabled: true,
            thresholds: RouteThresholds::default(),
            providers: default_providers(),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in provider table; env vars enable/key the non-primary entries.
pub fn default_providers() -> Vec<ProviderEntry> {
    vec![
        ProviderEntry {
            name: "anthropic".to_string(),
            kind: ProviderKind::Primary,
            endpoint: "https://api.anthropic.com".to_string(),
            api_key: None,
            models: vec![
                "claude-sonnet-4-5".to_string(),
                "claude-haiku-4-5".to_string(),
                "claude-opus-4-1".to_string(),
            ],
            enabled: true,
            priority: 1,
        },
        ProviderEntry {
            name: "openrouter".to_string(),
            kind: ProviderKind::OpenaiCompatible,
            endpoint: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            models: vec![
                "anthropic/claude-sonnet-4.5".to_string(),
                "anthropic/claude-haiku-4.5".to_string(),
            ],
            enabled: false,
            priority: 2,
        },
        ProviderEntry {
            name: "ollama".to_string(),
            kind: ProviderKind::LocalChat,
            endpoint: "http://localhost:11434".to_string(),
            api_key: None,
            models: vec!["llama3.3".to_string(), "qwen2.5".to_string()],
            enabled: false,
            priority: 3,
        },
    ]
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub port: u16,
    /// UsageLog retention horizon for `cleanup`, in days
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub router: RouterSettings,
}

fn default_retention_days() -> i64 {
    30
}

impl AppConfig {
    pub fn new() -> Self {
        Self {
            port: 4141,
            retention_days: 30,
            router: RouterSettings::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}
