//! Built-in backend registry
//!
//! Hosted backends are described in the embedded `backends.toml`; each entry
//! names the wire dialect its streaming adapter speaks. The local engine is
//! not listed here; it is either loaded or it is not.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireDialect {
    Gemini,
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub dialect: WireDialect,
    pub credential_label: String,
    pub default_model: String,
}

impl BackendDescriptor {
    /// Environment variable the CLI reads the credential from.
    pub fn credential_env(&self) -> String {
        format!("{}_API_KEY", self.id.to_uppercase())
    }
}

/// Runtime readiness of one side (online or local) of the session.
#[derive(Debug, Clone, Default)]
pub struct BackendState {
    pub ready: bool,
    pub last_error: Option<String>,
}

#[derive(Deserialize)]
struct BackendRegistry {
    backends: Vec<BackendDescriptor>,
}

/// Load the backends from the embedded configuration.
pub fn load_backends() -> Vec<BackendDescriptor> {
    const CONFIG_CONTENT: &str = include_str!("../backends.toml");

    let registry: BackendRegistry =
        toml::from_str(CONFIG_CONTENT).expect("Failed to parse backends.toml");

    registry.backends
}

/// Find a backend by ID (case-insensitive).
pub fn find_backend(id: &str) -> Option<BackendDescriptor> {
    load_backends()
        .into_iter()
        .find(|b| b.id.eq_ignore_ascii_case(id))
}
