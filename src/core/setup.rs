//! Readiness initialization for the two sides of a session.
//!
//! Online and local setup are attempted independently; one failing never
//! aborts the other, and the aggregate summary always names which side did
//! what.

use std::path::Path;
use std::sync::Arc;

use crate::core::backends::{find_backend, BackendDescriptor, BackendState};
use crate::local::{EngineConfig, LocalEngine, LocalEngineLoader};

pub struct SetupRequest<'a> {
    pub backend_id: Option<&'a str>,
    pub base_url_override: Option<&'a str>,
    pub credential: &'a str,
    pub model_path: Option<&'a Path>,
    pub max_output_tokens: u32,
}

pub struct SetupOutcome {
    pub backend: Option<BackendDescriptor>,
    pub online: BackendState,
    pub local: BackendState,
    pub engine: Option<Arc<dyn LocalEngine>>,
    pub summary: String,
    pub ready: bool,
}

/// Attempt online setup iff a credential is present and local setup iff a
/// model path is present. Callers must have released any previous engine
/// before calling; this function only acquires.
pub fn initialize(loader: &dyn LocalEngineLoader, request: &SetupRequest<'_>) -> SetupOutcome {
    let online_attempted = !request.credential.is_empty();
    let local_attempted = request.model_path.is_some();

    let mut backend = None;
    let mut online = BackendState::default();
    if online_attempted {
        match resolve_online(request) {
            Ok(descriptor) => {
                tracing::debug!("online backend ready: {}", descriptor.id);
                backend = Some(descriptor);
                online.ready = true;
            }
            Err(message) => online.last_error = Some(message),
        }
    }

    let mut local = BackendState::default();
    let mut engine = None;
    if let Some(path) = request.model_path {
        let config = EngineConfig {
            max_output_tokens: request.max_output_tokens,
        };
        match loader.load(path, &config) {
            Ok(loaded) => {
                tracing::debug!("local engine loaded from {}", path.display());
                engine = Some(loaded);
                local.ready = true;
            }
            Err(e) => local.last_error = Some(e.to_string()),
        }
    }

    let ready = online.ready || local.ready;
    let summary = summarize(
        backend.as_ref(),
        &online,
        &local,
        online_attempted,
        local_attempted,
    );

    SetupOutcome {
        backend,
        online,
        local,
        engine,
        summary,
        ready,
    }
}

fn resolve_online(request: &SetupRequest<'_>) -> Result<BackendDescriptor, String> {
    let Some(id) = request.backend_id else {
        return Err("no online backend selected".to_string());
    };
    let Some(mut descriptor) = find_backend(id) else {
        return Err(format!("unknown backend '{id}'"));
    };
    if let Some(base_url) = request.base_url_override {
        descriptor.base_url = base_url.to_string();
    }
    reqwest::Url::parse(&descriptor.base_url)
        .map_err(|e| format!("invalid base URL '{}': {e}", descriptor.base_url))?;
    Ok(descriptor)
}

fn summarize(
    backend: Option<&BackendDescriptor>,
    online: &BackendState,
    local: &BackendState,
    online_attempted: bool,
    local_attempted: bool,
) -> String {
    let online_name = backend
        .map(|b| b.display_name.as_str())
        .unwrap_or("online backend");
    let unknown = || "unknown error".to_string();

    match (online.ready, local.ready) {
        (true, true) => format!("{online_name} and local model ready"),
        (true, false) if local_attempted => format!(
            "{online_name} ready; local model failed: {}",
            local.last_error.clone().unwrap_or_else(unknown)
        ),
        (true, false) => format!("{online_name} ready"),
        (false, true) if online_attempted => format!(
            "Local model ready; online backend failed: {}",
            online.last_error.clone().unwrap_or_else(unknown)
        ),
        (false, true) => "Local model ready".to_string(),
        (false, false) => {
            if !online_attempted && !local_attempted {
                "Nothing configured: set an API key or provide a local model path".to_string()
            } else {
                let mut parts = Vec::new();
                if online_attempted {
                    parts.push(format!(
                        "online: {}",
                        online.last_error.clone().unwrap_or_else(unknown)
                    ));
                }
                if local_attempted {
                    parts.push(format!(
                        "local model: {}",
                        local.last_error.clone().unwrap_or_else(unknown)
                    ));
                }
                format!("Setup failed: {}", parts.join("; "))
            }
        }
    }
}
