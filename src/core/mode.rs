//! Per-message choice between online and local inference.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceMode {
    Online,
    Local,
}

/// Pick a mode from the connectivity signal and the two readiness flags.
///
/// Online wins when the network looks usable. Otherwise local serves if it
/// can. If online is the only ready backend we still try it even when the
/// connectivity oracle says no: captive portals and stale interface state
/// produce false negatives, and the request itself is the better probe.
pub fn select_mode(
    connectivity_up: bool,
    online_ready: bool,
    local_ready: bool,
) -> Option<InferenceMode> {
    if connectivity_up && online_ready {
        Some(InferenceMode::Online)
    } else if local_ready {
        Some(InferenceMode::Local)
    } else if online_ready {
        Some(InferenceMode::Online)
    } else {
        None
    }
}

/// Answers "is the network usable right now?". Deliberately a coarse oracle;
/// the adapters find out the truth either way.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_usable(&self) -> bool;
}

/// Probe that dials a well-known endpoint with a short timeout.
pub struct TcpDialProbe {
    target: String,
    timeout: Duration,
}

impl TcpDialProbe {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

impl Default for TcpDialProbe {
    fn default() -> Self {
        Self::new("1.1.1.1:443", Duration::from_millis(1500))
    }
}

#[async_trait]
impl ConnectivityProbe for TcpDialProbe {
    async fn is_usable(&self) -> bool {
        matches!(
            tokio::time::timeout(
                self.timeout,
                tokio::net::TcpStream::connect(self.target.as_str()),
            )
            .await,
            Ok(Ok(_))
        )
    }
}
