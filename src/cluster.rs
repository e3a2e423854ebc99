use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Overrides the default `/clusters/{name}` proxy route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_prefix: Option<String>,
}

impl ClusterRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: None,
            route_prefix: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_route_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.route_prefix = Some(prefix.into());
        self
    }

    pub(crate) fn proxy_prefix(&self) -> String {
        self.route_prefix
            .clone()
            .unwrap_or_else(|| format!("/clusters/{}", self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Expired { cluster: String, status: u16 },
}

#[derive(Clone)]
pub struct ClusterSession {
    active: Arc<RwLock<Option<ClusterRequest>>>,
    expired_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ClusterSession {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let session = Self {
            active: Arc::new(RwLock::new(None)),
            expired_tx,
        };
        (session, expired_rx)
    }

    pub fn select(&self, cluster: ClusterRequest) {
        if let Ok(mut guard) = self.active.write() {
            *guard = Some(cluster);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.active.write() {
            *guard = None;
        }
    }

    pub fn active(&self) -> Option<ClusterRequest> {
        self.active.read().ok().and_then(|guard| guard.clone())
    }

    /// Clears the selection and notifies the console. Fire-and-forget.
    pub(crate) fn expire(&self, cluster: &str, status: u16) {
        warn!("session for cluster {cluster} expired with status {status}");
        self.clear();
        let _ = self.expired_tx.send(SessionEvent::Expired {
            cluster: cluster.to_string(),
            status,
        });
    }
}
