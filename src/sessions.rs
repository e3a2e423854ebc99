use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::dispatch::{ApiClient, QueryParameters, RequestParams};
use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardRequest {
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    pub target_port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_namespace: Option<String>,
    /// Local port; `None` lets the backend pick a free one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// `None` lets the backend assign one. A supplied id must be unique
    /// within its cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl PortForwardRequest {
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            pod: pod.into(),
            target_port: target_port.into(),
            service: None,
            service_namespace: None,
            port: None,
            id: None,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self.service_namespace = Some(namespace.into());
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortForwardStatus {
    Running,
    Stopped,
}

/// Stopped sessions stay listed and restartable; deleted ones disappear.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardSession {
    pub id: String,
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_namespace: Option<String>,
    pub target_port: String,
    pub port: String,
    pub status: PortForwardStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStatus {
    InProgress,
    Completed,
    Failed(String),
}

impl DrainStatus {
    fn from_value(value: &Value) -> Result<Self, ApiError> {
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::new(500, "drain status response is missing status"))?;
        match status {
            "in-progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Completed),
            "error" => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("drain failed");
                Ok(Self::Failed(message.to_string()))
            }
            other => Err(ApiError::new(
                500,
                format!("unknown drain status {other:?}"),
            )),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl ApiClient {
    pub async fn start_port_forward(
        &self,
        request: &PortForwardRequest,
    ) -> Result<PortForwardSession, ApiError> {
        let body = serde_json::to_value(request).map_err(|error| {
            ApiError::new(500, format!("failed to encode port-forward request: {error}"))
        })?;
        let params = RequestParams::with_json(Method::POST, body);
        let value = self
            .request("/portforward", &params, true, false, &QueryParameters::default())
            .await?
            .into_json()?;
        serde_json::from_value(value).map_err(|error| {
            ApiError::new(500, format!("unexpected port-forward response: {error}"))
        })
    }

    /// Always a fresh query; the backend owns the session list.
    pub async fn list_port_forwards(
        &self,
        cluster: &str,
    ) -> Result<Vec<PortForwardSession>, ApiError> {
        let url = self.build_url(
            "/portforward/list",
            false,
            &[("cluster".to_string(), cluster.to_string())],
        )?;
        let value = self
            .send(url, &RequestParams::default(), true)
            .await?
            .into_json()?;
        serde_json::from_value(value).map_err(|error| {
            ApiError::new(500, format!("unexpected port-forward list: {error}"))
        })
    }

    /// `stop_or_delete` true stops the session but keeps it restartable;
    /// false deletes it permanently.
    pub async fn stop_or_delete_port_forward(
        &self,
        cluster: &str,
        id: &str,
        stop_or_delete: bool,
    ) -> Result<String, ApiError> {
        let body = json!({
            "cluster": cluster,
            "id": id,
            "stopOrDelete": stop_or_delete,
        });
        let params = RequestParams::with_json(Method::DELETE, body).raw_response();
        self.request("/portforward", &params, true, false, &QueryParameters::default())
            .await?
            .into_raw()
    }

    /// Success means the request was accepted, not that the drain
    /// finished; poll [`drain_node_status`](Self::drain_node_status).
    pub async fn drain_node(&self, cluster: &str, node: &str) -> Result<(), ApiError> {
        let body = json!({"cluster": cluster, "nodeName": node});
        let params = RequestParams::with_json(Method::POST, body);
        self.request("/drain-node", &params, true, false, &QueryParameters::default())
            .await?;
        Ok(())
    }

    pub async fn drain_node_status(
        &self,
        cluster: &str,
        node: &str,
    ) -> Result<DrainStatus, ApiError> {
        let url = self.build_url(
            "/drain-node-status",
            false,
            &[
                ("cluster".to_string(), cluster.to_string()),
                ("nodeName".to_string(), node.to_string()),
            ],
        )?;
        let value = self
            .send(url, &RequestParams::default(), true)
            .await?
            .into_json()?;
        DrainStatus::from_value(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockBackend, client_for};
    use axum::Router;
    use axum::extract::{Json, Query, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ForwardRegistry {
        sessions: Mutex<Vec<Value>>,
    }

    fn port_forward_backend() -> Router {
        let registry = Arc::new(ForwardRegistry::default());

        async fn start(
            State(registry): State<Arc<ForwardRegistry>>,
            Json(mut body): Json<Value>,
        ) -> impl IntoResponse {
            let id = body
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| "pf-1".to_string());
            body["id"] = json!(id);
            if body.get("port").is_none() {
                body["port"] = json!("41000");
            }
            body["status"] = json!("Running");
            registry.sessions.lock().unwrap().push(body.clone());
            Json(body)
        }

        async fn list(
            State(registry): State<Arc<ForwardRegistry>>,
            Query(query): Query<HashMap<String, String>>,
        ) -> impl IntoResponse {
            let cluster = query.get("cluster").cloned().unwrap_or_default();
            let sessions: Vec<Value> = registry
                .sessions
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s["cluster"] == json!(cluster))
                .cloned()
                .collect();
            Json(json!(sessions))
        }

        async fn stop_or_delete(
            State(registry): State<Arc<ForwardRegistry>>,
            Json(body): Json<Value>,
        ) -> axum::response::Response {
            let id = body["id"].as_str().unwrap_or_default().to_string();
            let stop = body["stopOrDelete"].as_bool().unwrap_or(true);
            let mut sessions = registry.sessions.lock().unwrap();
            let Some(position) = sessions.iter().position(|s| s["id"] == json!(id)) else {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({"message": format!("no port forward with id {id}")})),
                )
                    .into_response();
            };
            if stop {
                sessions[position]["status"] = json!("Stopped");
                "stopped".into_response()
            } else {
                sessions.remove(position);
                "deleted".into_response()
            }
        }

        Router::new()
            .route("/portforward", axum::routing::post(start).delete(stop_or_delete))
            .route("/portforward/list", get(list))
            .with_state(registry)
    }

    #[tokio::test]
    async fn start_list_stop_keeps_the_session_visible_as_stopped() {
        let backend = MockBackend::spawn(port_forward_backend()).await;
        let (client, _session, _expired_rx) = client_for(&backend);

        let request = PortForwardRequest::new("c1", "ns", "pod-a", "8080")
            .with_service("svc", "ns");
        let started = client.start_port_forward(&request).await.unwrap();
        assert_eq!(started.id, "pf-1");
        assert_eq!(started.status, PortForwardStatus::Running);
        assert_eq!(started.port, "41000");

        let listed = client.list_port_forwards("c1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, started.id);

        let outcome = client
            .stop_or_delete_port_forward("c1", &started.id, true)
            .await
            .unwrap();
        assert_eq!(outcome, "stopped");

        let listed = client.list_port_forwards("c1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, PortForwardStatus::Stopped);

        let outcome = client
            .stop_or_delete_port_forward("c1", &started.id, false)
            .await
            .unwrap();
        assert_eq!(outcome, "deleted");
        assert!(client.list_port_forwards("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn caller_supplied_id_is_kept_and_unknown_ids_fail() {
        let backend = MockBackend::spawn(port_forward_backend()).await;
        let (client, _session, _expired_rx) = client_for(&backend);

        let request = PortForwardRequest::new("c1", "ns", "pod-a", "8080")
            .with_id("my-forward")
            .with_port("9000");
        let started = client.start_port_forward(&request).await.unwrap();
        assert_eq!(started.id, "my-forward");
        assert_eq!(started.port, "9000");

        let err = client
            .stop_or_delete_port_forward("c1", "no-such-id", true)
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);
        assert!(err.message.contains("no-such-id"));
    }

    fn drain_backend(polls_until_done: usize) -> Router {
        let polls = Arc::new(AtomicUsize::new(0));

        async fn submit(Json(body): Json<Value>) -> axum::response::Response {
            if body["nodeName"] != json!("node-1") {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({"message": "node not found"})),
                )
                    .into_response();
            }
            Json(json!({"message": "success"})).into_response()
        }

        let status = {
            let polls = polls.clone();
            move |Query(query): Query<HashMap<String, String>>| {
                let polls = polls.clone();
                async move {
                    assert_eq!(query.get("nodeName").map(String::as_str), Some("node-1"));
                    if polls.fetch_add(1, Ordering::SeqCst) < polls_until_done {
                        Json(json!({"status": "in-progress"}))
                    } else {
                        Json(json!({"status": "success"}))
                    }
                }
            }
        };

        Router::new()
            .route("/drain-node", axum::routing::post(submit))
            .route("/drain-node-status", get(status))
    }

    #[tokio::test]
    async fn drain_polling_reaches_a_stable_terminal_state() {
        let backend = MockBackend::spawn(drain_backend(2)).await;
        let (client, _session, _expired_rx) = client_for(&backend);

        client.drain_node("c1", "node-1").await.unwrap();

        let mut seen = Vec::new();
        loop {
            let status = client.drain_node_status("c1", "node-1").await.unwrap();
            let done = status.is_terminal();
            seen.push(status);
            if done {
                break;
            }
        }
        assert_eq!(seen.len(), 3);
        assert!(seen[..2].iter().all(|s| *s == DrainStatus::InProgress));
        assert_eq!(seen[2], DrainStatus::Completed);

        assert_eq!(
            client.drain_node_status("c1", "node-1").await.unwrap(),
            DrainStatus::Completed
        );
    }

    #[tokio::test]
    async fn draining_a_missing_node_fails() {
        let backend = MockBackend::spawn(drain_backend(0)).await;
        let (client, _session, _expired_rx) = client_for(&backend);

        let err = client.drain_node("c1", "node-9").await.unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(err.message, "node not found");
    }

    #[test]
    fn drain_status_parsing() {
        assert_eq!(
            DrainStatus::from_value(&json!({"status": "in-progress"})).unwrap(),
            DrainStatus::InProgress
        );
        assert_eq!(
            DrainStatus::from_value(&json!({"status": "error", "message": "pdb violated"}))
                .unwrap(),
            DrainStatus::Failed("pdb violated".to_string())
        );
        assert!(DrainStatus::from_value(&json!({"status": "???"})).is_err());
        assert!(DrainStatus::from_value(&json!({})).is_err());
    }
}
