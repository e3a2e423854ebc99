use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::cluster::{ClusterRequest, ClusterSession, SessionEvent};
use crate::config::GatewayConfig;
use crate::dispatch::ApiClient;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

pub(crate) struct MockBackend {
    pub base_url: String,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn spawn(app: Router) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock backend address");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{addr}"),
            handle,
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) fn client_for(
    backend: &MockBackend,
) -> (ApiClient, ClusterSession, UnboundedReceiver<SessionEvent>) {
    let config = GatewayConfig {
        backend_url: backend.base_url.clone(),
        request_timeout: Duration::from_secs(5),
        ..GatewayConfig::default()
    };
    let (session, expired_rx) = ClusterSession::new();
    session.select(ClusterRequest::new("c1").with_token("secret"));
    let client = ApiClient::new(&config, session.clone()).expect("api client");
    (client, session, expired_rx)
}
