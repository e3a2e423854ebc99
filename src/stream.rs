use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as WsRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use crate::config::StreamDefaults;
use crate::dispatch::{ApiClient, QueryParameters, RequestParams};
use crate::error::{ApiError, STATUS_NON_HTTP};

#[derive(Debug, Clone)]
pub struct StreamArgs {
    pub reconnect_on_failure: bool,
    /// `None` retries until cancelled. The counter resets after every
    /// successful open.
    pub max_reconnects: Option<u32>,
    pub backoff: BackoffPolicy,
}

impl Default for StreamArgs {
    fn default() -> Self {
        Self {
            reconnect_on_failure: true,
            max_reconnects: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl StreamArgs {
    pub fn one_shot() -> Self {
        Self {
            reconnect_on_failure: false,
            ..Self::default()
        }
    }

    pub(crate) fn from_defaults(defaults: &StreamDefaults) -> Self {
        Self {
            reconnect_on_failure: defaults.reconnect_on_failure,
            max_reconnects: defaults.max_reconnects,
            backoff: BackoffPolicy {
                initial: defaults.initial_backoff,
                max: defaults.max_backoff,
                ..BackoffPolicy::default()
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Self {
        let current = policy.initial;
        Self { policy, current }
    }

    fn reset(&mut self) {
        self.current = self.policy.initial;
    }

    fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.policy.multiplier)
                .min(self.policy.max.as_secs_f64()),
        );
        delay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(StreamState::Connecting as u8)))
    }

    fn set(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn get(&self) -> StreamState {
        match self.0.load(Ordering::SeqCst) {
            0 => StreamState::Connecting,
            1 => StreamState::Open,
            2 => StreamState::Reconnecting,
            _ => StreamState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamNotice {
    Frame(Value),
    ConnectionLost(ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark(Value),
}

impl WatchEvent {
    pub fn from_frame(frame: &Value) -> Option<Self> {
        let kind = frame.get("type")?.as_str()?;
        let object = frame.get("object")?.clone();
        match kind {
            "ADDED" => Some(Self::Added(object)),
            "MODIFIED" => Some(Self::Modified(object)),
            "DELETED" => Some(Self::Deleted(object)),
            "BOOKMARK" => Some(Self::Bookmark(object)),
            _ => None,
        }
    }
}

/// Every snapshot carries the complete current resource set; callers
/// replace their view wholesale rather than merging deltas.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsEvent {
    Snapshot(Vec<Value>),
    Error(ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Object(Value),
    Deleted,
    Error(ApiError),
}

/// The first call closes the subscription; later calls are no-ops. Never
/// calling it leaks the underlying connection.
#[derive(Clone)]
pub struct StreamCanceller {
    cancelled: Arc<AtomicBool>,
    state: SharedState,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl StreamCanceller {
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.state.set(StreamState::Closed);
            let _ = self.cancel_tx.send(true);
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }
}

macro_rules! subscription {
    ($name:ident, $event:ty) => {
        pub struct $name {
            events: mpsc::UnboundedReceiver<$event>,
            canceller: StreamCanceller,
        }

        impl $name {
            pub async fn next(&mut self) -> Option<$event> {
                self.events.recv().await
            }

            pub fn cancel(&self) {
                self.canceller.cancel();
            }

            pub fn canceller(&self) -> StreamCanceller {
                self.canceller.clone()
            }

            pub fn state(&self) -> StreamState {
                self.canceller.state()
            }
        }
    };
}

subscription!(StreamSubscription, StreamNotice);
subscription!(ResultsSubscription, ResultsEvent);
subscription!(ObjectSubscription, ObjectEvent);

impl ApiClient {
    pub fn stream(
        &self,
        path: &str,
        query: &QueryParameters,
        args: StreamArgs,
    ) -> Result<StreamSubscription, ApiError> {
        self.stream_with_pairs(path, query.to_pairs(), args)
    }

    pub(crate) fn stream_with_pairs(
        &self,
        path: &str,
        pairs: Vec<(String, String)>,
        args: StreamArgs,
    ) -> Result<StreamSubscription, ApiError> {
        let url = to_ws_url(self.build_url(path, true, &pairs)?)?;
        let token = self.session.active().and_then(|cluster| cluster.token);

        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = SharedState::new();
        let canceller = StreamCanceller {
            cancelled: Arc::new(AtomicBool::new(false)),
            state: state.clone(),
            cancel_tx: Arc::new(cancel_tx),
        };

        let label = path.to_string();
        tokio::spawn(pump(url, token, args, state, cancel_rx, notices_tx, label));

        Ok(StreamSubscription {
            events: notices_rx,
            canceller,
        })
    }

    /// Seeds from a one-shot list, then keeps the view current from the
    /// watch, emitting a full snapshot after every accepted event.
    pub async fn stream_results(
        &self,
        path: &str,
        query: &QueryParameters,
        args: StreamArgs,
    ) -> Result<ResultsSubscription, ApiError> {
        let list_query = QueryParameters {
            watch: false,
            ..query.clone()
        };
        let list = self
            .cluster_request(path, &RequestParams::default(), &list_query)
            .await?
            .into_json()?;

        let mut view: BTreeMap<String, Value> = BTreeMap::new();
        if let Some(items) = list.get("items").and_then(Value::as_array) {
            for item in items {
                if let Some(key) = object_key(item) {
                    view.insert(key, item.clone());
                }
            }
        }

        let mut pairs = list_query.to_pairs();
        pairs.push(("watch".to_string(), "true".to_string()));
        if let Some(version) = list
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            pairs.push(("resourceVersion".to_string(), version.to_string()));
        }

        let mut inner = self.stream_with_pairs(path, pairs, args)?;
        let canceller = inner.canceller();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(ResultsEvent::Snapshot(view.values().cloned().collect()));

        tokio::spawn(async move {
            while let Some(notice) = inner.next().await {
                match notice {
                    StreamNotice::Frame(frame) => {
                        let Some(event) = WatchEvent::from_frame(&frame) else {
                            debug!("ignoring watch frame of unrecognized shape");
                            continue;
                        };
                        match event {
                            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                                if let Some(key) = object_key(&object) {
                                    view.insert(key, object);
                                }
                            }
                            WatchEvent::Deleted(object) => {
                                if let Some(key) = object_key(&object) {
                                    view.remove(&key);
                                }
                            }
                            WatchEvent::Bookmark(_) => continue,
                        }
                        let snapshot = ResultsEvent::Snapshot(view.values().cloned().collect());
                        if events_tx.send(snapshot).is_err() {
                            break;
                        }
                    }
                    StreamNotice::ConnectionLost(error) => {
                        if events_tx.send(ResultsEvent::Error(error)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(ResultsSubscription {
            events: events_rx,
            canceller,
        })
    }

    /// One-shot get, then a watch filtered to the object's name.
    pub async fn stream_result(
        &self,
        path: &str,
        name: &str,
        query: &QueryParameters,
        args: StreamArgs,
    ) -> Result<ObjectSubscription, ApiError> {
        let object_path = format!("{}/{}", path.trim_end_matches('/'), name);
        let get_query = QueryParameters {
            watch: false,
            field_selector: None,
            ..query.clone()
        };
        let object = self
            .cluster_request(&object_path, &RequestParams::default(), &get_query)
            .await?
            .into_json()?;

        let mut pairs = Vec::new();
        if let Some(selector) = &query.label_selector {
            pairs.push(("labelSelector".to_string(), selector.clone()));
        }
        let name_selector = format!("metadata.name={name}");
        let field_selector = match &query.field_selector {
            Some(selector) => format!("{selector},{name_selector}"),
            None => name_selector,
        };
        pairs.push(("fieldSelector".to_string(), field_selector));
        pairs.push(("watch".to_string(), "true".to_string()));
        if let Some(version) = object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            pairs.push(("resourceVersion".to_string(), version.to_string()));
        }

        let mut inner = self.stream_with_pairs(path, pairs, args)?;
        let canceller = inner.canceller();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(ObjectEvent::Object(object));

        tokio::spawn(async move {
            while let Some(notice) = inner.next().await {
                let event = match notice {
                    StreamNotice::Frame(frame) => match WatchEvent::from_frame(&frame) {
                        Some(WatchEvent::Added(object) | WatchEvent::Modified(object)) => {
                            ObjectEvent::Object(object)
                        }
                        Some(WatchEvent::Deleted(_)) => ObjectEvent::Deleted,
                        Some(WatchEvent::Bookmark(_)) | None => continue,
                    },
                    StreamNotice::ConnectionLost(error) => ObjectEvent::Error(error),
                };
                if events_tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(ObjectSubscription {
            events: events_rx,
            canceller,
        })
    }
}

fn object_key(object: &Value) -> Option<String> {
    let metadata = object.get("metadata")?;
    let name = metadata.get("name").and_then(Value::as_str);
    match name {
        Some(name) => {
            let namespace = metadata
                .get("namespace")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Some(format!("{namespace}/{name}"))
        }
        None => metadata
            .get("uid")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn to_ws_url(mut url: Url) -> Result<Url, ApiError> {
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => {
            return Err(ApiError::new(
                STATUS_NON_HTTP,
                format!("unsupported backend url scheme {other}"),
            ));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ApiError::new(STATUS_NON_HTTP, "unsupported backend url scheme"))?;
    Ok(url)
}

fn client_request(url: &Url, token: Option<&str>) -> Result<WsRequest, ApiError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|error| ApiError::new(STATUS_NON_HTTP, format!("invalid stream url: {error}")))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|error| ApiError::new(STATUS_NON_HTTP, format!("invalid bearer token: {error}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

/// A dropped sender also resolves, so an abandoned subscription tears
/// down instead of pumping forever.
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    if *cancel_rx.borrow() {
        return;
    }
    while cancel_rx.changed().await.is_ok() {
        if *cancel_rx.borrow() {
            return;
        }
    }
}

enum ReadExit {
    Cancelled,
    Lost(ApiError),
}

async fn pump(
    url: Url,
    token: Option<String>,
    args: StreamArgs,
    state: SharedState,
    mut cancel_rx: watch::Receiver<bool>,
    notices: mpsc::UnboundedSender<StreamNotice>,
    label: String,
) {
    let mut backoff = Backoff::new(args.backoff.clone());
    let mut attempts = 0u32;

    loop {
        state.set(StreamState::Connecting);
        let request = match client_request(&url, token.as_deref()) {
            Ok(request) => request,
            Err(error) => {
                let _ = notices.send(StreamNotice::ConnectionLost(error));
                break;
            }
        };

        let connected = tokio::select! {
            _ = cancelled(&mut cancel_rx) => break,
            connected = connect_async(request) => connected,
        };

        match connected {
            Ok((mut socket, _response)) => {
                state.set(StreamState::Open);
                backoff.reset();
                attempts = 0;
                match read_frames(&mut socket, &mut cancel_rx, &notices, &label).await {
                    ReadExit::Cancelled => {
                        let _ = socket.close(None).await;
                        break;
                    }
                    ReadExit::Lost(error) => {
                        warn!("stream {label} lost: {error}");
                        let _ = notices.send(StreamNotice::ConnectionLost(error));
                    }
                }
            }
            Err(error) => {
                let error = ApiError::new(
                    STATUS_NON_HTTP,
                    format!("websocket connect failed: {error}"),
                );
                warn!("stream {label}: {}", error.message);
                let _ = notices.send(StreamNotice::ConnectionLost(error));
            }
        }

        if !args.reconnect_on_failure {
            break;
        }
        attempts += 1;
        if let Some(max) = args.max_reconnects
            && attempts > max
        {
            warn!("stream {label} gave up after {max} reconnect attempts");
            break;
        }

        state.set(StreamState::Reconnecting);
        let delay = backoff.next_delay();
        debug!("stream {label} reconnecting in {delay:?}");
        tokio::select! {
            _ = cancelled(&mut cancel_rx) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state.set(StreamState::Closed);
}

async fn read_frames(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    cancel_rx: &mut watch::Receiver<bool>,
    notices: &mpsc::UnboundedSender<StreamNotice>,
    label: &str,
) -> ReadExit {
    loop {
        let message = tokio::select! {
            _ = cancelled(cancel_rx) => return ReadExit::Cancelled,
            message = socket.next() => message,
        };

        match message {
            Some(Ok(Message::Text(raw))) => forward_frame(notices, raw.as_bytes(), label),
            Some(Ok(Message::Binary(raw))) => forward_frame(notices, &raw, label),
            Some(Ok(Message::Close(_))) | None => {
                return ReadExit::Lost(ApiError::new(
                    STATUS_NON_HTTP,
                    "connection closed by server",
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                return ReadExit::Lost(ApiError::new(
                    STATUS_NON_HTTP,
                    format!("websocket error: {error}"),
                ));
            }
        }
    }
}

fn forward_frame(notices: &mpsc::UnboundedSender<StreamNotice>, raw: &[u8], label: &str) {
    match serde_json::from_slice::<Value>(raw) {
        Ok(frame) => {
            let _ = notices.send(StreamNotice::Frame(frame));
        }
        Err(error) => debug!("dropping malformed frame on {label}: {error}"),
    }
}
