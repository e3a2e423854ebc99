use anyhow::{Context, Result};
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::cluster::ClusterSession;
use crate::config::GatewayConfig;
use crate::error::{ApiError, STATUS_NON_HTTP};
use crate::factory::{ApiGroupVersion, plural_of};
use crate::stream::StreamArgs;

#[derive(Debug, Clone)]
pub struct RequestParams {
    pub method: Method,
    pub body: Option<RequestBody>,
    pub timeout: Option<Duration>,
    pub is_json: bool,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Raw(String),
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            timeout: None,
            is_json: true,
            headers: HeaderMap::new(),
        }
    }
}

impl RequestParams {
    pub fn with_method(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn with_json(method: Method, body: Value) -> Self {
        Self {
            method,
            body: Some(RequestBody::Json(body)),
            ..Self::default()
        }
    }

    pub fn raw_response(mut self) -> Self {
        self.is_json = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParameters {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub watch: bool,
}

impl QueryParameters {
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn with_field_selector(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    pub fn watching(mut self) -> Self {
        self.watch = true;
        self
    }

    pub(crate) fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(selector) = &self.label_selector {
            pairs.push(("labelSelector".to_string(), selector.clone()));
        }
        if let Some(selector) = &self.field_selector {
            pairs.push(("fieldSelector".to_string(), selector.clone()));
        }
        if self.watch {
            pairs.push(("watch".to_string(), "true".to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOp {
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: "replace".to_string(),
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: "remove".to_string(),
            path: path.into(),
            value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Raw(String),
}

impl Payload {
    pub fn into_json(self) -> Result<Value, ApiError> {
        match self {
            Payload::Json(value) => Ok(value),
            Payload::Raw(_) => Err(ApiError::new(500, "expected a JSON response body")),
        }
    }

    pub fn into_raw(self) -> Result<String, ApiError> {
        match self {
            Payload::Raw(text) => Ok(text),
            Payload::Json(_) => Err(ApiError::new(500, "expected a raw response body")),
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    pub(crate) session: ClusterSession,
    default_timeout: Duration,
    pub(crate) stream_defaults: StreamArgs,
}

impl ApiClient {
    pub fn new(config: &GatewayConfig, session: ClusterSession) -> Result<Self> {
        let base_url = Url::parse(&config.backend_url)
            .with_context(|| format!("invalid backend url {}", config.backend_url))?;
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            http,
            base_url,
            session,
            default_timeout: config.request_timeout,
            stream_defaults: StreamArgs::from_defaults(&config.stream),
        })
    }

    pub fn session(&self) -> &ClusterSession {
        &self.session
    }

    pub fn default_stream_args(&self) -> StreamArgs {
        self.stream_defaults.clone()
    }

    /// `use_cluster` prefixes the active cluster's proxy route;
    /// `auto_logout_on_auth_error` arms the session-expiry side effect for
    /// 401/403 responses.
    pub async fn request(
        &self,
        path: &str,
        params: &RequestParams,
        auto_logout_on_auth_error: bool,
        use_cluster: bool,
        query: &QueryParameters,
    ) -> Result<Payload, ApiError> {
        let url = self.build_url(path, use_cluster, &query.to_pairs())?;
        self.send(url, params, auto_logout_on_auth_error).await
    }

    pub(crate) async fn send(
        &self,
        url: Url,
        params: &RequestParams,
        auto_logout_on_auth_error: bool,
    ) -> Result<Payload, ApiError> {
        let cluster = self.session.active();

        let mut builder = self
            .http
            .request(params.method.clone(), url)
            .timeout(params.timeout.unwrap_or(self.default_timeout));

        if let Some(token) = cluster.as_ref().and_then(|c| c.token.as_deref()) {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                builder = builder.header(AUTHORIZATION, value);
            }
        }

        match &params.body {
            Some(RequestBody::Json(value)) => {
                builder = builder
                    .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                    .body(value.to_string());
            }
            Some(RequestBody::Raw(text)) => {
                builder = builder.body(text.clone());
            }
            None => {}
        }
        if !params.headers.is_empty() {
            builder = builder.headers(params.headers.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|error| ApiError::from_transport(&error))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let error = ApiError::from_response(status.as_u16(), &body);
            if error.is_auth_error() && auto_logout_on_auth_error {
                let name = cluster.map(|c| c.name).unwrap_or_default();
                self.session.expire(&name, error.status);
            }
            return Err(error);
        }

        if params.is_json {
            let bytes = response
                .bytes()
                .await
                .map_err(|error| ApiError::from_transport(&error))?;
            if bytes.is_empty() {
                return Ok(Payload::Json(Value::Null));
            }
            serde_json::from_slice(&bytes)
                .map(Payload::Json)
                .map_err(|error| {
                    ApiError::new(500, format!("failed to parse response body as JSON: {error}"))
                })
        } else {
            response
                .text()
                .await
                .map(Payload::Raw)
                .map_err(|error| ApiError::from_transport(&error))
        }
    }

    pub async fn cluster_request(
        &self,
        path: &str,
        params: &RequestParams,
        query: &QueryParameters,
    ) -> Result<Payload, ApiError> {
        self.request(path, params, true, true, query).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        query: &QueryParameters,
    ) -> Result<Value, ApiError> {
        let params = RequestParams::with_json(Method::POST, body.clone());
        self.cluster_request(path, &params, query).await?.into_json()
    }

    pub async fn put(
        &self,
        path: &str,
        body: &Value,
        query: &QueryParameters,
    ) -> Result<Value, ApiError> {
        let params = RequestParams::with_json(Method::PUT, body.clone());
        self.cluster_request(path, &params, query).await?.into_json()
    }

    pub async fn patch(
        &self,
        path: &str,
        ops: &[PatchOp],
        query: &QueryParameters,
    ) -> Result<Value, ApiError> {
        let body = serde_json::to_string(ops)
            .map_err(|error| ApiError::new(STATUS_NON_HTTP, format!("failed to encode patch: {error}")))?;
        let mut params = RequestParams::with_method(Method::PATCH);
        params.body = Some(RequestBody::Raw(body));
        params.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json-patch+json"),
        );
        self.cluster_request(path, &params, query).await?.into_json()
    }

    pub async fn remove(&self, path: &str, query: &QueryParameters) -> Result<Value, ApiError> {
        let params = RequestParams::with_method(Method::DELETE);
        self.cluster_request(path, &params, query).await?.into_json()
    }

    /// Creates the object, or replaces the existing one when the create
    /// conflicts.
    pub async fn apply(&self, body: &Value) -> Result<Value, ApiError> {
        let target = ApplyTarget::from_object(body)?;
        match self
            .post(&target.collection_path(), body, &QueryParameters::default())
            .await
        {
            Err(error) if error.status == 409 => {
                self.put(&target.object_path()?, body, &QueryParameters::default())
                    .await
            }
            result => result,
        }
    }

    pub(crate) fn build_url(
        &self,
        path: &str,
        use_cluster: bool,
        pairs: &[(String, String)],
    ) -> Result<Url, ApiError> {
        let prefix = if use_cluster {
            let Some(cluster) = self.session.active() else {
                return Err(ApiError::new(STATUS_NON_HTTP, "no cluster selected"));
            };
            cluster.proxy_prefix()
        } else {
            String::new()
        };

        let base = self.base_url.as_str().trim_end_matches('/');
        let separator = if path.starts_with('/') { "" } else { "/" };
        let mut url = Url::parse(&format!("{base}{prefix}{separator}{path}"))
            .map_err(|error| ApiError::new(STATUS_NON_HTTP, format!("invalid request url: {error}")))?;
        if !pairs.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(url)
    }
}

struct ApplyTarget {
    group_version: ApiGroupVersion,
    namespace: Option<String>,
    name: Option<String>,
}

impl ApplyTarget {
    fn from_object(body: &Value) -> Result<Self, ApiError> {
        let api_version = body
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::new(400, "object is missing apiVersion"))?;
        let kind = body
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::new(400, "object is missing kind"))?;

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };

        let metadata = body.get("metadata");
        let field = |key: &str| {
            metadata
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Ok(Self {
            group_version: ApiGroupVersion::new(group, version, plural_of(kind)),
            namespace: field("namespace"),
            name: field("name"),
        })
    }

    fn collection_path(&self) -> String {
        self.group_version.collection_path(self.namespace.as_deref())
    }

    fn object_path(&self) -> Result<String, ApiError> {
        let name = self
            .name
            .as_deref()
            .ok_or_else(|| ApiError::new(400, "object is missing metadata.name"))?;
        Ok(self.group_version.object_path(self.namespace.as_deref(), name))
    }
}
