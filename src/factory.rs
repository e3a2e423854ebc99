use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::dispatch::{ApiClient, PatchOp, QueryParameters, RequestParams};
use crate::error::ApiError;
use crate::stream::{ObjectSubscription, ResultsSubscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiGroupVersion {
    /// Empty string for the core group.
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ApiGroupVersion {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    pub(crate) fn discovery_path(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }

    pub(crate) fn collection_path(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(namespace) => format!(
                "{}/namespaces/{}/{}",
                self.discovery_path(),
                namespace,
                self.resource
            ),
            None => format!("{}/{}", self.discovery_path(), self.resource),
        }
    }

    pub(crate) fn object_path(&self, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", self.collection_path(namespace), name)
    }
}

pub(crate) fn plural_of(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y')
        && !stem.ends_with(['a', 'e', 'i', 'o', 'u'])
    {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}

pub fn api_factory(client: ApiClient, versions: Vec<ApiGroupVersion>) -> ResourceApi {
    ResourceApi::new(client, versions, false, false)
}

pub fn api_factory_with_namespace(
    client: ApiClient,
    versions: Vec<ApiGroupVersion>,
    include_scale: bool,
) -> ResourceApi {
    ResourceApi::new(client, versions, true, include_scale)
}

/// Versions are probed in order against the cluster's discovery endpoints;
/// the first one the cluster advertises wins and stays won.
pub struct ResourceApi {
    client: ApiClient,
    versions: Vec<ApiGroupVersion>,
    namespaced: bool,
    include_scale: bool,
    resolved: OnceCell<usize>,
}

impl ResourceApi {
    fn new(
        client: ApiClient,
        versions: Vec<ApiGroupVersion>,
        namespaced: bool,
        include_scale: bool,
    ) -> Self {
        Self {
            client,
            versions,
            namespaced,
            include_scale,
            resolved: OnceCell::new(),
        }
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespaced
    }

    async fn resolve(&self) -> Result<&ApiGroupVersion, ApiError> {
        let index = self
            .resolved
            .get_or_try_init(|| async {
                let mut last_error = None;
                for (index, version) in self.versions.iter().enumerate() {
                    match self
                        .client
                        .cluster_request(
                            &version.discovery_path(),
                            &RequestParams::default(),
                            &QueryParameters::default(),
                        )
                        .await
                    {
                        Ok(_) => return Ok(index),
                        Err(error) => {
                            debug!(
                                "cluster does not advertise {}: {error}",
                                version.discovery_path()
                            );
                            last_error = Some(error);
                        }
                    }
                }
                Err(last_error
                    .unwrap_or_else(|| ApiError::new(404, "no api versions supplied")))
            })
            .await?;
        Ok(&self.versions[*index])
    }

    fn check_namespace(&self, namespace: Option<&str>) -> Result<(), ApiError> {
        if namespace.is_some() && !self.namespaced {
            return Err(ApiError::new(400, "resource is not namespaced"));
        }
        Ok(())
    }

    fn require_namespace<'a>(&self, namespace: Option<&'a str>) -> Result<Option<&'a str>, ApiError> {
        self.check_namespace(namespace)?;
        if self.namespaced && namespace.is_none() {
            return Err(ApiError::new(400, "namespace is required for this resource"));
        }
        Ok(namespace)
    }

    /// Continuous list; `None` lists across all namespaces.
    pub async fn list(
        &self,
        namespace: Option<&str>,
        query: &QueryParameters,
    ) -> Result<ResultsSubscription, ApiError> {
        self.check_namespace(namespace)?;
        let version = self.resolve().await?;
        let path = version.collection_path(namespace);
        self.client
            .stream_results(&path, query, self.client.default_stream_args())
            .await
    }

    /// Continuous get: yields the object now and after every change, until
    /// cancelled or deleted.
    pub async fn get(
        &self,
        namespace: Option<&str>,
        name: &str,
        query: &QueryParameters,
    ) -> Result<ObjectSubscription, ApiError> {
        let namespace = self.require_namespace(namespace)?;
        let version = self.resolve().await?;
        let path = version.collection_path(namespace);
        self.client
            .stream_result(&path, name, query, self.client.default_stream_args())
            .await
    }

    pub async fn post(&self, body: &Value) -> Result<Value, ApiError> {
        let version = self.resolve().await?;
        let path = version.collection_path(self.namespace_of(body)?);
        self.client.post(&path, body, &QueryParameters::default()).await
    }

    pub async fn put(&self, body: &Value) -> Result<Value, ApiError> {
        let version = self.resolve().await?;
        let name = body
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::new(400, "object is missing metadata.name"))?;
        let path = version.object_path(self.namespace_of(body)?, name);
        self.client.put(&path, body, &QueryParameters::default()).await
    }

    pub async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        ops: &[PatchOp],
    ) -> Result<Value, ApiError> {
        let namespace = self.require_namespace(namespace)?;
        let version = self.resolve().await?;
        let path = version.object_path(namespace, name);
        self.client.patch(&path, ops, &QueryParameters::default()).await
    }

    pub async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<Value, ApiError> {
        let namespace = self.require_namespace(namespace)?;
        let version = self.resolve().await?;
        let path = version.object_path(namespace, name);
        self.client.remove(&path, &QueryParameters::default()).await
    }

    /// Present only when the factory was built with `include_scale`.
    pub fn scale(&self) -> Option<ScaleApi<'_>> {
        self.include_scale.then_some(ScaleApi { api: self })
    }

    fn namespace_of<'a>(&self, body: &'a Value) -> Result<Option<&'a str>, ApiError> {
        let namespace = body.pointer("/metadata/namespace").and_then(Value::as_str);
        if self.namespaced && namespace.is_none() {
            return Err(ApiError::new(400, "object is missing metadata.namespace"));
        }
        if !self.namespaced && namespace.is_some() {
            return Err(ApiError::new(400, "resource is not namespaced"));
        }
        Ok(namespace)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalePayload {
    pub metadata: Value,
    pub spec: ScaleSpec,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleSpec {
    pub replicas: i32,
}

pub struct ScaleApi<'a> {
    api: &'a ResourceApi,
}

impl ScaleApi<'_> {
    pub async fn get(&self, namespace: Option<&str>, name: &str) -> Result<ScalePayload, ApiError> {
        let namespace = self.api.require_namespace(namespace)?;
        let version = self.api.resolve().await?;
        let path = format!("{}/scale", version.object_path(namespace, name));
        let value = self
            .api
            .client
            .cluster_request(&path, &RequestParams::default(), &QueryParameters::default())
            .await?
            .into_json()?;
        parse_scale(value)
    }

    pub async fn put(&self, payload: &ScalePayload) -> Result<ScalePayload, ApiError> {
        let name = payload
            .metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::new(400, "scale payload is missing metadata.name"))?;
        let namespace = payload.metadata.get("namespace").and_then(Value::as_str);
        let namespace = if self.api.namespaced {
            Some(namespace.ok_or_else(|| {
                ApiError::new(400, "scale payload is missing metadata.namespace")
            })?)
        } else {
            None
        };

        let version = self.api.resolve().await?;
        let path = format!("{}/scale", version.object_path(namespace, name));
        let body = serde_json::to_value(payload)
            .map_err(|error| ApiError::new(500, format!("failed to encode scale payload: {error}")))?;
        let value = self.api.client.put(&path, &body, &QueryParameters::default()).await?;
        parse_scale(value)
    }
}

fn parse_scale(value: Value) -> Result<ScalePayload, ApiError> {
    serde_json::from_value(value)
        .map_err(|error| ApiError::new(500, format!("unexpected scale payload: {error}")))
}
