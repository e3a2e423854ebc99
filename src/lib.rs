mod cluster;
mod config;
mod dispatch;
mod error;
mod factory;
mod repo;
mod sessions;
mod stream;

#[cfg(test)]
mod testutil;

pub use cluster::{ClusterRequest, ClusterSession, SessionEvent};
pub use config::{GatewayConfig, StreamDefaults};
pub use dispatch::{
    ApiClient, PatchOp, Payload, QueryParameters, RequestBody, RequestParams,
};
pub use error::{ApiError, STATUS_NON_HTTP, STATUS_TIMEOUT};
pub use factory::{
    ApiGroupVersion, ResourceApi, ScaleApi, ScalePayload, ScaleSpec, api_factory,
    api_factory_with_namespace,
};
pub use repo::ChartRepository;
pub use sessions::{DrainStatus, PortForwardRequest, PortForwardSession, PortForwardStatus};
pub use stream::{
    BackoffPolicy, ObjectEvent, ObjectSubscription, ResultsEvent, ResultsSubscription,
    StreamArgs, StreamCanceller, StreamNotice, StreamState, StreamSubscription, WatchEvent,
};
