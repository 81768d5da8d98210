//! axum middleware publishing an enrichment event after each qualifying
//! write. The wrapped handler's response is always returned untouched.

use crate::config::{ConfigError, MiddlewareConfig};
use crate::filter::{Decision, EventFilter, WriteRequest};
use crate::topology::Topology;
use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    Router,
};
use insight_pipeline::{EnrichmentEvent, EventPublisher};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Shared state of the producer middleware
#[derive(Clone)]
pub struct EnrichmentState {
    pub filter: Arc<EventFilter>,
    pub publisher: Arc<dyn EventPublisher>,
}

impl EnrichmentState {
    pub fn new(filter: Arc<EventFilter>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { filter, publisher }
    }

    /// Load the topology described by `config` and build the gate chain
    pub fn from_config(
        config: &MiddlewareConfig,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let topology = Arc::new(Topology::load(config)?);
        let filter = EventFilter::new(
            topology,
            config.image_types.iter().cloned(),
            config.opt_in_header_name()?,
        );
        info!(
            devices = %config.devices.display(),
            image_types = ?config.image_types,
            "Enrichment middleware configured"
        );
        Ok(Self::new(Arc::new(filter), publisher))
    }

    /// Gate a completed write and, if it qualifies, publish on a detached
    /// task. Returns the spawned task so callers may wait on it.
    pub fn dispatch(&self, request: &WriteRequest) -> Option<tokio::task::JoinHandle<()>> {
        match self.filter.evaluate(request) {
            Decision::Publish(event) => {
                if event.timestamp.is_epoch() {
                    warn!(path = %event.path, "Write carries no timestamp, event will be skipped downstream");
                }
                let publisher = self.publisher.clone();
                Some(tokio::spawn(async move {
                    publish_event(publisher.as_ref(), &event).await;
                }))
            }
            Decision::Skip(reason) => {
                debug!(
                    account = %request.account,
                    container = %request.container,
                    object = %request.object,
                    reason = %reason,
                    "Write not enriched"
                );
                counter!("insights.producer.skipped", "reason" => reason.as_label()).increment(1);
                None
            }
        }
    }
}

/// Publish one event; failures are logged and swallowed
#[instrument(skip(publisher, event), fields(path = %event.path, timestamp = %event.timestamp))]
pub async fn publish_event(publisher: &dyn EventPublisher, event: &EnrichmentEvent) {
    match publisher.publish(event).await {
        Ok(()) => {
            info!("Enrichment event published");
            counter!("insights.producer.published").increment(1);
        }
        Err(e) => {
            warn!(error = %e, "Failed to publish enrichment event");
            counter!("insights.producer.failed").increment(1);
        }
    }
}

/// Middleware function for `axum::middleware::from_fn_with_state`
pub async fn enrich_on_write(
    State(state): State<EnrichmentState>,
    request: Request,
    next: Next,
) -> Response {
    let write = WriteRequest::from_path(
        request.method().clone(),
        request.headers().clone(),
        request.uri().path(),
    );

    let response = next.run(request).await;

    if response.status().is_success() {
        if let Some(write) = write {
            state.dispatch(&write);
        }
    }
    response
}

/// Wrap a storage router so that every successful write is considered
/// for enrichment
pub fn with_enrichment<S>(router: Router<S>, state: EnrichmentState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(state, enrich_on_write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::tests::filter;
    use async_trait::async_trait;
    use axum::{body::Body, http::StatusCode, routing::put};
    use insight_pipeline::{EventSubscription, MemoryChannel, PublishError};
    use std::io::Write;
    use std::time::Duration;
    use tower::ServiceExt;

    struct FailingPublisher;

    #[async_trait]
    impl EventPublisher for FailingPublisher {
        async fn publish(&self, _event: &EnrichmentEvent) -> Result<(), PublishError> {
            Err(PublishError::Connect("broker down".to_string()))
        }
    }

    fn storage_router(status: StatusCode) -> Router {
        Router::new().route(
            "/v1/:account/:container/*object",
            put(move || async move { (status, "stored") }),
        )
    }

    fn app(publisher: Arc<dyn EventPublisher>, status: StatusCode) -> Router {
        with_enrichment(
            storage_router(status),
            EnrichmentState::new(Arc::new(filter()), publisher),
        )
    }

    fn app_with_state(state: EnrichmentState) -> Router {
        with_enrichment(storage_router(StatusCode::CREATED), state)
    }

    fn write(uri: &str, opt_in: bool) -> Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("PUT")
            .uri(uri)
            .header("x-storage-policy", "sof")
            .header("x-timestamp", "1463745600.00000");
        if opt_in {
            builder = builder.header("x-visual-insights-enable", "yes");
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn wait_for_pending(channel: &MemoryChannel, expected: usize) -> usize {
        for _ in 0..50 {
            if channel.pending().await >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        channel.pending().await
    }

    #[tokio::test]
    async fn test_qualifying_write_publishes_event() {
        let channel = Arc::new(MemoryChannel::new("enrichment"));
        let response = app(channel.clone(), StatusCode::CREATED)
            .oneshot(write("/v1/AUTH_test/photos/cat.jpg", true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(wait_for_pending(&channel, 1).await, 1);

        let delivery = channel.next_delivery().await.unwrap();
        let event = delivery.event().unwrap();
        assert_eq!(event.path, "/srv/node/gpfs0/AUTH_test/photos/cat.jpg");
        assert_eq!(event.timestamp.normal(), "1463745600.00000");
    }

    #[tokio::test]
    async fn test_no_opt_in_publishes_nothing() {
        let channel = Arc::new(MemoryChannel::new("enrichment"));
        let response = app(channel.clone(), StatusCode::CREATED)
            .oneshot(write("/v1/AUTH_test/photos/cat.jpg", false))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.pending().await, 0);
    }

    #[tokio::test]
    async fn test_text_object_publishes_nothing() {
        let channel = Arc::new(MemoryChannel::new("enrichment"));
        app(channel.clone(), StatusCode::CREATED)
            .oneshot(write("/v1/AUTH_test/photos/notes.txt", true))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.pending().await, 0);
    }

    #[tokio::test]
    async fn test_failed_write_publishes_nothing() {
        let channel = Arc::new(MemoryChannel::new("enrichment"));
        let response = app(channel.clone(), StatusCode::INTERNAL_SERVER_ERROR)
            .oneshot(write("/v1/AUTH_test/photos/cat.jpg", true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.pending().await, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_response_unchanged() {
        let response = app(Arc::new(FailingPublisher), StatusCode::CREATED)
            .oneshot(write("/v1/AUTH_test/photos/cat.jpg", true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"stored");
    }

    #[tokio::test]
    async fn test_dispatch_runs_detached_publish() {
        let channel = Arc::new(MemoryChannel::new("enrichment"));
        let state = EnrichmentState::new(Arc::new(filter()), channel.clone());

        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-visual-insights-enable", "1".parse().unwrap());
        headers.insert("x-storage-policy", "sof".parse().unwrap());
        let request = WriteRequest::new(axum::http::Method::PUT, headers, "AUTH_a", "c", "d.png");

        let handle = state.dispatch(&request).expect("publish task");
        handle.await.unwrap();
        assert_eq!(channel.pending().await, 1);
    }

    #[tokio::test]
    async fn test_state_from_config_files() {
        let swift_dir = tempfile::tempdir().unwrap();
        let mut policies =
            std::fs::File::create(swift_dir.path().join("spectrum-scale-object-policies.conf")).unwrap();
        writeln!(
            policies,
            "[storage-policy:0]\nname = gold\ndefault = yes\n\n\
             [storage-policy:1]\nname = sof\nfunctions = file-and-object-access\n"
        )
        .unwrap();
        std::fs::write(
            swift_dir.path().join("object-1.ring.json"),
            r#"{"part_power": 0, "devs": [{"id": 0, "device": "gpfs0"}], "replica2part2dev_id": [[0]]}"#,
        )
        .unwrap();

        let mut config = MiddlewareConfig::new("/gpfs/fs1");
        config.swift_dir = swift_dir.path().to_path_buf();
        config.hash_path_suffix = "changeme".to_string();

        let channel = Arc::new(MemoryChannel::new("enrichment"));
        let state = EnrichmentState::from_config(&config, channel.clone()).unwrap();
        app_with_state(state)
            .oneshot(write("/v1/AUTH_test/photos/cat.jpeg", true))
            .await
            .unwrap();

        assert_eq!(wait_for_pending(&channel, 1).await, 1);
        let event = channel.next_delivery().await.unwrap().event().unwrap();
        assert_eq!(event.path, "/gpfs/fs1/gpfs0/AUTH_test/photos/cat.jpeg");
    }

    #[test]
    fn test_missing_policy_file_is_fatal() {
        let mut config = MiddlewareConfig::new("/gpfs/fs1");
        config.swift_dir = std::path::PathBuf::from("/nonexistent");
        config.hash_path_suffix = "changeme".to_string();

        let result = EnrichmentState::from_config(&config, Arc::new(FailingPublisher));
        assert!(matches!(result, Err(ConfigError::Policy(_))));
    }
}
