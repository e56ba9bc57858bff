// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Routing Orchestrator
//!
//! Consumes both logical channels and dispatches each inbound message by
//! intent:
//!
//! - **request channel**: normalize, classify (with duplicate suppression),
//!   then either execute a new request, acknowledge a probe, or drop.
//! - **response channel**: normalize, classify as a reply, then complete the
//!   matching pending request. Replies nobody waits for are orphans.
//!
//! A malformed or unexpected message is logged and dropped; nothing here
//! stops the consume loop.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** End-to-end request/response flow over pub/sub

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::execution::RequestExecutor;
use crate::domain::config::{GatewayConfigSpec, ModuleConfig};
use crate::domain::envelope::EnvelopeType;
use crate::domain::gateway::{GatewayRequest, GatewayResponse};
use crate::domain::message::{CanonicalMessage, MessageIntent};
use crate::domain::transport::{Transport, TransportError, TransportMessage, MESSAGE_TYPE_HEADER};
use crate::infrastructure::classifier::{Admission, MessageClassifier};
use crate::infrastructure::codec::EnvelopeCodec;
use crate::infrastructure::normalizer::MessageNormalizer;
use crate::infrastructure::pending::{CorrelationError, PendingRequestStore};

/// Error code on replies to requests that could not be parsed or validated.
pub const INVALID_REQUEST: &str = "invalid_request";

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Backend was called and a reply published.
    Dispatched { session_id: String, success: bool },
    ProbeAcknowledged,
    Duplicate,
    /// Own output or a reply seen on the wrong path.
    LoopSuppressed,
    ModuleDisabled { module: String },
    /// Bad request; an error reply was published when a session was known.
    Rejected { reason: String },
    Unrecognized,
    Undecodable,
    ReplyDelivered { session_id: String },
    OrphanReply { session_id: String },
    PublishFailed { session_id: String },
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub request_topic: String,
    pub response_topic: String,
    pub modules: ModuleConfig,
    pub max_concurrent: usize,
}

impl RouterSettings {
    pub fn from_spec(spec: &GatewayConfigSpec) -> Self {
        Self {
            request_topic: spec.transport.request_topic.clone(),
            response_topic: spec.transport.response_topic.clone(),
            modules: spec.modules.clone(),
            max_concurrent: spec.worker.max_concurrent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Request,
    Response,
}

pub struct RoutingOrchestrator {
    transport: Arc<dyn Transport>,
    executor: Arc<RequestExecutor>,
    classifier: MessageClassifier,
    pending: Arc<PendingRequestStore>,
    normalizer: MessageNormalizer,
    codec: EnvelopeCodec,
    settings: RouterSettings,
}

/// Running consume loop started by [`RoutingOrchestrator::start`].
pub struct RouterHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RouterHandle {
    /// Stop consuming. In-flight handlers finish on their own.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!("Router task ended abnormally: {}", e);
        }
    }
}

impl RoutingOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        executor: Arc<RequestExecutor>,
        classifier: MessageClassifier,
        pending: Arc<PendingRequestStore>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            transport,
            executor,
            classifier,
            pending,
            normalizer: MessageNormalizer::new(),
            codec: EnvelopeCodec::new(),
            settings,
        }
    }

    pub fn pending(&self) -> &Arc<PendingRequestStore> {
        &self.pending
    }

    /// Subscribe to both channels now and consume them on a background task.
    pub fn start(self: &Arc<Self>) -> Result<RouterHandle, TransportError> {
        let inbound = self.subscribe_inbound()?;
        let (tx, rx) = oneshot::channel::<()>();
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            this.consume(inbound, async {
                let _ = rx.await;
            })
            .await;
        });
        Ok(RouterHandle {
            shutdown: Some(tx),
            task,
        })
    }

    /// Consume both channels until `shutdown` resolves or the transport closes.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()> + Send,
    {
        let inbound = self.subscribe_inbound()?;
        self.consume(inbound, shutdown).await;
        Ok(())
    }

    fn subscribe_inbound(&self) -> Result<BoxStream<'static, (Channel, TransportMessage)>, TransportError> {
        let requests = self
            .transport
            .subscribe(&self.settings.request_topic)?
            .map(|m| (Channel::Request, m));
        let responses = self
            .transport
            .subscribe(&self.settings.response_topic)?
            .map(|m| (Channel::Response, m));
        info!(
            request_topic = %self.settings.request_topic,
            response_topic = %self.settings.response_topic,
            "Router subscribed"
        );
        Ok(stream::select(requests, responses).boxed())
    }

    async fn consume<F>(self: Arc<Self>, mut inbound: BoxStream<'static, (Channel, TransportMessage)>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent.max(1)));
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                _ = &mut shutdown => break,
                next = inbound.next() => next,
            };
            let Some((channel, message)) = next else {
                info!("Inbound stream closed");
                break;
            };

            match channel {
                // replies only touch the pending table, so they never wait on a permit
                Channel::Response => {
                    let outcome = self.handle_response_message(&message);
                    debug!(?outcome, "Response channel message handled");
                }
                // the permit is taken inside the task so a saturated worker
                // pool never stalls the consume loop
                Channel::Request => {
                    let this = Arc::clone(&self);
                    let permits = Arc::clone(&permits);
                    tokio::spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        let outcome = this.handle_request_message(&message).await;
                        debug!(?outcome, "Request channel message handled");
                    });
                }
            }
        }
        info!("Router stopped");
    }

    /// Handle one message from the request channel.
    pub async fn handle_request_message(&self, message: &TransportMessage) -> RouteOutcome {
        let header_type = message.message_type().and_then(EnvelopeType::from_tag);
        if header_type.is_some_and(|t| t.is_self_produced()) {
            debug!(key = ?message.key, "Dropping self-produced message by header");
            return RouteOutcome::LoopSuppressed;
        }

        let canonical = match self.normalizer.normalize(message.payload.as_slice()) {
            Ok(canonical) => canonical,
            Err(e) => {
                debug!(key = ?message.key, error = %e, "Dropping undecodable request message");
                return RouteOutcome::Undecodable;
            }
        };

        match self.classifier.admit(&canonical) {
            Admission::Duplicate { .. } => RouteOutcome::Duplicate,
            Admission::Accepted(intent) => match intent {
                MessageIntent::NewRequest => self.dispatch(&canonical).await,
                MessageIntent::TestProbe => {
                    info!(key = ?message.key, "Test probe acknowledged");
                    RouteOutcome::ProbeAcknowledged
                }
                MessageIntent::AlreadyProcessed | MessageIntent::ResponseEnvelope => {
                    debug!(key = ?message.key, "Dropping already processed message");
                    RouteOutcome::LoopSuppressed
                }
                MessageIntent::Unrecognized => {
                    debug!(key = ?message.key, "Dropping unrecognized message");
                    RouteOutcome::Unrecognized
                }
            },
        }
    }

    /// Handle one message from the response channel.
    pub fn handle_response_message(&self, message: &TransportMessage) -> RouteOutcome {
        let canonical = match self.normalizer.normalize(message.payload.as_slice()) {
            Ok(canonical) => canonical,
            Err(e) => {
                debug!(key = ?message.key, error = %e, "Dropping undecodable response message");
                return RouteOutcome::Undecodable;
            }
        };

        match self.classifier.classify_reply(&canonical) {
            MessageIntent::ResponseEnvelope => self.deliver(&canonical),
            MessageIntent::AlreadyProcessed => RouteOutcome::LoopSuppressed,
            MessageIntent::TestProbe => RouteOutcome::ProbeAcknowledged,
            _ => {
                debug!(key = ?message.key, "Dropping unrecognized response message");
                RouteOutcome::Unrecognized
            }
        }
    }

    async fn dispatch(&self, canonical: &CanonicalMessage) -> RouteOutcome {
        let session_id = canonical.session_id().map(str::to_string);

        let request = match parse_request(canonical.body()) {
            Ok(request) => request,
            Err(reason) => {
                warn!(session_id = ?session_id, reason = %reason, "Rejecting invalid request");
                if let Some(session_id) = session_id {
                    let reply = GatewayResponse::failure(&session_id, reason.clone(), Some(INVALID_REQUEST));
                    self.publish_reply(&reply).await;
                }
                return RouteOutcome::Rejected { reason };
            }
        };

        let module = request.module_key();
        if !self.settings.modules.is_enabled(module) {
            info!(session_id = %request.session_id, module, "Module disabled, dropping request");
            return RouteOutcome::ModuleDisabled {
                module: module.to_string(),
            };
        }

        info!(session_id = %request.session_id, module, "Dispatching request");
        let status = json!({
            "session_id": request.session_id,
            "status": "processing",
            "request_id": request.request_id,
        });
        if !self
            .publish(&request.session_id, &status, EnvelopeType::ProcessingStatus)
            .await
        {
            warn!(session_id = %request.session_id, "Processing status not published");
        }

        let reply = self.executor.execute_with_retry(&request).await;
        let success = reply.success;
        if !self.publish_reply(&reply).await {
            return RouteOutcome::PublishFailed {
                session_id: request.session_id,
            };
        }

        RouteOutcome::Dispatched {
            session_id: request.session_id,
            success,
        }
    }

    fn deliver(&self, canonical: &CanonicalMessage) -> RouteOutcome {
        let session_id = canonical.session_id().unwrap_or_default().to_string();

        let delivered = match serde_json::from_value::<GatewayResponse>(Value::Object(canonical.body().clone())) {
            Ok(response) => self.pending.complete(&session_id, response),
            Err(e) => self.pending.fail(
                &session_id,
                CorrelationError::Failed {
                    key: session_id.clone(),
                    reason: format!("Malformed reply: {}", e),
                },
            ),
        };

        if delivered {
            debug!(session_id = %session_id, "Reply delivered to waiting caller");
            RouteOutcome::ReplyDelivered { session_id }
        } else {
            RouteOutcome::OrphanReply { session_id }
        }
    }

    async fn publish_reply(&self, reply: &GatewayResponse) -> bool {
        self.publish(&reply.session_id, reply, EnvelopeType::Response).await
    }

    async fn publish<T: Serialize + ?Sized>(&self, session_id: &str, payload: &T, message_type: EnvelopeType) -> bool {
        let encoded = match self.codec.wrap(payload, message_type.as_str()) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(session_id, error = %e, "Failed to encode {} envelope", message_type);
                return false;
            }
        };

        let message = TransportMessage::new(&self.settings.response_topic, encoded.into_bytes())
            .with_key(session_id)
            .with_header(MESSAGE_TYPE_HEADER, message_type.as_str());

        match self.transport.publish(message).await {
            Ok(()) => true,
            Err(e) => {
                error!(session_id, error = %e, "Failed to publish {} envelope", message_type);
                false
            }
        }
    }
}

fn parse_request(body: &Map<String, Value>) -> Result<GatewayRequest, String> {
    let request: GatewayRequest =
        serde_json::from_value(Value::Object(body.clone())).map_err(|e| format!("Malformed request: {}", e))?;
    request.validate().map_err(|e| e.to_string())?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::{BackendConfig, DedupPolicy};
    use crate::domain::llm::{BackendRequest, BackendResponse, LLMError, OutputBlock, ResponsesBackend, TokenUsage};
    use crate::infrastructure::dedup::DuplicateGuard;
    use crate::infrastructure::transport::InMemoryTransport;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct EchoBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResponsesBackend for EchoBackend {
        async fn create_response(&self, _api_key: &str, request: &BackendRequest) -> Result<BackendResponse, LLMError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prompt = request.input.last().map(|b| b.text.clone()).unwrap_or_default();
            Ok(BackendResponse {
                id: "resp".into(),
                model: request.model.clone(),
                output: vec![OutputBlock::Text { text: format!("echo: {}", prompt) }],
                usage: TokenUsage::default(),
            })
        }
    }

    struct Fixture {
        router: Arc<RoutingOrchestrator>,
        transport: Arc<InMemoryTransport>,
        backend: Arc<EchoBackend>,
    }

    fn fixture(modules: ModuleConfig) -> Fixture {
        let transport = Arc::new(InMemoryTransport::default());
        let backend = Arc::new(EchoBackend { calls: AtomicUsize::new(0) });
        let executor = Arc::new(RequestExecutor::new(backend.clone(), BackendConfig::default(), "k"));
        let classifier = MessageClassifier::new(Arc::new(DuplicateGuard::new(100, DedupPolicy::ClearOnOverflow)));
        let settings = RouterSettings {
            request_topic: "req".into(),
            response_topic: "resp".into(),
            modules,
            max_concurrent: 4,
        };
        let router = Arc::new(RoutingOrchestrator::new(
            transport.clone(),
            executor,
            classifier,
            Arc::new(PendingRequestStore::new()),
            settings,
        ));
        Fixture { router, transport, backend }
    }

    fn enabled_modules() -> ModuleConfig {
        ModuleConfig {
            default_enabled: true,
            enabled: HashMap::from([("quiz".to_string(), false)]),
        }
    }

    fn request_message(body: Value) -> TransportMessage {
        let encoded = EnvelopeCodec::new().wrap(&body, "llm_request").unwrap();
        TransportMessage::new("req", encoded.into_bytes())
    }

    #[tokio::test]
    async fn test_new_request_publishes_status_then_reply() {
        let f = fixture(enabled_modules());
        let message = request_message(json!({"session_id": "chat-42", "prompt": "hi", "options": {}}));

        let outcome = f.router.handle_request_message(&message).await;
        assert_eq!(outcome, RouteOutcome::Dispatched { session_id: "chat-42".into(), success: true });

        let published = f.transport.published_to("resp");
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].message_type(), Some("processing_status"));
        assert_eq!(published[1].message_type(), Some("llm_response"));
        assert_eq!(published[1].key.as_deref(), Some("chat-42"));

        let envelope = EnvelopeCodec::new()
            .unwrap(std::str::from_utf8(&published[1].payload).unwrap())
            .unwrap();
        assert_eq!(envelope.payload()["result"], json!("echo: hi"));
    }

    #[tokio::test]
    async fn test_redelivered_request_is_suppressed() {
        let f = fixture(enabled_modules());
        let message = request_message(json!({"session_id": "chat-7", "prompt": "hi", "options": {}}));

        f.router.handle_request_message(&message).await;
        let again = f.router.handle_request_message(&message).await;
        assert_eq!(again, RouteOutcome::Duplicate);
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_is_acknowledged_without_publishing() {
        let f = fixture(enabled_modules());
        let message = TransportMessage::new("req", br#"{"source":"startup"}"#.to_vec());
        assert_eq!(f.router.handle_request_message(&message).await, RouteOutcome::ProbeAcknowledged);
        assert!(f.transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_self_produced_header_is_dropped() {
        let f = fixture(enabled_modules());
        let message = request_message(json!({"session_id": "s", "prompt": "p", "options": {}}))
            .with_header(MESSAGE_TYPE_HEADER, "llm_response");
        assert_eq!(f.router.handle_request_message(&message).await, RouteOutcome::LoopSuppressed);
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_module_is_dropped() {
        let f = fixture(enabled_modules());
        let message = request_message(json!({"session_id": "s", "prompt": "p", "options": {}, "module": "quiz"}));
        assert_eq!(
            f.router.handle_request_message(&message).await,
            RouteOutcome::ModuleDisabled { module: "quiz".into() }
        );
        assert!(f.transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_gets_error_reply() {
        let f = fixture(enabled_modules());
        let message = request_message(json!({
            "session_id": "s-bad",
            "prompt": "p",
            "options": {},
            "shards": [{"type": " ", "version": 1}]
        }));
        let outcome = f.router.handle_request_message(&message).await;
        assert!(matches!(outcome, RouteOutcome::Rejected { .. }));

        let published = f.transport.published_to("resp");
        assert_eq!(published.len(), 1);
        let envelope = EnvelopeCodec::new()
            .unwrap(std::str::from_utf8(&published[0].payload).unwrap())
            .unwrap();
        assert_eq!(envelope.payload()["error_code"], json!(INVALID_REQUEST));
    }

    #[tokio::test]
    async fn test_garbage_is_undecodable() {
        let f = fixture(enabled_modules());
        let message = TransportMessage::new("req", b"not a message".to_vec());
        assert_eq!(f.router.handle_request_message(&message).await, RouteOutcome::Undecodable);
    }

    #[tokio::test]
    async fn test_response_completes_pending_entry() {
        let f = fixture(enabled_modules());
        let waiting = f.router.pending().create("chat-42");

        let reply = GatewayResponse::success("chat-42", "done");
        let encoded = EnvelopeCodec::new().wrap(&reply, "llm_response").unwrap();
        let message = TransportMessage::new("resp", encoded.into_bytes());

        assert_eq!(
            f.router.handle_response_message(&message),
            RouteOutcome::ReplyDelivered { session_id: "chat-42".into() }
        );
        assert_eq!(waiting.wait().await.unwrap(), reply);

        // redelivery finds nobody waiting
        assert_eq!(
            f.router.handle_response_message(&message),
            RouteOutcome::OrphanReply { session_id: "chat-42".into() }
        );
    }

    /// Never answers until released.
    struct StalledBackend {
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResponsesBackend for StalledBackend {
        async fn create_response(&self, _api_key: &str, request: &BackendRequest) -> Result<BackendResponse, LLMError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(BackendResponse {
                id: "late".into(),
                model: request.model.clone(),
                output: vec![],
                usage: TokenUsage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_saturated_workers_do_not_block_replies_or_shutdown() {
        let transport = Arc::new(InMemoryTransport::default());
        let backend = Arc::new(StalledBackend {
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let executor = Arc::new(RequestExecutor::new(backend.clone(), BackendConfig::default(), "k"));
        let classifier = MessageClassifier::new(Arc::new(DuplicateGuard::new(100, DedupPolicy::ClearOnOverflow)));
        let settings = RouterSettings {
            request_topic: "req".into(),
            response_topic: "resp".into(),
            modules: enabled_modules(),
            max_concurrent: 1,
        };
        let router = Arc::new(RoutingOrchestrator::new(
            transport.clone(),
            executor,
            classifier,
            Arc::new(PendingRequestStore::new()),
            settings,
        ));
        let handle = router.start().unwrap();

        for session in ["busy-1", "busy-2"] {
            transport
                .publish(request_message(json!({"session_id": session, "prompt": "wait", "options": {}})))
                .await
                .unwrap();
        }

        // the only permit is now held by a handler stuck in the backend
        tokio::time::timeout(Duration::from_secs(2), async {
            while backend.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first request reached the backend");

        let waiting = router.pending().create("chat-42");
        let reply = GatewayResponse::success("chat-42", "done");
        let encoded = EnvelopeCodec::new().wrap(&reply, "llm_response").unwrap();
        transport
            .publish(TransportMessage::new("resp", encoded.into_bytes()))
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(2), waiting.wait())
            .await
            .expect("reply delivered while workers are busy");
        assert_eq!(delivered.unwrap(), reply);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(!router.pending().exists("chat-42"));

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown while workers are busy");
    }

    #[tokio::test]
    async fn test_closed_transport_stops_router() {
        let f = fixture(enabled_modules());
        let handle = f.router.start().unwrap();
        f.transport.close();

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("router stops once its streams end");
        assert!(matches!(f.router.start(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_processing_status_on_response_channel_is_ignored() {
        let f = fixture(enabled_modules());
        let _waiting = f.router.pending().create("chat-42");
        let encoded = EnvelopeCodec::new()
            .wrap(&json!({"session_id": "chat-42", "status": "processing"}), "processing_status")
            .unwrap();
        let message = TransportMessage::new("resp", encoded.into_bytes());

        assert_eq!(f.router.handle_response_message(&message), RouteOutcome::LoopSuppressed);
        assert!(f.router.pending().exists("chat-42"));
    }
}
