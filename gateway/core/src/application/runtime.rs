// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

// Gateway Runtime - wires the core from a validated configuration manifest.
//
// The transport, backend and audit log are supplied by the embedding
// process; everything else is built here from the `spec` sections.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::application::client::GatewayClient;
use crate::application::execution::RequestExecutor;
use crate::application::router::{RouterHandle, RouterSettings, RoutingOrchestrator};
use crate::domain::audit::AuditLog;
use crate::domain::config::GatewayConfigManifest;
use crate::domain::llm::ResponsesBackend;
use crate::domain::transport::Transport;
use crate::infrastructure::classifier::MessageClassifier;
use crate::infrastructure::dedup::DuplicateGuard;
use crate::infrastructure::pending::PendingRequestStore;

pub struct GatewayRuntime {
    router: Arc<RoutingOrchestrator>,
    client: GatewayClient,
    router_handle: RouterHandle,
    cleanup: JoinHandle<()>,
}

impl GatewayRuntime {
    /// Build every component and start consuming. Must run inside a tokio runtime.
    pub fn start(
        config: &GatewayConfigManifest,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn ResponsesBackend>,
        audit: Option<Arc<dyn AuditLog>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let spec = &config.spec;

        let mut executor = RequestExecutor::from_config(backend, spec.backend.clone())?;
        if let Some(audit) = audit {
            executor = executor.with_audit(audit);
        }

        let guard = Arc::new(DuplicateGuard::new(spec.dedup.max_entries, spec.dedup.policy));
        let pending = Arc::new(PendingRequestStore::new());
        let router = Arc::new(RoutingOrchestrator::new(
            Arc::clone(&transport),
            Arc::new(executor),
            MessageClassifier::new(guard),
            Arc::clone(&pending),
            RouterSettings::from_spec(spec),
        ));
        let router_handle = router.start()?;

        let cleanup = pending.spawn_cleanup(spec.correlation.cleanup_interval, spec.correlation.max_pending_age);
        let client = GatewayClient::new(
            transport,
            pending,
            spec.transport.request_topic.clone(),
            spec.correlation.reply_timeout,
        );

        info!(name = %config.metadata.name, "Gateway runtime started");
        Ok(Self {
            router,
            client,
            router_handle,
            cleanup,
        })
    }

    pub fn client(&self) -> &GatewayClient {
        &self.client
    }

    pub fn router(&self) -> &Arc<RoutingOrchestrator> {
        &self.router
    }

    pub async fn shutdown(self) {
        self.router_handle.shutdown().await;
        self.cleanup.abort();
        info!("Gateway runtime stopped");
    }
}
