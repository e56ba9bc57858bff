// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Caller-side request/reply over the transport.
//!
//! [`GatewayClient::request`] registers a pending entry, publishes the
//! request and waits for the router to complete the entry when the reply
//! arrives on the response channel. A timeout is reported as
//! [`ClientError::Timeout`], which is distinct from an error-shaped reply.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::envelope::EnvelopeType;
use crate::domain::gateway::{GatewayRequest, GatewayResponse, RequestError};
use crate::domain::transport::{Transport, TransportError, TransportMessage, MESSAGE_TYPE_HEADER};
use crate::infrastructure::codec::{EnvelopeCodec, EnvelopeError};
use crate::infrastructure::pending::{CorrelationError, PendingRequestStore};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid request: {0}")]
    Invalid(#[from] RequestError),

    #[error("Failed to encode request: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Failed to publish request: {0}")]
    Transport(#[from] TransportError),

    #[error("No reply for session '{session_id}' within {waited:?}")]
    Timeout { session_id: String, waited: Duration },

    #[error(transparent)]
    Correlation(CorrelationError),
}

pub struct GatewayClient {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingRequestStore>,
    codec: EnvelopeCodec,
    request_topic: String,
    reply_timeout: Duration,
}

impl GatewayClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        pending: Arc<PendingRequestStore>,
        request_topic: impl Into<String>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            pending,
            codec: EnvelopeCodec::new(),
            request_topic: request_topic.into(),
            reply_timeout,
        }
    }

    /// Publish `request` and wait for its reply.
    pub async fn request(&self, request: GatewayRequest) -> Result<GatewayResponse, ClientError> {
        request.validate()?;
        let session_id = request.session_id.clone();
        let encoded = self.codec.wrap(&request, EnvelopeType::Request.as_str())?;

        let reply = self.pending.create(session_id.clone());
        let message = TransportMessage::new(&self.request_topic, encoded.into_bytes())
            .with_key(&session_id)
            .with_header(MESSAGE_TYPE_HEADER, EnvelopeType::Request.as_str());

        if let Err(e) = self.transport.publish(message).await {
            self.pending.remove(&session_id);
            return Err(e.into());
        }
        debug!(session_id = %session_id, "Request published, awaiting reply");

        match self.pending.await_reply(reply, self.reply_timeout).await {
            Ok(response) => Ok(response),
            Err(CorrelationError::Timeout { key, waited }) => Err(ClientError::Timeout {
                session_id: key,
                waited,
            }),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Request ended without a reply");
                Err(ClientError::Correlation(e))
            }
        }
    }

    /// Publish a liveness probe on the request channel.
    pub async fn probe(&self) -> Result<(), ClientError> {
        let encoded = self
            .codec
            .wrap(&json!({"source": "startup"}), EnvelopeType::TestProbe.as_str())?;
        let message = TransportMessage::new(&self.request_topic, encoded.into_bytes())
            .with_header(MESSAGE_TYPE_HEADER, EnvelopeType::TestProbe.as_str());
        self.transport.publish(message).await?;
        Ok(())
    }
}
