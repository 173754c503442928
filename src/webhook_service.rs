//! For "Bring Your Own Server" (BYOS) integrations.
//!
//! [`WebhookService`] carries the same request handling as
//! [`crate::server::Server`] without owning a listener, so the webhook can be
//! mounted inside any `http`-based framework.
//!
//! # Usage Example (with axum)
//!
//! ```rust,no_run
//! use axum::{routing::any, Router};
//! use whatsapp_leads_rs::{webhook_service::WebhookService, Client, LeadBot};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bot = LeadBot::builder(Client::new("YOUR_WHATSAPP_TOKEN")?).build();
//! let service = WebhookService::<LeadBot>::builder()
//!     .verify_token("my_secret_token")
//!     .build(bot);
//!
//! let app = Router::new().route(
//!     "/webhook",
//!     any(move |req: axum::extract::Request| {
//!         let service = service.clone();
//!         async move { service.handle(req).await }
//!     }),
//! );
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(()) }
//! ```

use std::sync::Arc;

use axum::{
    extract::Query,
    http::{Method, Request, Response, StatusCode},
    response::IntoResponse,
};

use crate::{
    error::Error,
    rest::server::{InnerServer, VerifyQuery, ACK_BODY},
    server::Handler,
};

pub type Body = axum::body::Body;

/// Builder for a [`WebhookService`].
#[derive(Debug, Default, Clone)]
#[must_use]
pub struct WebhookServiceBuilder {
    verify_token: Option<String>,
}

impl WebhookServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`crate::server::ServerBuilder::verify_token`].
    pub fn verify_token(mut self, verify_token: impl Into<String>) -> Self {
        self.verify_token = Some(verify_token.into());
        self
    }

    pub fn build<H: Handler + 'static>(self, handler: H) -> WebhookService<H> {
        WebhookService {
            inner: Arc::new(InnerServer {
                handler,
                verify_token: self.verify_token,
            }),
        }
    }
}

/// Webhook request handling detached from any server.
pub struct WebhookService<H> {
    inner: Arc<InnerServer<H>>,
}

impl<H> Clone for WebhookService<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: Handler + 'static> WebhookService<H> {
    pub fn builder() -> WebhookServiceBuilder {
        WebhookServiceBuilder::new()
    }

    /// Handles one request: `GET` is the subscription handshake, `POST` a
    /// delivery (always acknowledged), anything else `405`.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: Into<Body>,
    {
        let (parts, body) = req.into_parts();
        match parts.method {
            Method::GET => {
                let query = Query::<VerifyQuery>::try_from_uri(&parts.uri)
                    .map(|Query(query)| query)
                    .unwrap_or_default();
                self.inner.verify(&query).into_response()
            }
            Method::POST => {
                match axum::body::to_bytes(body.into(), usize::MAX).await {
                    Ok(bytes) => self.inner.process(&bytes).await,
                    Err(err) => {
                        self.inner
                            .handler
                            .handle_error(Error::MalformedEnvelope(format!(
                                "failed to read body: {err}"
                            )))
                            .await
                    }
                }
                (StatusCode::OK, ACK_BODY).into_response()
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }
}
