//! Webhook server.
//!
//! Receives WhatsApp Cloud API webhooks, turns them into [`Event`]s and hands
//! them to a [`Handler`]. The server owns the transport contract:
//!
//! - `GET {route}` answers Meta's `hub.challenge` handshake.
//! - `POST {route}` always answers `200 EVENT_RECEIVED`, whatever the handler
//!   returns. Handler errors go to [`Handler::handle_error`], which logs them.
//! - `GET /health` answers `200 OK`.
//! - `POST /api/leads` is mounted when [`ServerBuilder::leads_api`] is set.
//!
//! For a more flexible, low-level integration, see [`crate::webhook_service`].
//!
//! # Example
//!
//! ```rust,no_run
//! use whatsapp_leads_rs::{
//!     server::{EventContext, Handler, IncomingMessage, Server},
//!     Error,
//! };
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     async fn handle_message(&self, _ctx: EventContext, msg: IncomingMessage) -> Result<(), Error> {
//!         println!("{} says {:?}", msg.from, msg.text);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Error> {
//! Server::builder()
//!     .endpoint("127.0.0.1:3000".parse().unwrap())
//!     .route("/webhook")
//!     .verify_token("my-verify-token")
//!     .build()
//!     .serve(Echo)
//!     .await
//! # }
//! ```

use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::Router;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::{bitable::BitableClient, error::Error, rest::server::LeadsIngest};

const DEFAULT_ENDPOINT: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3000);
const DEFAULT_ROUTE_PATH: &str = "/webhook";

/// WhatsApp webhook server.
///
/// Create using [`Server::builder()`].
#[derive(Default)]
pub struct Server {
    pub(crate) config: ServerBuilder,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The axum router serving this configuration with `handler`.
    ///
    /// Useful for mounting under a larger application or for driving
    /// requests directly in tests.
    pub fn router<H: Handler + 'static>(&self, handler: H) -> Router {
        crate::rest::server::router(
            &self.config.route_path,
            self.config.verify_token.clone(),
            self.config.leads.clone(),
            handler,
        )
    }

    /// Binds the endpoint and serves until the shutdown signal fires.
    pub async fn serve<H: Handler + 'static>(self, handler: H) -> Result<(), Error> {
        let app = self.router(handler);
        let listener = TcpListener::bind(self.config.endpoint)
            .await
            .map_err(|err| Error::Network(err.into()))?;

        info!(
            endpoint = %self.config.endpoint,
            route = %self.config.route_path,
            "webhook server listening"
        );

        let served = match self.config.shutdown {
            Some(shutdown) => axum::serve(listener, app).with_graceful_shutdown(shutdown).await,
            None => axum::serve(listener, app).await,
        };
        served.map_err(|err| Error::Network(err.into()))
    }
}

/// Builder for a [`Server`].
#[must_use]
pub struct ServerBuilder {
    pub(crate) endpoint: SocketAddr,
    pub(crate) route_path: String,
    pub(crate) shutdown: Option<BoxFuture<'static, ()>>,
    pub(crate) verify_token: Option<String>,
    pub(crate) leads: Option<LeadsIngest>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT,
            route_path: DEFAULT_ROUTE_PATH.to_owned(),
            shutdown: None,
            verify_token: None,
            leads: None,
        }
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address to bind. Defaults to `127.0.0.1:3000`.
    pub fn endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Webhook route. Defaults to `/webhook`.
    pub fn route<P: Into<String>>(mut self, path: P) -> Self {
        self.route_path = path.into();
        self
    }

    /// Future that triggers a graceful shutdown when it resolves.
    pub fn shutdown<F>(mut self, shutdown: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Some(Box::pin(shutdown));
        self
    }

    /// Token expected in `hub.verify_token` during the subscription
    /// handshake. Without it every handshake is rejected with `403`.
    pub fn verify_token(mut self, verify_token: impl Into<String>) -> Self {
        self.verify_token = Some(verify_token.into());
        self
    }

    /// Mounts `POST /api/leads`, guarded by the `x-api-key` header, writing
    /// into `bitable`.
    pub fn leads_api(mut self, api_key: impl Into<String>, bitable: BitableClient) -> Self {
        self.leads = Some(LeadsIngest::new(api_key, bitable));
        self
    }

    pub fn build(self) -> Server {
        Server { config: self }
    }
}

/// A decoded webhook event.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    /// A user sent a message.
    IncomingMessage(IncomingMessage),

    /// Delivery or read status of a message we sent.
    MessageUpdate(MessageUpdate),

    /// A well-formed envelope with nothing we act on.
    Unsupported,
}

/// Metadata shared by every event of one webhook delivery.
#[derive(Clone, Debug)]
pub struct EventContext {
    pub(crate) phone_number_id: Option<String>,
    pub(crate) payload: Arc<Value>,
}

impl EventContext {
    /// The business phone number the event was addressed to
    /// (`metadata.phone_number_id`).
    pub fn phone_number_id(&self) -> Option<&str> {
        self.phone_number_id.as_deref()
    }

    /// The raw delivery body, as received.
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// A message sent by a user.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct IncomingMessage {
    /// `wamid.` identifier, unique per message.
    pub id: String,
    /// The sender's WhatsApp id.
    pub from: String,
    /// Message type as reported by Meta (`text`, `interactive`, ...).
    pub kind: String,
    /// The user-visible text: the body of a text message, or the title of a
    /// tapped button or list row.
    pub text: Option<String>,
    /// Profile name from the envelope's `contacts`, when present.
    pub profile_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Status update for a previously sent message.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct MessageUpdate {
    pub message_id: String,
    /// `sent`, `delivered`, `read` or `failed`.
    pub status: String,
    pub recipient_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageUpdate {
    pub fn failed(&self) -> bool {
        self.status == "failed"
    }
}

/// Event handler.
///
/// Every method has a default, so implement only what you need. Errors
/// returned from a handler never reach Meta; they are passed to
/// [`Handler::handle_error`].
pub trait Handler: Send + Sync {
    /// Entry point for every event. Routes by type by default.
    fn handle(
        &self,
        ctx: EventContext,
        event: Event,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            match event {
                Event::IncomingMessage(msg) => self.handle_message(ctx, msg).await,
                Event::MessageUpdate(update) => self.handle_message_update(ctx, update).await,
                Event::Unsupported => Ok(()),
            }
        }
    }

    fn handle_message(
        &self,
        _ctx: EventContext,
        _msg: IncomingMessage,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }

    fn handle_message_update(
        &self,
        _ctx: EventContext,
        _update: MessageUpdate,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }

    /// Receives every error from event handling and envelope decoding.
    fn handle_error(&self, error: Error) -> impl Future<Output = ()> + Send {
        async move {
            match error.service() {
                Some(service) => error!(
                    status = %service.status(),
                    endpoint = service.endpoint(),
                    error = %error,
                    "webhook processing failed"
                ),
                None => error!(error = %error, "webhook processing failed"),
            }
        }
    }
}

impl<H: Handler> Handler for Arc<H> {
    fn handle(
        &self,
        ctx: EventContext,
        event: Event,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).handle(ctx, event)
    }

    fn handle_error(&self, error: Error) -> impl Future<Output = ()> + Send {
        (**self).handle_error(error)
    }
}
