//! HTTP plumbing behind [`crate::server`] and [`crate::webhook_service`]:
//! axum handlers and the webhook wire format.

pub(crate) mod server;
