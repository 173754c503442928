#![deny(clippy::future_not_send)]
#![deny(clippy::large_enum_variant)]

//! # whatsapp_leads_rs
//!
//! A WhatsApp Cloud API webhook that walks each sender through a short lead
//! intake questionnaire and stores the finished lead as a row in a Lark
//! Bitable table.
//!
//! ## Pieces
//!
//! - [`server`]: the webhook transport. Verifies the subscription handshake,
//!   decodes deliveries into events and always acknowledges them.
//! - [`bot::LeadBot`]: the event handler. Dedups, locks per sender, runs one
//!   [`intake`] transition, replies and persists completed leads.
//! - [`intake`]: the linear state machine and its answer parsing.
//! - [`session`], [`dedup`]: the in-memory state, both kept in an expiring
//!   concurrent map.
//! - [`client::Client`]: outbound text messages through the Graph API.
//! - [`bitable::BitableClient`]: record create / update / search, with a
//!   cached tenant access token.
//! - [`flow_engine`]: optional remote engine that replaces the local flow.
//!
//! ## Example
//!
//! ```rust,no_run
//! use whatsapp_leads_rs::{config::Config, LeadBot, Server};
//!
//! # async fn run() -> Result<(), whatsapp_leads_rs::Error> {
//! let config = Config::from_env()?;
//! let bot = LeadBot::from_config(&config)?;
//!
//! Server::builder()
//!     .endpoint(config.bind_addr)
//!     .route(&config.webhook_path)
//!     .verify_token(&config.verify_token)
//!     .build()
//!     .serve(bot)
//!     .await
//! # }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod bitable;
pub mod bot;
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
mod expiring;
pub mod flow_engine;
pub mod intake;
mod rest;
pub mod server;
pub mod session;
pub mod webhook_service;

pub use bitable::BitableClient;
pub use bot::LeadBot;
pub use client::Client;
pub use error::Error;
pub use intake::IntakeFlow;
pub use server::{Handler as WebhookHandler, Server};

/// An error reported by the Graph API itself.
///
/// # Example (from Meta API response)
/// ```json
/// {
///   "error": {
///     "message": "(#131030) Recipient phone number not in allowed list",
///     "type": "OAuthException",
///     "code": 131030,
///     "fbtrace_id": "A4K...",
///     "error_data": {
///       "messaging_product": "whatsapp",
///       "details": "Recipient phone number not in allowed list"
///     }
///   }
/// }
/// ```
#[derive(thiserror::Error, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[non_exhaustive]
pub struct MetaError {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fbtrace_id: Option<String>,
    #[serde(rename = "href", default, skip_serializing_if = "Option::is_none")]
    pub support: Option<String>,
    #[serde(
        rename = "error_data",
        default,
        skip_serializing_if = "MetaErrorMetadata::is_none"
    )]
    pub error_metadata: MetaErrorMetadata,
}

impl fmt::Display for MetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(code: {})", self.code)?;

        if let Some(title) = &self.title {
            write!(f, " - {title}")?;
        }

        if let Some(r#type) = &self.r#type {
            write!(f, " (type: {type})")?;
        }

        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }

        if let Some(details) = &self.error_metadata.details {
            write!(f, " [{details}]")?;
        }

        if let Some(id) = &self.fbtrace_id {
            write!(f, " (trace: {id})")?;
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
#[non_exhaustive]
pub struct MetaErrorMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl MetaErrorMetadata {
    fn is_none(&self) -> bool {
        self.details.is_none()
    }
}
