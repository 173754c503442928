//! Error Handling
//!
//! This module defines the crate's core error types. Every failure that can
//! happen while talking to the WhatsApp Graph API, the Lark Bitable API or the
//! optional flow engine is mapped into [`Error`].
//!
//! None of these errors ever reach the inbound webhook sender: the transport
//! layer always acknowledges and forwards the error to logging instead (see
//! [`crate::server::Handler`]). A user answer that fails validation is not an
//! error at all; it is an [`Outcome::Reprompt`](crate::intake::Outcome::Reprompt).

use std::error::Error as StdError;

use reqwest::StatusCode;
use serde_json::Value;

use crate::MetaError;

/// The **top-level error enum** for the `whatsapp-leads-rs` crate.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A network error occurred before any response was received
    /// (connection refused, DNS, TLS, timeout).
    #[error("A network error occurred: {0}")]
    Network(#[from] BoxError),

    /// The access-credential exchange with the record store failed,
    /// or its response carried no token.
    #[error("Record store authentication failed: {0}")]
    Auth(ServiceError),

    /// Creating, updating or searching records in the record store failed.
    #[error("Record store write failed: {0}")]
    Write(ServiceError),

    /// Sending an outbound message through the Graph API failed.
    #[error("Message send failed: {0}")]
    Send(ServiceError),

    /// The remote flow engine answered with a non-success status.
    #[error("Flow engine request failed: {0}")]
    FlowEngine(ServiceError),

    /// The inbound webhook payload did not have the expected shape.
    #[error("Malformed webhook envelope: {0}")]
    MalformedEnvelope(String),

    /// A required configuration value is missing or could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An internal logic error, or invalid input that should have been
    /// caught earlier (e.g. a header value that is not valid ASCII).
    #[error("An internal library error occurred: {0}")]
    Internal(BoxError),
}

impl Error {
    pub(crate) fn network(err: BoxError) -> Self {
        Self::Network(err)
    }

    pub(crate) fn internal(err: BoxError) -> Self {
        Self::Internal(err)
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns the upstream service error, if this error came from a
    /// non-success provider response.
    pub fn service(&self) -> Option<&ServiceError> {
        match self {
            Self::Auth(e) | Self::Write(e) | Self::Send(e) | Self::FlowEngine(e) => Some(e),
            _ => None,
        }
    }
}

/// Represents **service-level errors**: the provider answered, but with a
/// non-success HTTP status or a non-zero business code.
///
/// Both the HTTP status and the provider's own status code are kept because
/// Lark reports failures inside `200 OK` responses.
#[derive(thiserror::Error, Debug)]
#[error("Service error at endpoint '{endpoint}': {kind} (HTTP status {status})")]
#[non_exhaustive]
pub struct ServiceError {
    pub(crate) status: StatusCode,
    pub(crate) kind: ServiceErrorKind,
    pub(crate) endpoint: String,
}

impl ServiceError {
    /// Returns the HTTP status code associated with this service error.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the endpoint where this service error occurred.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the specific kind of service error.
    pub fn kind(&self) -> &ServiceErrorKind {
        &self.kind
    }

    /// The provider business code, when the provider returned one.
    pub fn provider_code(&self) -> Option<i64> {
        match &self.kind {
            ServiceErrorKind::Api(api) => Some(api.error.code),
            ServiceErrorKind::Lark(lark) => Some(lark.code),
            _ => None,
        }
    }

    /// The `data` object of a Lark error response, if it carried one.
    pub fn provider_data(&self) -> Option<&Value> {
        match &self.kind {
            ServiceErrorKind::Lark(lark) => lark.data.as_ref(),
            _ => None,
        }
    }

    /// The provider's human-readable message, when the provider returned one.
    pub fn provider_message(&self) -> Option<&str> {
        match &self.kind {
            ServiceErrorKind::Api(api) => api.error.message.as_deref(),
            ServiceErrorKind::Lark(lark) => Some(&lark.msg),
            _ => None,
        }
    }

    pub(crate) fn api(error: MetaError) -> ServiceErrorKind {
        ServiceErrorKind::Api(ApiError {
            error: Box::new(error),
        })
    }

    pub(crate) fn lark(
        code: i64,
        msg: impl Into<String>,
        data: Option<Value>,
        body: String,
    ) -> ServiceErrorKind {
        ServiceErrorKind::Lark(LarkError {
            code,
            msg: msg.into(),
            data,
            body,
        })
    }

    pub(crate) fn parse(source: BoxError, body: String) -> ServiceErrorKind {
        ServiceErrorKind::Parse(ParseError {
            source: Some(source),
            body,
        })
    }

    pub(crate) fn payload(source: BoxError) -> ServiceErrorKind {
        ServiceErrorKind::InvalidPayload(Some(source))
    }
}

/// Granular detail about a [`ServiceError`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ServiceErrorKind {
    /// The Graph API returned a structured `{"error": {...}}` body.
    #[error("The API returned an error: {0}")]
    Api(#[from] ApiError),

    /// Lark returned a non-zero `code`.
    #[error("Lark returned an error: {0}")]
    Lark(#[from] LarkError),

    /// The response body could not be parsed into the expected structure.
    #[error("Failed to parse the API response: {0}")]
    Parse(#[from] ParseError),

    /// The response parsed but lacked data we need (e.g. a missing token).
    #[error("The API response had an invalid or unexpected payload structure.")]
    InvalidPayload(#[source] Option<BoxError>),
}

impl ServiceErrorKind {
    pub(crate) fn service(self, endpoint: impl Into<String>, status: StatusCode) -> ServiceError {
        ServiceError {
            status,
            kind: self,
            endpoint: endpoint.into(),
        }
    }
}

/// A Graph API error with the decoded [`MetaError`].
#[derive(thiserror::Error, Debug)]
#[error("Meta API error: {error}")]
#[non_exhaustive]
pub struct ApiError {
    pub error: Box<MetaError>,
}

/// A Lark business error (`code != 0`).
#[derive(thiserror::Error, Debug)]
#[error("code {code}: {msg}")]
#[non_exhaustive]
pub struct LarkError {
    pub code: i64,
    pub msg: String,
    pub data: Option<Value>,
    /// The raw response body, kept for logging.
    pub body: String,
}

/// The response body could not be decoded.
#[derive(thiserror::Error, Debug)]
#[error("Failed to parse the response body. Raw body content was: '{}'.", body)]
#[non_exhaustive]
pub struct ParseError {
    #[source]
    pub(crate) source: Option<BoxError>,
    pub body: String,
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_builder() || value.is_redirect() {
            Self::internal(value.into())
        } else {
            Self::network(value.into())
        }
    }
}

/// A boxed, trait-object error that can be sent across threads.
pub type BoxError = Box<dyn StdError + Send + Sync>;
