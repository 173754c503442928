//! WhatsApp Cloud API client.
//!
//! The outbound half of the bot: a thin, typed wrapper over the Graph API
//! `/{phone_number_id}/messages` endpoint. One call per send, no retry and no
//! queuing; a failed send surfaces as [`Error::Send`] and the caller decides
//! what to log.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use whatsapp_leads_rs::Client;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::builder()
//!     .timeout(Duration::from_secs(10))
//!     .api_version("v22.0")
//!     .auth("YOUR_ACCESS_TOKEN")
//!     .build()?;
//!
//! client
//!     .message("PHONE_NUMBER_ID")
//!     .send_text("5211234567", "Hola!")
//!     .await?;
//! # Ok(()) }
//! ```

use std::{fmt, sync::Arc, time::Duration};

use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client as HttpClient, ClientBuilder as HttpClientBuilder, Response,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, ServiceError},
    MetaError,
};

/// Default API version for the WhatsApp Graph API
const DEFAULT_API_VERSION: &str = "22.0";
const DEFAULT_BASE_URL: &str = "https://graph.facebook.com";
/// Default user agent for the client
const USER_AGENT: &str = "whatsapp-leads-rs/0.1 (Rust)";

/// The outbound message gateway.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<InnerClient>,
}

#[derive(Debug)]
struct InnerClient {
    http_client: HttpClient,
    base_url: String,
    api_version: String,
}

impl Client {
    /// Creates a client with the default timeout and API version.
    pub fn new(access_token: impl AsRef<str>) -> Result<Self, Error> {
        Self::builder().auth(access_token).build()
    }

    /// Starts building a client with custom settings.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Returns a message manager sending from the given business phone number id.
    pub fn message(&self, phone_number_id: impl Into<String>) -> MessageManager {
        MessageManager {
            client: self.clone(),
            from: phone_number_id.into(),
        }
    }

    fn messages_url(&self, phone_number_id: &str) -> String {
        format!(
            "{}/v{}/{}/messages",
            self.inner.base_url, self.inner.api_version, phone_number_id
        )
    }

    /// Maps a Graph response into `T`, decoding the `{"error": {...}}`
    /// envelope on failure.
    async fn handle_response<T>(response: Response, endpoint: &str) -> Result<T, Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            serde_json::from_slice(&body).map_err(|err| {
                Error::Send(
                    ServiceError::parse(err.into(), String::from_utf8_lossy(&body).into_owned())
                        .service(endpoint, status),
                )
            })
        } else {
            #[derive(Deserialize)]
            struct Envelope {
                error: MetaError,
            }
            let kind = match serde_json::from_slice::<Envelope>(&body) {
                Ok(envelope) => ServiceError::api(envelope.error),
                Err(err) => {
                    ServiceError::parse(err.into(), String::from_utf8_lossy(&body).into_owned())
                }
            };
            Err(Error::Send(kind.service(endpoint, status)))
        }
    }
}

/// Builder for [`Client`].
#[derive(Debug)]
#[must_use]
pub struct ClientBuilder {
    http: HttpClientBuilder,
    api_version: String,
    base_url: String,
    access_token: Option<String>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            http: HttpClientBuilder::new(),
            api_version: DEFAULT_API_VERSION.to_owned(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            access_token: None,
        }
    }
}

impl ClientBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request timeout for all Graph API calls.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.http = self.http.timeout(duration);
        self
    }

    /// Sets the Graph API version (e.g. `"22.0"`). A leading `v` is removed.
    pub fn api_version(mut self, version: impl AsRef<str>) -> Self {
        self.api_version = version.as_ref().trim_start_matches('v').to_owned();
        self
    }

    /// Overrides the Graph API host. Mostly useful for tests.
    pub fn base_url(mut self, base_url: impl AsRef<str>) -> Self {
        self.base_url = base_url.as_ref().trim_end_matches('/').to_owned();
        self
    }

    /// Sets the bearer token sent with every request.
    pub fn auth(mut self, access_token: impl AsRef<str>) -> Self {
        self.access_token = Some(access_token.as_ref().to_owned());
        self
    }

    /// Finishes building the client.
    pub fn build(self) -> Result<Client, Error> {
        let token = self
            .access_token
            .ok_or_else(|| Error::config("WhatsApp access token is not set"))?;

        let mut auth: HeaderValue = format!("Bearer {token}")
            .parse()
            .map_err(|err| Error::internal(format!("Invalid auth: {err}").into()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(USER_AGENT),
        );
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http_client = self.http.default_headers(headers).build()?;
        Ok(Client {
            inner: Arc::new(InnerClient {
                http_client,
                base_url: self.base_url,
                api_version: self.api_version,
            }),
        })
    }
}

/// Sends messages on behalf of one business phone number.
#[derive(Debug, Clone)]
pub struct MessageManager {
    client: Client,
    from: String,
}

impl MessageManager {
    /// The phone number id messages are sent from.
    pub fn phone_number_id(&self) -> &str {
        &self.from
    }

    /// Sends a plain text message to `to`.
    ///
    /// Exactly one HTTP call is made. A non-success status is returned as
    /// [`Error::Send`] carrying the decoded Graph error.
    pub async fn send_text(
        &self,
        to: impl AsRef<str>,
        body: impl Into<String>,
    ) -> Result<MessageCreate, Error> {
        let url = self.client.messages_url(&self.from);
        let request = TextMessageRequest {
            messaging_product: "whatsapp",
            recipient_type: "individual",
            to: to.as_ref(),
            r#type: "text",
            text: TextBody {
                body: body.into(),
            },
        };

        let response = self
            .client
            .inner
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await?;

        let response: SendMessageResponse = Client::handle_response(response, &url).await?;
        MessageCreate::from_response(response, &url)
    }
}

#[derive(Serialize, Debug)]
struct TextMessageRequest<'a> {
    messaging_product: &'static str,
    recipient_type: &'static str,
    to: &'a str,
    r#type: &'static str,
    text: TextBody,
}

#[derive(Serialize, Debug)]
struct TextBody {
    body: String,
}

#[derive(Deserialize, Debug)]
struct SendMessageResponseContact {
    wa_id: String,
}

#[derive(Deserialize, Debug)]
struct SendMessageResponseMetadata {
    id: String,
    #[serde(default)]
    message_status: Option<String>,
}

/// Send message API response
#[derive(Deserialize, Debug)]
struct SendMessageResponse {
    messages: Vec<SendMessageResponseMetadata>,
    #[serde(default)]
    contacts: Vec<SendMessageResponseContact>,
}

/// Delivery metadata returned by a successful send.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct MessageCreate {
    message_id: String,
    recipient: Option<String>,
    message_status: Option<String>,
}

impl MessageCreate {
    fn from_response(mut response: SendMessageResponse, endpoint: &str) -> Result<Self, Error> {
        let metadata = response.messages.pop().ok_or_else(|| {
            Error::Send(
                ServiceError::payload("Missing message metadata in response".into())
                    .service(endpoint, reqwest::StatusCode::OK),
            )
        })?;

        Ok(Self {
            message_id: metadata.id,
            recipient: response.contacts.pop().map(|c| c.wa_id),
            message_status: metadata.message_status,
        })
    }

    /// The `wamid.` id of the sent message.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The resolved WhatsApp id of the recipient, if Meta returned one.
    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    /// Delivery status (e.g. `accepted`), if Meta returned one.
    pub fn message_status(&self) -> Option<&str> {
        self.message_status.as_deref()
    }
}

impl fmt::Display for MessageCreate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_prefix_is_trimmed() {
        let client = Client::builder()
            .api_version("v19.0")
            .base_url("http://localhost:1234/")
            .auth("T")
            .build()
            .unwrap();
        assert_eq!(
            client.messages_url("123"),
            "http://localhost:1234/v19.0/123/messages"
        );
    }

    #[test]
    fn build_without_token_fails() {
        assert!(matches!(Client::builder().build(), Err(Error::Config(_))));
    }

    #[test]
    fn text_request_shape() {
        let request = TextMessageRequest {
            messaging_product: "whatsapp",
            recipient_type: "individual",
            to: "5211234567",
            r#type: "text",
            text: TextBody {
                body: "hola".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": "5211234567",
                "type": "text",
                "text": {"body": "hola"}
            })
        );
    }
}
