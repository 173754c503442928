//! Remote flow engine client.
//!
//! Some deployments keep the conversation logic outside this service, in a
//! spreadsheet script that receives the raw webhook payload and answers with
//! `{"reply": "..."}`. When configured, the bot hands every inbound message
//! to it instead of running the local intake flow.
//!
//! Script runtimes of that kind cannot read request headers, so the shared
//! secret travels as the `secret` query parameter.

use std::time::Duration;

use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, ServiceError};

/// Reply used whenever the engine gives no usable answer.
pub const FALLBACK_REPLY: &str = "Gracias. Un asesor te contactará pronto.";

#[derive(Clone, Debug)]
pub struct FlowEngineClient {
    http: HttpClient,
    url: String,
    secret: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct EngineResponse {
    #[serde(default)]
    reply: Option<String>,
}

impl FlowEngineClient {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self, Error> {
        Self::with_timeout(url, secret, None)
    }

    pub fn with_timeout(
        url: impl Into<String>,
        secret: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        let mut http = HttpClient::builder();
        if let Some(timeout) = timeout {
            http = http.timeout(timeout);
        }
        Ok(Self {
            http: http.build()?,
            url: url.into(),
            secret,
        })
    }

    /// Forwards `payload` and returns the engine's `reply`, if it sent one.
    ///
    /// A body that is not JSON, or JSON without a non-empty `reply`, is
    /// `Ok(None)`.
    pub async fn reply(&self, payload: &Value) -> Result<Option<String>, Error> {
        let mut request = self.http.post(&self.url).json(payload);
        if let Some(secret) = &self.secret {
            request = request.query(&[("secret", secret)]);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let raw = String::from_utf8_lossy(&body).into_owned();
            return Err(Error::FlowEngine(
                ServiceError::parse(format!("unexpected status {status}").into(), raw)
                    .service(&self.url, status),
            ));
        }

        let parsed: EngineResponse = serde_json::from_slice(&body).unwrap_or_else(|err| {
            debug!(error = %err, "flow engine answered with a non-JSON body");
            EngineResponse::default()
        });
        Ok(parsed.reply.filter(|reply| !reply.trim().is_empty()))
    }

    /// Like [`reply`](Self::reply), but every failure becomes [`FALLBACK_REPLY`].
    pub async fn reply_or_fallback(&self, payload: &Value) -> String {
        match self.reply(payload).await {
            Ok(Some(reply)) => reply,
            Ok(None) => FALLBACK_REPLY.to_owned(),
            Err(err) => {
                warn!(error = %err, "flow engine failed, using fallback reply");
                FALLBACK_REPLY.to_owned()
            }
        }
    }
}
