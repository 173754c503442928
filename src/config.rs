//! Environment configuration.
//!
//! Everything the service needs is read from environment variables (optionally
//! seeded from a `.env` file). See [`Config::from_env`] for the full list.

use std::{env, net::SocketAddr, time::Duration};

use crate::error::Error;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_WEBHOOK_PATH: &str = "/webhook";
const DEFAULT_GRAPH_API_VERSION: &str = "22.0";
const DEFAULT_LARK_API_BASE: &str = "https://open.larksuite.com/open-apis";
const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
const DEFAULT_DEDUP_TTL_SECS: u64 = 5 * 60;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Holds all application configuration loaded from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Route of the webhook (verification and events).
    pub webhook_path: String,
    /// Secret echoed back during the `hub.challenge` handshake.
    pub verify_token: String,
    pub whatsapp: WhatsAppConfig,
    pub lark: Option<LarkConfig>,
    pub flow_engine: Option<FlowEngineConfig>,
    /// Enables `POST /api/leads` when set.
    pub leads_api_key: Option<String>,
    pub session_ttl: Duration,
    pub dedup_ttl: Duration,
    /// Timeout applied to every outbound HTTP call.
    pub http_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct WhatsAppConfig {
    pub access_token: String,
    /// Sending phone number id. Falls back to the envelope's
    /// `metadata.phone_number_id` when unset.
    pub phone_number_id: Option<String>,
    pub api_version: String,
}

#[derive(Clone, Debug)]
pub struct LarkConfig {
    pub app_id: String,
    pub app_secret: String,
    /// The Bitable app (base) token.
    pub app_token: String,
    pub table_id: String,
    pub api_base: String,
}

#[derive(Clone, Debug)]
pub struct FlowEngineConfig {
    pub url: String,
    pub secret: Option<String>,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    ///
    /// | Variable | Required | Default |
    /// |---|---|---|
    /// | `VERIFY_TOKEN` | yes | |
    /// | `WHATSAPP_TOKEN` | yes | |
    /// | `PHONE_NUMBER_ID` | no | envelope metadata |
    /// | `GRAPH_API_VERSION` | no | `22.0` |
    /// | `LARK_APP_ID`, `LARK_APP_SECRET`, `LARK_APP_TOKEN`, `LARK_TABLE_ID` | all or none | |
    /// | `LARK_API_BASE` | no | `https://open.larksuite.com/open-apis` |
    /// | `FLOW_ENGINE_URL`, `FLOW_ENGINE_SECRET` | no | |
    /// | `LEADS_API_KEY` | no | |
    /// | `BIND_ADDR` or `PORT` | no | `0.0.0.0:3000` |
    /// | `WEBHOOK_PATH` | no | `/webhook` |
    /// | `SESSION_TTL_SECS` | no | `1800` |
    /// | `DEDUP_TTL_SECS` | no | `300` |
    /// | `HTTP_TIMEOUT_SECS` | no | `10` |
    pub fn from_env() -> Result<Self, Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require =
            |key: &str| get(key).ok_or_else(|| Error::config(format!("`{key}` is not set")));

        let bind_addr = match (get("BIND_ADDR"), get("PORT")) {
            (Some(addr), _) => addr,
            (None, Some(port)) => format!("0.0.0.0:{port}"),
            (None, None) => DEFAULT_BIND_ADDR.to_owned(),
        };
        let bind_addr = bind_addr
            .parse()
            .map_err(|err| Error::config(format!("invalid bind address `{bind_addr}`: {err}")))?;

        let whatsapp = WhatsAppConfig {
            access_token: require("WHATSAPP_TOKEN")?,
            phone_number_id: get("PHONE_NUMBER_ID"),
            api_version: get("GRAPH_API_VERSION")
                .unwrap_or_else(|| DEFAULT_GRAPH_API_VERSION.to_owned())
                .trim_start_matches('v')
                .to_owned(),
        };

        let lark = match (get("LARK_APP_ID"), get("LARK_APP_SECRET")) {
            (Some(app_id), Some(app_secret)) => Some(LarkConfig {
                app_id,
                app_secret,
                app_token: require("LARK_APP_TOKEN")?,
                table_id: require("LARK_TABLE_ID")?,
                api_base: get("LARK_API_BASE")
                    .unwrap_or_else(|| DEFAULT_LARK_API_BASE.to_owned())
                    .trim_end_matches('/')
                    .to_owned(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(Error::config("`LARK_APP_SECRET` is not set")),
            (None, Some(_)) => return Err(Error::config("`LARK_APP_ID` is not set")),
        };

        let flow_engine = get("FLOW_ENGINE_URL").map(|url| FlowEngineConfig {
            url,
            secret: get("FLOW_ENGINE_SECRET"),
        });

        let secs = |key: &str, default: u64| -> Result<Duration, Error> {
            match get(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(|err| Error::config(format!("invalid `{key}` value `{raw}`: {err}"))),
                None => Ok(Duration::from_secs(default)),
            }
        };

        Ok(Self {
            bind_addr,
            webhook_path: get("WEBHOOK_PATH").unwrap_or_else(|| DEFAULT_WEBHOOK_PATH.to_owned()),
            verify_token: require("VERIFY_TOKEN")?,
            whatsapp,
            lark,
            flow_engine,
            leads_api_key: get("LEADS_API_KEY"),
            session_ttl: secs("SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS)?,
            dedup_ttl: secs("DEDUP_TTL_SECS", DEFAULT_DEDUP_TTL_SECS)?,
            http_timeout: secs("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?,
        })
    }
}
