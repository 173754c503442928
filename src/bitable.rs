//! Lark Bitable record store client.
//!
//! Completed leads end up as rows of a Bitable table. This module owns the
//! two pieces of that integration:
//!
//! - [`TenantTokenCache`]: the process-wide tenant access token, refreshed a
//!   safety margin before it expires. Refreshes are serialized so concurrent
//!   callers that find a stale token collapse into a single credential
//!   exchange.
//! - [`BitableClient`]: record create / update / search against one table.
//!
//! Every Lark response is checked twice: the HTTP status must be a success and
//! the body's `code` must be `0`. Lark reports most failures (unknown field
//! names, missing permissions) with `200 OK` and a non-zero code.
//!
//! # Example
//!
//! ```rust,no_run
//! use whatsapp_leads_rs::bitable::{BitableClient, Fields};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), whatsapp_leads_rs::Error> {
//! let bitable = BitableClient::builder()
//!     .credentials("cli_a1b2", "app_secret")
//!     .table("bascnAppToken", "tblTableId")
//!     .build()?;
//!
//! let mut fields = Fields::new();
//! fields.insert("wa_id".into(), json!("5211234567"));
//! let record_id = bitable.create_record(fields).await?;
//! # Ok(()) }
//! ```

use std::{sync::Arc, time::Duration};

use async_stream::try_stream;
use futures::{pin_mut, Stream, TryStreamExt};
use reqwest::{Client as HttpClient, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    error::{Error, ServiceError},
    expiring::MAX_TTL,
};

const DEFAULT_API_BASE: &str = "https://open.larksuite.com/open-apis";

/// A token is refreshed once its remaining lifetime drops below this.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed when the token response omits `expire`.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Lark business code for an expired or invalid tenant access token.
const LARK_INVALID_ACCESS_TOKEN_CODE: i64 = 99_991_663;

const SEARCH_PAGE_SIZE: u32 = 100;

/// The column the completion timestamp is stored under.
pub const CREATED_AT_FIELD: &str = "created_at";

/// A Bitable field map, keyed by column name.
///
/// Names must match the table's columns exactly. Lark accepts unknown names
/// on some endpoints without complaint, so nothing here validates them.
pub type Fields = serde_json::Map<String, Value>;

/// A Bitable row.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct Record {
    pub record_id: String,
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    /// The record's `created_at` column as epoch milliseconds, if present
    /// and numeric (or a numeric string).
    pub fn created_at(&self) -> Option<i64> {
        match self.fields.get(CREATED_AT_FIELD)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant, margin: Duration) -> bool {
        self.expires_at
            .checked_duration_since(now)
            .is_some_and(|remaining| remaining > margin)
    }
}

/// Process-wide cache for the Lark tenant access token.
///
/// Readers take a shared lock on the fast path. A caller that finds the token
/// stale takes the refresh lock, re-checks, and only then performs the
/// exchange, so N concurrent callers cause one request.
#[derive(Debug)]
pub struct TenantTokenCache {
    app_id: String,
    app_secret: String,
    margin: Duration,
    token: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    app_id: &'a str,
    app_secret: &'a str,
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(default = "unknown_code")]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: Option<String>,
    #[serde(default)]
    expire: Option<u64>,
}

fn unknown_code() -> i64 {
    -1
}

impl TenantTokenCache {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            margin: TOKEN_REFRESH_MARGIN,
            token: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Returns the cached token if it outlives the margin, otherwise
    /// exchanges credentials for a new one.
    pub async fn get(&self, http: &HttpClient, api_base: &str) -> Result<String, Error> {
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }

        let (value, ttl) = self.exchange(http, api_base).await?;
        *self.token.write().await = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        });
        debug!(ttl_secs = ttl.as_secs(), "refreshed Lark tenant access token");
        Ok(value)
    }

    /// Drops the cached token so the next [`get`](Self::get) refreshes.
    pub async fn invalidate(&self) {
        *self.token.write().await = None;
    }

    async fn fresh(&self) -> Option<String> {
        let guard = self.token.read().await;
        guard
            .as_ref()
            .filter(|t| t.is_fresh(Instant::now(), self.margin))
            .map(|t| t.value.clone())
    }

    async fn exchange(&self, http: &HttpClient, api_base: &str) -> Result<(String, Duration), Error> {
        let endpoint = format!("{api_base}/auth/v3/tenant_access_token/internal");
        let response = http
            .post(&endpoint)
            .json(&TokenRequest {
                app_id: &self.app_id,
                app_secret: &self.app_secret,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        let raw = || String::from_utf8_lossy(&body).into_owned();

        let parsed: TokenResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                return Err(Error::Auth(
                    ServiceError::parse(err.into(), raw()).service(endpoint, status),
                ))
            }
        };

        if !status.is_success() || parsed.code != 0 {
            return Err(Error::Auth(
                ServiceError::lark(parsed.code, parsed.msg, None, raw()).service(endpoint, status),
            ));
        }

        let token = parsed.tenant_access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            Error::Auth(
                ServiceError::payload("missing tenant_access_token in response".into())
                    .service(endpoint.as_str(), status),
            )
        })?;

        let ttl = parsed
            .expire
            .filter(|&secs| secs > 0)
            .map(|secs| Duration::from_secs(secs).min(MAX_TTL))
            .unwrap_or(DEFAULT_TOKEN_TTL);

        Ok((token, ttl))
    }
}

/// Client for a single Bitable table.
///
/// Cheap to clone; clones share the HTTP pool and the token cache.
#[derive(Clone, Debug)]
pub struct BitableClient {
    inner: Arc<InnerBitable>,
}

#[derive(Debug)]
struct InnerBitable {
    http: HttpClient,
    api_base: String,
    app_token: String,
    table_id: String,
    tokens: TenantTokenCache,
}

/// Builder for [`BitableClient`].
#[derive(Debug, Default)]
#[must_use]
pub struct BitableClientBuilder {
    api_base: Option<String>,
    app_id: Option<String>,
    app_secret: Option<String>,
    app_token: Option<String>,
    table_id: Option<String>,
    timeout: Option<Duration>,
}

impl BitableClientBuilder {
    /// Sets the Lark app credentials used for the token exchange.
    pub fn credentials(mut self, app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self.app_secret = Some(app_secret.into());
        self
    }

    /// Selects the Bitable app (base) token and table id.
    pub fn table(mut self, app_token: impl Into<String>, table_id: impl Into<String>) -> Self {
        self.app_token = Some(app_token.into());
        self.table_id = Some(table_id.into());
        self
    }

    /// Overrides the API base (`https://open.larksuite.com/open-apis` by default).
    pub fn api_base(mut self, api_base: impl AsRef<str>) -> Self {
        self.api_base = Some(api_base.as_ref().trim_end_matches('/').to_owned());
        self
    }

    /// Sets the timeout of every outbound call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<BitableClient, Error> {
        let missing = |what: &str| Error::config(format!("Bitable {what} is not set"));

        let mut http = HttpClient::builder();
        if let Some(timeout) = self.timeout {
            http = http.timeout(timeout);
        }

        Ok(BitableClient {
            inner: Arc::new(InnerBitable {
                http: http.build()?,
                api_base: self.api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_owned()),
                app_token: self.app_token.ok_or_else(|| missing("app token"))?,
                table_id: self.table_id.ok_or_else(|| missing("table id"))?,
                tokens: TenantTokenCache::new(
                    self.app_id.ok_or_else(|| missing("app id"))?,
                    self.app_secret.ok_or_else(|| missing("app secret"))?,
                ),
            }),
        })
    }
}

#[derive(Deserialize, Debug)]
struct LarkEnvelope {
    #[serde(default = "unknown_code")]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct RecordData {
    record: Record,
}

#[derive(Deserialize, Debug)]
struct SearchData {
    #[serde(default)]
    items: Vec<Record>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Serialize)]
struct FieldsBody<'a> {
    fields: &'a Fields,
}

#[derive(Serialize, Debug, Clone)]
struct SearchBody {
    filter: SearchFilter,
}

#[derive(Serialize, Debug, Clone)]
struct SearchFilter {
    conjunction: &'static str,
    conditions: Vec<SearchCondition>,
}

#[derive(Serialize, Debug, Clone)]
struct SearchCondition {
    field_name: String,
    operator: &'static str,
    value: Vec<String>,
}

impl BitableClient {
    pub fn builder() -> BitableClientBuilder {
        BitableClientBuilder::default()
    }

    /// Returns a valid tenant access token, refreshing it if needed.
    pub async fn get_access_token(&self) -> Result<String, Error> {
        self.inner
            .tokens
            .get(&self.inner.http, &self.inner.api_base)
            .await
    }

    fn records_url(&self) -> String {
        format!(
            "{}/bitable/v1/apps/{}/tables/{}/records",
            self.inner.api_base, self.inner.app_token, self.inner.table_id
        )
    }

    /// Creates a record and returns its id.
    pub async fn create_record(&self, fields: Fields) -> Result<String, Error> {
        let endpoint = self.records_url();
        let token = self.get_access_token().await?;
        let response = self
            .inner
            .http
            .post(&endpoint)
            .bearer_auth(token)
            .json(&FieldsBody { fields: &fields })
            .send()
            .await?;

        let data: RecordData = self.handle_response(response, &endpoint).await?;
        Ok(data.record.record_id)
    }

    /// Partially updates a record: only the given fields are touched.
    pub async fn update_record(&self, record_id: &str, fields: Fields) -> Result<Record, Error> {
        let endpoint = format!("{}/{record_id}", self.records_url());
        let token = self.get_access_token().await?;
        let response = self
            .inner
            .http
            .put(&endpoint)
            .bearer_auth(token)
            .json(&FieldsBody { fields: &fields })
            .send()
            .await?;

        let data: RecordData = self.handle_response(response, &endpoint).await?;
        Ok(data.record)
    }

    /// Streams every record whose `field` equals `value`, following pagination.
    pub fn search_by_field(
        &self,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> impl Stream<Item = Result<Record, Error>> + Send + 'static {
        let client = self.clone();
        let body = SearchBody {
            filter: SearchFilter {
                conjunction: "and",
                conditions: vec![SearchCondition {
                    field_name: field.into(),
                    operator: "is",
                    value: vec![value.into()],
                }],
            },
        };

        try_stream! {
            let endpoint = format!("{}/search", client.records_url());
            let mut page_token: Option<String> = None;
            loop {
                let token = client.get_access_token().await?;
                let mut request = client
                    .inner
                    .http
                    .post(&endpoint)
                    .bearer_auth(token)
                    .query(&[("page_size", SEARCH_PAGE_SIZE.to_string())]);
                if let Some(page) = &page_token {
                    request = request.query(&[("page_token", page)]);
                }

                let response = request.json(&body).send().await?;
                let page: SearchData = client.handle_response(response, &endpoint).await?;

                for record in page.items {
                    yield record;
                }

                match page.page_token.filter(|_| page.has_more) {
                    Some(next) => page_token = Some(next),
                    None => break,
                }
            }
        }
    }

    /// Finds the most recent record (greatest `created_at`) whose `wa_id`
    /// equals `external_id`. Records without a readable `created_at` lose to
    /// any record that has one.
    pub async fn find_latest_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Record>, Error> {
        let records = self.search_by_field(crate::intake::SENDER_FIELD, external_id);
        pin_mut!(records);

        let mut latest: Option<Record> = None;
        while let Some(record) = records.try_next().await? {
            let newer = match &latest {
                None => true,
                Some(current) => record.created_at() > current.created_at(),
            };
            if newer {
                latest = Some(record);
            }
        }
        Ok(latest)
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
        endpoint: &str,
    ) -> Result<T, Error> {
        let status = response.status();
        let body = response.bytes().await?;
        let raw = || String::from_utf8_lossy(&body).into_owned();

        let envelope: LarkEnvelope = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(err) => {
                return Err(Error::Write(
                    ServiceError::parse(err.into(), raw()).service(endpoint, status),
                ))
            }
        };

        if !status.is_success() || envelope.code != 0 {
            if envelope.code == LARK_INVALID_ACCESS_TOKEN_CODE || status == StatusCode::UNAUTHORIZED {
                warn!(code = envelope.code, "Lark rejected the tenant token; dropping it");
                self.inner.tokens.invalidate().await;
            }
            return Err(Error::Write(
                ServiceError::lark(envelope.code, envelope.msg, envelope.data, raw())
                    .service(endpoint, status),
            ));
        }

        let data = envelope.data.ok_or_else(|| {
            Error::Write(
                ServiceError::payload("missing `data` in Lark response".into())
                    .service(endpoint, status),
            )
        })?;
        serde_json::from_value(data).map_err(|err| {
            Error::Write(ServiceError::parse(err.into(), raw()).service(endpoint, status))
        })
    }
}
