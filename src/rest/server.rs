use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::{
    bitable::{BitableClient, Fields, CREATED_AT_FIELD},
    error::Error,
    intake::SENDER_FIELD,
    server::{Event, EventContext, Handler, IncomingMessage, MessageUpdate},
};

/// Body of every `POST` acknowledgement.
pub(crate) const ACK_BODY: &str = "EVENT_RECEIVED";

const HEALTH_PATH: &str = "/health";
const ROOT_PATH: &str = "/";
const LEADS_PATH: &str = "/api/leads";
const API_KEY_HEADER: &str = "x-api-key";
const SUBSCRIBE_MODE: &str = "subscribe";

/// Columns `POST /api/leads` accepts. Anything else in the body is dropped.
const LEAD_FIELDS: &[&str] = &[
    SENDER_FIELD,
    "producto_interes",
    "intencion_cliente",
    "nombre",
    "empresa",
    "ubicacion",
    "telefono",
    "email",
];

/// Internal shared state for the webhook logic.
/// Used by both the managed server and the BYOS service.
pub(crate) struct InnerServer<H> {
    pub(crate) handler: H,
    pub(crate) verify_token: Option<String>,
}

impl<H: Handler> InnerServer<H> {
    /// Decodes and dispatches one delivery. Never fails: every error is
    /// forwarded to the handler's error hook.
    pub(crate) async fn process(&self, body: &[u8]) {
        let result = match decode_event(body) {
            Ok((ctx, event)) => self.handler.handle(ctx, event).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.handler.handle_error(err).await;
        }
    }
}

impl<H> InnerServer<H> {
    /// Answers the subscription handshake: the challenge on success,
    /// `403` otherwise.
    pub(crate) fn verify(&self, query: &VerifyQuery) -> (StatusCode, String) {
        let token_matches = match (&self.verify_token, &query.verify_token) {
            (Some(expected), Some(given)) => expected.as_bytes().ct_eq(given.as_bytes()).into(),
            _ => false,
        };

        if token_matches && query.mode.as_deref() == Some(SUBSCRIBE_MODE) {
            info!("webhook verified");
            (StatusCode::OK, query.challenge.clone().unwrap_or_default())
        } else {
            warn!(mode = ?query.mode, "webhook verification rejected");
            (StatusCode::FORBIDDEN, "Forbidden".to_owned())
        }
    }
}

pub(crate) fn router<H: Handler + 'static>(
    route: &str,
    verify_token: Option<String>,
    leads: Option<LeadsIngest>,
    handler: H,
) -> Router {
    let state = Arc::new(InnerServer {
        handler,
        verify_token,
    });

    let mut app = Router::new()
        .route(
            route,
            get(handle_verification::<H>).post(handle_webhook::<H>),
        )
        .with_state(state)
        .route(HEALTH_PATH, get(handle_health));

    if route != ROOT_PATH {
        app = app.route(ROOT_PATH, get(handle_health));
    }

    if let Some(leads) = leads {
        app = app.merge(
            Router::new()
                .route(
                    LEADS_PATH,
                    post(handle_leads).fallback(leads_method_not_allowed),
                )
                .with_state(Arc::new(leads)),
        );
    }
    app
}

// Verification handler
pub(crate) async fn handle_verification<H: Handler + 'static>(
    State(state): State<Arc<InnerServer<H>>>,
    Query(query): Query<VerifyQuery>,
) -> (StatusCode, String) {
    state.verify(&query)
}

// Webhook handler
pub(crate) async fn handle_webhook<H: Handler + 'static>(
    State(state): State<Arc<InnerServer<H>>>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    state.process(&body).await;
    (StatusCode::OK, ACK_BODY)
}

async fn handle_health() -> &'static str {
    "OK"
}

/// `hub.*` query parameters of the subscription handshake.
#[derive(Deserialize, Debug, Default)]
pub(crate) struct VerifyQuery {
    #[serde(rename = "hub.mode", default)]
    pub(crate) mode: Option<String>,
    #[serde(rename = "hub.verify_token", default)]
    pub(crate) verify_token: Option<String>,
    #[serde(rename = "hub.challenge", default)]
    pub(crate) challenge: Option<String>,
}

/// Webhook payload structures
#[derive(Deserialize, Debug)]
struct WebhookPayload {
    #[serde(default)]
    object: Option<String>,
    #[serde(rename = "entry", default)]
    entries: Vec<WebhookEntry>,
}

#[derive(Deserialize, Debug)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookEntryChange>,
}

#[derive(Deserialize, Debug)]
struct WebhookEntryChange {
    #[serde(default)]
    value: Option<WebhookChangeValue>,
}

#[derive(Deserialize, Debug)]
struct WebhookChangeValue {
    #[serde(default)]
    metadata: Option<BusinessMetadata>,
    #[serde(default)]
    contacts: Vec<UserContact>,
    #[serde(default)]
    messages: Vec<MessageEvent>,
    #[serde(default)]
    statuses: Vec<MessageStatusEvent>,
}

#[derive(Deserialize, Debug)]
struct BusinessMetadata {
    #[serde(default)]
    phone_number_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct UserContact {
    #[serde(default)]
    wa_id: Option<String>,
    #[serde(default)]
    profile: Option<UserProfile>,
}

#[derive(Deserialize, Debug)]
struct UserProfile {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct MessageEvent {
    id: String,
    from: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<TextContent>,
    #[serde(default)]
    interactive: Option<InteractiveContent>,
    #[serde(default)]
    button: Option<ButtonContent>,
}

#[derive(Deserialize, Debug)]
struct TextContent {
    body: String,
}

#[derive(Deserialize, Debug)]
struct InteractiveContent {
    #[serde(default)]
    button_reply: Option<ReplyTitle>,
    #[serde(default)]
    list_reply: Option<ReplyTitle>,
}

#[derive(Deserialize, Debug)]
struct ReplyTitle {
    title: String,
}

#[derive(Deserialize, Debug)]
struct ButtonContent {
    text: String,
}

#[derive(Deserialize, Debug)]
struct MessageStatusEvent {
    id: String,
    status: String,
    #[serde(default)]
    recipient_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

impl MessageEvent {
    /// Plain text body, or the title of the tapped reply button / list row.
    fn text(&self) -> Option<String> {
        let interactive = self.interactive.as_ref().and_then(|i| {
            i.button_reply
                .as_ref()
                .or(i.list_reply.as_ref())
                .map(|reply| reply.title.as_str())
        });

        self.text
            .as_ref()
            .map(|t| t.body.as_str())
            .or(interactive)
            .or(self.button.as_ref().map(|b| b.text.as_str()))
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_owned)
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw?.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Decodes a delivery body into the event of its first change.
///
/// Only the first message (or, failing that, the first status) is kept.
/// A well-formed body with neither is [`Event::Unsupported`].
pub(crate) fn decode_event(body: &[u8]) -> Result<(EventContext, Event), Error> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|err| Error::MalformedEnvelope(format!("body is not JSON: {err}")))?;
    let envelope = WebhookPayload::deserialize(&payload)
        .map_err(|err| Error::MalformedEnvelope(err.to_string()))?;

    if let Some(object) = envelope.object.as_deref() {
        if object != "whatsapp_business_account" {
            return Err(Error::MalformedEnvelope(format!(
                "unexpected object type '{object}'"
            )));
        }
    }

    let mut value = envelope
        .entries
        .into_iter()
        .next()
        .and_then(|entry| entry.changes.into_iter().next())
        .and_then(|change| change.value);

    let ctx = EventContext {
        phone_number_id: value
            .as_mut()
            .and_then(|v| v.metadata.take())
            .and_then(|m| m.phone_number_id),
        payload: Arc::new(payload),
    };

    let Some(mut value) = value else {
        return Ok((ctx, Event::Unsupported));
    };

    let event = if !value.messages.is_empty() {
        let message = value.messages.swap_remove(0);
        let profile_name = value
            .contacts
            .iter()
            .find(|c| c.wa_id.as_deref() == Some(message.from.as_str()))
            .or(value.contacts.first())
            .and_then(|c| c.profile.as_ref())
            .and_then(|p| p.name.clone());

        Event::IncomingMessage(IncomingMessage {
            text: message.text(),
            timestamp: parse_timestamp(message.timestamp.as_deref()),
            id: message.id,
            from: message.from,
            kind: message.kind,
            profile_name,
        })
    } else if !value.statuses.is_empty() {
        let status = value.statuses.swap_remove(0);
        Event::MessageUpdate(MessageUpdate {
            timestamp: parse_timestamp(status.timestamp.as_deref()),
            message_id: status.id,
            status: status.status,
            recipient_id: status.recipient_id,
        })
    } else {
        Event::Unsupported
    };

    Ok((ctx, event))
}

/// State of `POST /api/leads`.
#[derive(Clone, Debug)]
pub(crate) struct LeadsIngest {
    api_key: String,
    bitable: BitableClient,
}

impl LeadsIngest {
    pub(crate) fn new(api_key: impl Into<String>, bitable: BitableClient) -> Self {
        Self {
            api_key: api_key.into(),
            bitable,
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(API_KEY_HEADER)
            .map(|given| given.as_bytes().ct_eq(self.api_key.as_bytes()).into())
            .unwrap_or(false)
    }
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

async fn handle_leads(
    State(ingest): State<Arc<LeadsIngest>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !ingest.authorized(&headers) {
        return json_response(
            StatusCode::UNAUTHORIZED,
            json!({"ok": false, "error": "Unauthorized"}),
        );
    }

    let Some(body) = parse_lenient_object(&String::from_utf8_lossy(&body)) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"ok": false, "error": "Invalid JSON body"}),
        );
    };

    let (fields, created_at) = lead_fields(&body, Utc::now().timestamp_millis());
    let has_sender = fields
        .get(SENDER_FIELD)
        .is_some_and(|v| !matches!(v, Value::String(s) if s.is_empty()));
    if !has_sender {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"ok": false, "error": "wa_id is required"}),
        );
    }

    match ingest.bitable.create_record(fields).await {
        Ok(record_id) => {
            info!(record_id = %record_id, "lead ingested");
            json_response(
                StatusCode::OK,
                json!({"ok": true, "record_id": record_id, "created_at": created_at}),
            )
        }
        Err(Error::Write(service)) => {
            warn!(status = %service.status(), error = %service, "lead ingestion rejected by Lark");
            json_response(
                StatusCode::BAD_GATEWAY,
                json!({
                    "ok": false,
                    "error": "Lark API error",
                    "lark_http": service.status().as_u16(),
                    "lark_code": service.provider_code(),
                    "lark_msg": service.provider_message(),
                    "lark_data": service.provider_data(),
                }),
            )
        }
        Err(err) => {
            warn!(error = %err, "lead ingestion failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"ok": false, "error": err.to_string()}),
            )
        }
    }
}

async fn leads_method_not_allowed() -> Response {
    let mut response = json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        json!({"ok": false, "error": "Method Not Allowed"}),
    );
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("POST"));
    response
}

/// Accepts a JSON object, a JSON string holding an object, or an object
/// with garbage around it (first `{` to last `}`). An empty body is an empty
/// object.
fn parse_lenient_object(raw: &str) -> Option<Map<String, Value>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(Map::new());
    }

    let value: Value = serde_json::from_str(raw).ok().or_else(|| {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        if end <= start {
            return None;
        }
        debug!("lead body had text around the JSON object");
        serde_json::from_str(&raw[start..=end]).ok()
    })?;

    match value {
        Value::Object(map) => Some(map),
        Value::String(inner) => parse_lenient_object(&inner),
        _ => None,
    }
}

/// Keeps the accepted columns (nulls dropped) and stamps `created_at`: the
/// body's numeric value if it has one, `now_ms` otherwise.
fn lead_fields(body: &Map<String, Value>, now_ms: i64) -> (Fields, i64) {
    let mut fields: Fields = LEAD_FIELDS
        .iter()
        .filter_map(|&name| match body.get(name) {
            None | Some(Value::Null) => None,
            Some(value) => Some((name.to_owned(), value.clone())),
        })
        .collect();

    let created_at = body
        .get(CREATED_AT_FIELD)
        .and_then(|value| match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        })
        .filter(|&ms| ms != 0)
        .unwrap_or(now_ms);

    fields.insert(CREATED_AT_FIELD.to_owned(), Value::from(created_at));
    (fields, created_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_body(message: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "WABA_ID",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {
                            "display_phone_number": "15550001111",
                            "phone_number_id": "PHONE_NUMBER_ID"
                        },
                        "contacts": [{"profile": {"name": "Ana"}, "wa_id": "5211234567"}],
                        "messages": [message]
                    }
                }]
            }]
        }))
        .unwrap()
    }

    fn incoming(body: &[u8]) -> (EventContext, IncomingMessage) {
        match decode_event(body).unwrap() {
            (ctx, Event::IncomingMessage(msg)) => (ctx, msg),
            (_, other) => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn decodes_text_message() {
        let body = message_body(json!({
            "from": "5211234567",
            "id": "wamid.A",
            "timestamp": "1731617831",
            "type": "text",
            "text": {"body": "  hola  "}
        }));

        let (ctx, msg) = incoming(&body);

        assert_eq!(ctx.phone_number_id(), Some("PHONE_NUMBER_ID"));
        assert_eq!(ctx.payload()["entry"][0]["id"], "WABA_ID");
        assert_eq!(msg.id, "wamid.A");
        assert_eq!(msg.from, "5211234567");
        assert_eq!(msg.text.as_deref(), Some("hola"));
        assert_eq!(msg.profile_name.as_deref(), Some("Ana"));
        assert_eq!(msg.timestamp.unwrap().timestamp(), 1_731_617_831);
    }

    #[test]
    fn decodes_interactive_and_button_replies() {
        let (_, msg) = incoming(&message_body(json!({
            "from": "5211234567", "id": "wamid.B", "type": "interactive",
            "interactive": {"type": "button_reply", "button_reply": {"id": "opt_1", "title": "Cotizar"}}
        })));
        assert_eq!(msg.text.as_deref(), Some("Cotizar"));

        let (_, msg) = incoming(&message_body(json!({
            "from": "5211234567", "id": "wamid.C", "type": "interactive",
            "interactive": {"type": "list_reply", "list_reply": {"id": "row_2", "title": "Refacciones"}}
        })));
        assert_eq!(msg.text.as_deref(), Some("Refacciones"));

        let (_, msg) = incoming(&message_body(json!({
            "from": "5211234567", "id": "wamid.D", "type": "button",
            "button": {"payload": "MENU", "text": "Menú"}
        })));
        assert_eq!(msg.text.as_deref(), Some("Menú"));
    }

    #[test]
    fn media_message_has_no_text() {
        let (_, msg) = incoming(&message_body(json!({
            "from": "5211234567", "id": "wamid.E", "type": "image",
            "image": {"id": "MEDIA_ID", "mime_type": "image/jpeg"}
        })));
        assert_eq!(msg.kind, "image");
        assert_eq!(msg.text, None);
    }

    #[test]
    fn decodes_status_callback() {
        let body = json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "WABA_ID", "changes": [{"field": "messages", "value": {
                "messaging_product": "whatsapp",
                "metadata": {"phone_number_id": "PHONE_NUMBER_ID"},
                "statuses": [{"id": "wamid.OUT", "status": "delivered", "recipient_id": "5211234567", "timestamp": "1731617831"}]
            }}]}]
        });

        match decode_event(&serde_json::to_vec(&body).unwrap()).unwrap().1 {
            Event::MessageUpdate(update) => {
                assert_eq!(update.message_id, "wamid.OUT");
                assert_eq!(update.status, "delivered");
                assert!(!update.failed());
            }
            other => panic!("expected a status update, got {other:?}"),
        }
    }

    #[test]
    fn empty_envelopes_are_unsupported() {
        for body in [
            json!({"object": "whatsapp_business_account", "entry": []}),
            json!({"object": "whatsapp_business_account", "entry": [{"id": "1", "changes": []}]}),
            json!({"entry": [{"changes": [{"field": "account_update", "value": {"event": "PARTNER_ADDED"}}]}]}),
        ] {
            let (_, event) = decode_event(&serde_json::to_vec(&body).unwrap()).unwrap();
            assert!(matches!(event, Event::Unsupported));
        }
    }

    #[test]
    fn malformed_envelopes_are_errors() {
        assert!(matches!(
            decode_event(b"not json"),
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode_event(br#"{"object": "page", "entry": []}"#),
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode_event(br#"{"entry": "nope"}"#),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn verification_requires_subscribe_mode_and_token() {
        let state = InnerServer {
            handler: (),
            verify_token: Some("secret".to_owned()),
        };
        let query = |mode: &str, token: &str| VerifyQuery {
            mode: Some(mode.to_owned()),
            verify_token: Some(token.to_owned()),
            challenge: Some("1158201444".to_owned()),
        };

        assert_eq!(
            state.verify(&query("subscribe", "secret")),
            (StatusCode::OK, "1158201444".to_owned())
        );
        assert_eq!(state.verify(&query("subscribe", "wrong")).0, StatusCode::FORBIDDEN);
        assert_eq!(state.verify(&query("unsubscribe", "secret")).0, StatusCode::FORBIDDEN);
        assert_eq!(state.verify(&VerifyQuery::default()).0, StatusCode::FORBIDDEN);

        let unconfigured = InnerServer {
            handler: (),
            verify_token: None,
        };
        assert_eq!(
            unconfigured.verify(&query("subscribe", "")).0,
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn lenient_body_parsing() {
        let object = parse_lenient_object(r#"{"wa_id": "521"}"#).unwrap();
        assert_eq!(object["wa_id"], "521");

        let quoted = parse_lenient_object(r#""{\"wa_id\": \"521\"}""#).unwrap();
        assert_eq!(quoted["wa_id"], "521");

        let noisy = parse_lenient_object("payload=\n{\"wa_id\": \"521\"}\n--end").unwrap();
        assert_eq!(noisy["wa_id"], "521");

        assert!(parse_lenient_object("").unwrap().is_empty());
        assert!(parse_lenient_object("garbage").is_none());
        assert!(parse_lenient_object("[1, 2]").is_none());
        assert!(parse_lenient_object("} backwards {").is_none());
    }

    #[test]
    fn lead_fields_keep_allowed_columns() {
        let body = json!({
            "wa_id": "521",
            "nombre": "Ana",
            "email": null,
            "sucursal": "Centro",
            "password": "x"
        });

        let (fields, created_at) = lead_fields(body.as_object().unwrap(), 1_700_000_000_000);

        assert_eq!(created_at, 1_700_000_000_000);
        assert_eq!(
            Value::Object(fields),
            json!({"wa_id": "521", "nombre": "Ana", "created_at": 1_700_000_000_000i64})
        );
    }

    #[test]
    fn lead_created_at_from_body() {
        let now = 1_700_000_000_000;
        let created = |v: Value| lead_fields(json!({"created_at": v}).as_object().unwrap(), now).1;

        assert_eq!(created(json!(1_600_000_000_000i64)), 1_600_000_000_000);
        assert_eq!(created(json!("1600000000000")), 1_600_000_000_000);
        assert_eq!(created(json!("yesterday")), now);
        assert_eq!(created(json!(0)), now);
    }
}
