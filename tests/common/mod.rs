#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use whatsapp_leads_rs::{BitableClient, Client};
use wiremock::{
    matchers::{body_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

// --- CONSTANTS ---
pub const ACCESS_TOKEN: &str = "EAAD...";
pub const API_VERSION: &str = "22.0";
pub const PHONE_ID: &str = "phone_id_222";
pub const RECIPIENT_ID: &str = "5211234567";
pub const VERIFY_TOKEN: &str = "jc_verify_123";

pub const LARK_APP_ID: &str = "cli_a1b2c3";
pub const LARK_APP_SECRET: &str = "lark_secret";
pub const LARK_APP_TOKEN: &str = "bascnAppToken";
pub const LARK_TABLE_ID: &str = "tblLeads";
pub const TENANT_TOKEN: &str = "t-g1044ab";

pub const LEADS_API_KEY: &str = "leads-key";

// --- PATHS ---
pub fn messages_path() -> String {
    format!("/v{API_VERSION}/{PHONE_ID}/messages")
}

pub fn token_path() -> &'static str {
    "/auth/v3/tenant_access_token/internal"
}

pub fn records_path() -> String {
    format!("/bitable/v1/apps/{LARK_APP_TOKEN}/tables/{LARK_TABLE_ID}/records")
}

// --- CLIENTS ---
pub fn graph_client(server: &MockServer) -> Client {
    Client::builder()
        .base_url(server.uri())
        .api_version(API_VERSION)
        .auth(ACCESS_TOKEN)
        .build()
        .unwrap()
}

pub fn bitable_client(server: &MockServer) -> BitableClient {
    BitableClient::builder()
        .credentials(LARK_APP_ID, LARK_APP_SECRET)
        .table(LARK_APP_TOKEN, LARK_TABLE_ID)
        .api_base(server.uri())
        .build()
        .unwrap()
}

// --- MOCKS ---
pub async fn mount_tenant_token(server: &MockServer, expect: u64) {
    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_json(json!({
            "app_id": LARK_APP_ID,
            "app_secret": LARK_APP_SECRET
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "msg": "ok",
            "tenant_access_token": TENANT_TOKEN,
            "expire": 7200
        })))
        .expect(expect)
        .mount(server)
        .await;
}

pub fn send_ok(message_id: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "messaging_product": "whatsapp",
        "contacts": [{"input": RECIPIENT_ID, "wa_id": RECIPIENT_ID}],
        "messages": [{"id": message_id}]
    }))
}

pub fn record_ok(record_id: &str, fields: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "code": 0,
        "msg": "success",
        "data": {"record": {"record_id": record_id, "fields": fields}}
    }))
}

// --- WEBHOOK PAYLOADS ---
pub fn text_message(from: &str, id: &str, text: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA_ID",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {
                        "display_phone_number": "15550001111",
                        "phone_number_id": PHONE_ID
                    },
                    "contacts": [{"profile": {"name": "Ana"}, "wa_id": from}],
                    "messages": [{
                        "from": from,
                        "id": id,
                        "timestamp": "1731617831",
                        "type": "text",
                        "text": {"body": text}
                    }]
                }
            }]
        }]
    })
}

pub fn status_callback(message_id: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA_ID",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"phone_number_id": PHONE_ID},
                    "statuses": [{
                        "id": message_id,
                        "status": "delivered",
                        "timestamp": "1731617831",
                        "recipient_id": RECIPIENT_ID
                    }]
                }
            }]
        }]
    })
}

// --- REQUESTS ---
pub async fn call(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

pub async fn post_json(app: &Router, uri: &str, body: &Value) -> (StatusCode, String) {
    call(
        app,
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}
