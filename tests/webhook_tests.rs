mod common;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::*;
use serde_json::{json, Value};
use whatsapp_leads_rs::{
    flow_engine::{FlowEngineClient, FALLBACK_REPLY},
    intake::Step,
    session::SessionStore,
    LeadBot, Server,
};
use wiremock::{
    matchers::{body_json, body_partial_json, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const WEBHOOK: &str = "/webhook";

fn app(bot: impl whatsapp_leads_rs::WebhookHandler + 'static) -> Router {
    Server::builder()
        .route(WEBHOOK)
        .verify_token(VERIFY_TOKEN)
        .build()
        .router(bot)
}

async fn mount_send(server: &MockServer, expect: u64) {
    Mock::given(method("POST"))
        .and(path(messages_path()))
        .respond_with(send_ok("wamid.reply"))
        .expect(expect)
        .mount(server)
        .await;
}

/// Text bodies of every outbound message, in the order they were sent.
async fn sent_texts(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == messages_path())
        .map(|request| {
            let body: Value = request.body_json().unwrap();
            assert_eq!(body["to"], RECIPIENT_ID);
            body["text"]["body"].as_str().unwrap().to_owned()
        })
        .collect()
}

async fn deliver(app: &Router, id: &str, text: &str) {
    let (status, body) = post_json(app, WEBHOOK, &text_message(RECIPIENT_ID, id, text)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "EVENT_RECEIVED");
}

#[tokio::test]
async fn test_verification_handshake() {
    let mock_server = MockServer::start().await;
    let app = app(LeadBot::builder(graph_client(&mock_server)).build());

    let uri = format!(
        "{WEBHOOK}?hub.mode=subscribe&hub.verify_token={VERIFY_TOKEN}&hub.challenge=1158201444"
    );
    let (status, body) = call(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "1158201444");

    let uri = format!("{WEBHOOK}?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1");
    let (status, _) = call(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let uri = format!("{WEBHOOK}?hub.mode=unsubscribe&hub.verify_token={VERIFY_TOKEN}&hub.challenge=1");
    let (status, _) = call(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&app, Request::get(WEBHOOK).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health() {
    let mock_server = MockServer::start().await;
    let app = app(LeadBot::builder(graph_client(&mock_server)).build());

    let (status, body) = call(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_malformed_and_foreign_deliveries_are_acknowledged() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 0).await;
    let app = app(LeadBot::builder(graph_client(&mock_server)).build());

    let request = Request::post(WEBHOOK).body(Body::from("{not json")).unwrap();
    let (status, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "EVENT_RECEIVED");

    let (status, _) = post_json(&app, WEBHOOK, &json!({"object": "page", "entry": []})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post_json(
        &app,
        WEBHOOK,
        &json!({"object": "whatsapp_business_account", "entry": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_status_callback_sends_nothing() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 0).await;
    let bot = Arc::new(LeadBot::builder(graph_client(&mock_server)).build());
    let app = app(bot.clone());

    let (status, _) = post_json(&app, WEBHOOK, &status_callback("wamid.out1")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(bot.sessions().is_empty());
}

#[tokio::test]
async fn test_duplicate_delivery_is_answered_once() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 1).await;
    let bot = Arc::new(LeadBot::builder(graph_client(&mock_server)).build());
    let app = app(bot.clone());

    deliver(&app, "wamid.in1", "hola").await;
    deliver(&app, "wamid.in1", "hola").await;

    let session = bot.sessions().get(RECIPIENT_ID).await.unwrap();
    assert_eq!(session.step, Step::AskProductInterest);
}

#[tokio::test]
async fn test_full_intake_is_persisted_once() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 11).await;
    mount_tenant_token(&mock_server, 1).await;
    Mock::given(method("POST"))
        .and(path(records_path()))
        .and(body_partial_json(json!({"fields": {
            "wa_id": RECIPIENT_ID,
            "producto_interes": "Montacargas",
            "intencion_cliente": "Cotizar",
            "nombre": "Ana",
            "empresa": "Acme",
            "ubicacion": "CDMX",
            "telefono": "5511112222",
            "email": "ana@acme.com"
        }})))
        .respond_with(record_ok("recLead1", json!({})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let bot = Arc::new(
        LeadBot::builder(graph_client(&mock_server))
            .bitable(bitable_client(&mock_server))
            .build(),
    );
    let app = app(bot.clone());

    let answers = [
        "hola",
        "1",
        "cotizar",
        "Ana",
        "Acme",
        "CDMX",
        "55-1111-2222",
        "ana@acme.com",
    ];
    for (i, text) in answers.iter().enumerate() {
        deliver(&app, &format!("wamid.in{i}"), text).await;
    }

    let session = bot.sessions().get(RECIPIENT_ID).await.unwrap();
    assert_eq!(session.step, Step::Completed);

    // Further answers neither advance nor persist again.
    deliver(&app, "wamid.in8", "otra cosa").await;
    deliver(&app, "wamid.in9", "ana@acme.com").await;

    // A reset keyword starts over.
    deliver(&app, "wamid.in10", "menu").await;
    let session = bot.sessions().get(RECIPIENT_ID).await.unwrap();
    assert_eq!(session.step, Step::AskProductInterest);
    assert!(session.answers.is_empty());

    let texts = sent_texts(&mock_server).await;
    assert_eq!(texts.len(), 11);
    assert!(texts[0].ends_with(&bot.flow().prompt(Step::AskProductInterest)));
    assert_eq!(texts[1], bot.flow().prompt(Step::AskUserIntent));
    assert_eq!(texts[6], bot.flow().prompt(Step::AskEmail));
    assert!(texts[7].starts_with("¡Gracias, Ana!"));
    assert!(texts[7].contains("ana@acme.com"));
    assert_eq!(texts[8], texts[9]);
    assert_eq!(texts[8], bot.flow().prompt(Step::Completed));
    assert_eq!(texts[10], texts[0]);
}

#[tokio::test]
async fn test_invalid_answer_is_reprompted() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 3).await;
    let bot = Arc::new(LeadBot::builder(graph_client(&mock_server)).build());
    let app = app(bot.clone());

    deliver(&app, "wamid.a", "hola").await;
    deliver(&app, "wamid.b", "9").await;
    deliver(&app, "wamid.c", "no sé").await;

    let texts = sent_texts(&mock_server).await;
    let prompt = bot.flow().prompt(Step::AskProductInterest);
    assert_eq!(texts[1], prompt);
    assert_eq!(texts[2], prompt);

    let session = bot.sessions().get(RECIPIENT_ID).await.unwrap();
    assert_eq!(session.step, Step::AskProductInterest);
}

#[tokio::test]
async fn test_completed_lead_without_record_store() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 8).await;
    Mock::given(method("POST"))
        .and(path(token_path()))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;

    let bot = Arc::new(LeadBot::builder(graph_client(&mock_server)).build());
    let app = app(bot.clone());

    for (i, text) in ["hola", "2", "3", "Luis", "Grúas SA", "Monterrey", "8181818181", "luis@gruas.mx"]
        .iter()
        .enumerate()
    {
        deliver(&app, &format!("wamid.x{i}"), text).await;
    }

    let session = bot.sessions().get(RECIPIENT_ID).await.unwrap();
    assert_eq!(session.step, Step::Completed);
}

#[tokio::test]
async fn test_failed_send_still_acknowledges() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(messages_path()))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Invalid OAuth access token.", "type": "OAuthException", "code": 190}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let bot = Arc::new(LeadBot::builder(graph_client(&mock_server)).build());
    let app = app(bot.clone());

    deliver(&app, "wamid.f1", "hola").await;

    // The transition is kept even though the reply never left.
    assert!(bot.sessions().get(RECIPIENT_ID).await.is_some());
}

#[tokio::test]
async fn test_missing_phone_number_id_skips_reply() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 0).await;
    let bot = Arc::new(LeadBot::builder(graph_client(&mock_server)).build());
    let app = app(bot.clone());

    let mut payload = text_message(RECIPIENT_ID, "wamid.m1", "hola");
    payload["entry"][0]["changes"][0]["value"]
        .as_object_mut()
        .unwrap()
        .remove("metadata");

    let (status, _) = post_json(&app, WEBHOOK, &payload).await;

    assert_eq!(status, StatusCode::OK);
    assert!(bot.sessions().get(RECIPIENT_ID).await.is_none());
}

#[tokio::test]
async fn test_configured_phone_number_id_wins() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v{API_VERSION}/configured_id/messages")))
        .respond_with(send_ok("wamid.reply"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let bot = LeadBot::builder(graph_client(&mock_server))
        .phone_number_id("configured_id")
        .build();
    let app = app(bot);

    deliver(&app, "wamid.p1", "hola").await;
}

#[tokio::test]
async fn test_flow_engine_replaces_local_flow() {
    let mock_server = MockServer::start().await;
    let payload = text_message(RECIPIENT_ID, "wamid.e1", "hola");

    Mock::given(method("POST"))
        .and(path("/engine"))
        .and(query_param("secret", "s3cret"))
        .and(body_json(&payload))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"reply": "Hola desde el motor"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    mount_send(&mock_server, 1).await;

    let engine =
        FlowEngineClient::new(format!("{}/engine", mock_server.uri()), Some("s3cret".into()))
            .unwrap();
    let bot = Arc::new(
        LeadBot::builder(graph_client(&mock_server))
            .flow_engine(engine)
            .build(),
    );
    let app = app(bot.clone());

    let (status, _) = post_json(&app, WEBHOOK, &payload).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent_texts(&mock_server).await, ["Hola desde el motor"]);
    assert!(bot.sessions().get(RECIPIENT_ID).await.is_none());
}

#[tokio::test]
async fn test_flow_engine_failure_uses_fallback() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/engine"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;
    mount_send(&mock_server, 1).await;

    let engine = FlowEngineClient::new(format!("{}/engine", mock_server.uri()), None).unwrap();
    let app = app(
        LeadBot::builder(graph_client(&mock_server))
            .flow_engine(engine)
            .build(),
    );

    deliver(&app, "wamid.e2", "hola").await;

    assert_eq!(sent_texts(&mock_server).await, [FALLBACK_REPLY]);
}

#[tokio::test]
async fn test_first_message_is_taken_as_an_answer() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 1).await;
    let bot = Arc::new(LeadBot::builder(graph_client(&mock_server)).build());
    let app = app(bot.clone());

    deliver(&app, "wamid.n1", "Montacargas").await;

    let session = bot.sessions().get(RECIPIENT_ID).await.unwrap();
    assert_eq!(session.step, Step::AskUserIntent);
    assert_eq!(
        sent_texts(&mock_server).await,
        [bot.flow().prompt(Step::AskUserIntent)]
    );
}

#[tokio::test]
async fn test_failed_persistence_is_not_retried() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 9).await;
    mount_tenant_token(&mock_server, 1).await;
    Mock::given(method("POST"))
        .and(path(records_path()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1254045,
            "msg": "FieldNameNotFound",
            "data": {}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let bot = Arc::new(
        LeadBot::builder(graph_client(&mock_server))
            .bitable(bitable_client(&mock_server))
            .build(),
    );
    let app = app(bot.clone());

    let answers = [
        "hola",
        "1",
        "cotizar",
        "Ana",
        "Acme",
        "CDMX",
        "5511112222",
        "ana@acme.com",
    ];
    for (i, text) in answers.iter().enumerate() {
        deliver(&app, &format!("wamid.r{i}"), text).await;
    }

    let session = bot.sessions().get(RECIPIENT_ID).await.unwrap();
    assert_eq!(session.step, Step::Completed);

    // Answering again only gets the "already registered" reply.
    deliver(&app, "wamid.r8", "ana@acme.com").await;

    let session = bot.sessions().get(RECIPIENT_ID).await.unwrap();
    assert_eq!(session.step, Step::Completed);
    let texts = sent_texts(&mock_server).await;
    assert!(texts[7].starts_with("¡Gracias, Ana!"));
    assert_eq!(texts[8], bot.flow().prompt(Step::Completed));
}

#[tokio::test]
async fn test_flow_engine_receives_messages_without_text() {
    let mock_server = MockServer::start().await;
    let mut payload = text_message(RECIPIENT_ID, "wamid.img1", "");
    payload["entry"][0]["changes"][0]["value"]["messages"][0] = json!({
        "from": RECIPIENT_ID,
        "id": "wamid.img1",
        "timestamp": "1731617831",
        "type": "image",
        "image": {"id": "1479537139650973", "mime_type": "image/jpeg"}
    });

    Mock::given(method("POST"))
        .and(path("/engine"))
        .and(body_json(&payload))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"reply": "Recibimos tu foto"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    mount_send(&mock_server, 1).await;

    let engine = FlowEngineClient::new(format!("{}/engine", mock_server.uri()), None).unwrap();
    let app = app(
        LeadBot::builder(graph_client(&mock_server))
            .flow_engine(engine)
            .build(),
    );

    let (status, _) = post_json(&app, WEBHOOK, &payload).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent_texts(&mock_server).await, ["Recibimos tu foto"]);
}

#[tokio::test]
async fn test_local_flow_ignores_messages_without_text() {
    let mock_server = MockServer::start().await;
    mount_send(&mock_server, 0).await;
    let bot = Arc::new(LeadBot::builder(graph_client(&mock_server)).build());
    let app = app(bot.clone());

    let mut payload = text_message(RECIPIENT_ID, "wamid.img2", "");
    payload["entry"][0]["changes"][0]["value"]["messages"][0]["type"] = json!("image");
    payload["entry"][0]["changes"][0]["value"]["messages"][0]
        .as_object_mut()
        .unwrap()
        .remove("text");

    let (status, _) = post_json(&app, WEBHOOK, &payload).await;

    assert_eq!(status, StatusCode::OK);
    assert!(bot.sessions().get(RECIPIENT_ID).await.is_none());
}

#[tokio::test]
async fn test_root_health() {
    let mock_server = MockServer::start().await;
    let app = app(LeadBot::builder(graph_client(&mock_server)).build());

    let (status, body) = call(&app, Request::get("/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}
