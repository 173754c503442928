//! The lead-intake bot.
//!
//! [`LeadBot`] is the [`Handler`] that ties everything together. For every
//! inbound message it runs, under the sender's lock:
//!
//! 1. dedup by message id,
//! 2. session lookup (or creation),
//! 3. one intake transition,
//! 4. the reply through the Graph API,
//! 5. persistence of the lead when the transition completed the flow.
//!
//! With a [`FlowEngineClient`] configured, steps 2 and 3 are replaced by a
//! call to the remote engine.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    bitable::BitableClient,
    client::Client,
    config::Config,
    dedup::{DedupFilter, DEFAULT_DEDUP_TTL},
    error::Error,
    flow_engine::FlowEngineClient,
    intake::{IntakeFlow, LeadRecord, Outcome, Transition},
    server::{EventContext, Handler, IncomingMessage, MessageUpdate},
    session::{InMemorySessionStore, SenderLocks, SessionStore},
};

pub struct LeadBot<S = InMemorySessionStore> {
    client: Client,
    phone_number_id: Option<String>,
    flow: IntakeFlow,
    sessions: S,
    dedup: DedupFilter,
    locks: SenderLocks,
    bitable: Option<BitableClient>,
    flow_engine: Option<FlowEngineClient>,
}

impl LeadBot {
    pub fn builder(client: Client) -> LeadBotBuilder {
        LeadBotBuilder {
            client,
            phone_number_id: None,
            flow: None,
            sessions: InMemorySessionStore::default(),
            dedup_ttl: DEFAULT_DEDUP_TTL,
            bitable: None,
            flow_engine: None,
        }
    }

    /// Builds the bot and its outbound clients from environment configuration.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let client = Client::builder()
            .auth(&config.whatsapp.access_token)
            .api_version(&config.whatsapp.api_version)
            .timeout(config.http_timeout)
            .build()?;

        let mut builder = Self::builder(client)
            .sessions(InMemorySessionStore::new(config.session_ttl))
            .dedup_ttl(config.dedup_ttl);

        if let Some(id) = &config.whatsapp.phone_number_id {
            builder = builder.phone_number_id(id);
        }
        if let Some(lark) = &config.lark {
            builder = builder.bitable(
                BitableClient::builder()
                    .credentials(&lark.app_id, &lark.app_secret)
                    .table(&lark.app_token, &lark.table_id)
                    .api_base(&lark.api_base)
                    .timeout(config.http_timeout)
                    .build()?,
            );
        }
        if let Some(engine) = &config.flow_engine {
            builder = builder.flow_engine(FlowEngineClient::with_timeout(
                &engine.url,
                engine.secret.clone(),
                Some(config.http_timeout),
            )?);
        }

        Ok(builder.build())
    }
}

impl<S: SessionStore> LeadBot<S> {
    pub fn flow(&self) -> &IntakeFlow {
        &self.flow
    }

    pub fn sessions(&self) -> &S {
        &self.sessions
    }

    pub fn bitable(&self) -> Option<&BitableClient> {
        self.bitable.as_ref()
    }

    /// Runs one intake transition for `sender` and saves the session.
    ///
    /// A reset keyword replaces the stored session before the transition. A
    /// sender without a live session gets a fresh one and the text is taken
    /// as the first answer; if it does not parse, the reply is the welcome
    /// plus the first prompt.
    pub async fn advance(&self, sender: &str, text: &str) -> Transition {
        let first = self.flow.first_step();
        let (mut session, created) = if self.flow.is_reset(text) {
            (self.sessions.reset(sender, first).await, true)
        } else {
            self.sessions.get_or_create(sender, first).await
        };

        if !created {
            debug!(
                sender,
                idle_secs = session.idle_for(Utc::now()).as_secs(),
                "resuming session"
            );
        }

        let mut transition = self.flow.advance(&mut session, text);
        if created && matches!(transition.outcome, Outcome::Reprompt { .. }) {
            transition = self.flow.start(&mut session);
        }

        debug!(
            sender,
            step = %session.step,
            outcome = ?transition.outcome,
            "intake transition"
        );
        // Saved before any persistence so a completed flow never completes twice.
        self.sessions.save(session).await;
        transition
    }

    /// Writes a completed lead to the record store.
    pub async fn persist(&self, lead: &LeadRecord) -> Result<(), Error> {
        let Some(bitable) = &self.bitable else {
            warn!(
                sender = %lead.sender_id,
                fields = %serde_json::Value::Object(lead.to_fields()),
                "no record store configured, lead dropped"
            );
            return Ok(());
        };

        let record_id = bitable.create_record(lead.to_fields()).await?;
        info!(sender = %lead.sender_id, record_id = %record_id, "lead stored");
        Ok(())
    }

    async fn reply_for(
        &self,
        ctx: &EventContext,
        msg: &IncomingMessage,
    ) -> (String, Option<LeadRecord>) {
        if let Some(engine) = &self.flow_engine {
            return (engine.reply_or_fallback(ctx.payload()).await, None);
        }

        let text = msg.text.as_deref().unwrap_or_default();
        let transition = self.advance(&msg.from, text).await;
        match transition.outcome {
            Outcome::Completed(lead) => (transition.reply, Some(lead)),
            _ => (transition.reply, None),
        }
    }
}

impl<S: SessionStore + 'static> Handler for LeadBot<S> {
    async fn handle_message(&self, ctx: EventContext, msg: IncomingMessage) -> Result<(), Error> {
        // The remote engine sees every message; the local flow only text.
        if self.flow_engine.is_none() && msg.text.is_none() {
            debug!(message_id = %msg.id, kind = %msg.kind, "message without text ignored");
            return Ok(());
        }

        if !self.dedup.check_and_remember(&msg.id) {
            debug!(message_id = %msg.id, "duplicate delivery dropped");
            return Ok(());
        }

        let Some(from_number) = self
            .phone_number_id
            .as_deref()
            .or(ctx.phone_number_id())
            .map(str::to_owned)
        else {
            warn!(message_id = %msg.id, "no phone number id to reply from, message skipped");
            return Ok(());
        };

        let _guard = self.locks.lock(&msg.from).await;
        let (reply, lead) = self.reply_for(&ctx, &msg).await;

        let sent = self
            .client
            .message(from_number)
            .send_text(&msg.from, reply)
            .await
            .map(|created| debug!(sender = %msg.from, reply = %created, "reply sent"));

        let persisted = match &lead {
            Some(lead) => self.persist(lead).await,
            None => Ok(()),
        };

        match (sent, persisted) {
            (Err(send), Err(persist)) => {
                warn!(sender = %msg.from, error = %persist, "lead persistence failed");
                Err(send)
            }
            (sent, persisted) => sent.and(persisted),
        }
    }

    async fn handle_message_update(
        &self,
        _ctx: EventContext,
        update: MessageUpdate,
    ) -> Result<(), Error> {
        if update.failed() {
            warn!(message_id = %update.message_id, "outbound message failed to deliver");
        } else {
            debug!(message_id = %update.message_id, status = %update.status, "status update");
        }
        Ok(())
    }
}

/// Builder for [`LeadBot`].
#[must_use]
pub struct LeadBotBuilder<S = InMemorySessionStore> {
    client: Client,
    phone_number_id: Option<String>,
    flow: Option<IntakeFlow>,
    sessions: S,
    dedup_ttl: Duration,
    bitable: Option<BitableClient>,
    flow_engine: Option<FlowEngineClient>,
}

impl<S: SessionStore> LeadBotBuilder<S> {
    /// Sending phone number id. Overrides the one in each envelope.
    pub fn phone_number_id(mut self, id: impl Into<String>) -> Self {
        self.phone_number_id = Some(id.into());
        self
    }

    /// Replaces the default intake flow.
    pub fn flow(mut self, flow: IntakeFlow) -> Self {
        self.flow = Some(flow);
        self
    }

    /// Replaces the session store.
    pub fn sessions<T: SessionStore>(self, sessions: T) -> LeadBotBuilder<T> {
        LeadBotBuilder {
            client: self.client,
            phone_number_id: self.phone_number_id,
            flow: self.flow,
            sessions,
            dedup_ttl: self.dedup_ttl,
            bitable: self.bitable,
            flow_engine: self.flow_engine,
        }
    }

    pub fn dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Record store for completed leads.
    pub fn bitable(mut self, bitable: BitableClient) -> Self {
        self.bitable = Some(bitable);
        self
    }

    /// Hands every message to a remote flow engine instead of the local flow.
    pub fn flow_engine(mut self, engine: FlowEngineClient) -> Self {
        self.flow_engine = Some(engine);
        self
    }

    pub fn build(self) -> LeadBot<S> {
        LeadBot {
            client: self.client,
            phone_number_id: self.phone_number_id,
            flow: self.flow.unwrap_or_default(),
            sessions: self.sessions,
            dedup: DedupFilter::new(self.dedup_ttl),
            locks: SenderLocks::new(),
            bitable: self.bitable,
            flow_engine: self.flow_engine,
        }
    }
}
