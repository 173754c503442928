use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{Slot, SENDER_FIELD};
use crate::bitable::{Fields, CREATED_AT_FIELD};

/// The artifact of a completed intake: every captured answer plus who sent
/// it and when the flow finished.
///
/// Built exactly once per completed session and handed to the record store;
/// nothing here mutates it afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct LeadRecord {
    pub sender_id: String,
    pub answers: BTreeMap<Slot, String>,
    pub completed_at: DateTime<Utc>,
}

impl LeadRecord {
    pub fn get(&self, slot: Slot) -> Option<&str> {
        self.answers.get(&slot).map(String::as_str)
    }

    /// The Bitable row: `wa_id`, one column per answer, and `created_at` in
    /// epoch milliseconds.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(SENDER_FIELD.to_owned(), Value::from(self.sender_id.as_str()));
        for (slot, value) in &self.answers {
            fields.insert(slot.field_name().to_owned(), Value::from(value.as_str()));
        }
        fields.insert(
            CREATED_AT_FIELD.to_owned(),
            Value::from(self.completed_at.timestamp_millis()),
        );
        fields
    }

    /// Human-readable confirmation sent back to the user.
    pub fn summary(&self) -> String {
        let mut summary = match self.get(Slot::Name) {
            Some(name) => format!("¡Gracias, {name}! Registramos tus datos:"),
            None => "¡Gracias! Registramos tus datos:".to_owned(),
        };
        for (slot, value) in &self.answers {
            summary.push_str(&format!("\n• {}: {}", slot.label(), value));
        }
        summary.push_str("\n\nUn asesor te contactará pronto.");
        summary
    }
}
