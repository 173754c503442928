//! The lead-intake state machine.
//!
//! A conversation is a strictly linear walk over a table of [`StepSpec`]s.
//! Each inbound message is one transition: the answer is parsed according to
//! the current step, stored under the step's [`Slot`] and the session moves to
//! the next row. After the last row the session is [`Step::Completed`] and the
//! transition carries the [`LeadRecord`] to persist.
//!
//! ```text
//! ASK_PRODUCT_INTEREST -> ASK_USER_INTENT -> ASK_NAME -> ASK_COMPANY
//!     -> ASK_LOCATION -> ASK_PHONE -> ASK_EMAIL -> COMPLETED
//! ```
//!
//! A reset keyword (`menu`, `hola`, ...) wins over everything and starts over.
//! An answer that does not parse leaves the step untouched and repeats its
//! prompt.
//!
//! # Example
//!
//! ```rust
//! use whatsapp_leads_rs::intake::{IntakeFlow, Outcome, Step};
//! use whatsapp_leads_rs::session::Session;
//!
//! let flow = IntakeFlow::default();
//! let mut session = Session::new("5211234567", flow.first_step());
//!
//! let transition = flow.advance(&mut session, "1");
//! assert!(matches!(transition.outcome, Outcome::Advanced { .. }));
//! assert_eq!(session.step, Step::AskUserIntent);
//! ```

mod lead;
mod parse;
mod step;

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;

pub use lead::LeadRecord;
pub use parse::{normalize, parse_choice, parse_email, parse_phone, parse_text};
pub use step::{Answer, Choice, Slot, Step, StepSpec};

use crate::session::Session;

/// Column the sender's WhatsApp id is stored under.
pub const SENDER_FIELD: &str = "wa_id";

const DEFAULT_RESET_KEYWORDS: &[&str] = &[
    "menu",
    "reset",
    "reiniciar",
    "inicio",
    "hola",
    "buenas",
    "buenos dias",
    "buenas tardes",
    "buenas noches",
];

const DEFAULT_WELCOME: &str = "¡Hola! Gracias por escribirnos. Te haremos unas preguntas rápidas para que un asesor pueda atenderte.";

const DEFAULT_ALREADY_COMPLETED: &str =
    "Ya tenemos tu registro y un asesor te contactará pronto. Escribe *menu* si quieres comenzar de nuevo.";

/// Result of feeding one message to the machine.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    /// Text to send back to the user.
    pub reply: String,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The session was (re)initialized at the first step.
    Started,
    /// The answer was accepted.
    Advanced { from: Step, to: Step },
    /// The answer did not parse; the step is unchanged.
    Reprompt { step: Step },
    /// The last answer was accepted. Persist the lead exactly once.
    Completed(LeadRecord),
    /// The session had already completed; nothing changed.
    AlreadyCompleted,
}

impl Transition {
    /// The lead to persist, present only on the completing transition.
    pub fn lead(&self) -> Option<&LeadRecord> {
        match &self.outcome {
            Outcome::Completed(lead) => Some(lead),
            _ => None,
        }
    }
}

/// Why an [`IntakeFlow`] table was rejected.
#[derive(thiserror::Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum FlowError {
    #[error("an intake flow needs at least one step")]
    Empty,
    #[error("step {0} appears more than once")]
    DuplicateStep(Step),
    #[error("slot `{}` is filled by more than one step", .0.field_name())]
    DuplicateSlot(Slot),
    #[error("COMPLETED is implicit and cannot be listed as a step")]
    TerminalStep,
    #[error("step {0} offers no options")]
    NoOptions(Step),
}

/// The configured transition table plus the fixed texts around it.
#[derive(Clone, Debug)]
pub struct IntakeFlow {
    steps: Vec<StepSpec>,
    reset_keywords: HashSet<String>,
    welcome: String,
    already_completed: String,
}

impl Default for IntakeFlow {
    /// Product interest, intent, name, company, location, phone, email.
    fn default() -> Self {
        Self::builder()
            .step(StepSpec::new(
                Step::AskProductInterest,
                Slot::ProductInterest,
                "¿Qué producto te interesa? Responde con el número de la opción:",
                Answer::Choice(vec![
                    Choice::new("Montacargas").keywords(["montacarga", "forklift"]),
                    Choice::new("Refacciones").keywords(["refaccion", "repuestos", "partes"]),
                    Choice::new("Servicio y mantenimiento")
                        .keywords(["servicio", "mantenimiento", "reparacion"]),
                    Choice::new("Renta de equipo").keywords(["renta", "rentar", "alquiler"]),
                ]),
            ))
            .step(StepSpec::new(
                Step::AskUserIntent,
                Slot::UserIntent,
                "¿Qué te gustaría hacer?",
                Answer::Choice(vec![
                    Choice::new("Cotizar").keywords(["cotizacion", "precio", "precios"]),
                    Choice::new("Recibir información").keywords(["informacion", "info"]),
                    Choice::new("Hablar con un asesor").keywords(["asesor", "llamada", "llamar"]),
                ]),
            ))
            .step(StepSpec::new(
                Step::AskName,
                Slot::Name,
                "¿Cuál es tu nombre completo?",
                Answer::DEFAULT_TEXT,
            ))
            .step(StepSpec::new(
                Step::AskCompany,
                Slot::Company,
                "¿Cómo se llama tu empresa?",
                Answer::DEFAULT_TEXT,
            ))
            .step(StepSpec::new(
                Step::AskLocation,
                Slot::Location,
                "¿En qué ciudad o estado te encuentras?",
                Answer::DEFAULT_TEXT,
            ))
            .step(StepSpec::new(
                Step::AskPhone,
                Slot::Phone,
                "¿A qué número de teléfono te podemos contactar?",
                Answer::DEFAULT_PHONE,
            ))
            .step(StepSpec::new(
                Step::AskEmail,
                Slot::Email,
                "Por último, ¿cuál es tu correo electrónico?",
                Answer::Email,
            ))
            .build()
            .expect("default intake flow is valid")
    }
}

impl IntakeFlow {
    pub fn builder() -> IntakeFlowBuilder {
        IntakeFlowBuilder::default()
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn first_step(&self) -> Step {
        self.steps[0].step
    }

    pub fn step_spec(&self, step: Step) -> Option<&StepSpec> {
        self.steps.iter().find(|spec| spec.step == step)
    }

    /// The step after `step`, or `Completed` after the last row.
    pub fn next_step(&self, step: Step) -> Step {
        self.steps
            .iter()
            .position(|spec| spec.step == step)
            .and_then(|i| self.steps.get(i + 1))
            .map_or(Step::Completed, |spec| spec.step)
    }

    /// The text asked at `step`.
    pub fn prompt(&self, step: Step) -> String {
        match self.step_spec(step) {
            Some(spec) => spec.prompt(),
            None => self.already_completed.clone(),
        }
    }

    /// Whether the whole message is a reset keyword.
    pub fn is_reset(&self, text: &str) -> bool {
        self.reset_keywords.contains(&normalize(text))
    }

    /// Puts `session` at the first step with no answers and greets.
    pub fn start(&self, session: &mut Session) -> Transition {
        session.restart(self.first_step());
        Transition {
            reply: format!("{}\n\n{}", self.welcome, self.prompt(self.first_step())),
            outcome: Outcome::Started,
        }
    }

    /// Feeds one inbound message to the machine.
    pub fn advance(&self, session: &mut Session, text: &str) -> Transition {
        if self.is_reset(text) {
            return self.start(session);
        }

        if session.step.is_terminal() {
            return Transition {
                reply: self.already_completed.clone(),
                outcome: Outcome::AlreadyCompleted,
            };
        }

        // A step this table does not know (e.g. the flow was reconfigured).
        let Some(spec) = self.step_spec(session.step) else {
            return self.start(session);
        };

        session.touch();
        let Some(value) = Self::parse(&spec.answer, text) else {
            return Transition {
                reply: spec.prompt(),
                outcome: Outcome::Reprompt { step: spec.step },
            };
        };

        let from = spec.step;
        session.answers.insert(spec.slot, value);
        session.step = self.next_step(from);

        if session.step.is_terminal() {
            let lead = LeadRecord {
                sender_id: session.sender_id.clone(),
                answers: self
                    .steps
                    .iter()
                    .filter_map(|spec| {
                        session
                            .answers
                            .get(&spec.slot)
                            .map(|value| (spec.slot, value.clone()))
                    })
                    .collect::<BTreeMap<_, _>>(),
                completed_at: Utc::now(),
            };
            Transition {
                reply: lead.summary(),
                outcome: Outcome::Completed(lead),
            }
        } else {
            Transition {
                reply: self.prompt(session.step),
                outcome: Outcome::Advanced {
                    from,
                    to: session.step,
                },
            }
        }
    }

    fn parse(answer: &Answer, text: &str) -> Option<String> {
        match answer {
            Answer::Choice(options) => parse_choice(text, options).map(|c| c.label().to_owned()),
            Answer::Text { min_len } => parse_text(text, *min_len),
            Answer::Phone { min_digits } => parse_phone(text, *min_digits),
            Answer::Email => parse_email(text),
        }
    }
}

/// Builder for a custom [`IntakeFlow`].
///
/// ```rust
/// use whatsapp_leads_rs::intake::{Answer, Choice, IntakeFlow, Slot, Step, StepSpec};
///
/// let flow = IntakeFlow::builder()
///     .step(StepSpec::new(
///         Step::AskBranch,
///         Slot::Branch,
///         "¿Qué sucursal te queda más cerca?",
///         Answer::Choice(vec![Choice::new("CDMX"), Choice::new("Monterrey")]),
///     ))
///     .step(StepSpec::new(Step::AskName, Slot::Name, "¿Tu nombre?", Answer::DEFAULT_TEXT))
///     .build()
///     .unwrap();
/// assert_eq!(flow.first_step(), Step::AskBranch);
/// ```
#[derive(Debug, Default)]
#[must_use]
pub struct IntakeFlowBuilder {
    steps: Vec<StepSpec>,
    reset_keywords: Option<Vec<String>>,
    welcome: Option<String>,
    already_completed: Option<String>,
}

impl IntakeFlowBuilder {
    /// Appends a row to the table.
    pub fn step(mut self, spec: StepSpec) -> Self {
        self.steps.push(spec);
        self
    }

    /// Replaces the default reset keywords.
    pub fn reset_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reset_keywords = Some(keywords.into_iter().map(Into::into).collect());
        self
    }

    /// Greeting placed before the first prompt on (re)start.
    pub fn welcome(mut self, welcome: impl Into<String>) -> Self {
        self.welcome = Some(welcome.into());
        self
    }

    /// Reply sent to a completed session.
    pub fn already_completed(mut self, text: impl Into<String>) -> Self {
        self.already_completed = Some(text.into());
        self
    }

    pub fn build(self) -> Result<IntakeFlow, FlowError> {
        if self.steps.is_empty() {
            return Err(FlowError::Empty);
        }

        let mut steps = HashSet::new();
        let mut slots = HashSet::new();
        for spec in &self.steps {
            if spec.step.is_terminal() {
                return Err(FlowError::TerminalStep);
            }
            if !steps.insert(spec.step) {
                return Err(FlowError::DuplicateStep(spec.step));
            }
            if !slots.insert(spec.slot) {
                return Err(FlowError::DuplicateSlot(spec.slot));
            }
            if matches!(&spec.answer, Answer::Choice(options) if options.is_empty()) {
                return Err(FlowError::NoOptions(spec.step));
            }
        }

        let reset_keywords = match self.reset_keywords {
            Some(keywords) => keywords.iter().map(|k| normalize(k)).collect(),
            None => DEFAULT_RESET_KEYWORDS.iter().map(|k| normalize(k)).collect(),
        };

        Ok(IntakeFlow {
            steps: self.steps,
            reset_keywords,
            welcome: self.welcome.unwrap_or_else(|| DEFAULT_WELCOME.to_owned()),
            already_completed: self
                .already_completed
                .unwrap_or_else(|| DEFAULT_ALREADY_COMPLETED.to_owned()),
        })
    }
}
