use std::fmt;

use serde::{Deserialize, Serialize};

use super::parse::normalize;

/// A stage of the intake conversation.
///
/// The order in which stages are visited is not fixed here; it is the row
/// order of the [`IntakeFlow`](super::IntakeFlow) table. `Completed` is always
/// terminal and never appears in the table.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    AskBranch,
    AskProductInterest,
    AskUserIntent,
    AskName,
    AskCompany,
    AskLocation,
    AskPhone,
    AskEmail,
    Completed,
}

impl Step {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AskBranch => "ASK_BRANCH",
            Self::AskProductInterest => "ASK_PRODUCT_INTEREST",
            Self::AskUserIntent => "ASK_USER_INTENT",
            Self::AskName => "ASK_NAME",
            Self::AskCompany => "ASK_COMPANY",
            Self::AskLocation => "ASK_LOCATION",
            Self::AskPhone => "ASK_PHONE",
            Self::AskEmail => "ASK_EMAIL",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named answer captured by one step.
///
/// [`Slot::field_name`] is the Bitable column the answer is written to; it
/// must match the table schema exactly.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Branch,
    ProductInterest,
    UserIntent,
    Name,
    Company,
    Location,
    Phone,
    Email,
}

impl Slot {
    pub fn field_name(self) -> &'static str {
        match self {
            Self::Branch => "sucursal",
            Self::ProductInterest => "producto_interes",
            Self::UserIntent => "intencion_cliente",
            Self::Name => "nombre",
            Self::Company => "empresa",
            Self::Location => "ubicacion",
            Self::Phone => "telefono",
            Self::Email => "email",
        }
    }

    /// Label used in the confirmation summary.
    pub fn label(self) -> &'static str {
        match self {
            Self::Branch => "Sucursal",
            Self::ProductInterest => "Producto",
            Self::UserIntent => "Interés",
            Self::Name => "Nombre",
            Self::Company => "Empresa",
            Self::Location => "Ubicación",
            Self::Phone => "Teléfono",
            Self::Email => "Email",
        }
    }
}

/// One option of a multiple-choice step.
#[derive(Clone, Debug, PartialEq)]
pub struct Choice {
    label: String,
    keywords: Vec<String>,
}

impl Choice {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            keywords: Vec::new(),
        }
    }

    /// Extra words that select this option.
    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    /// The canonical value stored when this option is picked.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Normalized label followed by normalized keywords.
    pub(crate) fn terms(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(&self.label)
            .chain(&self.keywords)
            .map(|term| normalize(term))
            .filter(|term| !term.is_empty())
    }
}

/// What a step expects as an answer.
#[derive(Clone, Debug, PartialEq)]
pub enum Answer {
    Choice(Vec<Choice>),
    Text { min_len: usize },
    Phone { min_digits: usize },
    Email,
}

impl Answer {
    pub const DEFAULT_TEXT: Self = Self::Text { min_len: 2 };
    pub const DEFAULT_PHONE: Self = Self::Phone { min_digits: 8 };
}

/// One row of the transition table.
#[derive(Clone, Debug, PartialEq)]
pub struct StepSpec {
    pub step: Step,
    pub slot: Slot,
    pub question: String,
    pub answer: Answer,
}

impl StepSpec {
    pub fn new(step: Step, slot: Slot, question: impl Into<String>, answer: Answer) -> Self {
        Self {
            step,
            slot,
            question: question.into(),
            answer,
        }
    }

    /// The question, followed by the numbered options for choice steps.
    pub fn prompt(&self) -> String {
        match &self.answer {
            Answer::Choice(options) => {
                let mut prompt = self.question.clone();
                for (i, option) in options.iter().enumerate() {
                    prompt.push_str(&format!("\n{}. {}", i + 1, option.label()));
                }
                prompt
            }
            _ => self.question.clone(),
        }
    }
}
