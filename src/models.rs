use crate::throttle::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Seconds since the epoch; `None` for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginStorage {
    pub origin: String,
    pub local_storage: BTreeMap<String, String>,
}

/// Browser authentication state: cookie jar plus per-origin local storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub origins: Vec<OriginStorage>,
}

impl StorageState {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.iter().all(|o| o.local_storage.is_empty())
    }
}

/// Captured authentication state for one account.
///
/// Whether a session is still accepted is only known by probing the service
/// (`Authenticator::validate`); `captured_at` is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub account: String,
    pub captured_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub state: StorageState,
}

impl Session {
    pub fn new(account: impl Into<String>, fingerprint: Fingerprint, state: StorageState) -> Self {
        Self {
            account: account.into(),
            captured_at: Utc::now(),
            fingerprint,
            state,
        }
    }
}

/// How a set was reached during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetSource {
    Owned,
    SharedClass,
    SharedFolder,
}

impl fmt::Display for SetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned => write!(f, "owned"),
            Self::SharedClass => write!(f, "shared-class"),
            Self::SharedFolder => write!(f, "shared-folder"),
        }
    }
}

/// Title used when a set link or page carries none.
pub const UNTITLED_SET: &str = "Untitled Set";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetMetadata {
    pub id: String,
    pub title: String,
    pub url: String,
    /// Best effort, read from "N terms" labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_count: Option<u32>,
    pub source: SetSource,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub term: String,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Multiple-choice options, when the page carries them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<String>,
}

impl Card {
    pub fn new(term: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            definition: definition.into(),
            ..Self::default()
        }
    }
}

/// One slot in a set's display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CardEntry {
    Parsed(Card),
    /// A card that rendered but could not be read.
    Missing { position: usize, reason: String },
}

impl CardEntry {
    pub fn card(&self) -> Option<&Card> {
        match self {
            Self::Parsed(card) => Some(card),
            Self::Missing { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "count", rename_all = "snake_case")]
pub enum PartialReason {
    MissingCards(usize),
    /// No cards rendered within the bounded wait.
    RenderTimeout,
    /// Cancelled before the set finished.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completeness {
    Full,
    Partial { reason: PartialReason },
}

impl Completeness {
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }
}

impl fmt::Display for Completeness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial {
                reason: PartialReason::MissingCards(n),
            } => write!(f, "partial: {} missing", n),
            Self::Partial {
                reason: PartialReason::RenderTimeout,
            } => write!(f, "partial: no cards rendered"),
            Self::Partial {
                reason: PartialReason::Aborted,
            } => write!(f, "partial: aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub set: SetMetadata,
    pub cards: Vec<CardEntry>,
    pub completeness: Completeness,
    pub extracted_at: DateTime<Utc>,
}

impl ScrapeResult {
    /// Builds a result whose completeness follows from the entries.
    pub fn from_entries(set: SetMetadata, cards: Vec<CardEntry>) -> Self {
        let missing = cards
            .iter()
            .filter(|c| matches!(c, CardEntry::Missing { .. }))
            .count();
        let completeness = if missing > 0 {
            Completeness::Partial {
                reason: PartialReason::MissingCards(missing),
            }
        } else {
            Completeness::Full
        };
        Self {
            set,
            cards,
            completeness,
            extracted_at: Utc::now(),
        }
    }

    pub fn parsed_cards(&self) -> impl Iterator<Item = &Card> {
        self.cards.iter().filter_map(CardEntry::card)
    }

    pub fn missing_count(&self) -> usize {
        self.cards.len() - self.parsed_cards().count()
    }
}
