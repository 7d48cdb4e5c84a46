use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer macro tuple. The upstream catalog reports fractional grams;
/// values are rounded to whole units before they enter the store, so all
/// arithmetic on totals stays exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NutrientTuple {
    pub calories: i64,
    pub protein: i64,
    pub carbs: i64,
    pub fat: i64,
}

impl NutrientTuple {
    pub const ZERO: NutrientTuple = NutrientTuple {
        calories: 0,
        protein: 0,
        carbs: 0,
        fat: 0,
    };

    pub fn add(&self, other: &NutrientTuple) -> NutrientTuple {
        NutrientTuple {
            calories: self.calories + other.calories,
            protein: self.protein + other.protein,
            carbs: self.carbs + other.carbs,
            fat: self.fat + other.fat,
        }
    }

    pub fn sub(&self, other: &NutrientTuple) -> NutrientTuple {
        NutrientTuple {
            calories: self.calories - other.calories,
            protein: self.protein - other.protein,
            carbs: self.carbs - other.carbs,
            fat: self.fat - other.fat,
        }
    }

    /// Component-wise `other <= self`. Guards the non-negative contract on
    /// daily totals before a decrement is attempted.
    pub fn covers(&self, other: &NutrientTuple) -> bool {
        self.calories >= other.calories
            && self.protein >= other.protein
            && self.carbs >= other.carbs
            && self.fat >= other.fat
    }
}

/// Operator macro targets, reported with every summary: stay under the
/// calorie ceiling, reach the protein floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroGoals {
    pub calories_max: i64,
    pub protein_min: i64,
}

/// What the event source delivers: one inbound text message.
/// `event_id` is delivery-unique and is the idempotency key for every
/// downstream effect of this message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub event_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Immutable audit row, one per inbound message. Written once with a
/// put-if-absent; never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub raw_text: String,
}

impl Event {
    pub fn from_inbound(msg: &InboundMessage) -> Event {
        Event {
            event_id: msg.event_id.clone(),
            user_id: msg.user_id.clone(),
            timestamp: msg.timestamp,
            raw_text: msg.text.clone(),
        }
    }
}

/// User-authored correction to catalog nutrition data. Looked up by
/// normalized name (or barcode) before any external catalog call, and it
/// always wins over the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoodOverride {
    pub user_id: String,
    /// Normalized name: trimmed, lowercased, internal whitespace collapsed.
    pub name: String,
    /// Set when the override targets a scanned product rather than a dish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    pub nutrients: NutrientTuple,
    pub created_at: DateTime<Utc>,
}

/// How a meal's nutrients were resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Override,
    Catalog,
    Barcode,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Override => "override",
            ResolutionSource::Catalog => "catalog",
            ResolutionSource::Barcode => "barcode",
        }
    }
}

/// One enriched meal record. Never mutated after creation except the
/// tombstone flag — deletion is logical so totals stay auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meal {
    /// UUIDv7 — time-sortable, so "most recent meal" is a max over ids
    /// when timestamps tie.
    pub id: Uuid,
    pub user_id: String,
    /// Source event id; unique per user. This is the idempotency key that
    /// makes apply-meal a no-op on duplicate delivery.
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Calendar date in the user's timezone; keys the DailyTotal row.
    pub date: NaiveDate,
    pub description: String,
    pub nutrients: NutrientTuple,
    pub source: ResolutionSource,
    pub tombstoned: bool,
}

/// Running per-day sums. The only entity with in-place numeric mutation,
/// always via atomic add/sub keyed by (user, date).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyTotal {
    pub user_id: String,
    pub date: NaiveDate,
    pub nutrients: NutrientTuple,
    pub meal_count: i64,
}

impl DailyTotal {
    pub fn empty(user_id: &str, date: NaiveDate) -> DailyTotal {
        DailyTotal {
            user_id: user_id.to_string(),
            date,
            nutrients: NutrientTuple::ZERO,
            meal_count: 0,
        }
    }
}

/// The two open/close trackers the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeKind {
    Migraine,
    Fasting,
}

impl EpisodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeKind::Migraine => "migraine",
            EpisodeKind::Fasting => "fasting",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EpisodeKind::Migraine => "Migraine",
            EpisodeKind::Fasting => "Fast",
        }
    }
}

/// A bounded open/closed interval: a migraine episode or a fasting
/// session. Invariant: at most one open episode per (user, kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub user_id: String,
    pub kind: EpisodeKind,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub open: bool,
}

/// One logged dose. Append-only; the safety-window and quota invariants
/// are computed at write time, not stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicationDose {
    pub id: Uuid,
    pub user_id: String,
    /// Normalized drug name (trimmed, lowercased).
    pub drug: String,
    /// Free-form dose text as the user typed it, e.g. "400mg".
    pub dose: String,
    pub taken_at: DateTime<Utc>,
}

/// Immutable catalog row, ingested out-of-core (CSV import is an
/// external collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: Uuid,
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Per-user scheduled delivery state. `last_sent` doubles as the
/// idempotency gate for the hourly tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSettings {
    pub user_id: String,
    pub enabled: bool,
    /// Local delivery hour, 0-23, in the user's timezone.
    pub hour: u32,
    /// Delivery target when it differs from the user id the transport
    /// derives (e.g. a whatsapp: address).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sent: Option<NaiveDate>,
}

impl FactSettings {
    pub fn defaults(user_id: &str, hour: u32) -> FactSettings {
        FactSettings {
            user_id: user_id.to_string(),
            enabled: false,
            hour,
            recipient: None,
            tag: None,
            last_sent: None,
        }
    }
}

/// Trim, lowercase, and collapse internal whitespace. Override and drug
/// lookups are exact matches over this form — no fuzzy matching, so
/// resolution stays deterministic.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize_name("  Canned   TUNA "), "canned tuna");
        assert_eq!(normalize_name("coffee"), "coffee");
    }

    #[test]
    fn nutrient_add_and_sub_are_inverses() {
        let a = NutrientTuple {
            calories: 140,
            protein: 12,
            carbs: 1,
            fat: 10,
        };
        let b = NutrientTuple {
            calories: 300,
            protein: 20,
            carbs: 30,
            fat: 8,
        };
        assert_eq!(a.add(&b).sub(&b), a);
    }

    #[test]
    fn covers_requires_every_component() {
        let total = NutrientTuple {
            calories: 140,
            protein: 12,
            carbs: 1,
            fat: 10,
        };
        let meal = NutrientTuple {
            calories: 140,
            protein: 13,
            carbs: 0,
            fat: 0,
        };
        assert!(!total.covers(&meal));
        assert!(total.covers(&total));
    }
}
