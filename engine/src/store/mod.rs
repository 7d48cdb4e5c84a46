pub mod dry_run;
pub mod memory;
pub mod postgres;
pub mod retry;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use tally_core::error::DomainError;
use tally_core::model::{
    DailyTotal, Episode, EpisodeKind, Event, Fact, FactSettings, FoodOverride, Meal,
    MedicationDose, NutrientTuple,
};

pub use dry_run::DryRunStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::RetryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Only backend failures are worth retrying; a corrupt row will not
    /// heal itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> DomainError {
        DomainError::upstream("store", err.to_string())
    }
}

/// Conditional read/write interface over the engine's entities.
///
/// Conditional writes are the concurrency primitive: put-if-absent and
/// guarded updates return whether the condition held instead of erroring,
/// and a failed condition is the domain answer, never retried. Each
/// entity family is owned by exactly one component; nothing here spans
/// families except the totals methods the aggregation engine drives.
#[allow(async_fn_in_trait)]
pub trait Store: Send + Sync {
    // Events (raw inbound audit rows, put-if-absent by event id).
    async fn record_event(&self, event: &Event) -> Result<bool, StoreError>;
    async fn event_seen(&self, user_id: &str, event_id: &str) -> Result<bool, StoreError>;

    // Food overrides, keyed by normalized name; `find_override` also
    // matches the barcode field so scanned products hit overrides first.
    async fn put_override(&self, ov: &FoodOverride) -> Result<(), StoreError>;
    async fn delete_override(&self, user_id: &str, name: &str) -> Result<bool, StoreError>;
    async fn find_override(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<FoodOverride>, StoreError>;
    async fn list_overrides(&self, user_id: &str) -> Result<Vec<FoodOverride>, StoreError>;

    // Meals. Insert is put-if-absent keyed by (user, event id) — the
    // idempotency gate for the meal path. Tombstoning is conditional on
    // the meal still being active.
    async fn insert_meal(&self, meal: &Meal) -> Result<bool, StoreError>;
    async fn meal_for_event(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> Result<Option<Meal>, StoreError>;
    async fn latest_active_meal(&self, user_id: &str) -> Result<Option<Meal>, StoreError>;
    async fn active_meals_on(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Meal>, StoreError>;
    async fn tombstone_meal(&self, user_id: &str, meal_id: Uuid) -> Result<bool, StoreError>;

    // Daily totals: atomic add (create-or-update), guarded subtract that
    // refuses to go negative (returns None), direct zero for resets.
    async fn add_to_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
        meals_delta: i64,
    ) -> Result<DailyTotal, StoreError>;
    async fn subtract_from_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
    ) -> Result<Option<DailyTotal>, StoreError>;
    async fn zero_daily_total(&self, user_id: &str, date: NaiveDate) -> Result<(), StoreError>;
    async fn daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyTotal>, StoreError>;
    async fn totals_in_range(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyTotal>, StoreError>;

    // Episodes. `open_episode` is conditional on no open episode of the
    // same kind — the single-open invariant as one atomic check-and-set.
    async fn open_episode(&self, episode: &Episode) -> Result<bool, StoreError>;
    async fn find_open_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
    ) -> Result<Option<Episode>, StoreError>;
    async fn close_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<Episode>, StoreError>;

    // Medication doses, append-only.
    async fn insert_dose(&self, dose: &MedicationDose) -> Result<(), StoreError>;
    async fn last_dose_of(
        &self,
        user_id: &str,
        drug: &str,
    ) -> Result<Option<MedicationDose>, StoreError>;
    async fn doses_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MedicationDose>, StoreError>;

    // Facts and delivery state. `mark_fact_sent` advances last_sent only
    // if it differs from `date` — the scheduled tick's idempotency gate.
    async fn put_fact(&self, fact: &Fact) -> Result<(), StoreError>;
    async fn list_facts(&self, user_id: &str) -> Result<Vec<Fact>, StoreError>;
    async fn fact_settings(&self, user_id: &str) -> Result<Option<FactSettings>, StoreError>;
    async fn put_fact_settings(&self, settings: &FactSettings) -> Result<(), StoreError>;
    async fn enabled_fact_settings(&self) -> Result<Vec<FactSettings>, StoreError>;
    async fn mark_fact_sent(&self, user_id: &str, date: NaiveDate) -> Result<bool, StoreError>;

    // Fasting goal (target duration in minutes).
    async fn set_fast_goal(&self, user_id: &str, minutes: i64) -> Result<(), StoreError>;
    async fn fast_goal(&self, user_id: &str) -> Result<Option<i64>, StoreError>;
}

/// Retry a store operation a bounded number of times on transient
/// backend failure. Condition failures come back as `Ok(false)` /
/// `Ok(None)` and are never retried — they are answers, not errors.
pub async fn with_retries<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(attempt, error = %err, "transient store failure, retrying");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| StoreError::Corrupt("retry loop exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retries_stop_at_first_success() {
        let mut calls = 0;
        let result = with_retries(3, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 2 {
                    Err(StoreError::Database(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn non_transient_errors_surface_immediately() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(3, || {
            calls += 1;
            async { Err(StoreError::Corrupt("bad row".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
