use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use tally_core::model::{
    DailyTotal, Episode, EpisodeKind, Event, Fact, FactSettings, FoodOverride, Meal,
    MedicationDose, NutrientTuple,
};

use super::{Store, StoreError, with_retries};

/// Store decorator applying the bounded-retry contract to every call:
/// transient backend failures are retried up to `attempts` times before
/// they surface. Condition failures come back as values, not errors, so
/// they pass through untouched on the first attempt.
pub struct RetryStore<S> {
    inner: S,
    attempts: u32,
}

impl<S: Store> RetryStore<S> {
    pub fn new(inner: S, attempts: u32) -> RetryStore<S> {
        RetryStore { inner, attempts }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Store> Store for RetryStore<S> {
    async fn record_event(&self, event: &Event) -> Result<bool, StoreError> {
        with_retries(self.attempts, || self.inner.record_event(event)).await
    }

    async fn event_seen(&self, user_id: &str, event_id: &str) -> Result<bool, StoreError> {
        with_retries(self.attempts, || self.inner.event_seen(user_id, event_id)).await
    }

    async fn put_override(&self, ov: &FoodOverride) -> Result<(), StoreError> {
        with_retries(self.attempts, || self.inner.put_override(ov)).await
    }

    async fn delete_override(&self, user_id: &str, name: &str) -> Result<bool, StoreError> {
        with_retries(self.attempts, || self.inner.delete_override(user_id, name)).await
    }

    async fn find_override(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<FoodOverride>, StoreError> {
        with_retries(self.attempts, || self.inner.find_override(user_id, key)).await
    }

    async fn list_overrides(&self, user_id: &str) -> Result<Vec<FoodOverride>, StoreError> {
        with_retries(self.attempts, || self.inner.list_overrides(user_id)).await
    }

    async fn insert_meal(&self, meal: &Meal) -> Result<bool, StoreError> {
        with_retries(self.attempts, || self.inner.insert_meal(meal)).await
    }

    async fn meal_for_event(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> Result<Option<Meal>, StoreError> {
        with_retries(self.attempts, || self.inner.meal_for_event(user_id, event_id)).await
    }

    async fn latest_active_meal(&self, user_id: &str) -> Result<Option<Meal>, StoreError> {
        with_retries(self.attempts, || self.inner.latest_active_meal(user_id)).await
    }

    async fn active_meals_on(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Meal>, StoreError> {
        with_retries(self.attempts, || self.inner.active_meals_on(user_id, date)).await
    }

    async fn tombstone_meal(&self, user_id: &str, meal_id: Uuid) -> Result<bool, StoreError> {
        with_retries(self.attempts, || self.inner.tombstone_meal(user_id, meal_id)).await
    }

    async fn add_to_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
        meals_delta: i64,
    ) -> Result<DailyTotal, StoreError> {
        with_retries(self.attempts, || {
            self.inner
                .add_to_daily_total(user_id, date, delta, meals_delta)
        })
        .await
    }

    async fn subtract_from_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
    ) -> Result<Option<DailyTotal>, StoreError> {
        with_retries(self.attempts, || {
            self.inner.subtract_from_daily_total(user_id, date, delta)
        })
        .await
    }

    async fn zero_daily_total(&self, user_id: &str, date: NaiveDate) -> Result<(), StoreError> {
        with_retries(self.attempts, || self.inner.zero_daily_total(user_id, date)).await
    }

    async fn daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyTotal>, StoreError> {
        with_retries(self.attempts, || self.inner.daily_total(user_id, date)).await
    }

    async fn totals_in_range(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyTotal>, StoreError> {
        with_retries(self.attempts, || self.inner.totals_in_range(user_id, from, to)).await
    }

    async fn open_episode(&self, episode: &Episode) -> Result<bool, StoreError> {
        with_retries(self.attempts, || self.inner.open_episode(episode)).await
    }

    async fn find_open_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
    ) -> Result<Option<Episode>, StoreError> {
        with_retries(self.attempts, || self.inner.find_open_episode(user_id, kind)).await
    }

    async fn close_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<Episode>, StoreError> {
        with_retries(self.attempts, || {
            self.inner.close_episode(user_id, kind, ended_at)
        })
        .await
    }

    async fn insert_dose(&self, dose: &MedicationDose) -> Result<(), StoreError> {
        with_retries(self.attempts, || self.inner.insert_dose(dose)).await
    }

    async fn last_dose_of(
        &self,
        user_id: &str,
        drug: &str,
    ) -> Result<Option<MedicationDose>, StoreError> {
        with_retries(self.attempts, || self.inner.last_dose_of(user_id, drug)).await
    }

    async fn doses_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MedicationDose>, StoreError> {
        with_retries(self.attempts, || self.inner.doses_between(user_id, from, to)).await
    }

    async fn put_fact(&self, fact: &Fact) -> Result<(), StoreError> {
        with_retries(self.attempts, || self.inner.put_fact(fact)).await
    }

    async fn list_facts(&self, user_id: &str) -> Result<Vec<Fact>, StoreError> {
        with_retries(self.attempts, || self.inner.list_facts(user_id)).await
    }

    async fn fact_settings(&self, user_id: &str) -> Result<Option<FactSettings>, StoreError> {
        with_retries(self.attempts, || self.inner.fact_settings(user_id)).await
    }

    async fn put_fact_settings(&self, settings: &FactSettings) -> Result<(), StoreError> {
        with_retries(self.attempts, || self.inner.put_fact_settings(settings)).await
    }

    async fn enabled_fact_settings(&self) -> Result<Vec<FactSettings>, StoreError> {
        with_retries(self.attempts, || self.inner.enabled_fact_settings()).await
    }

    async fn mark_fact_sent(&self, user_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        with_retries(self.attempts, || self.inner.mark_fact_sent(user_id, date)).await
    }

    async fn set_fast_goal(&self, user_id: &str, minutes: i64) -> Result<(), StoreError> {
        with_retries(self.attempts, || self.inner.set_fast_goal(user_id, minutes)).await
    }

    async fn fast_goal(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        with_retries(self.attempts, || self.inner.fast_goal(user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tally_core::model::ResolutionSource;

    use super::super::MemoryStore;
    use super::*;

    fn meal(event_id: &str) -> Meal {
        Meal {
            id: Uuid::now_v7(),
            user_id: "me".to_string(),
            event_id: event_id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 2, 20, 13, 0, 0).unwrap(),
            date: NaiveDate::from_ymd_opt(2024, 2, 20).unwrap(),
            description: "2 eggs".to_string(),
            nutrients: NutrientTuple {
                calories: 140,
                protein: 12,
                carbs: 1,
                fat: 10,
            },
            source: ResolutionSource::Catalog,
            tombstoned: false,
        }
    }

    #[tokio::test]
    async fn transient_write_failure_is_retried_to_success() {
        let store = RetryStore::new(MemoryStore::new(), 3);
        store.inner().fail_next_writes(1);
        assert!(store.insert_meal(&meal("evt-1")).await.unwrap());
        assert!(
            store
                .meal_for_event("me", "evt-1")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_the_budget() {
        let store = RetryStore::new(MemoryStore::new(), 3);
        store.inner().fail_next_writes(5);
        assert!(store.insert_meal(&meal("evt-1")).await.is_err());
        // The budget consumed three of the injected failures.
        store.inner().fail_next_writes(0);
        assert!(store.insert_meal(&meal("evt-1")).await.unwrap());
    }

    #[tokio::test]
    async fn condition_failures_pass_through_without_retry() {
        let store = RetryStore::new(MemoryStore::new(), 3);
        assert!(store.insert_meal(&meal("evt-1")).await.unwrap());
        // Same event id: a condition failure, answered immediately.
        assert!(!store.insert_meal(&meal("evt-1")).await.unwrap());
    }
}
