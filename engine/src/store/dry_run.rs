use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use tally_core::model::{
    DailyTotal, Episode, EpisodeKind, Event, Fact, FactSettings, FoodOverride, Meal,
    MedicationDose, NutrientTuple,
};

use super::{Store, StoreError};

/// Store decorator backing the `/test` wrapper: reads pass through,
/// writes become no-ops that still answer with the value the real write
/// would have computed. Every component runs unchanged against it, so a
/// dry run exercises the full pipeline with zero side effects.
pub struct DryRunStore<'a, S> {
    inner: &'a S,
}

impl<'a, S: Store> DryRunStore<'a, S> {
    pub fn new(inner: &'a S) -> DryRunStore<'a, S> {
        DryRunStore { inner }
    }
}

impl<S: Store> Store for DryRunStore<'_, S> {
    async fn record_event(&self, event: &Event) -> Result<bool, StoreError> {
        Ok(!self
            .inner
            .event_seen(&event.user_id, &event.event_id)
            .await?)
    }

    async fn event_seen(&self, user_id: &str, event_id: &str) -> Result<bool, StoreError> {
        self.inner.event_seen(user_id, event_id).await
    }

    async fn put_override(&self, _ov: &FoodOverride) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_override(&self, user_id: &str, name: &str) -> Result<bool, StoreError> {
        Ok(self.inner.find_override(user_id, name).await?.is_some())
    }

    async fn find_override(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<FoodOverride>, StoreError> {
        self.inner.find_override(user_id, key).await
    }

    async fn list_overrides(&self, user_id: &str) -> Result<Vec<FoodOverride>, StoreError> {
        self.inner.list_overrides(user_id).await
    }

    async fn insert_meal(&self, meal: &Meal) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .meal_for_event(&meal.user_id, &meal.event_id)
            .await?
            .is_none())
    }

    async fn meal_for_event(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> Result<Option<Meal>, StoreError> {
        self.inner.meal_for_event(user_id, event_id).await
    }

    async fn latest_active_meal(&self, user_id: &str) -> Result<Option<Meal>, StoreError> {
        self.inner.latest_active_meal(user_id).await
    }

    async fn active_meals_on(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Meal>, StoreError> {
        self.inner.active_meals_on(user_id, date).await
    }

    async fn tombstone_meal(&self, _user_id: &str, _meal_id: Uuid) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn add_to_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
        meals_delta: i64,
    ) -> Result<DailyTotal, StoreError> {
        let mut total = self
            .inner
            .daily_total(user_id, date)
            .await?
            .unwrap_or_else(|| DailyTotal::empty(user_id, date));
        total.nutrients = total.nutrients.add(delta);
        total.meal_count += meals_delta;
        Ok(total)
    }

    async fn subtract_from_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
    ) -> Result<Option<DailyTotal>, StoreError> {
        let Some(mut total) = self.inner.daily_total(user_id, date).await? else {
            return Ok(None);
        };
        if !total.nutrients.covers(delta) || total.meal_count < 1 {
            return Ok(None);
        }
        total.nutrients = total.nutrients.sub(delta);
        total.meal_count -= 1;
        Ok(Some(total))
    }

    async fn zero_daily_total(&self, _user_id: &str, _date: NaiveDate) -> Result<(), StoreError> {
        Ok(())
    }

    async fn daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyTotal>, StoreError> {
        self.inner.daily_total(user_id, date).await
    }

    async fn totals_in_range(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyTotal>, StoreError> {
        self.inner.totals_in_range(user_id, from, to).await
    }

    async fn open_episode(&self, episode: &Episode) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .find_open_episode(&episode.user_id, episode.kind)
            .await?
            .is_none())
    }

    async fn find_open_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
    ) -> Result<Option<Episode>, StoreError> {
        self.inner.find_open_episode(user_id, kind).await
    }

    async fn close_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<Episode>, StoreError> {
        Ok(self
            .inner
            .find_open_episode(user_id, kind)
            .await?
            .map(|mut episode| {
                episode.ended_at = Some(ended_at);
                episode.open = false;
                episode
            }))
    }

    async fn insert_dose(&self, _dose: &MedicationDose) -> Result<(), StoreError> {
        Ok(())
    }

    async fn last_dose_of(
        &self,
        user_id: &str,
        drug: &str,
    ) -> Result<Option<MedicationDose>, StoreError> {
        self.inner.last_dose_of(user_id, drug).await
    }

    async fn doses_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MedicationDose>, StoreError> {
        self.inner.doses_between(user_id, from, to).await
    }

    async fn put_fact(&self, _fact: &Fact) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_facts(&self, user_id: &str) -> Result<Vec<Fact>, StoreError> {
        self.inner.list_facts(user_id).await
    }

    async fn fact_settings(&self, user_id: &str) -> Result<Option<FactSettings>, StoreError> {
        self.inner.fact_settings(user_id).await
    }

    async fn put_fact_settings(&self, _settings: &FactSettings) -> Result<(), StoreError> {
        Ok(())
    }

    async fn enabled_fact_settings(&self) -> Result<Vec<FactSettings>, StoreError> {
        self.inner.enabled_fact_settings().await
    }

    async fn mark_fact_sent(&self, user_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .fact_settings(user_id)
            .await?
            .is_some_and(|s| s.last_sent != Some(date)))
    }

    async fn set_fast_goal(&self, _user_id: &str, _minutes: i64) -> Result<(), StoreError> {
        Ok(())
    }

    async fn fast_goal(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        self.inner.fast_goal(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::super::MemoryStore;
    use super::*;

    #[tokio::test]
    async fn writes_do_not_reach_the_inner_store() {
        let store = MemoryStore::new();
        let dry = DryRunStore::new(&store);
        let date = NaiveDate::from_ymd_opt(2024, 2, 20).unwrap();
        let delta = NutrientTuple {
            calories: 140,
            protein: 12,
            carbs: 1,
            fat: 10,
        };

        let computed = dry
            .add_to_daily_total("me", date, &delta, 1)
            .await
            .unwrap();
        assert_eq!(computed.nutrients, delta);
        assert_eq!(computed.meal_count, 1);
        // The real store never saw it.
        assert!(store.daily_total("me", date).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conditional_answers_reflect_inner_state() {
        let store = MemoryStore::new();
        let episode = Episode {
            id: Uuid::now_v7(),
            user_id: "me".to_string(),
            kind: EpisodeKind::Migraine,
            started_at: Utc.with_ymd_and_hms(2024, 2, 20, 13, 0, 0).unwrap(),
            ended_at: None,
            open: true,
        };
        store.open_episode(&episode).await.unwrap();

        let dry = DryRunStore::new(&store);
        // A dry-run start correctly reports the invariant violation.
        assert!(!dry.open_episode(&episode).await.unwrap());
        // A dry-run close answers with the closed episode, leaving the
        // real one open.
        let closed = dry
            .close_episode("me", EpisodeKind::Migraine, episode.started_at)
            .await
            .unwrap()
            .unwrap();
        assert!(!closed.open);
        assert!(
            store
                .find_open_episode("me", EpisodeKind::Migraine)
                .await
                .unwrap()
                .is_some()
        );
    }
}
