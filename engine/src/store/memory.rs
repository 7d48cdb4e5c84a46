use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use tally_core::model::{
    DailyTotal, Episode, EpisodeKind, Event, Fact, FactSettings, FoodOverride, Meal,
    MedicationDose, NutrientTuple,
};

use super::{Store, StoreError};

#[derive(Default)]
struct Inner {
    events: HashMap<(String, String), Event>,
    overrides: HashMap<(String, String), FoodOverride>,
    meals: HashMap<Uuid, Meal>,
    meals_by_event: HashMap<(String, String), Uuid>,
    totals: HashMap<(String, NaiveDate), DailyTotal>,
    episodes: Vec<Episode>,
    doses: Vec<MedicationDose>,
    facts: Vec<Fact>,
    fact_settings: HashMap<String, FactSettings>,
    fast_goals: HashMap<String, i64>,
}

/// In-memory store: the test harness and the CLI's offline mode. Writes
/// hold the lock for their whole check-and-set, which gives the same
/// conditional-write atomicity the production store gets from the
/// database.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Make the next `n` writes fail with a transient database error, to
    /// exercise the retry path.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn check_write_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    async fn record_event(&self, event: &Event) -> Result<bool, StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        let key = (event.user_id.clone(), event.event_id.clone());
        if inner.events.contains_key(&key) {
            return Ok(false);
        }
        inner.events.insert(key, event.clone());
        Ok(true)
    }

    async fn event_seen(&self, user_id: &str, event_id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .contains_key(&(user_id.to_string(), event_id.to_string())))
    }

    async fn put_override(&self, ov: &FoodOverride) -> Result<(), StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        inner
            .overrides
            .insert((ov.user_id.clone(), ov.name.clone()), ov.clone());
        Ok(())
    }

    async fn delete_override(&self, user_id: &str, name: &str) -> Result<bool, StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        Ok(inner
            .overrides
            .remove(&(user_id.to_string(), name.to_string()))
            .is_some())
    }

    async fn find_override(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<FoodOverride>, StoreError> {
        let inner = self.inner.read().await;
        if let Some(ov) = inner.overrides.get(&(user_id.to_string(), key.to_string())) {
            return Ok(Some(ov.clone()));
        }
        Ok(inner
            .overrides
            .values()
            .find(|ov| ov.user_id == user_id && ov.barcode.as_deref() == Some(key))
            .cloned())
    }

    async fn list_overrides(&self, user_id: &str) -> Result<Vec<FoodOverride>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<FoodOverride> = inner
            .overrides
            .values()
            .filter(|ov| ov.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn insert_meal(&self, meal: &Meal) -> Result<bool, StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        let key = (meal.user_id.clone(), meal.event_id.clone());
        if inner.meals_by_event.contains_key(&key) {
            return Ok(false);
        }
        inner.meals_by_event.insert(key, meal.id);
        inner.meals.insert(meal.id, meal.clone());
        Ok(true)
    }

    async fn meal_for_event(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> Result<Option<Meal>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .meals_by_event
            .get(&(user_id.to_string(), event_id.to_string()))
            .and_then(|id| inner.meals.get(id))
            .cloned())
    }

    async fn latest_active_meal(&self, user_id: &str) -> Result<Option<Meal>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .meals
            .values()
            .filter(|m| m.user_id == user_id && !m.tombstoned)
            .max_by_key(|m| (m.timestamp, m.id))
            .cloned())
    }

    async fn active_meals_on(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Meal>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Meal> = inner
            .meals
            .values()
            .filter(|m| m.user_id == user_id && m.date == date && !m.tombstoned)
            .cloned()
            .collect();
        out.sort_by_key(|m| (m.timestamp, m.id));
        Ok(out)
    }

    async fn tombstone_meal(&self, user_id: &str, meal_id: Uuid) -> Result<bool, StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        match inner.meals.get_mut(&meal_id) {
            Some(meal) if meal.user_id == user_id && !meal.tombstoned => {
                meal.tombstoned = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_to_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
        meals_delta: i64,
    ) -> Result<DailyTotal, StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        let total = inner
            .totals
            .entry((user_id.to_string(), date))
            .or_insert_with(|| DailyTotal::empty(user_id, date));
        total.nutrients = total.nutrients.add(delta);
        total.meal_count += meals_delta;
        Ok(total.clone())
    }

    async fn subtract_from_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
    ) -> Result<Option<DailyTotal>, StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        let Some(total) = inner.totals.get_mut(&(user_id.to_string(), date)) else {
            return Ok(None);
        };
        if !total.nutrients.covers(delta) || total.meal_count < 1 {
            return Ok(None);
        }
        total.nutrients = total.nutrients.sub(delta);
        total.meal_count -= 1;
        Ok(Some(total.clone()))
    }

    async fn zero_daily_total(&self, user_id: &str, date: NaiveDate) -> Result<(), StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        inner
            .totals
            .insert((user_id.to_string(), date), DailyTotal::empty(user_id, date));
        Ok(())
    }

    async fn daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyTotal>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.totals.get(&(user_id.to_string(), date)).cloned())
    }

    async fn totals_in_range(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyTotal>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<DailyTotal> = inner
            .totals
            .values()
            .filter(|t| t.user_id == user_id && t.date >= from && t.date <= to)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.date);
        Ok(out)
    }

    async fn open_episode(&self, episode: &Episode) -> Result<bool, StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        let already_open = inner
            .episodes
            .iter()
            .any(|e| e.user_id == episode.user_id && e.kind == episode.kind && e.open);
        if already_open {
            return Ok(false);
        }
        inner.episodes.push(episode.clone());
        Ok(true)
    }

    async fn find_open_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
    ) -> Result<Option<Episode>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .episodes
            .iter()
            .find(|e| e.user_id == user_id && e.kind == kind && e.open)
            .cloned())
    }

    async fn close_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<Episode>, StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        let Some(episode) = inner
            .episodes
            .iter_mut()
            .find(|e| e.user_id == user_id && e.kind == kind && e.open)
        else {
            return Ok(None);
        };
        episode.ended_at = Some(ended_at);
        episode.open = false;
        Ok(Some(episode.clone()))
    }

    async fn insert_dose(&self, dose: &MedicationDose) -> Result<(), StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        inner.doses.push(dose.clone());
        Ok(())
    }

    async fn last_dose_of(
        &self,
        user_id: &str,
        drug: &str,
    ) -> Result<Option<MedicationDose>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .doses
            .iter()
            .filter(|d| d.user_id == user_id && d.drug == drug)
            .max_by_key(|d| (d.taken_at, d.id))
            .cloned())
    }

    async fn doses_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MedicationDose>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<MedicationDose> = inner
            .doses
            .iter()
            .filter(|d| d.user_id == user_id && d.taken_at >= from && d.taken_at < to)
            .cloned()
            .collect();
        out.sort_by_key(|d| (d.taken_at, d.id));
        Ok(out)
    }

    async fn put_fact(&self, fact: &Fact) -> Result<(), StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        inner.facts.push(fact.clone());
        Ok(())
    }

    async fn list_facts(&self, user_id: &str) -> Result<Vec<Fact>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .facts
            .iter()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn fact_settings(&self, user_id: &str) -> Result<Option<FactSettings>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.fact_settings.get(user_id).cloned())
    }

    async fn put_fact_settings(&self, settings: &FactSettings) -> Result<(), StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        inner
            .fact_settings
            .insert(settings.user_id.clone(), settings.clone());
        Ok(())
    }

    async fn enabled_fact_settings(&self) -> Result<Vec<FactSettings>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<FactSettings> = inner
            .fact_settings
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(out)
    }

    async fn mark_fact_sent(&self, user_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        let Some(settings) = inner.fact_settings.get_mut(user_id) else {
            return Ok(false);
        };
        if settings.last_sent == Some(date) {
            return Ok(false);
        }
        settings.last_sent = Some(date);
        Ok(true)
    }

    async fn set_fast_goal(&self, user_id: &str, minutes: i64) -> Result<(), StoreError> {
        self.check_write_failure()?;
        let mut inner = self.inner.write().await;
        inner.fast_goals.insert(user_id.to_string(), minutes);
        Ok(())
    }

    async fn fast_goal(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.fast_goals.get(user_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn episode(user: &str, kind: EpisodeKind) -> Episode {
        Episode {
            id: Uuid::now_v7(),
            user_id: user.to_string(),
            kind,
            started_at: Utc.with_ymd_and_hms(2024, 2, 20, 13, 0, 0).unwrap(),
            ended_at: None,
            open: true,
        }
    }

    #[tokio::test]
    async fn open_episode_is_conditional_on_no_open_episode() {
        let store = MemoryStore::new();
        assert!(
            store
                .open_episode(&episode("me", EpisodeKind::Migraine))
                .await
                .unwrap()
        );
        assert!(
            !store
                .open_episode(&episode("me", EpisodeKind::Migraine))
                .await
                .unwrap()
        );
        // Different kind is independent.
        assert!(
            store
                .open_episode(&episode("me", EpisodeKind::Fasting))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn subtract_refuses_to_go_negative() {
        let store = MemoryStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 2, 20).unwrap();
        let delta = NutrientTuple {
            calories: 140,
            protein: 12,
            carbs: 1,
            fat: 10,
        };
        store
            .add_to_daily_total("me", date, &delta, 1)
            .await
            .unwrap();
        let bigger = NutrientTuple {
            calories: 200,
            ..delta
        };
        assert!(
            store
                .subtract_from_daily_total("me", date, &bigger)
                .await
                .unwrap()
                .is_none()
        );
        let after = store
            .subtract_from_daily_total("me", date, &delta)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.nutrients, NutrientTuple::ZERO);
        assert_eq!(after.meal_count, 0);
    }

    #[tokio::test]
    async fn mark_fact_sent_gates_on_last_sent_date() {
        let store = MemoryStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 2, 20).unwrap();
        store
            .put_fact_settings(&FactSettings {
                enabled: true,
                ..FactSettings::defaults("me", 9)
            })
            .await
            .unwrap();
        assert!(store.mark_fact_sent("me", date).await.unwrap());
        assert!(!store.mark_fact_sent("me", date).await.unwrap());
        let next = date.succ_opt().unwrap();
        assert!(store.mark_fact_sent("me", next).await.unwrap());
    }
}
