use uuid::Uuid;

use tally_core::command::{Command, classify};
use tally_core::error::DomainError;
use tally_core::model::{
    DailyTotal, EpisodeKind, Event, Fact, FoodOverride, InboundMessage, Meal, normalize_name,
};
use tally_core::reply::{Outcome, render};

use crate::catalog::NutritionCatalog;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::episodes;
use crate::facts::{self, TickReport};
use crate::meds;
use crate::resolver::{self, ResolveQuery};
use crate::sender::MessageSender;
use crate::store::{DryRunStore, RetryStore, Store};
use crate::totals;

/// The message pipeline: classify, dispatch, reply. One instance per
/// process; every dependency is injected so tests swap in fixed clocks,
/// in-memory stores, and recording senders without touching the logic.
///
/// The store is wrapped in [`RetryStore`] at construction, so every
/// store call below carries the bounded-retry contract for transient
/// backend failures.
pub struct Engine<S, C, K, M> {
    store: RetryStore<S>,
    catalog: C,
    clock: K,
    sender: M,
    config: EngineConfig,
}

impl<S, C, K, M> Engine<S, C, K, M>
where
    S: Store,
    C: NutritionCatalog,
    K: Clock,
    M: MessageSender,
{
    pub fn new(store: S, catalog: C, clock: K, sender: M, config: EngineConfig) -> Self {
        Engine {
            store: RetryStore::new(store, config.store_retries),
            catalog,
            clock,
            sender,
            config,
        }
    }

    /// Handle one inbound message end to end and return the structured
    /// outcome. `/test`-wrapped commands run against a dry-run view of
    /// the store, so the full pipeline executes with zero persistence.
    pub async fn handle(&self, msg: &InboundMessage) -> Result<Outcome, DomainError> {
        let command = classify(&msg.text)?;
        tracing::debug!(event_id = %msg.event_id, ?command, "classified");
        if let Command::TestWrapper(inner) = command {
            let dry = DryRunStore::new(&self.store);
            let outcome = self.dispatch(&dry, msg, *inner).await?;
            return Ok(Outcome::DryRun(Box::new(outcome)));
        }
        self.dispatch(&self.store, msg, command).await
    }

    /// Handle a message and compose the reply text.
    pub async fn reply(&self, msg: &InboundMessage) -> String {
        render(&self.handle(msg).await)
    }

    /// One scheduled fact-delivery tick.
    pub async fn tick(&self) -> Result<TickReport, DomainError> {
        facts::hourly_tick(&self.store, &self.clock, &self.sender, &self.config).await
    }

    /// Add a fact to the pool, outside the message path.
    pub async fn add_fact(&self, text: &str, tags: Vec<String>) -> Result<Fact, DomainError> {
        facts::add_fact(&self.store, &self.config.user_id, text, tags).await
    }

    async fn dispatch<T: Store>(
        &self,
        store: &T,
        msg: &InboundMessage,
        command: Command,
    ) -> Result<Outcome, DomainError> {
        let event = Event::from_inbound(msg);
        let fresh = store.record_event(&event).await?;
        let user_id = msg.user_id.as_str();

        match command {
            Command::LogMeal { description } => {
                self.log_meal(store, msg, fresh, ResolveQuery::Name(description))
                    .await
            }
            Command::Barcode { code } => {
                self.log_meal(store, msg, fresh, ResolveQuery::Barcode(code))
                    .await
            }
            Command::LookupMeal { description } => {
                let resolved = resolver::resolve(
                    store,
                    &self.catalog,
                    user_id,
                    &ResolveQuery::Name(description.clone()),
                )
                .await?;
                Ok(Outcome::MealPreview {
                    description,
                    nutrients: resolved.nutrients,
                    source: resolved.source,
                })
            }
            Command::FoodOverrideSet {
                name,
                barcode,
                nutrients,
            } => {
                let name = normalize_name(&name);
                store
                    .put_override(&FoodOverride {
                        user_id: user_id.to_string(),
                        name: name.clone(),
                        barcode,
                        nutrients,
                        created_at: self.clock.now_utc(),
                    })
                    .await?;
                Ok(Outcome::OverrideSaved { name, nutrients })
            }
            Command::FoodOverrideDel { name } => {
                let name = normalize_name(&name);
                if !store.delete_override(user_id, &name).await? {
                    return Err(DomainError::NotFound { query: name });
                }
                Ok(Outcome::OverrideDeleted { name })
            }
            Command::FoodOverrideList => {
                let overrides = store.list_overrides(user_id).await?;
                Ok(Outcome::OverrideList { overrides })
            }
            Command::Summary { period } => {
                totals::summary(store, &self.clock, &self.config, user_id, period).await
            }
            Command::Undo => totals::undo(store, user_id).await,
            Command::ResetToday => totals::reset_today(store, &self.clock, user_id).await,
            Command::MigraineStart => {
                episodes::start(store, &self.clock, user_id, EpisodeKind::Migraine).await
            }
            Command::MigraineEnd => {
                episodes::end(store, &self.clock, user_id, EpisodeKind::Migraine).await
            }
            Command::MigraineStatus => {
                episodes::status(store, &self.clock, user_id, EpisodeKind::Migraine).await
            }
            Command::FastStart => {
                episodes::start(store, &self.clock, user_id, EpisodeKind::Fasting).await
            }
            Command::FastEnd => {
                episodes::end(store, &self.clock, user_id, EpisodeKind::Fasting).await
            }
            Command::FastStatus => {
                episodes::status(store, &self.clock, user_id, EpisodeKind::Fasting).await
            }
            Command::FastGoal { hours } => episodes::set_fast_goal(store, user_id, hours).await,
            Command::MedLog { drug, dose, when } => {
                meds::log_dose(store, &self.clock, &self.config, user_id, &drug, &dose, when).await
            }
            Command::MedsSummary { period } => {
                meds::summary(store, &self.clock, user_id, period).await
            }
            Command::FactRequest { tag } => {
                facts::request_fact(store, &self.config, user_id, tag.as_deref()).await
            }
            Command::FactsSettings(sub) => {
                facts::update_settings(store, &self.config, user_id, &sub).await
            }
            Command::TestWrapper(inner) => {
                // Nested wrappers collapse: already dry at this point.
                let outcome = Box::pin(self.dispatch(store, msg, *inner)).await?;
                Ok(Outcome::DryRun(Box::new(outcome)))
            }
        }
    }

    /// The meal path shared by descriptions and barcodes. A redelivered
    /// event replays the stored meal and current total without touching
    /// the catalog again.
    async fn log_meal<T: Store>(
        &self,
        store: &T,
        msg: &InboundMessage,
        fresh: bool,
        query: ResolveQuery,
    ) -> Result<Outcome, DomainError> {
        let user_id = msg.user_id.as_str();
        if !fresh {
            if let Some(stored) = store.meal_for_event(user_id, &msg.event_id).await? {
                let total = store
                    .daily_total(user_id, stored.date)
                    .await?
                    .unwrap_or_else(|| DailyTotal::empty(user_id, stored.date));
                tracing::info!(event_id = %msg.event_id, "duplicate delivery, replaying meal");
                return Ok(Outcome::MealLogged {
                    meal: stored,
                    total,
                    duplicate: true,
                });
            }
        }

        let resolved = resolver::resolve(store, &self.catalog, user_id, &query).await?;
        let meal = Meal {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            event_id: msg.event_id.clone(),
            timestamp: msg.timestamp,
            date: self.clock.local_date_of(msg.timestamp),
            description: query.text().to_string(),
            nutrients: resolved.nutrients,
            source: resolved.source,
            tombstoned: false,
        };
        let (meal, total, duplicate) = totals::apply_meal(store, meal).await?;
        Ok(Outcome::MealLogged {
            meal,
            total,
            duplicate,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use tally_core::model::NutrientTuple;

    use crate::catalog::StaticCatalog;
    use crate::clock::FixedClock;
    use crate::sender::RecordingSender;
    use crate::store::MemoryStore;

    use super::*;

    type TestEngine = Engine<MemoryStore, StaticCatalog, FixedClock, RecordingSender>;

    fn start_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 20, 13, 0, 0).unwrap()
    }

    fn engine() -> TestEngine {
        let catalog = StaticCatalog::new()
            .with_name(
                "2 eggs",
                NutrientTuple {
                    calories: 143,
                    protein: 13,
                    carbs: 1,
                    fat: 10,
                },
            )
            .with_barcode(
                "012345678905",
                NutrientTuple {
                    calories: 210,
                    protein: 9,
                    carbs: 30,
                    fat: 6,
                },
            );
        Engine::new(
            MemoryStore::new(),
            catalog,
            FixedClock::new(start_instant(), chrono_tz::America::New_York),
            RecordingSender::new(),
            EngineConfig::default(),
        )
    }

    fn msg(event_id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            event_id: event_id.to_string(),
            user_id: "me".to_string(),
            timestamp: start_instant(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn meal_redelivery_replays_without_double_counting() {
        let engine = engine();
        let first = engine.handle(&msg("evt-1", "2 eggs")).await.unwrap();
        let Outcome::MealLogged {
            total, duplicate, ..
        } = first
        else {
            panic!("expected MealLogged");
        };
        assert!(!duplicate);
        assert_eq!(total.nutrients.calories, 143);

        let replay = engine.handle(&msg("evt-1", "2 eggs")).await.unwrap();
        let Outcome::MealLogged {
            total, duplicate, ..
        } = replay
        else {
            panic!("expected MealLogged");
        };
        assert!(duplicate);
        assert_eq!(total.nutrients.calories, 143);
        assert_eq!(total.meal_count, 1);
    }

    #[tokio::test]
    async fn transient_store_failure_is_retried_before_surfacing() {
        let engine = engine();
        // First write hiccups once; the bounded retry absorbs it and the
        // meal still lands.
        engine.store.inner().fail_next_writes(1);
        let outcome = engine.handle(&msg("evt-1", "2 eggs")).await.unwrap();
        assert!(matches!(outcome, Outcome::MealLogged { .. }));
        let summary = engine.handle(&msg("evt-2", "/summary day")).await.unwrap();
        let Outcome::Summary { meal_count, .. } = summary else {
            panic!("expected Summary");
        };
        assert_eq!(meal_count, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_upstream() {
        let engine = engine();
        engine.store.inner().fail_next_writes(10);
        let err = engine
            .handle(&msg("evt-1", "2 eggs"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Upstream { .. }));
    }

    #[tokio::test]
    async fn override_beats_catalog_in_the_meal_path() {
        let engine = engine();
        engine
            .handle(&msg("evt-1", "/food set 2 eggs k=100 p=10 c=0 f=7"))
            .await
            .unwrap();
        let outcome = engine.handle(&msg("evt-2", "2 eggs")).await.unwrap();
        let Outcome::MealLogged { meal, .. } = outcome else {
            panic!("expected MealLogged");
        };
        assert_eq!(meal.nutrients.calories, 100);
        assert_eq!(meal.source, tally_core::model::ResolutionSource::Override);
    }

    #[tokio::test]
    async fn barcode_message_logs_from_the_upc_catalog() {
        let engine = engine();
        let outcome = engine.handle(&msg("evt-1", "012345678905")).await.unwrap();
        let Outcome::MealLogged { meal, .. } = outcome else {
            panic!("expected MealLogged");
        };
        assert_eq!(meal.nutrients.calories, 210);
        assert_eq!(meal.source, tally_core::model::ResolutionSource::Barcode);
    }

    #[tokio::test]
    async fn lookup_previews_without_logging() {
        let engine = engine();
        let outcome = engine.handle(&msg("evt-1", "/lookup 2 eggs")).await.unwrap();
        assert!(matches!(outcome, Outcome::MealPreview { .. }));
        let summary = engine.handle(&msg("evt-2", "/summary day")).await.unwrap();
        let Outcome::Summary { meal_count, .. } = summary else {
            panic!("expected Summary");
        };
        assert_eq!(meal_count, 0);
    }

    #[tokio::test]
    async fn second_migraine_start_is_rejected() {
        let engine = engine();
        engine.handle(&msg("evt-1", "/migraine start")).await.unwrap();
        let err = engine
            .handle(&msg("evt-2", "/migraine start"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::AlreadyOpen {
                kind: EpisodeKind::Migraine
            }
        );
    }

    #[tokio::test]
    async fn undo_round_trips_the_daily_total() {
        let engine = engine();
        engine.handle(&msg("evt-1", "2 eggs")).await.unwrap();
        let outcome = engine.handle(&msg("evt-2", "/undo")).await.unwrap();
        let Outcome::Undone { total, .. } = outcome else {
            panic!("expected Undone");
        };
        assert_eq!(total.nutrients, NutrientTuple::ZERO);
        assert_eq!(total.meal_count, 0);
    }

    #[tokio::test]
    async fn unknown_food_reports_not_found_and_logs_nothing() {
        let engine = engine();
        let err = engine
            .handle(&msg("evt-1", "mystery stew"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound { .. }));
        let summary = engine.handle(&msg("evt-2", "/summary day")).await.unwrap();
        let Outcome::Summary { meal_count, .. } = summary else {
            panic!("expected Summary");
        };
        assert_eq!(meal_count, 0);
    }

    #[tokio::test]
    async fn dry_run_wrapper_persists_nothing() {
        let engine = engine();
        let outcome = engine.handle(&msg("evt-1", "/test 2 eggs")).await.unwrap();
        let Outcome::DryRun(inner) = outcome else {
            panic!("expected DryRun");
        };
        let Outcome::MealLogged { total, .. } = *inner else {
            panic!("expected MealLogged inside DryRun");
        };
        assert_eq!(total.nutrients.calories, 143);

        // Nothing reached the store, and the reply says so.
        let summary = engine.handle(&msg("evt-2", "/summary day")).await.unwrap();
        let Outcome::Summary { meal_count, .. } = summary else {
            panic!("expected Summary");
        };
        assert_eq!(meal_count, 0);
        let text = engine.reply(&msg("evt-3", "/test /migraine start")).await;
        assert!(text.starts_with("[dry-run] "));
    }

    #[tokio::test]
    async fn dry_run_sees_real_state() {
        let engine = engine();
        engine.handle(&msg("evt-1", "/migraine start")).await.unwrap();
        let err = engine
            .handle(&msg("evt-2", "/test /migraine start"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::AlreadyOpen {
                kind: EpisodeKind::Migraine
            }
        );
    }

    #[tokio::test]
    async fn med_doses_ten_minutes_apart_warn() {
        let engine = engine();
        engine
            .handle(&msg("evt-1", "/med ibuprofen 400mg"))
            .await
            .unwrap();
        engine.clock.advance(Duration::minutes(10));
        let outcome = engine
            .handle(&msg("evt-2", "/med ibuprofen 400mg"))
            .await
            .unwrap();
        let Outcome::DoseLogged { warnings, .. } = outcome else {
            panic!("expected DoseLogged");
        };
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn scheduled_fact_fires_once_per_day() {
        let engine = engine();
        engine
            .add_fact("Honey never spoils.", vec!["food".to_string()])
            .await
            .unwrap();
        engine.handle(&msg("evt-1", "/facts on 9")).await.unwrap();

        // Move to 09:00 New York.
        engine.clock.set(Utc.with_ymd_and_hms(2024, 2, 20, 14, 0, 0).unwrap());
        assert_eq!(engine.tick().await.unwrap().sent, 1);
        assert_eq!(engine.tick().await.unwrap().sent, 0);
        assert_eq!(engine.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn fact_request_serves_on_demand() {
        let engine = engine();
        engine
            .add_fact("Octopuses have three hearts.", vec!["animals".to_string()])
            .await
            .unwrap();
        let outcome = engine
            .handle(&msg("evt-1", "/fact animals"))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::FactSent { .. }));
    }

    #[tokio::test]
    async fn override_delete_and_list() {
        let engine = engine();
        engine
            .handle(&msg("evt-1", "/food set canned tuna k=120 p=26 c=0 f=1"))
            .await
            .unwrap();
        let outcome = engine.handle(&msg("evt-2", "/food list")).await.unwrap();
        let Outcome::OverrideList { overrides } = outcome else {
            panic!("expected OverrideList");
        };
        assert_eq!(overrides.len(), 1);

        engine
            .handle(&msg("evt-3", "/food del canned tuna"))
            .await
            .unwrap();
        let err = engine
            .handle(&msg("evt-4", "/food del canned tuna"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound { .. }));
    }

    #[tokio::test]
    async fn fast_goal_shows_up_in_status() {
        let engine = engine();
        engine.handle(&msg("evt-1", "/fast goal 16")).await.unwrap();
        engine.handle(&msg("evt-2", "/fast start")).await.unwrap();
        engine.clock.advance(Duration::hours(3));
        let outcome = engine.handle(&msg("evt-3", "/fast status")).await.unwrap();
        let Outcome::EpisodeStatus {
            elapsed_minutes,
            goal_minutes,
            ..
        } = outcome
        else {
            panic!("expected EpisodeStatus");
        };
        assert_eq!(elapsed_minutes, Some(180));
        assert_eq!(goal_minutes, Some(960));
    }
}
