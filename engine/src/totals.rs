use chrono::{Datelike, Duration};

use tally_core::command::Period;
use tally_core::error::DomainError;
use tally_core::model::{DailyTotal, MacroGoals, Meal, NutrientTuple};
use tally_core::reply::Outcome;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::store::Store;

/// Persist a meal and fold it into its day's total.
///
/// The meal insert is put-if-absent on (user, event id): a redelivered
/// message finds the stored meal, skips the total update, and replays
/// the original result with `duplicate = true`. The total is therefore
/// bumped exactly once per event no matter how many times it arrives.
pub async fn apply_meal<S: Store>(
    store: &S,
    meal: Meal,
) -> Result<(Meal, DailyTotal, bool), DomainError> {
    if store.insert_meal(&meal).await? {
        let total = store
            .add_to_daily_total(&meal.user_id, meal.date, &meal.nutrients, 1)
            .await?;
        return Ok((meal, total, false));
    }
    let stored = store
        .meal_for_event(&meal.user_id, &meal.event_id)
        .await?
        .ok_or_else(|| DomainError::Internal {
            message: format!("meal insert lost for event '{}'", meal.event_id),
        })?;
    let total = store
        .daily_total(&stored.user_id, stored.date)
        .await?
        .unwrap_or_else(|| DailyTotal::empty(&stored.user_id, stored.date));
    Ok((stored, total, true))
}

/// Remove the most recent active meal and back its macros out of the
/// day's total. The subtract is guarded: if it would drive any component
/// negative the store refuses, we leave the tombstone in place, and the
/// caller gets an internal-inconsistency error instead of a corrupted
/// total.
pub async fn undo<S: Store>(store: &S, user_id: &str) -> Result<Outcome, DomainError> {
    let Some(meal) = store.latest_active_meal(user_id).await? else {
        return Err(DomainError::validation("nothing to undo"));
    };
    if !store.tombstone_meal(user_id, meal.id).await? {
        // Lost a race with another undo; the next call sees fresh state.
        return Err(DomainError::validation("nothing to undo"));
    }
    match store
        .subtract_from_daily_total(user_id, meal.date, &meal.nutrients)
        .await?
    {
        Some(total) => {
            tracing::info!(user_id, meal_id = %meal.id, "meal undone");
            Ok(Outcome::Undone { meal, total })
        }
        None => {
            tracing::error!(
                user_id,
                meal_id = %meal.id,
                date = %meal.date,
                "daily total cannot cover undone meal"
            );
            Err(DomainError::Internal {
                message: format!("total for {} does not cover meal {}", meal.date, meal.id),
            })
        }
    }
}

/// Tombstone every active meal logged today and zero the day's total.
pub async fn reset_today<S: Store, K: Clock>(
    store: &S,
    clock: &K,
    user_id: &str,
) -> Result<Outcome, DomainError> {
    let date = clock.today();
    let meals = store.active_meals_on(user_id, date).await?;
    let mut removed = 0;
    for meal in &meals {
        if store.tombstone_meal(user_id, meal.id).await? {
            removed += 1;
        }
    }
    store.zero_daily_total(user_id, date).await?;
    tracing::info!(user_id, %date, removed, "day reset");
    Ok(Outcome::TodayReset { date, removed })
}

/// Aggregate totals for today, the trailing seven days, or the current
/// calendar month so far. Week and month views also carry per-day
/// averages; every view carries the operator's macro goals.
pub async fn summary<S: Store, K: Clock>(
    store: &S,
    clock: &K,
    config: &EngineConfig,
    user_id: &str,
    period: Period,
) -> Result<Outcome, DomainError> {
    let today = clock.today();
    let from = match period {
        Period::Day => today,
        Period::Week => today - Duration::days(6),
        Period::Month => today.with_day(1).unwrap_or(today),
    };
    let totals = store.totals_in_range(user_id, from, today).await?;
    let mut summed = NutrientTuple::ZERO;
    let mut meal_count = 0;
    for day in &totals {
        summed = summed.add(&day.nutrients);
        meal_count += day.meal_count;
    }
    // Averaged over the whole window, zero days included.
    let days = (today - from).num_days() + 1;
    let average = match period {
        Period::Day => None,
        Period::Week | Period::Month => Some(per_day(&summed, days)),
    };
    Ok(Outcome::Summary {
        period,
        from,
        to: today,
        totals: summed,
        meal_count,
        average,
        goals: MacroGoals {
            calories_max: config.calories_max,
            protein_min: config.protein_min,
        },
    })
}

fn per_day(totals: &NutrientTuple, days: i64) -> NutrientTuple {
    let div = |v: i64| ((v as f64) / (days.max(1) as f64)).round() as i64;
    NutrientTuple {
        calories: div(totals.calories),
        protein: div(totals.protein),
        carbs: div(totals.carbs),
        fat: div(totals.fat),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    use tally_core::model::ResolutionSource;

    use crate::clock::FixedClock;
    use crate::store::MemoryStore;

    use super::*;

    fn clock() -> FixedClock {
        FixedClock::new(
            Utc.with_ymd_and_hms(2024, 2, 20, 13, 0, 0).unwrap(),
            chrono_tz::America::New_York,
        )
    }

    fn meal(event_id: &str, calories: i64) -> Meal {
        Meal {
            id: Uuid::now_v7(),
            user_id: "me".to_string(),
            event_id: event_id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 2, 20, 13, 0, 0).unwrap(),
            date: NaiveDate::from_ymd_opt(2024, 2, 20).unwrap(),
            description: "2 eggs".to_string(),
            nutrients: NutrientTuple {
                calories,
                protein: 12,
                carbs: 1,
                fat: 10,
            },
            source: ResolutionSource::Catalog,
            tombstoned: false,
        }
    }

    #[tokio::test]
    async fn duplicate_event_bumps_the_total_once() {
        let store = MemoryStore::new();
        let (_, total, duplicate) = apply_meal(&store, meal("evt-1", 140)).await.unwrap();
        assert!(!duplicate);
        assert_eq!(total.nutrients.calories, 140);

        let (replayed, total, duplicate) = apply_meal(&store, meal("evt-1", 140)).await.unwrap();
        assert!(duplicate);
        assert_eq!(total.nutrients.calories, 140);
        assert_eq!(total.meal_count, 1);
        assert_eq!(replayed.description, "2 eggs");
    }

    #[tokio::test]
    async fn undo_backs_the_latest_meal_out() {
        let store = MemoryStore::new();
        apply_meal(&store, meal("evt-1", 140)).await.unwrap();
        let mut second = meal("evt-2", 300);
        second.timestamp += Duration::hours(1);
        apply_meal(&store, second).await.unwrap();

        let outcome = undo(&store, "me").await.unwrap();
        let Outcome::Undone { meal: undone, total } = outcome else {
            panic!("expected Undone");
        };
        assert_eq!(undone.event_id, "evt-2");
        assert_eq!(total.nutrients.calories, 140);
        assert_eq!(total.meal_count, 1);
    }

    #[tokio::test]
    async fn undo_with_nothing_logged_is_rejected() {
        let store = MemoryStore::new();
        let err = undo(&store, "me").await.unwrap_err();
        assert!(matches!(err, DomainError::Validation { .. }));
    }

    #[tokio::test]
    async fn reset_tombstones_every_meal_and_zeroes_the_day() {
        let store = MemoryStore::new();
        let clock = clock();
        apply_meal(&store, meal("evt-1", 140)).await.unwrap();
        apply_meal(&store, meal("evt-2", 300)).await.unwrap();

        let outcome = reset_today(&store, &clock, "me").await.unwrap();
        let Outcome::TodayReset { removed, .. } = outcome else {
            panic!("expected TodayReset");
        };
        assert_eq!(removed, 2);

        let total = store
            .daily_total("me", clock.today())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(total.nutrients, NutrientTuple::ZERO);
        assert_eq!(total.meal_count, 0);
        // Nothing left to undo either.
        assert!(undo(&store, "me").await.is_err());
    }

    #[tokio::test]
    async fn week_summary_covers_the_trailing_seven_days() {
        let store = MemoryStore::new();
        let clock = clock();
        let today = clock.today();
        let window_start = today - Duration::days(6);
        let delta = NutrientTuple {
            calories: 700,
            protein: 70,
            carbs: 35,
            fat: 21,
        };
        store
            .add_to_daily_total("me", window_start, &delta, 2)
            .await
            .unwrap();
        store
            .add_to_daily_total("me", today, &delta, 1)
            .await
            .unwrap();
        // One day before the window: excluded.
        store
            .add_to_daily_total("me", window_start - Duration::days(1), &delta, 1)
            .await
            .unwrap();

        let outcome = summary(&store, &clock, &EngineConfig::default(), "me", Period::Week)
            .await
            .unwrap();
        let Outcome::Summary {
            totals,
            meal_count,
            from,
            average,
            goals,
            ..
        } = outcome
        else {
            panic!("expected Summary");
        };
        assert_eq!(from, window_start);
        assert_eq!(totals.calories, 1400);
        assert_eq!(meal_count, 3);
        // 1400 kcal over a 7-day window, empty days included.
        assert_eq!(average.unwrap().calories, 200);
        assert_eq!(goals.calories_max, 1800);
        assert_eq!(goals.protein_min, 190);
    }

    #[tokio::test]
    async fn day_summary_has_no_average() {
        let store = MemoryStore::new();
        let clock = clock();
        let outcome = summary(&store, &clock, &EngineConfig::default(), "me", Period::Day)
            .await
            .unwrap();
        let Outcome::Summary { average, .. } = outcome else {
            panic!("expected Summary");
        };
        assert!(average.is_none());
    }
}
