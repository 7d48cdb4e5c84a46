use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use tally_core::model::{
    DailyTotal, Episode, EpisodeKind, Event, Fact, FactSettings, FoodOverride, Meal,
    MedicationDose, NutrientTuple, ResolutionSource,
};

use super::{Store, StoreError};

/// Production store. Conditional writes lean on the database: unique
/// constraints give put-if-absent (`ON CONFLICT DO NOTHING`), guarded
/// `UPDATE ... WHERE` gives update-if-condition, and `rows_affected`
/// reports whether the condition held. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> PgStore {
        PgStore { pool }
    }
}

fn parse_kind(raw: &str) -> Result<EpisodeKind, StoreError> {
    match raw {
        "migraine" => Ok(EpisodeKind::Migraine),
        "fasting" => Ok(EpisodeKind::Fasting),
        other => Err(StoreError::Corrupt(format!("unknown episode kind '{other}'"))),
    }
}

fn parse_source(raw: &str) -> Result<ResolutionSource, StoreError> {
    match raw {
        "override" => Ok(ResolutionSource::Override),
        "catalog" => Ok(ResolutionSource::Catalog),
        "barcode" => Ok(ResolutionSource::Barcode),
        other => Err(StoreError::Corrupt(format!(
            "unknown resolution source '{other}'"
        ))),
    }
}

#[derive(sqlx::FromRow)]
struct OverrideRow {
    user_id: String,
    name: String,
    barcode: Option<String>,
    calories: i64,
    protein: i64,
    carbs: i64,
    fat: i64,
    created_at: DateTime<Utc>,
}

impl OverrideRow {
    fn into_override(self) -> FoodOverride {
        FoodOverride {
            user_id: self.user_id,
            name: self.name,
            barcode: self.barcode,
            nutrients: NutrientTuple {
                calories: self.calories,
                protein: self.protein,
                carbs: self.carbs,
                fat: self.fat,
            },
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MealRow {
    id: Uuid,
    user_id: String,
    event_id: String,
    ts: DateTime<Utc>,
    date: NaiveDate,
    description: String,
    calories: i64,
    protein: i64,
    carbs: i64,
    fat: i64,
    source: String,
    tombstoned: bool,
}

impl MealRow {
    fn into_meal(self) -> Result<Meal, StoreError> {
        Ok(Meal {
            id: self.id,
            user_id: self.user_id,
            event_id: self.event_id,
            timestamp: self.ts,
            date: self.date,
            description: self.description,
            nutrients: NutrientTuple {
                calories: self.calories,
                protein: self.protein,
                carbs: self.carbs,
                fat: self.fat,
            },
            source: parse_source(&self.source)?,
            tombstoned: self.tombstoned,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TotalRow {
    user_id: String,
    date: NaiveDate,
    calories: i64,
    protein: i64,
    carbs: i64,
    fat: i64,
    meal_count: i64,
}

impl TotalRow {
    fn into_total(self) -> DailyTotal {
        DailyTotal {
            user_id: self.user_id,
            date: self.date,
            nutrients: NutrientTuple {
                calories: self.calories,
                protein: self.protein,
                carbs: self.carbs,
                fat: self.fat,
            },
            meal_count: self.meal_count,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EpisodeRow {
    id: Uuid,
    user_id: String,
    kind: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    open: bool,
}

impl EpisodeRow {
    fn into_episode(self) -> Result<Episode, StoreError> {
        Ok(Episode {
            id: self.id,
            user_id: self.user_id,
            kind: parse_kind(&self.kind)?,
            started_at: self.started_at,
            ended_at: self.ended_at,
            open: self.open,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DoseRow {
    id: Uuid,
    user_id: String,
    drug: String,
    dose: String,
    taken_at: DateTime<Utc>,
}

impl DoseRow {
    fn into_dose(self) -> MedicationDose {
        MedicationDose {
            id: self.id,
            user_id: self.user_id,
            drug: self.drug,
            dose: self.dose,
            taken_at: self.taken_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FactRow {
    id: Uuid,
    user_id: String,
    text: String,
    tags: Vec<String>,
}

impl FactRow {
    fn into_fact(self) -> Fact {
        Fact {
            id: self.id,
            user_id: self.user_id,
            text: self.text,
            tags: self.tags,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FactSettingsRow {
    user_id: String,
    enabled: bool,
    hour: i32,
    recipient: Option<String>,
    tag: Option<String>,
    last_sent: Option<NaiveDate>,
}

impl FactSettingsRow {
    fn into_settings(self) -> FactSettings {
        FactSettings {
            user_id: self.user_id,
            enabled: self.enabled,
            hour: self.hour.max(0) as u32,
            recipient: self.recipient,
            tag: self.tag,
            last_sent: self.last_sent,
        }
    }
}

impl Store for PgStore {
    async fn record_event(&self, event: &Event) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (user_id, event_id, ts, raw_text)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, event_id) DO NOTHING
            "#,
        )
        .bind(&event.user_id)
        .bind(&event.event_id)
        .bind(event.timestamp)
        .bind(&event.raw_text)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn event_seen(&self, user_id: &str, event_id: &str) -> Result<bool, StoreError> {
        let seen: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM events WHERE user_id = $1 AND event_id = $2",
        )
        .bind(user_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(seen.is_some())
    }

    async fn put_override(&self, ov: &FoodOverride) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO food_overrides (user_id, name, barcode, calories, protein, carbs, fat, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, name) DO UPDATE SET
                barcode = EXCLUDED.barcode,
                calories = EXCLUDED.calories,
                protein = EXCLUDED.protein,
                carbs = EXCLUDED.carbs,
                fat = EXCLUDED.fat
            "#,
        )
        .bind(&ov.user_id)
        .bind(&ov.name)
        .bind(&ov.barcode)
        .bind(ov.nutrients.calories)
        .bind(ov.nutrients.protein)
        .bind(ov.nutrients.carbs)
        .bind(ov.nutrients.fat)
        .bind(ov.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_override(&self, user_id: &str, name: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM food_overrides WHERE user_id = $1 AND name = $2")
                .bind(user_id)
                .bind(name)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_override(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<FoodOverride>, StoreError> {
        let row = sqlx::query_as::<_, OverrideRow>(
            r#"
            SELECT user_id, name, barcode, calories, protein, carbs, fat, created_at
            FROM food_overrides
            WHERE user_id = $1 AND (name = $2 OR barcode = $2)
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(OverrideRow::into_override))
    }

    async fn list_overrides(&self, user_id: &str) -> Result<Vec<FoodOverride>, StoreError> {
        let rows = sqlx::query_as::<_, OverrideRow>(
            r#"
            SELECT user_id, name, barcode, calories, protein, carbs, fat, created_at
            FROM food_overrides
            WHERE user_id = $1
            ORDER BY name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(OverrideRow::into_override).collect())
    }

    async fn insert_meal(&self, meal: &Meal) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO meals (id, user_id, event_id, ts, date, description,
                               calories, protein, carbs, fat, source, tombstoned)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (user_id, event_id) DO NOTHING
            "#,
        )
        .bind(meal.id)
        .bind(&meal.user_id)
        .bind(&meal.event_id)
        .bind(meal.timestamp)
        .bind(meal.date)
        .bind(&meal.description)
        .bind(meal.nutrients.calories)
        .bind(meal.nutrients.protein)
        .bind(meal.nutrients.carbs)
        .bind(meal.nutrients.fat)
        .bind(meal.source.as_str())
        .bind(meal.tombstoned)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn meal_for_event(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> Result<Option<Meal>, StoreError> {
        let row = sqlx::query_as::<_, MealRow>(
            r#"
            SELECT id, user_id, event_id, ts, date, description,
                   calories, protein, carbs, fat, source, tombstoned
            FROM meals
            WHERE user_id = $1 AND event_id = $2
            "#,
        )
        .bind(user_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MealRow::into_meal).transpose()
    }

    async fn latest_active_meal(&self, user_id: &str) -> Result<Option<Meal>, StoreError> {
        let row = sqlx::query_as::<_, MealRow>(
            r#"
            SELECT id, user_id, event_id, ts, date, description,
                   calories, protein, carbs, fat, source, tombstoned
            FROM meals
            WHERE user_id = $1 AND NOT tombstoned
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MealRow::into_meal).transpose()
    }

    async fn active_meals_on(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Meal>, StoreError> {
        let rows = sqlx::query_as::<_, MealRow>(
            r#"
            SELECT id, user_id, event_id, ts, date, description,
                   calories, protein, carbs, fat, source, tombstoned
            FROM meals
            WHERE user_id = $1 AND date = $2 AND NOT tombstoned
            ORDER BY ts, id
            "#,
        )
        .bind(user_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MealRow::into_meal).collect()
    }

    async fn tombstone_meal(&self, user_id: &str, meal_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE meals SET tombstoned = TRUE
            WHERE user_id = $1 AND id = $2 AND NOT tombstoned
            "#,
        )
        .bind(user_id)
        .bind(meal_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn add_to_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
        meals_delta: i64,
    ) -> Result<DailyTotal, StoreError> {
        let row = sqlx::query_as::<_, TotalRow>(
            r#"
            INSERT INTO daily_totals (user_id, date, calories, protein, carbs, fat, meal_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, date) DO UPDATE SET
                calories = daily_totals.calories + EXCLUDED.calories,
                protein = daily_totals.protein + EXCLUDED.protein,
                carbs = daily_totals.carbs + EXCLUDED.carbs,
                fat = daily_totals.fat + EXCLUDED.fat,
                meal_count = daily_totals.meal_count + EXCLUDED.meal_count
            RETURNING user_id, date, calories, protein, carbs, fat, meal_count
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(delta.calories)
        .bind(delta.protein)
        .bind(delta.carbs)
        .bind(delta.fat)
        .bind(meals_delta)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_total())
    }

    async fn subtract_from_daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
        delta: &NutrientTuple,
    ) -> Result<Option<DailyTotal>, StoreError> {
        let row = sqlx::query_as::<_, TotalRow>(
            r#"
            UPDATE daily_totals SET
                calories = calories - $3,
                protein = protein - $4,
                carbs = carbs - $5,
                fat = fat - $6,
                meal_count = meal_count - 1
            WHERE user_id = $1 AND date = $2
              AND calories >= $3 AND protein >= $4 AND carbs >= $5 AND fat >= $6
              AND meal_count >= 1
            RETURNING user_id, date, calories, protein, carbs, fat, meal_count
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(delta.calories)
        .bind(delta.protein)
        .bind(delta.carbs)
        .bind(delta.fat)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TotalRow::into_total))
    }

    async fn zero_daily_total(&self, user_id: &str, date: NaiveDate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO daily_totals (user_id, date, calories, protein, carbs, fat, meal_count)
            VALUES ($1, $2, 0, 0, 0, 0, 0)
            ON CONFLICT (user_id, date) DO UPDATE SET
                calories = 0, protein = 0, carbs = 0, fat = 0, meal_count = 0
            "#,
        )
        .bind(user_id)
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_total(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyTotal>, StoreError> {
        let row = sqlx::query_as::<_, TotalRow>(
            r#"
            SELECT user_id, date, calories, protein, carbs, fat, meal_count
            FROM daily_totals
            WHERE user_id = $1 AND date = $2
            "#,
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TotalRow::into_total))
    }

    async fn totals_in_range(
        &self,
        user_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyTotal>, StoreError> {
        let rows = sqlx::query_as::<_, TotalRow>(
            r#"
            SELECT user_id, date, calories, protein, carbs, fat, meal_count
            FROM daily_totals
            WHERE user_id = $1 AND date BETWEEN $2 AND $3
            ORDER BY date
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TotalRow::into_total).collect())
    }

    async fn open_episode(&self, episode: &Episode) -> Result<bool, StoreError> {
        // The partial unique index on (user_id, kind) WHERE open makes
        // this a single atomic check-and-set.
        let result = sqlx::query(
            r#"
            INSERT INTO episodes (id, user_id, kind, started_at, ended_at, open)
            VALUES ($1, $2, $3, $4, NULL, TRUE)
            ON CONFLICT (user_id, kind) WHERE open DO NOTHING
            "#,
        )
        .bind(episode.id)
        .bind(&episode.user_id)
        .bind(episode.kind.as_str())
        .bind(episode.started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_open_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
    ) -> Result<Option<Episode>, StoreError> {
        let row = sqlx::query_as::<_, EpisodeRow>(
            r#"
            SELECT id, user_id, kind, started_at, ended_at, open
            FROM episodes
            WHERE user_id = $1 AND kind = $2 AND open
            "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(EpisodeRow::into_episode).transpose()
    }

    async fn close_episode(
        &self,
        user_id: &str,
        kind: EpisodeKind,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<Episode>, StoreError> {
        let row = sqlx::query_as::<_, EpisodeRow>(
            r#"
            UPDATE episodes SET ended_at = $3, open = FALSE
            WHERE user_id = $1 AND kind = $2 AND open
            RETURNING id, user_id, kind, started_at, ended_at, open
            "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(ended_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EpisodeRow::into_episode).transpose()
    }

    async fn insert_dose(&self, dose: &MedicationDose) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO medication_doses (id, user_id, drug, dose, taken_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(dose.id)
        .bind(&dose.user_id)
        .bind(&dose.drug)
        .bind(&dose.dose)
        .bind(dose.taken_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_dose_of(
        &self,
        user_id: &str,
        drug: &str,
    ) -> Result<Option<MedicationDose>, StoreError> {
        let row = sqlx::query_as::<_, DoseRow>(
            r#"
            SELECT id, user_id, drug, dose, taken_at
            FROM medication_doses
            WHERE user_id = $1 AND drug = $2
            ORDER BY taken_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(drug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DoseRow::into_dose))
    }

    async fn doses_between(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MedicationDose>, StoreError> {
        let rows = sqlx::query_as::<_, DoseRow>(
            r#"
            SELECT id, user_id, drug, dose, taken_at
            FROM medication_doses
            WHERE user_id = $1 AND taken_at >= $2 AND taken_at < $3
            ORDER BY taken_at, id
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DoseRow::into_dose).collect())
    }

    async fn put_fact(&self, fact: &Fact) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO facts (id, user_id, text, tags)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(fact.id)
        .bind(&fact.user_id)
        .bind(&fact.text)
        .bind(&fact.tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_facts(&self, user_id: &str) -> Result<Vec<Fact>, StoreError> {
        let rows = sqlx::query_as::<_, FactRow>(
            "SELECT id, user_id, text, tags FROM facts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FactRow::into_fact).collect())
    }

    async fn fact_settings(&self, user_id: &str) -> Result<Option<FactSettings>, StoreError> {
        let row = sqlx::query_as::<_, FactSettingsRow>(
            r#"
            SELECT user_id, enabled, hour, recipient, tag, last_sent
            FROM fact_settings
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FactSettingsRow::into_settings))
    }

    async fn put_fact_settings(&self, settings: &FactSettings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fact_settings (user_id, enabled, hour, recipient, tag, last_sent)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                hour = EXCLUDED.hour,
                recipient = EXCLUDED.recipient,
                tag = EXCLUDED.tag,
                last_sent = EXCLUDED.last_sent
            "#,
        )
        .bind(&settings.user_id)
        .bind(settings.enabled)
        .bind(settings.hour as i32)
        .bind(&settings.recipient)
        .bind(&settings.tag)
        .bind(settings.last_sent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enabled_fact_settings(&self) -> Result<Vec<FactSettings>, StoreError> {
        let rows = sqlx::query_as::<_, FactSettingsRow>(
            r#"
            SELECT user_id, enabled, hour, recipient, tag, last_sent
            FROM fact_settings
            WHERE enabled
            ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(FactSettingsRow::into_settings)
            .collect())
    }

    async fn mark_fact_sent(&self, user_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fact_settings SET last_sent = $2
            WHERE user_id = $1 AND (last_sent IS NULL OR last_sent <> $2)
            "#,
        )
        .bind(user_id)
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_fast_goal(&self, user_id: &str, minutes: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fast_goals (user_id, goal_minutes)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET goal_minutes = EXCLUDED.goal_minutes
            "#,
        )
        .bind(user_id)
        .bind(minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fast_goal(&self, user_id: &str) -> Result<Option<i64>, StoreError> {
        let goal: Option<i64> =
            sqlx::query_scalar("SELECT goal_minutes FROM fast_goals WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(goal)
    }
}
