use rand::Rng;
use uuid::Uuid;

use tally_core::command::FactsSubcommand;
use tally_core::error::DomainError;
use tally_core::model::{Fact, FactSettings};
use tally_core::reply::{Outcome, compose};

use crate::clock::Clock;
use crate::config::{EngineConfig, TagMatch};
use crate::sender::MessageSender;
use crate::store::Store;

/// What one scheduled tick did, for the caller's logs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub sent: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Save a fact to the pool.
pub async fn add_fact<S: Store>(
    store: &S,
    user_id: &str,
    text: &str,
    tags: Vec<String>,
) -> Result<Fact, DomainError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(DomainError::validation("fact text is empty"));
    }
    let fact = Fact {
        id: Uuid::now_v7(),
        user_id: user_id.to_string(),
        text: text.to_string(),
        tags: tags.into_iter().map(|t| t.to_lowercase()).collect(),
    };
    store.put_fact(&fact).await?;
    Ok(fact)
}

/// Serve a fact on demand. Explicit requests bypass the daily gate —
/// the gate protects the scheduled push, not the user asking.
pub async fn request_fact<S: Store>(
    store: &S,
    config: &EngineConfig,
    user_id: &str,
    tag: Option<&str>,
) -> Result<Outcome, DomainError> {
    let facts = store.list_facts(user_id).await?;
    if facts.is_empty() {
        return Err(DomainError::validation("no facts saved yet"));
    }
    let pool: Vec<Fact> = match tag {
        Some(filter) => facts
            .into_iter()
            .filter(|fact| matches_tag(fact, filter, config.tag_match))
            .collect(),
        None => facts,
    };
    let Some(fact) = pick(&pool) else {
        return Err(DomainError::NotFound {
            query: tag.unwrap_or("any").to_string(),
        });
    };
    Ok(Outcome::FactSent { fact })
}

/// Apply one settings subcommand and report the resulting settings.
pub async fn update_settings<S: Store>(
    store: &S,
    config: &EngineConfig,
    user_id: &str,
    sub: &FactsSubcommand,
) -> Result<Outcome, DomainError> {
    let mut settings = store
        .fact_settings(user_id)
        .await?
        .unwrap_or_else(|| FactSettings::defaults(user_id, config.default_fact_hour));

    match sub {
        FactsSubcommand::Status => {
            return Ok(Outcome::FactsUpdated { settings });
        }
        FactsSubcommand::On { hour } => {
            settings.enabled = true;
            if let Some(hour) = hour {
                settings.hour = *hour;
            }
        }
        FactsSubcommand::Off => settings.enabled = false,
        FactsSubcommand::Hour(hour) => settings.hour = *hour,
        FactsSubcommand::Tag(tag) => {
            settings.tag = tag.as_ref().map(|t| t.to_lowercase());
        }
        FactsSubcommand::To(recipient) => settings.recipient = Some(recipient.clone()),
    }
    if settings.hour > 23 {
        return Err(DomainError::validation("hour must be 0-23"));
    }
    store.put_fact_settings(&settings).await?;
    Ok(Outcome::FactsUpdated { settings })
}

/// One scheduled tick: for every enabled user whose delivery hour is now
/// and who has not received today's fact, pick one and push it.
///
/// The gate is advanced before the send. If the send then fails the day
/// is burned, which is the accepted trade: a missed fact is annoying, a
/// doubled one erodes trust in every other idempotency promise.
pub async fn hourly_tick<S: Store, K: Clock, M: MessageSender>(
    store: &S,
    clock: &K,
    sender: &M,
    config: &EngineConfig,
) -> Result<TickReport, DomainError> {
    let today = clock.today();
    let hour = clock.local_hour();
    let mut report = TickReport::default();

    for settings in store.enabled_fact_settings().await? {
        if settings.hour != hour || settings.last_sent == Some(today) {
            report.skipped += 1;
            continue;
        }
        let facts = store.list_facts(&settings.user_id).await?;
        let pool: Vec<Fact> = match &settings.tag {
            Some(filter) => facts
                .into_iter()
                .filter(|fact| matches_tag(fact, filter, config.tag_match))
                .collect(),
            None => facts,
        };
        let Some(fact) = pick(&pool) else {
            tracing::debug!(user_id = %settings.user_id, "no facts match, skipping delivery");
            report.skipped += 1;
            continue;
        };
        if !store.mark_fact_sent(&settings.user_id, today).await? {
            // Another tick got here first.
            report.skipped += 1;
            continue;
        }
        let recipient = settings.recipient.as_deref().unwrap_or(&settings.user_id);
        let text = compose(&Outcome::FactSent { fact });
        match sender.send(recipient, &text).await {
            Ok(()) => report.sent += 1,
            Err(err) => {
                tracing::warn!(user_id = %settings.user_id, error = %err, "fact delivery failed");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

fn matches_tag(fact: &Fact, filter: &str, mode: TagMatch) -> bool {
    let filter = filter.to_lowercase();
    fact.tags.iter().any(|tag| {
        let tag = tag.to_lowercase();
        match mode {
            TagMatch::Exact => tag == filter,
            TagMatch::Substring => tag.contains(&filter),
        }
    })
}

fn pick(pool: &[Fact]) -> Option<Fact> {
    if pool.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..pool.len());
    Some(pool[idx].clone())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    use crate::clock::FixedClock;
    use crate::sender::RecordingSender;
    use crate::store::MemoryStore;

    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    // 14:00 UTC is 09:00 in New York — the default delivery hour.
    fn nine_am_clock() -> FixedClock {
        FixedClock::new(
            Utc.with_ymd_and_hms(2024, 2, 20, 14, 0, 0).unwrap(),
            chrono_tz::America::New_York,
        )
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        add_fact(&store, "me", "Octopuses have three hearts.", vec!["animals".to_string()])
            .await
            .unwrap();
        add_fact(&store, "me", "Honey never spoils.", vec!["food".to_string()])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn tag_filter_narrows_the_pool() {
        let store = seeded_store().await;
        let outcome = request_fact(&store, &config(), "me", Some("animals"))
            .await
            .unwrap();
        let Outcome::FactSent { fact } = outcome else {
            panic!("expected FactSent");
        };
        assert!(fact.tags.contains(&"animals".to_string()));
    }

    #[tokio::test]
    async fn unmatched_tag_is_not_found() {
        let store = seeded_store().await;
        let err = request_fact(&store, &config(), "me", Some("space"))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound { .. }));
    }

    #[tokio::test]
    async fn substring_matching_widens_the_filter() {
        let store = seeded_store().await;
        let mut config = config();
        config.tag_match = TagMatch::Substring;
        let outcome = request_fact(&store, &config, "me", Some("anim"))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::FactSent { .. }));
    }

    #[tokio::test]
    async fn tick_delivers_once_per_day() {
        let store = seeded_store().await;
        let clock = nine_am_clock();
        let sender = RecordingSender::new();
        update_settings(&store, &config(), "me", &FactsSubcommand::On { hour: None })
            .await
            .unwrap();

        let report = hourly_tick(&store, &clock, &sender, &config())
            .await
            .unwrap();
        assert_eq!(report.sent, 1);

        // Same hour re-run (retried tick): gated out.
        let report = hourly_tick(&store, &clock, &sender, &config())
            .await
            .unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(sender.sent().len(), 1);
        assert!(sender.sent()[0].1.starts_with("🧠 Fact:"));

        // Next day at the same hour it fires again.
        clock.advance(Duration::days(1));
        let report = hourly_tick(&store, &clock, &sender, &config())
            .await
            .unwrap();
        assert_eq!(report.sent, 1);
    }

    #[tokio::test]
    async fn tick_outside_the_delivery_hour_does_nothing() {
        let store = seeded_store().await;
        let clock = nine_am_clock();
        clock.advance(Duration::hours(2));
        let sender = RecordingSender::new();
        update_settings(&store, &config(), "me", &FactsSubcommand::On { hour: None })
            .await
            .unwrap();

        let report = hourly_tick(&store, &clock, &sender, &config())
            .await
            .unwrap();
        assert_eq!(report.sent, 0);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_send_burns_the_day() {
        let store = seeded_store().await;
        let clock = nine_am_clock();
        let sender = RecordingSender::new();
        sender.set_failing(true);
        update_settings(&store, &config(), "me", &FactsSubcommand::On { hour: None })
            .await
            .unwrap();

        let report = hourly_tick(&store, &clock, &sender, &config())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        // Gate already advanced; the retry does not double-send.
        sender.set_failing(false);
        let report = hourly_tick(&store, &clock, &sender, &config())
            .await
            .unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(
            store
                .fact_settings("me")
                .await
                .unwrap()
                .unwrap()
                .last_sent,
            Some(NaiveDate::from_ymd_opt(2024, 2, 20).unwrap())
        );
    }

    #[tokio::test]
    async fn settings_subcommands_compose() {
        let store = MemoryStore::new();
        update_settings(&store, &config(), "me", &FactsSubcommand::On { hour: Some(8) })
            .await
            .unwrap();
        update_settings(
            &store,
            &config(),
            "me",
            &FactsSubcommand::Tag(Some("Animals".to_string())),
        )
        .await
        .unwrap();
        let outcome = update_settings(&store, &config(), "me", &FactsSubcommand::Status)
            .await
            .unwrap();
        let Outcome::FactsUpdated { settings } = outcome else {
            panic!("expected FactsUpdated");
        };
        assert!(settings.enabled);
        assert_eq!(settings.hour, 8);
        assert_eq!(settings.tag.as_deref(), Some("animals"));
    }
}
