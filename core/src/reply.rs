use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::command::{MedsPeriod, Period};
use crate::error::{DomainError, DoseWarning, DoseWarningKind};
use crate::model::{
    DailyTotal, Episode, EpisodeKind, Fact, FactSettings, FoodOverride, MacroGoals, Meal,
    MedicationDose, NutrientTuple, ResolutionSource,
};

/// The structured result of handling one command. The transport layer
/// turns this into user-facing text via [`render`]; the engine itself
/// never formats strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    MealLogged {
        meal: Meal,
        total: DailyTotal,
        /// True when this was a redelivery of an already-processed event
        /// and the original result was replayed.
        duplicate: bool,
    },
    MealPreview {
        description: String,
        nutrients: NutrientTuple,
        source: ResolutionSource,
    },
    OverrideSaved {
        name: String,
        nutrients: NutrientTuple,
    },
    OverrideDeleted {
        name: String,
    },
    OverrideList {
        overrides: Vec<FoodOverride>,
    },
    Summary {
        period: Period,
        from: NaiveDate,
        to: NaiveDate,
        totals: NutrientTuple,
        meal_count: i64,
        /// Per-day averages over the window; `None` for the day view.
        average: Option<NutrientTuple>,
        goals: MacroGoals,
    },
    Undone {
        meal: Meal,
        total: DailyTotal,
    },
    TodayReset {
        date: NaiveDate,
        removed: i64,
    },
    EpisodeStarted {
        episode: Episode,
    },
    EpisodeEnded {
        episode: Episode,
        duration_minutes: i64,
    },
    EpisodeStatus {
        kind: EpisodeKind,
        open: Option<Episode>,
        elapsed_minutes: Option<i64>,
        /// Fasting only: the configured goal, for progress in the reply.
        goal_minutes: Option<i64>,
    },
    DoseLogged {
        dose: MedicationDose,
        warnings: Vec<DoseWarning>,
    },
    MedsSummary {
        period: MedsPeriod,
        from: NaiveDate,
        to: NaiveDate,
        doses: Vec<MedicationDose>,
    },
    FactSent {
        fact: Fact,
    },
    FactsUpdated {
        settings: FactSettings,
    },
    FastGoalSet {
        hours: f64,
    },
    /// Wraps the outcome a dry-run would have produced; nothing was
    /// persisted.
    DryRun(Box<Outcome>),
}

/// Compose the final reply text for a handled command. Pure function:
/// no side effects beyond returning the string.
pub fn render(result: &Result<Outcome, DomainError>) -> String {
    match result {
        Ok(outcome) => compose(outcome),
        Err(err) => compose_error(err),
    }
}

pub fn compose(outcome: &Outcome) -> String {
    match outcome {
        Outcome::MealLogged {
            meal,
            total,
            duplicate,
        } => {
            let mut text = format!(
                "Logged: {}\n{}\nToday so far: {} ({} meals)",
                meal.description,
                macros_line(&meal.nutrients),
                macros_line(&total.nutrients),
                total.meal_count,
            );
            if *duplicate {
                text.push_str("\n(already logged — duplicate delivery ignored)");
            }
            text
        }
        Outcome::MealPreview {
            description,
            nutrients,
            source,
        } => format!(
            "Lookup: {}\n{}\nSource: {} (not logged)",
            description,
            macros_line(nutrients),
            source.as_str(),
        ),
        Outcome::OverrideSaved { name, nutrients } => {
            format!("Saved custom food: {}\n{}", name, macros_line(nutrients))
        }
        Outcome::OverrideDeleted { name } => format!("Deleted custom food: {name}"),
        Outcome::OverrideList { overrides } => {
            if overrides.is_empty() {
                return "No custom foods saved.".to_string();
            }
            let mut lines = vec![format!("Custom foods ({}):", overrides.len())];
            for ov in overrides {
                lines.push(format!("- {}: {}", ov.name, macros_line(&ov.nutrients)));
            }
            lines.join("\n")
        }
        Outcome::Summary {
            period,
            from,
            to,
            totals,
            meal_count,
            average,
            goals,
        } => {
            let label = match period {
                Period::Day => format!("Today ({from})"),
                Period::Week => format!("Week {from} to {to}"),
                Period::Month => format!("Month {from} to {to}"),
            };
            let mut text = format!("{label}\n{}\nMeals: {meal_count}", macros_line(totals));
            if let Some(avg) = average {
                text.push_str(&format!("\nPer day: {}", macros_line(avg)));
            }
            text.push_str(&format!(
                "\nGoals: calories <= {}, protein >= {}g",
                goals.calories_max, goals.protein_min
            ));
            text
        }
        Outcome::Undone { meal, total } => format!(
            "Removed: {}\n{}\nToday now: {} ({} meals)",
            meal.description,
            macros_line(&meal.nutrients),
            macros_line(&total.nutrients),
            total.meal_count,
        ),
        Outcome::TodayReset { date, removed } => {
            format!("Reset {date}: removed {removed} meals, totals zeroed.")
        }
        Outcome::EpisodeStarted { episode } => {
            format!("{} started.", episode.kind.label())
        }
        Outcome::EpisodeEnded {
            episode,
            duration_minutes,
        } => format!(
            "{} ended after {}.",
            episode.kind.label(),
            duration_line(*duration_minutes)
        ),
        Outcome::EpisodeStatus {
            kind,
            open,
            elapsed_minutes,
            goal_minutes,
        } => match (open, elapsed_minutes) {
            (Some(_), Some(elapsed)) => {
                let mut text = format!(
                    "{} open for {}.",
                    kind.label(),
                    duration_line(*elapsed)
                );
                if let Some(goal) = goal_minutes {
                    text.push_str(&format!(" Goal: {}.", duration_line(*goal)));
                }
                text
            }
            _ => format!("No open {}.", kind.as_str()),
        },
        Outcome::DoseLogged { dose, warnings } => {
            let mut text = format!("Logged {} {}.", dose.drug, dose.dose);
            for warning in warnings {
                let prefix = match warning.kind {
                    DoseWarningKind::Safety => "⚠️ Safety",
                    DoseWarningKind::Quota => "⚠️ Quota",
                };
                text.push_str(&format!("\n{prefix}: {}", warning.message));
            }
            text
        }
        Outcome::MedsSummary {
            period,
            from,
            to,
            doses,
        } => {
            let label = match period {
                MedsPeriod::Day => format!("Meds today ({from})"),
                MedsPeriod::Month => format!("Meds {from} — {to}"),
            };
            if doses.is_empty() {
                return format!("{label}: none logged.");
            }
            let mut lines = vec![format!("{label}: {} doses", doses.len())];
            for dose in doses {
                lines.push(format!(
                    "- {} {} at {}",
                    dose.drug,
                    dose.dose,
                    dose.taken_at.format("%Y-%m-%d %H:%M"),
                ));
            }
            lines.join("\n")
        }
        Outcome::FactSent { fact } => format!("🧠 Fact:\n{}", fact.text),
        Outcome::FactsUpdated { settings } => {
            let state = if settings.enabled { "enabled" } else { "disabled" };
            let mut text = format!("Daily facts {state}, hour {}:00.", settings.hour);
            if let Some(tag) = &settings.tag {
                text.push_str(&format!(" Tag filter: {tag}."));
            }
            if let Some(recipient) = &settings.recipient {
                text.push_str(&format!(" Sending to {recipient}."));
            }
            text
        }
        Outcome::FastGoalSet { hours } => format!("Fasting goal set to {hours}h."),
        Outcome::DryRun(inner) => format!("[dry-run] {}", compose(inner)),
    }
}

pub fn compose_error(err: &DomainError) -> String {
    match err {
        DomainError::Validation { message } => format!("Can't do that: {message}"),
        DomainError::NotFound { query } => format!("No match found for '{query}'."),
        DomainError::AlreadyOpen { kind } => format!(
            "{} already running — end it first with /{} end.",
            kind.label(),
            kind_keyword(kind),
        ),
        DomainError::NoOpenEpisode { kind } => format!(
            "No open {} — start one with /{} start.",
            kind.as_str(),
            kind_keyword(kind),
        ),
        DomainError::DuplicateEvent { .. } => {
            "Already processed that message.".to_string()
        }
        DomainError::Upstream { .. } => {
            "Something upstream failed — your data is safe, try again shortly.".to_string()
        }
        DomainError::Internal { .. } => {
            "Internal inconsistency detected — nothing was changed, please check /summary."
                .to_string()
        }
    }
}

fn kind_keyword(kind: &EpisodeKind) -> &'static str {
    match kind {
        EpisodeKind::Migraine => "migraine",
        EpisodeKind::Fasting => "fast",
    }
}

fn macros_line(n: &NutrientTuple) -> String {
    format!(
        "Calories {}, P {}g, C {}g, F {}g",
        n.calories, n.protein, n.carbs, n.fat
    )
}

fn duration_line(minutes: i64) -> String {
    let minutes = minutes.max(0);
    let hours = minutes / 60;
    let rest = minutes % 60;
    if hours == 0 {
        format!("{rest}m")
    } else {
        format!("{hours}h {rest}m")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::*;

    #[test]
    fn meal_logged_reply_includes_macros_and_running_total() {
        let meal = Meal {
            id: Uuid::now_v7(),
            user_id: "me".to_string(),
            event_id: "evt-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 2, 20, 13, 0, 0).unwrap(),
            date: NaiveDate::from_ymd_opt(2024, 2, 20).unwrap(),
            description: "2 eggs".to_string(),
            nutrients: NutrientTuple {
                calories: 140,
                protein: 12,
                carbs: 1,
                fat: 10,
            },
            source: ResolutionSource::Override,
            tombstoned: false,
        };
        let total = DailyTotal {
            user_id: "me".to_string(),
            date: meal.date,
            nutrients: meal.nutrients,
            meal_count: 1,
        };
        let text = compose(&Outcome::MealLogged {
            meal,
            total,
            duplicate: false,
        });
        assert!(text.contains("Logged: 2 eggs"));
        assert!(text.contains("Calories 140, P 12g, C 1g, F 10g"));
        assert!(text.contains("1 meals"));
    }

    #[test]
    fn week_summary_reply_carries_averages_and_goals() {
        let text = compose(&Outcome::Summary {
            period: Period::Week,
            from: NaiveDate::from_ymd_opt(2024, 2, 14).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 2, 20).unwrap(),
            totals: NutrientTuple {
                calories: 7000,
                protein: 700,
                carbs: 350,
                fat: 210,
            },
            meal_count: 14,
            average: Some(NutrientTuple {
                calories: 1000,
                protein: 100,
                carbs: 50,
                fat: 30,
            }),
            goals: MacroGoals {
                calories_max: 1800,
                protein_min: 190,
            },
        });
        assert!(text.contains("Per day: Calories 1000, P 100g, C 50g, F 30g"));
        assert!(text.contains("Goals: calories <= 1800, protein >= 190g"));
    }

    #[test]
    fn day_summary_reply_has_no_average_line() {
        let text = compose(&Outcome::Summary {
            period: Period::Day,
            from: NaiveDate::from_ymd_opt(2024, 2, 20).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 2, 20).unwrap(),
            totals: NutrientTuple::ZERO,
            meal_count: 0,
            average: None,
            goals: MacroGoals {
                calories_max: 1800,
                protein_min: 190,
            },
        });
        assert!(!text.contains("Per day:"));
        assert!(text.contains("Goals:"));
    }

    #[test]
    fn dry_run_reply_is_prefixed() {
        let text = compose(&Outcome::DryRun(Box::new(Outcome::FastGoalSet {
            hours: 16.0,
        })));
        assert!(text.starts_with("[dry-run] "));
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(duration_line(205), "3h 25m");
        assert_eq!(duration_line(45), "45m");
    }

    #[test]
    fn dose_warnings_are_appended() {
        let dose = MedicationDose {
            id: Uuid::now_v7(),
            user_id: "me".to_string(),
            drug: "ibuprofen".to_string(),
            dose: "400mg".to_string(),
            taken_at: Utc.with_ymd_and_hms(2024, 2, 20, 13, 0, 0).unwrap(),
        };
        let text = compose(&Outcome::DoseLogged {
            dose,
            warnings: vec![DoseWarning {
                kind: DoseWarningKind::Safety,
                message: "last ibuprofen was 10m ago (minimum interval 4h)".to_string(),
            }],
        });
        assert!(text.contains("Logged ibuprofen 400mg."));
        assert!(text.contains("⚠️ Safety"));
    }
}
