use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

use tally_core::command::MedsPeriod;
use tally_core::error::{DomainError, DoseWarning, DoseWarningKind};
use tally_core::model::MedicationDose;
use tally_core::reply::Outcome;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::store::Store;

/// Log a medication dose, attaching warnings but never refusing. The
/// user took the medication whether or not it was wise; the record must
/// exist either way.
pub async fn log_dose<S: Store, K: Clock>(
    store: &S,
    clock: &K,
    config: &EngineConfig,
    user_id: &str,
    drug: &str,
    dose: &str,
    when: Option<NaiveDateTime>,
) -> Result<Outcome, DomainError> {
    let taken_at = match when {
        Some(local) => clock.local_to_utc(local).ok_or_else(|| {
            DomainError::validation(format!(
                "{local} does not exist in {}",
                clock.timezone()
            ))
        })?,
        None => clock.now_utc(),
    };

    let mut warnings = Vec::new();
    if let Some(prev) = store.last_dose_of(user_id, drug).await? {
        let gap = (taken_at - prev.taken_at).abs();
        if gap < config.med_min_interval {
            warnings.push(DoseWarning {
                kind: DoseWarningKind::Safety,
                message: format!(
                    "last {drug} was {} ago (minimum interval {}h)",
                    format_gap(gap),
                    config.med_min_interval.num_hours(),
                ),
            });
        }
    }

    let (from, to) = month_window(clock, taken_at)?;
    let this_month = store.doses_between(user_id, from, to).await?.len() as u32;
    if this_month + 1 > config.med_monthly_quota {
        warnings.push(DoseWarning {
            kind: DoseWarningKind::Quota,
            message: format!(
                "dose {} this month, over the monthly quota of {}",
                this_month + 1,
                config.med_monthly_quota,
            ),
        });
    }

    let record = MedicationDose {
        id: Uuid::now_v7(),
        user_id: user_id.to_string(),
        drug: drug.to_string(),
        dose: dose.to_string(),
        taken_at,
    };
    store.insert_dose(&record).await?;
    tracing::info!(user_id, drug, warnings = warnings.len(), "dose logged");
    Ok(Outcome::DoseLogged {
        dose: record,
        warnings,
    })
}

/// List doses for today or the current calendar month, in the user's
/// timezone.
pub async fn summary<S: Store, K: Clock>(
    store: &S,
    clock: &K,
    user_id: &str,
    period: MedsPeriod,
) -> Result<Outcome, DomainError> {
    let today = clock.today();
    let (from_date, to_date) = match period {
        MedsPeriod::Day => (today, today),
        MedsPeriod::Month => month_dates(today),
    };
    let from = day_start_utc(clock, from_date)?;
    let to = day_start_utc(clock, to_date + Duration::days(1))?;
    let doses = store.doses_between(user_id, from, to).await?;
    Ok(Outcome::MedsSummary {
        period,
        from: from_date,
        to: to_date,
        doses,
    })
}

/// First and last local calendar dates of the month containing `date`.
fn month_dates(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let first = date.with_day(1).unwrap_or(date);
    let next_first = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    }
    .unwrap_or(first);
    (first, next_first - Duration::days(1))
}

/// UTC half-open window covering the local calendar month of `instant`.
fn month_window<K: Clock>(
    clock: &K,
    instant: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), DomainError> {
    let (first, last) = month_dates(clock.local_date_of(instant));
    Ok((
        day_start_utc(clock, first)?,
        day_start_utc(clock, last + Duration::days(1))?,
    ))
}

fn day_start_utc<K: Clock>(clock: &K, date: NaiveDate) -> Result<DateTime<Utc>, DomainError> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| DomainError::validation(format!("invalid date {date}")))?;
    clock.local_to_utc(midnight).ok_or_else(|| {
        DomainError::validation(format!("{midnight} does not exist in {}", clock.timezone()))
    })
}

fn format_gap(gap: Duration) -> String {
    let minutes = gap.num_minutes().max(0);
    if minutes < 60 {
        format!("{minutes}m")
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}
