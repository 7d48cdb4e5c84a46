use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Injected time source. The pipeline never reads a global clock, so
/// tests can fix "now" and the user's timezone travels with it.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn timezone(&self) -> Tz;

    /// Today's calendar date in the user's timezone.
    fn today(&self) -> NaiveDate {
        self.now_utc().with_timezone(&self.timezone()).date_naive()
    }

    /// Current hour (0-23) in the user's timezone.
    fn local_hour(&self) -> u32 {
        use chrono::Timelike;
        self.now_utc().with_timezone(&self.timezone()).hour()
    }

    /// The user-tz calendar date of an arbitrary instant.
    fn local_date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.timezone()).date_naive()
    }

    /// Resolve a wall-clock local datetime to UTC. DST gaps and folds
    /// resolve to the earliest valid instant; `None` only for times that
    /// do not exist at all.
    fn local_to_utc(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.timezone()
            .from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Production clock: system time plus the configured user timezone.
#[derive(Debug, Clone)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> SystemClock {
        SystemClock { tz }
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}

/// Test clock pinned to an instant; `advance` moves it forward.
#[derive(Debug)]
pub struct FixedClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    tz: Tz,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>, tz: Tz) -> FixedClock {
        FixedClock {
            now: std::sync::Mutex::new(now),
            tz,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 2, 20, 13, 0, 0).unwrap();
        let clock = FixedClock::new(start, chrono_tz::America::New_York);
        clock.advance(Duration::minutes(10));
        assert_eq!(clock.now_utc(), start + Duration::minutes(10));
    }

    #[test]
    fn today_uses_the_user_timezone() {
        // 02:00 UTC on the 21st is still the evening of the 20th in
        // New York.
        let clock = FixedClock::new(
            Utc.with_ymd_and_hms(2024, 2, 21, 2, 0, 0).unwrap(),
            chrono_tz::America::New_York,
        );
        assert_eq!(
            clock.today(),
            chrono::NaiveDate::from_ymd_opt(2024, 2, 20).unwrap()
        );
        assert_eq!(clock.local_hour(), 21);
    }
}
