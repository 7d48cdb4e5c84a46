use chrono::Duration;
use chrono_tz::Tz;

/// How the fact tag filter matches against a fact's tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMatch {
    Exact,
    Substring,
}

/// Operator configuration, read once at startup. Thresholds live here
/// and nowhere else — call sites never hard-code them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed sentinel for a single-user deployment.
    pub user_id: String,
    pub timezone: Tz,
    /// Minimum interval between doses of the same drug before a
    /// SafetyWarning is attached.
    pub med_min_interval: Duration,
    /// Doses of any drug per calendar month before a QuotaWarning.
    pub med_monthly_quota: u32,
    /// Daily calorie ceiling reported with summaries.
    pub calories_max: i64,
    /// Daily protein floor (grams) reported with summaries.
    pub protein_min: i64,
    /// Delivery hour used when a user enables facts without picking one.
    pub default_fact_hour: u32,
    pub tag_match: TagMatch,
    /// Bounded retries for transient store failures on conditional
    /// writes. Condition failures are never retried.
    pub store_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            user_id: "me".to_string(),
            timezone: chrono_tz::America::New_York,
            med_min_interval: Duration::hours(4),
            med_monthly_quota: 10,
            calories_max: 1800,
            protein_min: 190,
            default_fact_hour: 9,
            tag_match: TagMatch::Exact,
            store_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Build from environment, falling back to defaults for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        EngineConfig {
            user_id: std::env::var("USER_ID").unwrap_or(defaults.user_id),
            timezone: std::env::var("TZ_NAME")
                .ok()
                .and_then(|tz| tz.parse().ok())
                .unwrap_or(defaults.timezone),
            med_min_interval: env_i64("MED_MIN_INTERVAL_HOURS")
                .map(Duration::hours)
                .unwrap_or(defaults.med_min_interval),
            med_monthly_quota: env_i64("MED_MONTHLY_QUOTA")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.med_monthly_quota),
            calories_max: env_i64("CALORIES_MAX").unwrap_or(defaults.calories_max),
            protein_min: env_i64("PROTEIN_MIN").unwrap_or(defaults.protein_min),
            default_fact_hour: env_i64("DEFAULT_DAILY_HOUR")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|h| *h <= 23)
                .unwrap_or(defaults.default_fact_hour),
            tag_match: match std::env::var("FACT_TAG_MATCH")
                .unwrap_or_default()
                .to_lowercase()
                .as_str()
            {
                "substring" => TagMatch::Substring,
                _ => TagMatch::Exact,
            },
            store_retries: defaults.store_retries,
        }
    }
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Credentials and endpoint for the external nutrition catalog.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub app_id: String,
    pub app_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl CatalogConfig {
    pub fn from_env() -> Option<Self> {
        Some(CatalogConfig {
            app_id: std::env::var("NUTRITION_APP_ID").ok()?,
            app_key: std::env::var("NUTRITION_APP_KEY").ok()?,
            base_url: std::env::var("NUTRITION_BASE_URL")
                .unwrap_or_else(|_| "https://trackapi.nutritionix.com".to_string()),
            timeout_secs: 10,
        })
    }
}
