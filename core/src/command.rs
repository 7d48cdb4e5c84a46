use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::model::{NutrientTuple, normalize_name};

/// Summary window for meal totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Day,
    Week,
    Month,
}

/// Summary window for medication doses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MedsPeriod {
    Day,
    Month,
}

/// `/facts` settings subcommands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactsSubcommand {
    /// Enable daily delivery, optionally setting the hour in one step.
    On { hour: Option<u32> },
    Off,
    Hour(u32),
    /// `None` clears the tag filter.
    Tag(Option<String>),
    To(String),
    Status,
}

/// A classified inbound message. Unrecognized text with no command
/// prefix falls through to `LogMeal` — logging food is the default path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    LogMeal {
        description: String,
    },
    /// Preview: resolve nutrients without persisting anything.
    LookupMeal {
        description: String,
    },
    Barcode {
        code: String,
    },
    FoodOverrideSet {
        name: String,
        barcode: Option<String>,
        nutrients: NutrientTuple,
    },
    FoodOverrideDel {
        name: String,
    },
    FoodOverrideList,
    Summary {
        period: Period,
    },
    Undo,
    ResetToday,
    MigraineStart,
    MigraineEnd,
    MigraineStatus,
    MedLog {
        drug: String,
        dose: String,
        /// Optional backdate, interpreted in the user's timezone.
        when: Option<NaiveDateTime>,
    },
    MedsSummary {
        period: MedsPeriod,
    },
    FactRequest {
        tag: Option<String>,
    },
    FactsSettings(FactsSubcommand),
    FastStart,
    FastEnd,
    FastStatus,
    FastGoal {
        hours: f64,
    },
    /// Dry-run wrapper: the inner command runs with every persistent
    /// write suppressed while still returning the computed reply.
    TestWrapper(Box<Command>),
}

const BARCODE_MIN_DIGITS: usize = 8;
const BARCODE_MAX_DIGITS: usize = 14;

fn looks_like_barcode(text: &str) -> bool {
    let len = text.chars().count();
    (BARCODE_MIN_DIGITS..=BARCODE_MAX_DIGITS).contains(&len)
        && text.chars().all(|c| c.is_ascii_digit())
}

/// Classify raw message text into a typed command.
///
/// Keywords are case-insensitive and the leading slash is optional: a
/// bare keyword whose arguments parse is a command, while bare text that
/// merely starts with a keyword-looking word (e.g. "fast food burger")
/// falls back to the meal path. Slash-prefixed text must parse or it is
/// a validation error — the slash states intent.
pub fn classify(raw: &str) -> Result<Command, DomainError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(DomainError::validation("empty message"));
    }

    if looks_like_barcode(text) {
        return Ok(Command::Barcode {
            code: text.to_string(),
        });
    }

    let (slashed, body) = match text.strip_prefix('/') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, text),
    };

    let mut tokens = body.split_whitespace();
    let keyword = match tokens.next() {
        Some(k) => k.to_lowercase(),
        None => return Err(DomainError::validation("empty command")),
    };
    let rest: Vec<&str> = tokens.collect();

    let parsed = parse_keyword(&keyword, &rest);
    match parsed {
        Some(result) => match result {
            Ok(cmd) => Ok(cmd),
            // A recognized keyword with bad arguments: only trust it as
            // a command when the user typed the slash.
            Err(e) if slashed => Err(e),
            Err(_) => Ok(Command::LogMeal {
                description: text.to_string(),
            }),
        },
        None if slashed => Err(DomainError::validation(format!(
            "unknown command '/{keyword}'"
        ))),
        None => Ok(Command::LogMeal {
            description: text.to_string(),
        }),
    }
}

/// Returns `None` for words that are not command keywords at all.
fn parse_keyword(keyword: &str, rest: &[&str]) -> Option<Result<Command, DomainError>> {
    let cmd = match keyword {
        "log" | "meal" => require_text(rest, "usage: /log <description>")
            .map(|description| Command::LogMeal { description }),
        "lookup" => require_text(rest, "usage: /lookup <description>")
            .map(|description| Command::LookupMeal { description }),
        "barcode" => parse_barcode(rest),
        "food" => parse_food(rest),
        "summary" => parse_summary(rest),
        "undo" => expect_no_args(rest, Command::Undo),
        "reset" => expect_no_args(rest, Command::ResetToday),
        "migraine" => parse_migraine(rest),
        "med" => parse_med(rest),
        "meds" => parse_meds(rest),
        "fact" => Ok(Command::FactRequest {
            tag: (!rest.is_empty()).then(|| normalize_name(&rest.join(" "))),
        }),
        "facts" => parse_facts(rest),
        "fast" => parse_fast(rest),
        "test" => parse_test(rest),
        _ => return None,
    };
    Some(cmd)
}

fn require_text(rest: &[&str], usage: &str) -> Result<String, DomainError> {
    if rest.is_empty() {
        Err(DomainError::validation(usage))
    } else {
        Ok(rest.join(" "))
    }
}

fn expect_no_args(rest: &[&str], cmd: Command) -> Result<Command, DomainError> {
    if rest.is_empty() {
        Ok(cmd)
    } else {
        Err(DomainError::validation("unexpected arguments"))
    }
}

fn parse_barcode(rest: &[&str]) -> Result<Command, DomainError> {
    match rest {
        [code] if looks_like_barcode(code) => Ok(Command::Barcode {
            code: (*code).to_string(),
        }),
        _ => Err(DomainError::validation(
            "usage: /barcode <8-14 digit code>",
        )),
    }
}

fn parse_summary(rest: &[&str]) -> Result<Command, DomainError> {
    let period = match rest {
        [] | ["day"] => Period::Day,
        ["week"] => Period::Week,
        ["month"] => Period::Month,
        _ => return Err(DomainError::validation("usage: /summary [day|week|month]")),
    };
    Ok(Command::Summary { period })
}

fn parse_migraine(rest: &[&str]) -> Result<Command, DomainError> {
    match rest {
        ["start"] => Ok(Command::MigraineStart),
        ["end"] => Ok(Command::MigraineEnd),
        ["status"] => Ok(Command::MigraineStatus),
        _ => Err(DomainError::validation("usage: /migraine start|end|status")),
    }
}

fn parse_meds(rest: &[&str]) -> Result<Command, DomainError> {
    let period = match rest {
        [] | ["month"] => MedsPeriod::Month,
        ["day"] => MedsPeriod::Day,
        _ => return Err(DomainError::validation("usage: /meds [day|month]")),
    };
    Ok(Command::MedsSummary { period })
}

fn parse_fast(rest: &[&str]) -> Result<Command, DomainError> {
    match rest {
        ["start"] => Ok(Command::FastStart),
        ["end"] => Ok(Command::FastEnd),
        ["status"] => Ok(Command::FastStatus),
        ["goal", hours] => {
            let hours: f64 = hours
                .parse()
                .map_err(|_| DomainError::validation("usage: /fast goal <hours>"))?;
            if hours <= 0.0 || hours > 24.0 * 14.0 {
                return Err(DomainError::validation("goal must be between 0 and 336 hours"));
            }
            Ok(Command::FastGoal { hours })
        }
        _ => Err(DomainError::validation(
            "usage: /fast start|end|status|goal <hours>",
        )),
    }
}

fn parse_test(rest: &[&str]) -> Result<Command, DomainError> {
    if rest.is_empty() {
        return Err(DomainError::validation("usage: /test <command>"));
    }
    let inner = classify(&rest.join(" "))?;
    Ok(Command::TestWrapper(Box::new(inner)))
}

/// `/food set <name...> k=<cal> p=<g> c=<g> f=<g>` — name may span
/// multiple words; macro tokens accepted in any order, missing ones
/// default to zero. An all-digit name is stored as a barcode override.
fn parse_food(rest: &[&str]) -> Result<Command, DomainError> {
    match rest.first().map(|s| s.to_lowercase()).as_deref() {
        Some("set") => {
            let mut name_words = Vec::new();
            let mut nutrients = NutrientTuple::ZERO;
            let mut saw_macro = false;
            for token in &rest[1..] {
                if let Some((field, value)) = parse_macro_token(token)? {
                    saw_macro = true;
                    match field {
                        'k' => nutrients.calories = value,
                        'p' => nutrients.protein = value,
                        'c' => nutrients.carbs = value,
                        'f' => nutrients.fat = value,
                        _ => unreachable!(),
                    }
                } else if saw_macro {
                    return Err(DomainError::validation(
                        "food name must come before macro tokens",
                    ));
                } else {
                    name_words.push(*token);
                }
            }
            if name_words.is_empty() {
                return Err(DomainError::validation(
                    "usage: /food set <name> k=<cal> p=<g> c=<g> f=<g>",
                ));
            }
            if !saw_macro {
                return Err(DomainError::validation(
                    "at least one of k=/p=/c=/f= is required",
                ));
            }
            let name = normalize_name(&name_words.join(" "));
            let barcode = looks_like_barcode(&name).then(|| name.clone());
            Ok(Command::FoodOverrideSet {
                name,
                barcode,
                nutrients,
            })
        }
        Some("del") => {
            if rest.len() < 2 {
                return Err(DomainError::validation("usage: /food del <name>"));
            }
            Ok(Command::FoodOverrideDel {
                name: normalize_name(&rest[1..].join(" ")),
            })
        }
        Some("list") => expect_no_args(&rest[1..], Command::FoodOverrideList),
        _ => Err(DomainError::validation("usage: /food set|del|list")),
    }
}

/// Parses `k=120` style tokens. Returns `Ok(None)` for tokens that are
/// not macro assignments (they belong to the food name).
fn parse_macro_token(token: &str) -> Result<Option<(char, i64)>, DomainError> {
    let Some((key, value)) = token.split_once('=') else {
        return Ok(None);
    };
    let key = key.to_lowercase();
    let field = match key.as_str() {
        "k" | "kcal" | "cal" => 'k',
        "p" => 'p',
        "c" => 'c',
        "f" => 'f',
        _ => return Ok(None),
    };
    let parsed: f64 = value
        .parse()
        .map_err(|_| DomainError::validation(format!("bad macro value '{token}'")))?;
    if parsed < 0.0 {
        return Err(DomainError::validation(format!(
            "macro value must not be negative: '{token}'"
        )));
    }
    Ok(Some((field, parsed.round() as i64)))
}

/// `/med <drug...> <dose> [YYYY-MM-DD [HH:MM]]` — trailing date/time
/// tokens backdate the dose; the final non-time token is the dose text
/// and everything before it is the (possibly multi-word) drug name.
fn parse_med(rest: &[&str]) -> Result<Command, DomainError> {
    let mut tokens: Vec<&str> = rest.to_vec();
    let when = take_when(&mut tokens);

    if tokens.len() < 2 {
        return Err(DomainError::validation(
            "usage: /med <drug> <dose> [YYYY-MM-DD [HH:MM]]",
        ));
    }
    let dose = tokens
        .pop()
        .map(|s| s.to_string())
        .unwrap_or_default();
    let drug = normalize_name(&tokens.join(" "));
    Ok(Command::MedLog { drug, dose, when })
}

/// Pops trailing `YYYY-MM-DD [HH:MM]` tokens, if present. Time without a
/// date is not accepted; a bare date means midnight local time.
fn take_when(tokens: &mut Vec<&str>) -> Option<NaiveDateTime> {
    let time = tokens
        .last()
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok());
    let date_index = if time.is_some() {
        tokens.len().checked_sub(2)?
    } else {
        tokens.len().checked_sub(1)?
    };
    let date = NaiveDate::parse_from_str(tokens.get(date_index)?, "%Y-%m-%d").ok()?;

    tokens.truncate(date_index);
    Some(date.and_time(time.unwrap_or(NaiveTime::MIN)))
}

fn parse_facts(rest: &[&str]) -> Result<Command, DomainError> {
    let sub = match rest.first().map(|s| s.to_lowercase()).as_deref() {
        Some("on") => {
            let hour = match rest.get(1) {
                Some(h) => Some(parse_hour(h)?),
                None => None,
            };
            FactsSubcommand::On { hour }
        }
        Some("off") => FactsSubcommand::Off,
        Some("hour") => {
            let h = rest
                .get(1)
                .ok_or_else(|| DomainError::validation("usage: /facts hour <0-23>"))?;
            FactsSubcommand::Hour(parse_hour(h)?)
        }
        Some("tag") => match rest.get(1).map(|s| s.to_lowercase()).as_deref() {
            Some("clear") => FactsSubcommand::Tag(None),
            Some(_) => FactsSubcommand::Tag(Some(normalize_name(&rest[1..].join(" ")))),
            None => {
                return Err(DomainError::validation("usage: /facts tag <tag>|clear"));
            }
        },
        Some("to") => {
            let recipient = rest
                .get(1)
                .ok_or_else(|| DomainError::validation("usage: /facts to <recipient>"))?;
            FactsSubcommand::To((*recipient).to_string())
        }
        Some("status") | None => FactsSubcommand::Status,
        Some(other) => {
            return Err(DomainError::validation(format!(
                "unknown facts subcommand '{other}'"
            )));
        }
    };
    Ok(Command::FactsSettings(sub))
}

fn parse_hour(raw: &str) -> Result<u32, DomainError> {
    let hour: u32 = raw
        .parse()
        .map_err(|_| DomainError::validation(format!("bad hour '{raw}'")))?;
    if hour > 23 {
        return Err(DomainError::validation("hour must be 0-23"));
    }
    Ok(hour)
}
