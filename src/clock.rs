// src/clock.rs

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;

use crate::errors::{AppError, AppResult};

/// Local calendar date for `tz` at the current instant.
pub fn today(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}

/// Resolves an optional IANA name, falling back to `default`.
pub fn resolve_tz(name: Option<&str>, default: Tz) -> AppResult<Tz> {
    match name {
        None => Ok(default),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| AppError::Validation(format!("unknown timezone '{}'", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_named_timezones() {
        assert_eq!(resolve_tz(Some("Europe/Brussels"), Tz::UTC).unwrap(), Tz::Europe__Brussels);
        assert_eq!(resolve_tz(None, Tz::Asia__Tokyo).unwrap(), Tz::Asia__Tokyo);
        assert!(resolve_tz(Some("Mars/Olympus"), Tz::UTC).is_err());
    }
}
