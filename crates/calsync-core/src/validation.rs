//! # Validation Module
//!
//! Field validation for events and calendars.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Entity constructors (Event::new, Calendar::new)              │
//! │  └── THIS MODULE: required fields, formats, ranges                     │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Database (SQLite)                                            │
//! │  ├── NOT NULL constraints                                              │
//! │  ├── PRIMARY KEY on id                                                 │
//! │  └── partial UNIQUE index on sync_id                                   │
//! │                                                                         │
//! │  Remote pulls skip Layer 1: the remote is the source of truth for      │
//! │  what it sends, so we store it and report anomalies instead.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::{MAX_DESCRIPTION_LEN, MAX_NAME_LEN, MAX_REMINDER_MINUTES, MAX_TITLE_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

fn validate_required_text(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::required(field));
    }

    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(())
}

/// Validates an event title.
///
/// ## Rules
/// - Must not be blank
/// - At most [`MAX_TITLE_LEN`] characters
///
/// ## Example
/// ```rust
/// use calsync_core::validation::validate_title;
///
/// assert!(validate_title("Standup").is_ok());
/// assert!(validate_title("   ").is_err());
/// ```
pub fn validate_title(title: &str) -> ValidationResult<()> {
    validate_required_text("title", title, MAX_TITLE_LEN)
}

/// Validates a calendar name.
pub fn validate_calendar_name(name: &str) -> ValidationResult<()> {
    validate_required_text("name", name, MAX_NAME_LEN)
}

/// Validates an optional free-text description.
pub fn validate_description(description: Option<&str>) -> ValidationResult<()> {
    match description {
        Some(text) if text.chars().count() > MAX_DESCRIPTION_LEN => Err(ValidationError::TooLong {
            field: "description".to_string(),
            max: MAX_DESCRIPTION_LEN,
        }),
        _ => Ok(()),
    }
}

/// Validates a display color.
///
/// ## Rules
/// - `#RRGGBB` or `#AARRGGBB`
/// - Hex digits only
///
/// ## Example
/// ```rust
/// use calsync_core::validation::validate_color;
///
/// assert!(validate_color("#6750A4").is_ok());
/// assert!(validate_color("#FF6750A4").is_ok());
/// assert!(validate_color("purple").is_err());
/// ```
pub fn validate_color(color: &str) -> ValidationResult<()> {
    let color = color.trim();

    if color.is_empty() {
        return Err(ValidationError::required("color"));
    }

    let digits = match color.strip_prefix('#') {
        Some(digits) => digits,
        None => {
            return Err(ValidationError::InvalidFormat {
                field: "color".to_string(),
                reason: "must start with '#'".to_string(),
            })
        }
    };

    if !(digits.len() == 6 || digits.len() == 8) || !digits.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(ValidationError::InvalidFormat {
            field: "color".to_string(),
            reason: "expected #RRGGBB or #AARRGGBB".to_string(),
        });
    }

    Ok(())
}

/// Validates an optional account email (very loose: one '@' with text on both sides).
pub fn validate_account_email(email: Option<&str>) -> ValidationResult<()> {
    let Some(email) = email else {
        return Ok(());
    };

    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(ValidationError::InvalidFormat {
            field: "account_email".to_string(),
            reason: "expected name@domain".to_string(),
        }),
    }
}

// =============================================================================
// Time Validators
// =============================================================================

/// Validates that an event does not end before it starts.
///
/// Zero-length events (`start == end`) are allowed; reminders and
/// all-day markers use them.
pub fn validate_time_range(start: DateTime<Utc>, end: DateTime<Utc>) -> ValidationResult<()> {
    if end < start {
        return Err(ValidationError::EndBeforeStart);
    }
    Ok(())
}

/// Validates a reminder lead time in minutes.
///
/// ## Rules
/// - `None` means no reminder
/// - Otherwise between 0 and [`MAX_REMINDER_MINUTES`] (four weeks)
pub fn validate_reminder(minutes: Option<i32>) -> ValidationResult<()> {
    match minutes {
        Some(m) if m < 0 || i64::from(m) > MAX_REMINDER_MINUTES => Err(ValidationError::OutOfRange {
            field: "reminder_minutes".to_string(),
            min: 0,
            max: MAX_REMINDER_MINUTES,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_validate_title() {
        assert!(validate_title("Standup").is_ok());
        assert_eq!(validate_title(""), Err(ValidationError::required("title")));
        assert!(matches!(
            validate_title(&"x".repeat(MAX_TITLE_LEN + 1)),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_validate_color() {
        assert!(validate_color("#6750a4").is_ok());
        assert!(validate_color("#6750A4").is_ok());
        assert!(validate_color("6750A4").is_err());
        assert!(validate_color("#6750A").is_err());
        assert!(validate_color("#GGGGGG").is_err());
        assert!(validate_color("").is_err());
    }

    #[test]
    fn test_validate_time_range() {
        let start = Utc::now();
        assert!(validate_time_range(start, start).is_ok());
        assert!(validate_time_range(start, start + Duration::minutes(15)).is_ok());
        assert_eq!(
            validate_time_range(start, start - Duration::minutes(1)),
            Err(ValidationError::EndBeforeStart)
        );
    }

    #[test]
    fn test_validate_reminder() {
        assert!(validate_reminder(None).is_ok());
        assert!(validate_reminder(Some(0)).is_ok());
        assert!(validate_reminder(Some(15)).is_ok());
        assert!(validate_reminder(Some(-5)).is_err());
        assert!(validate_reminder(Some(MAX_REMINDER_MINUTES as i32 + 1)).is_err());
    }

    #[test]
    fn test_validate_account_email() {
        assert!(validate_account_email(None).is_ok());
        assert!(validate_account_email(Some("me@example.com")).is_ok());
        assert!(validate_account_email(Some("@example.com")).is_err());
        assert!(validate_account_email(Some("nobody")).is_err());
    }
}
