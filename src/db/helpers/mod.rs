use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::db::models::DraftStatus;

pub fn to_i64(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_usize(value: i64, field: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| anyhow!("{field} contains invalid value {value}"))
}

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} contains invalid value {value}"))
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_draft_status(value: &str) -> Result<DraftStatus> {
    match value {
        "dirty" => Ok(DraftStatus::Dirty),
        "syncing" => Ok(DraftStatus::Syncing),
        "synced" => Ok(DraftStatus::Synced),
        "error" => Ok(DraftStatus::Error),
        other => Err(anyhow!("unknown draft status {other}")),
    }
}

pub fn parse_shortcut(value: Option<String>) -> Option<char> {
    let value = value?;
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            DraftStatus::Dirty,
            DraftStatus::Syncing,
            DraftStatus::Synced,
            DraftStatus::Error,
        ] {
            assert_eq!(parse_draft_status(status.as_str()).unwrap(), status);
        }
        assert!(parse_draft_status("lost").is_err());
    }

    #[test]
    fn shortcut_must_be_single_char() {
        assert_eq!(parse_shortcut(Some("3".into())), Some('3'));
        assert_eq!(parse_shortcut(Some("12".into())), None);
        assert_eq!(parse_shortcut(None), None);
    }
}
