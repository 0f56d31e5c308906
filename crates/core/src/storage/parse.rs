//! Database value parsing utilities
//!
//! Provides error-safe parsing of stored values.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Error as SqlError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

fn conversion_error<E>(column: usize, err: E) -> SqlError
where
    E: std::error::Error + Send + Sync + 'static,
{
    SqlError::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

/// Parse a UUID from a database string column
pub fn parse_uuid(s: &str) -> Result<Uuid, SqlError> {
    Uuid::parse_str(s).map_err(|e| conversion_error(0, e))
}

/// Parse an optional UUID from a database string column
pub fn parse_uuid_opt(s: Option<String>) -> Result<Option<Uuid>, SqlError> {
    s.map(|s| parse_uuid(&s)).transpose()
}

/// Fixed-width RFC3339 so that text ordering matches time ordering
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a DateTime from an RFC3339 string
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, SqlError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(0, e))
}

/// Parse an optional DateTime from an RFC3339 string
pub fn parse_datetime_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, SqlError> {
    s.map(|s| parse_datetime(&s)).transpose()
}

/// Decode a JSON text column
pub fn parse_json<T: DeserializeOwned>(s: &str) -> Result<T, SqlError> {
    serde_json::from_str(s).map_err(|e| conversion_error(0, e))
}

/// Decode a nullable JSON text column
pub fn parse_json_opt<T: DeserializeOwned>(s: Option<String>) -> Result<Option<T>, SqlError> {
    s.map(|s| parse_json(&s)).transpose()
}

/// Encode a value for a JSON text column
pub fn to_json<T: Serialize>(value: &T) -> crate::error::Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Parse an enum stored by name, using the type's own `parse`
pub fn parse_named<T>(s: &str, parse: fn(&str) -> Option<T>) -> Result<T, SqlError> {
    parse(s).ok_or_else(|| {
        conversion_error(
            0,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown stored value '{}'", s),
            ),
        )
    })
}

/// Extension trait for converting rusqlite Results to Option
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, SqlError>;
}

impl<T> OptionalExt<T> for Result<T, SqlError> {
    fn optional(self) -> Result<Option<T>, SqlError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(SqlError::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
