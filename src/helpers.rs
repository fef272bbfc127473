//! Various small helper functions

use std::num::ParseIntError;
use std::time::Duration;

/// Parses a Duration from a string containing seconds.
/// Useful for command line parsing
pub fn parse_seconds(src: &str) -> Result<Duration, ParseIntError> {
    let seconds = src.parse::<u64>()?;
    Ok(Duration::from_secs(seconds))
}

/// Parses a JSON document from a command line argument
pub fn parse_json(src: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(src)
}
