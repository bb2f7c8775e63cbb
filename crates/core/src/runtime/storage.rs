//! SQLite bootstrap and time helpers shared by the entities

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::Result;

/// Open (creating if needed) the database file backing one entity instance.
/// Layout: `<data_dir>/<kind>/<sanitized-name>.db`.
pub fn open_database(data_dir: &Path, kind: &str, name: &str) -> Result<Connection> {
    let dir = data_dir.join(kind);
    std::fs::create_dir_all(&dir)?;
    let path: PathBuf = dir.join(format!("{}.db", sanitize_name(name)));
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Connection> {
    Ok(Connection::open_in_memory()?)
}

/// Entity names are opaque strings (resource paths, repo ids); escape
/// anything unsafe for a filename while keeping the mapping injective.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' => out.push(byte as char),
            _ => out.push_str(&format!("_{:02x}", byte)),
        }
    }
    out
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Milliseconds elapsed since the given RFC-3339 timestamp, or `None` when
/// the timestamp does not parse.
pub fn ms_since(timestamp: &str, now: DateTime<Utc>) -> Option<i64> {
    parse_rfc3339(timestamp).map(|t| (now - t).num_milliseconds())
}

/// Decode a JSON-array column into strings; tolerates NULL and garbage.
pub fn json_string_vec(raw: Option<String>) -> Vec<String> {
    raw.and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

/// Encode a string slice as a JSON-array column value.
pub fn to_json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_name("phoenix-7.alpha"), "phoenix-7.alpha");
    }

    #[test]
    fn sanitize_escapes_separators() {
        assert_eq!(sanitize_name("src/server"), "src_2fserver");
        assert_ne!(sanitize_name("a/b"), sanitize_name("a_b"));
    }

    #[test]
    fn ms_since_parses_rfc3339() {
        let now = Utc::now();
        let earlier = (now - chrono::Duration::seconds(90)).to_rfc3339();
        let elapsed = ms_since(&earlier, now).unwrap();
        assert!((89_000..=91_000).contains(&elapsed));
    }
}
