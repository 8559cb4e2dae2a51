//! Process configuration, read once from `GUESTBOOK_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::model::TableId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("venue file {}: {source}", path.display())]
    VenueIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("venue file {}: {source}", path.display())]
    VenueParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub venue_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            bind: lookup("GUESTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_var(&lookup, "GUESTBOOK_PORT")?.unwrap_or(5433),
            data_dir: lookup("GUESTBOOK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            max_connections: parse_var(&lookup, "GUESTBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parse_var(&lookup, "GUESTBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parse_var(&lookup, "GUESTBOOK_METRICS_PORT")?,
            venue_file: lookup("GUESTBOOK_VENUE_FILE").map(PathBuf::from),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("guestbook.wal")
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

/// Tables to provision at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VenueFile {
    pub tables: Vec<TableSeed>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TableSeed {
    pub table_id: TableId,
    pub capacity: u32,
}

impl VenueFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::VenueIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::VenueParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.venue_file, None);
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/guestbook.wal"));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("GUESTBOOK_BIND", "127.0.0.1"),
            ("GUESTBOOK_PORT", "6543"),
            ("GUESTBOOK_METRICS_PORT", " 9100 "),
            ("GUESTBOOK_VENUE_FILE", "/etc/venue.json"),
        ]))
        .unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6543");
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.venue_file, Some(PathBuf::from("/etc/venue.json")));
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[("GUESTBOOK_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("GUESTBOOK_PORT"));
    }

    #[test]
    fn venue_file_loads() {
        let dir = std::env::temp_dir().join("guestbook_test_config");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("venue.json");
        std::fs::write(
            &path,
            r#"{"tables":[{"table_id":1,"capacity":10},{"table_id":2,"capacity":6}]}"#,
        )
        .unwrap();

        let venue = VenueFile::load(&path).unwrap();
        assert_eq!(
            venue.tables,
            vec![
                TableSeed { table_id: 1, capacity: 10 },
                TableSeed { table_id: 2, capacity: 6 },
            ]
        );
    }

    #[test]
    fn venue_file_errors_name_the_path() {
        let path = std::env::temp_dir().join("guestbook_test_config_missing.json");
        let _ = std::fs::remove_file(&path);
        let err = VenueFile::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::VenueIo { .. }));
        assert!(err.to_string().contains("guestbook_test_config_missing.json"));
    }
}
