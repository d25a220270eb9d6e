//! Tunable parameters for file access and field storage.
//!
//! A [`Config`] is an explicit value: it is handed to [`crate::File::open_with`],
//! [`crate::load_with`] or [`crate::save_with`] and travels with the tree
//! through its root file. Detached trees use [`Config::default`].
//!
//! Each parameter can also be overridden from the environment with an
//! `NX_` prefix (`NX_LOCK=10`, `NX_MEMORY=500`, ...) via [`Config::from_env`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Parameter names accepted by [`Config::get`] and [`Config::set`].
pub const PARAMETERS: [&str; 8] = [
    "compression",
    "encoding",
    "lock",
    "lockexpiry",
    "lockdirectory",
    "maxsize",
    "memory",
    "recursive",
];

/// Lock timeout used when locking is switched on without an explicit value.
pub const DEFAULT_LOCK_TIMEOUT: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Compression filter applied to fields larger than `max_size`.
    pub compression: Option<String>,
    /// Text encoding used to decode byte strings.
    pub encoding: String,
    /// Lock timeout in seconds; 0 disables locking.
    pub lock: u64,
    /// Age in seconds after which a lock file is considered stale.
    pub lock_expiry: u64,
    /// Directory holding lock files instead of the data directory.
    pub lock_directory: Option<PathBuf>,
    /// Element count above which fields are chunked and compressed.
    pub max_size: usize,
    /// Ceiling in MB for whole-array reads.
    pub memory: usize,
    /// Read the whole hierarchy on load instead of one level at a time.
    pub recursive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compression: Some("gzip".to_string()),
            encoding: "utf-8".to_string(),
            lock: 0,
            lock_expiry: 8 * 3600,
            lock_directory: None,
            max_size: 10_000,
            memory: 2000,
            recursive: false,
        }
    }
}

impl Config {
    /// Defaults overridden by any `NX_<PARAMETER>` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        for name in PARAMETERS {
            if let Ok(value) = std::env::var(format!("NX_{}", name.to_uppercase())) {
                config.set(name, &value)?;
            }
        }
        if config.lock_directory.is_some() && config.lock == 0 {
            config.lock = DEFAULT_LOCK_TIMEOUT;
        }
        Ok(config)
    }

    /// Textual value of a parameter.
    pub fn get(&self, name: &str) -> Result<String> {
        let value = match name {
            "compression" => self.compression.clone().unwrap_or_else(|| "None".into()),
            "encoding" => self.encoding.clone(),
            "lock" => self.lock.to_string(),
            "lockexpiry" => self.lock_expiry.to_string(),
            "lockdirectory" => self
                .lock_directory
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "None".into()),
            "maxsize" => self.max_size.to_string(),
            "memory" => self.memory.to_string(),
            "recursive" => self.recursive.to_string(),
            _ => return Err(invalid_parameter(name)),
        };
        Ok(value)
    }

    /// Set a parameter from its textual form.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let is_none = matches!(value, "None" | "none" | "");
        match name {
            "compression" => {
                self.compression = if is_none { None } else { Some(value.to_string()) };
            }
            "encoding" => self.encoding = value.to_string(),
            "lock" => self.lock = if is_none { 0 } else { parse_int(name, value)? },
            "lockexpiry" => self.lock_expiry = if is_none { 0 } else { parse_int(name, value)? },
            "lockdirectory" => {
                if is_none {
                    self.lock_directory = None;
                } else {
                    self.lock_directory = Some(PathBuf::from(value));
                    if self.lock == 0 {
                        self.lock = DEFAULT_LOCK_TIMEOUT;
                    }
                }
            }
            "maxsize" => self.max_size = parse_int(name, value)? as usize,
            "memory" => self.memory = parse_int(name, value)? as usize,
            "recursive" => {
                self.recursive = matches!(value, "True" | "true" | "Yes" | "yes" | "Y" | "y" | "1");
            }
            _ => return Err(invalid_parameter(name)),
        }
        Ok(())
    }

    /// Set the lock directory after checking that it exists.
    pub fn set_lock_directory(&mut self, dir: Option<PathBuf>) -> Result<()> {
        self.lock_directory = match dir {
            Some(dir) => Some(dir.canonicalize().map_err(|e| {
                Error::Configuration(format!("lock directory '{}': {e}", dir.display()))
            })?),
            None => None,
        };
        Ok(())
    }

    /// Memory ceiling in bytes.
    pub(crate) fn memory_bytes(&self) -> usize {
        self.memory.saturating_mul(1000 * 1000)
    }
}

fn parse_int(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::Configuration(format!("'{name}' must be an integer")))
}

fn invalid_parameter(name: &str) -> Error {
    Error::Configuration(format!("'{name}' is not a valid parameter"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.compression.as_deref(), Some("gzip"));
        assert_eq!(c.lock, 0);
        assert_eq!(c.lock_expiry, 28800);
        assert_eq!(c.max_size, 10000);
        assert_eq!(c.memory, 2000);
        assert!(!c.recursive);
    }

    #[test]
    fn set_parses_text() {
        let mut c = Config::default();
        c.set("compression", "None").unwrap();
        assert_eq!(c.compression, None);
        c.set("maxsize", "500").unwrap();
        assert_eq!(c.max_size, 500);
        c.set("recursive", "yes").unwrap();
        assert!(c.recursive);
        c.set("recursive", "no").unwrap();
        assert!(!c.recursive);
    }

    #[test]
    fn lock_directory_turns_locking_on() {
        let mut c = Config::default();
        c.set("lockdirectory", "/tmp").unwrap();
        assert_eq!(c.lock, DEFAULT_LOCK_TIMEOUT);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut c = Config::default();
        assert!(matches!(c.set("memory", "lots"), Err(Error::Configuration(_))));
        assert!(matches!(c.set("colour", "red"), Err(Error::Configuration(_))));
        assert!(c.get("colour").is_err());
    }

    #[test]
    fn get_round_trips_set() {
        let mut c = Config::default();
        for name in PARAMETERS {
            let value = c.get(name).unwrap();
            c.set(name, &value).unwrap();
        }
        assert_eq!(c, Config::default());
    }

    #[test]
    fn serde_json_round_trip() {
        let mut c = Config::default();
        c.lock = 20;
        let json = serde_json::to_string(&c).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
        let partial: Config = serde_json::from_str(r#"{"memory": 10}"#).unwrap();
        assert_eq!(partial.memory, 10);
        assert_eq!(partial.max_size, 10000);
    }
}
