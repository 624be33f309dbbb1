//! Environment-scoped settings file.
//!
//! One JSON file holds a section per machine or deployment:
//!
//! ```json
//! {
//!   "default": { "EBOOKS_PATH": "/data/ebooks", "WIKI_BASE_PATH": "/data/wiki" },
//!   "studio":  { "hostname": "mac-studio", "EBOOKS_PATH": "/Volumes/Books" },
//!   "nas":     { "EBOOKS_PATH": "/volume1/ebooks", "PROXIES": { "https": "http://10.0.0.2:7890" } }
//! }
//! ```
//!
//! The section is chosen by a fixed precedence:
//!
//! 1. an explicit selector (`--env`, `PDFSHELF_ENV`): must name a section;
//! 2. the host name: a section whose key or `hostname` equals it, then one
//!    whose `hostname` is contained in it (case-insensitive);
//! 3. `default`.
//!
//! The chosen section is laid over `default`, so shared values only need to
//! be written once. Nested objects are flattened to dotted keys
//! (`PROXIES.https`), arrays to comma-separated strings: the pipeline only
//! ever sees a flat key-value map.

use crate::error::ShelfError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const DEFAULT_SECTION: &str = "default";
const HOSTNAME_KEY: &str = "hostname";

/// A resolved, flat settings section.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    env_name: String,
    values: BTreeMap<String, String>,
}

impl Settings {
    pub fn from_map(env_name: impl Into<String>, values: BTreeMap<String, String>) -> Self {
        Self {
            env_name: env_name.into(),
            values,
        }
    }

    /// Read `path` and resolve a section against this machine's host name.
    pub fn load(path: &Path, selector: Option<&str>) -> Result<Self, ShelfError> {
        let text = std::fs::read_to_string(path).map_err(|e| ShelfError::SettingsUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Self::resolve(&text, selector, host_name().as_deref()).map_err(|e| match e {
            ShelfError::SettingsUnreadable { detail, .. } => ShelfError::SettingsUnreadable {
                path: path.to_path_buf(),
                detail,
            },
            other => other,
        })
    }

    /// Resolve a section from JSON text. `host` is injected for testability.
    pub fn resolve(json: &str, selector: Option<&str>, host: Option<&str>) -> Result<Self, ShelfError> {
        let root: Map<String, Value> =
            serde_json::from_str(json).map_err(|e| ShelfError::SettingsUnreadable {
                path: Default::default(),
                detail: e.to_string(),
            })?;

        let chosen = match selector.filter(|s| !s.is_empty()) {
            Some(name) => {
                if !root.contains_key(name) {
                    return Err(ShelfError::UnknownEnvironment {
                        name: name.to_string(),
                        available: root.keys().cloned().collect::<Vec<_>>().join(", "),
                    });
                }
                name.to_string()
            }
            None => host
                .and_then(|h| match_host(&root, h))
                .unwrap_or_else(|| DEFAULT_SECTION.to_string()),
        };
        debug!("settings: using environment '{}'", chosen);

        let mut values = BTreeMap::new();
        if let Some(Value::Object(base)) = root.get(DEFAULT_SECTION) {
            flatten(base, "", &mut values);
        }
        if chosen != DEFAULT_SECTION {
            if let Some(Value::Object(section)) = root.get(&chosen) {
                flatten(section, "", &mut values);
            }
        }
        values.remove(HOSTNAME_KEY);

        Ok(Self {
            env_name: chosen,
            values,
        })
    }

    /// Name of the section that was selected.
    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    /// A non-empty value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ShelfError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                other => Err(ShelfError::InvalidConfig(format!(
                    "{key}: expected a boolean, got '{other}'"
                ))),
            },
        }
    }

    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ShelfError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v.parse::<T>().map(Some).map_err(|_| {
                ShelfError::InvalidConfig(format!("{key}: cannot parse '{v}'"))
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn match_host(root: &Map<String, Value>, host: &str) -> Option<String> {
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    let section_host = |v: &Value| {
        v.get(HOSTNAME_KEY)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
    };

    // Exact match on the key or the declared hostname wins over a fuzzy one.
    for (key, section) in root {
        if key.to_ascii_lowercase() == host || section_host(section).as_deref() == Some(host.as_str())
        {
            return Some(key.clone());
        }
    }
    for (key, section) in root {
        if let Some(h) = section_host(section) {
            if host.contains(&h) {
                return Some(key.clone());
            }
        }
    }
    None
}

fn flatten(obj: &Map<String, Value>, prefix: &str, out: &mut BTreeMap<String, String>) {
    for (k, v) in obj {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            Value::Null => {}
            Value::String(s) => {
                out.insert(key, s.clone());
            }
            Value::Bool(_) | Value::Number(_) => {
                out.insert(key, v.to_string());
            }
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|i| match i {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                out.insert(key, joined);
            }
            Value::Object(inner) => flatten(inner, &key, out),
        }
    }
}

/// This machine's host name, from the environment or `/etc/hostname`.
pub fn host_name() -> Option<String> {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}
