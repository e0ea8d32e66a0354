//! Signal-number mapping loader
//!
//! Parses `.vsi` files mapping signal names to numeric IDs. The format is
//! line-oriented: the first non-blank line is the file format version (a
//! float), every following non-blank line is `name number`. Rule files may
//! only reference signals present in this mapping; inputs may arrive by
//! name or by numeric ID, with IDs translated back to names at ingress.

use crate::types::{PolicyError, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Bidirectional signal name/number mapping
#[derive(Debug, Default)]
pub struct SignalMap {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
    version: f64,
}

impl SignalMap {
    /// Load a mapping from a `.vsi` file
    pub fn load(path: &Path) -> Result<Self> {
        log::info!("Loading signal number file: {:?}", path);
        let file = std::fs::File::open(path)?;
        let map = Self::from_reader(BufReader::new(file))?;
        log::info!(
            "Signal number file loaded: {} signals, version {}",
            map.len(),
            map.version()
        );
        Ok(map)
    }

    /// Parse a mapping from any line-oriented reader
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut map = SignalMap::default();
        let mut version_seen = false;

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if !version_seen {
                map.version = trimmed.parse::<f64>().map_err(|e| {
                    PolicyError::SignalMapParse(format!(
                        "line {}: bad version number '{}': {}",
                        lineno + 1,
                        trimmed,
                        e
                    ))
                })?;
                version_seen = true;
                continue;
            }

            let mut parts = trimmed.split_whitespace();
            let (name, id_text) = match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(id), None) => (name, id),
                _ => {
                    return Err(PolicyError::SignalMapParse(format!(
                        "line {}: expected 'name number', got '{}'",
                        lineno + 1,
                        trimmed
                    )))
                }
            };

            let id = id_text.parse::<u32>().map_err(|e| {
                PolicyError::SignalMapParse(format!(
                    "line {}: bad signal number '{}': {}",
                    lineno + 1,
                    id_text,
                    e
                ))
            })?;

            map.by_name.insert(name.to_string(), id);
            map.by_id.insert(id, name.to_string());
        }

        if !version_seen {
            return Err(PolicyError::SignalMapParse(
                "file contains no version line".to_string(),
            ));
        }

        Ok(map)
    }

    /// Mapping for tests and embedded use
    pub fn from_pairs(pairs: &[(&str, u32)]) -> Self {
        let mut map = SignalMap {
            version: 1.0,
            ..SignalMap::default()
        };
        for (name, id) in pairs {
            map.by_name.insert(name.to_string(), *id);
            map.by_id.insert(*id, name.to_string());
        }
        map
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn version(&self) -> f64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
