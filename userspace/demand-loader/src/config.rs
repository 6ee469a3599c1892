// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Launcher configuration loaded from TOML.
//!
//! ```toml
//! [log]
//! level = "info"
//!
//! [env]
//! inherit = true
//! set = { LANG = "C" }
//! unset = ["LD_PRELOAD"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    pub log: LogConfig,
    pub env: EnvConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `env_logger` filter string, e.g. `info` or `demand_loader=debug`.
    pub level: Option<String>,
}

/// Environment handed to the launched program.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvConfig {
    pub inherit: bool,
    pub set: BTreeMap<String, String>,
    pub unset: Vec<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self { inherit: true, set: BTreeMap::new(), unset: Vec::new() }
    }
}

impl LauncherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Builds `KEY=VALUE` entries from `inherited` and the `[env]` table.
    ///
    /// Inherited variables keep their order; `set` entries override or
    /// append; `unset` wins over both.
    pub fn environment<I>(&self, inherited: I) -> Vec<Vec<u8>>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let unset: BTreeSet<&[u8]> = self.env.unset.iter().map(|key| key.as_bytes()).collect();
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        if self.env.inherit {
            for (key, value) in inherited {
                let key = key.as_bytes();
                if !self.env.set.contains_key(&*String::from_utf8_lossy(key)) {
                    entries.push((key.to_vec(), value.as_bytes().to_vec()));
                }
            }
        }
        for (key, value) in &self.env.set {
            entries.push((key.as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        entries
            .into_iter()
            .filter(|(key, _)| !unset.contains(key.as_slice()))
            .map(|(mut key, value)| {
                key.push(b'=');
                key.extend_from_slice(&value);
                key
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs.iter().map(|(k, v)| (OsString::from(k), OsString::from(v))).collect()
    }

    #[test]
    fn defaults_inherit_everything() {
        let config = LauncherConfig::default();
        let env = config.environment(vars(&[("A", "1"), ("B", "2")]));
        assert_eq!(env, vec![b"A=1".to_vec(), b"B=2".to_vec()]);
        assert!(config.log.level.is_none());
    }

    #[test]
    fn set_overrides_and_unset_removes() {
        let config: LauncherConfig = toml::from_str(
            r#"
            [env]
            set = { B = "two", C = "3" }
            unset = ["A"]
            "#,
        )
        .expect("parse");
        let env = config.environment(vars(&[("A", "1"), ("B", "2")]));
        assert_eq!(env, vec![b"B=two".to_vec(), b"C=3".to_vec()]);
    }

    #[test]
    fn inherit_false_starts_empty() {
        let config: LauncherConfig = toml::from_str("[env]\ninherit = false\nset = { X = \"y\" }").expect("parse");
        assert_eq!(config.environment(vars(&[("A", "1")])), vec![b"X=y".to_vec()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<LauncherConfig>("[log]\nverbosity = 3").is_err());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[log]\nlevel = \"debug\"").expect("write");
        let config = LauncherConfig::load(file.path()).expect("load");
        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert!(config.env.inherit);
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = LauncherConfig::load(Path::new("/nonexistent/demand-loader.toml")).expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
