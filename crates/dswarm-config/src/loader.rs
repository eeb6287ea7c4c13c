// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Config files searched from lowest to highest priority.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/dswarm/config.yaml")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/dswarm/config.yaml"));
    }
    paths.push(PathBuf::from(".dswarm/config.yaml"));
    paths
}

/// Load configuration by deep-merging every YAML layer found on disk.
/// `extra` (the `--config` flag) is applied last and must exist.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        let p = PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned());
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_layer(&p)?);
    }

    if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty()) {
        return Ok(Config::default());
    }
    serde_yaml::from_value(merged).context("invalid configuration")
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let layer: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    // An empty file parses as null; treat it as an empty layer.
    Ok(match layer {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        other => other,
    })
}

/// Deep-merge `src` into `dst`; src wins on scalar and sequence conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        merge_yaml(&mut dst, val("x: 2"));
        assert_eq!(dst["x"].as_u64(), Some(2));
    }

    #[test]
    fn merge_nested_mappings() {
        let mut dst = val("swarm:\n  debug: true\n  listen_port: 1\n");
        merge_yaml(&mut dst, val("swarm:\n  listen_port: 2\n"));
        assert_eq!(dst["swarm"]["debug"].as_bool(), Some(true));
        assert_eq!(dst["swarm"]["listen_port"].as_u64(), Some(2));
    }

    #[test]
    fn merge_replaces_sequences() {
        let mut dst = val("topics: [a, b]");
        merge_yaml(&mut dst, val("topics: [c]"));
        assert_eq!(dst["topics"].as_sequence().map(|s| s.len()), Some(1));
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        assert!(load(Some(Path::new("/tmp/dswarm_nonexistent_config_xyz.yaml"))).is_err());
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "swarm:\n  max_connections: 3\npeers:\n  - tcp://127.0.0.1:9\nannounce: true").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.swarm.max_connections, 3);
        assert_eq!(cfg.swarm.connect_timeout_secs, 10);
        assert_eq!(cfg.peers, vec!["tcp://127.0.0.1:9"]);
        assert!(cfg.announce);
    }

    #[test]
    fn empty_file_gives_defaults() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.discovery.refresh_secs, 60);
    }

    #[test]
    fn malformed_values_are_reported() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "swarm:\n  listen_port: not-a-port").unwrap();
        assert!(load(Some(f.path())).is_err());
    }
}
