// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::schema::GatewayConfig;

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/courier/gateway.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/courier/gateway.yaml"));
    }
    paths.push(PathBuf::from(".courier/gateway.yaml"));
    paths
}

/// Load the gateway config by deep-merging every layer found in the search
/// paths, then `extra` on top when given.
pub fn load(extra: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading gateway config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit gateway config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty()) {
        return Ok(GatewayConfig::default());
    }
    serde_yaml::from_value(merged).context("assembling gateway config")
}

/// Recursively merge `src` into `dst`. Mappings merge key-by-key; any other
/// value in `src` replaces the destination wholesale.
pub fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
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

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(&path, "http:\n  bind: \"127.0.0.1:9999\"\n").unwrap();
        let c = load(Some(&path)).unwrap();
        assert_eq!(c.http.bind, "127.0.0.1:9999");
        // Untouched fields keep their defaults.
        assert!(c.http.tls);
    }

    #[test]
    fn merge_overrides_scalar_leaves_siblings() {
        let mut base: serde_yaml::Value =
            serde_yaml::from_str("http:\n  bind: a\n  tls: true\n").unwrap();
        let layer: serde_yaml::Value = serde_yaml::from_str("http:\n  bind: b\n").unwrap();
        merge_yaml(&mut base, layer);
        let http = base.get("http").unwrap();
        assert_eq!(http.get("bind").unwrap().as_str(), Some("b"));
        assert_eq!(http.get("tls").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn merge_replaces_sequences_wholesale() {
        let mut base: serde_yaml::Value = serde_yaml::from_str("list: [1, 2]\n").unwrap();
        let layer: serde_yaml::Value = serde_yaml::from_str("list: [3]\n").unwrap();
        merge_yaml(&mut base, layer);
        assert_eq!(base.get("list").unwrap().as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "http: [unclosed\n").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
