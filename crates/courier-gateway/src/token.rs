// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Gateway token — the pre-shared secret subscribers authenticate with.
//!
//! A 32-byte random token, hex-encoded (64 chars), persisted at
//! `<data_dir>/gateway-token` with mode 0600.  Generated on first run.
//! The file being readable by anyone else is a configuration error: the
//! gateway refuses to start rather than serve with a leaked secret.
//!
//! Comparison uses [`subtle::ConstantTimeEq`] to avoid timing oracles.

use std::path::Path;

use anyhow::Context;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// The in-memory token.  Holds the raw hex string for comparisons.
#[derive(Clone)]
pub struct GatewayToken(String);

impl GatewayToken {
    /// Load the token, generating a fresh one on first run.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            check_permissions(path)?;
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading token file {}", path.display()))?;
            let raw = raw.trim().to_string();
            if raw.len() != 64 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
                anyhow::bail!(
                    "token file {} is malformed (expected 64 hex chars)",
                    path.display()
                );
            }
            return Ok(Self(raw));
        }

        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let raw = hex::encode(bytes);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating token directory {}", parent.display()))?;
        }
        write_secret_file(path, raw.as_bytes())?;
        tracing::info!(path = %path.display(), "generated gateway token");
        Ok(Self(raw))
    }

    /// Constant-time comparison against a provided token.
    pub fn verify(&self, provided: &str) -> bool {
        if provided.len() != self.0.len() {
            return false;
        }
        bool::from(self.0.as_bytes().ct_eq(provided.as_bytes()))
    }

    /// The raw hex token, for display to the local user.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn check_permissions(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(path)
            .with_context(|| format!("inspecting {}", path.display()))?;
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            anyhow::bail!(
                "token file {} has mode {mode:03o}; it must be 0600 — \
                 fix with: chmod 600 {}",
                path.display(),
                path.display()
            );
        }
    }
    Ok(())
}

/// Write `data` to `path` with mode 0o600 on Unix (owner-read/write only).
pub(crate) fn write_secret_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing secret file {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
            .with_context(|| format!("writing secret file {}", path.display()))?;
    }
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_64_hex_chars() {
        let dir = tempfile::tempdir().unwrap();
        let token = GatewayToken::load_or_generate(&dir.path().join("gateway-token")).unwrap();
        assert_eq!(token.as_str().len(), 64);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn reload_returns_the_same_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway-token");
        let a = GatewayToken::load_or_generate(&path).unwrap();
        let b = GatewayToken::load_or_generate(&path).unwrap();
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn verify_accepts_only_the_exact_token() {
        let dir = tempfile::tempdir().unwrap();
        let token = GatewayToken::load_or_generate(&dir.path().join("gateway-token")).unwrap();
        assert!(token.verify(token.as_str()));
        assert!(!token.verify("deadbeef"));
        assert!(!token.verify(""));
    }

    #[test]
    #[cfg(unix)]
    fn token_file_is_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway-token");
        GatewayToken::load_or_generate(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    #[cfg(unix)]
    fn world_readable_token_file_is_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway-token");
        GatewayToken::load_or_generate(&path).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(GatewayToken::load_or_generate(&path).is_err());
    }

    #[test]
    fn malformed_token_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway-token");
        write_secret_file(&path, b"not-a-token").unwrap();
        assert!(GatewayToken::load_or_generate(&path).is_err());
    }
}
