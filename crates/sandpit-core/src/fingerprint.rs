//! Content digests identifying a unique build input.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const FORMAT_TAG: &[u8] = b"sandpit-build-v1";

/// Hex-encoded SHA-256 over (toolchain, flags, normalized source).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(source: &str, toolchain: &str, flags: &[String]) -> Self {
        let normalized = normalize_source(source);

        let mut hasher = Sha256::new();
        update_field(&mut hasher, FORMAT_TAG);
        update_field(&mut hasher, toolchain.as_bytes());
        hasher.update((flags.len() as u64).to_le_bytes());
        for flag in flags {
            update_field(&mut hasher, flag.as_bytes());
        }
        update_field(&mut hasher, normalized.as_bytes());

        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Accepts only the 64 lowercase hex characters a digest renders to, so a
    /// parsed fingerprint is always safe to use as a directory name.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Fingerprint(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Length prefixes keep ("ab", "c") and ("a", "bc") apart.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Line endings are the only thing normalized.
pub fn normalize_source(source: &str) -> String {
    source.replace("\r\n", "\n").replace('\r', "\n")
}
