//! Ledger key file loading.
//!
//! Keys arrive as a newline-delimited text file, one base64-encoded
//! serialized key record per line. The records themselves are opaque to this
//! program. Blank lines are skipped; lines that fail to decode are logged
//! and skipped. Only an unreadable file is fatal.

use std::{fs, io, path::Path};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
/// Errors produced when loading ledger keys.
pub enum Error {
    /// The key file could not be read at all.
    #[error("Failed to read key file {path}: {source}")]
    Read {
        /// Path of the unreadable file
        path: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

/// An opaque ledger key, decoded from its base64 transport form.
///
/// The key list is built once at startup and shared read-only between all
/// workers for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerKey(Bytes);

impl LedgerKey {
    /// Wrap an already-decoded serialized key record.
    #[must_use]
    pub fn from_raw(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    /// The raw serialized key record.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Re-encode into the base64 form the remote service expects.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }
}

/// Load ledger keys from the file at `path`.
///
/// # Errors
///
/// Function will return an error if the file cannot be read. Individual
/// malformed lines are logged and skipped, not errors.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<LedgerKey>, Error> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse(&contents))
}

fn parse(contents: &str) -> Vec<LedgerKey> {
    let mut keys = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match STANDARD.decode(trimmed) {
            Ok(raw) => keys.push(LedgerKey(Bytes::from(raw))),
            Err(err) => {
                warn!("skipping undecodable ledger key #{idx} ({line}): {err}");
            }
        }
    }
    keys
}
