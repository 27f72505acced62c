//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program.

use std::{
    num::{NonZeroU16, NonZeroU64},
    path::PathBuf,
};

use http::Uri;
use serde::{Deserialize, Serialize};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The URI of the ledger-data service to query, must be a valid URI
    #[serde(with = "http_serde::uri")]
    pub target_uri: Uri,
    /// Path to the newline-delimited base64 key file
    pub key_file: PathBuf,
    /// The number of concurrent worker loops to run
    #[serde(default = "default_workers")]
    pub workers: NonZeroU16,
    /// The base seed for random key selection. Each worker derives its own
    /// stream from this value and its index.
    #[serde(default = "default_seed")]
    pub seed: [u8; 32],
    /// The reporting worker emits a statistics block every this many of its
    /// own queries.
    #[serde(default = "default_report_interval")]
    pub report_interval: NonZeroU64,
}

impl Config {
    /// Parse a [`Config`] from a YAML document.
    ///
    /// # Errors
    ///
    /// Function will return an error if the document does not deserialize
    /// into a valid `Config`.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

fn default_workers() -> NonZeroU16 {
    NonZeroU16::MIN
}

fn default_seed() -> [u8; 32] {
    rand::random()
}

fn default_report_interval() -> NonZeroU64 {
    NonZeroU64::new(10).expect("10 is non-zero")
}
