//! Short human-legible ids.
//!
//! Ids are lowercase alphanumeric suffixes used to disambiguate resource names and
//! operations. They are not unique in any cryptographic sense; callers accept the
//! collision probability of a few random characters.

use once_cell::sync::Lazy;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Length used when callers do not ask for one.
pub const DEFAULT_ID_LENGTH: usize = 4;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static GLOBAL_IDS: Lazy<IdRegistry> = Lazy::new(IdRegistry::new);

/// Generates a fresh random id of `len` characters.
pub fn new_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())])).collect()
}

/// Returns the process-wide id memoised under `name`, generating it on first use.
///
/// The length only applies to the first call for a name.
pub fn shared_id(name: &str, len: usize) -> String {
    GLOBAL_IDS.shared_id(name, len)
}

/// Generates an id, memoised under `shared_name` when one is given.
pub fn next_id(shared_name: Option<&str>, len: usize) -> String {
    match shared_name {
        Some(name) => shared_id(name, len),
        None => new_id(len),
    }
}

/// Memo of named ids.
///
/// The process keeps one global registry behind [`shared_id`]; sessions that need
/// their own namespace can own a registry instead.
#[derive(Debug, Default)]
pub struct IdRegistry {
    shared: Mutex<HashMap<String, String>>,
}

impl IdRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id stored under `name`, generating one of `len` characters first
    /// if needed.
    pub fn shared_id(&self, name: &str, len: usize) -> String {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared
            .entry(name.to_string())
            .or_insert_with(|| {
                let id = new_id(len);
                debug!(name = %name, id = %id, "Generated shared id");
                id
            })
            .clone()
    }

    /// Drops the id stored under `name`, returning it.
    pub fn forget(&self, name: &str) -> Option<String> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner).remove(name)
    }
}
