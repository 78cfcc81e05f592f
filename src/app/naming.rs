//! Unique application names.

use std::collections::HashSet;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 20;

/// Generates `<fixture>-<20 random chars>` names, never repeating one.
///
/// Each worker owns one generator seeded independently, so names do not
/// collide across workers either.
#[derive(Debug)]
pub struct NameGenerator {
    rng: Mutex<StdRng>,
    issued: Mutex<HashSet<String>>,
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl NameGenerator {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            issued: Mutex::new(HashSet::new()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            issued: Mutex::new(HashSet::new()),
        }
    }

    /// `len` random lowercase alphanumerics.
    pub fn random_suffix(&self, len: usize) -> String {
        let mut rng = self.rng.lock();
        (0..len)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    }

    /// A fresh name derived from `base`.
    pub fn unique(&self, base: &str) -> String {
        let base = route_safe(base);
        loop {
            let candidate = format!("{}-{}", base, self.random_suffix(SUFFIX_LEN));
            if self.issued.lock().insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

/// Lowercase, with anything a route host cannot carry replaced by `-`.
fn route_safe(base: &str) -> String {
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "app".to_string()
    } else {
        trimmed.to_string()
    }
}
