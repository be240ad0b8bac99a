//! FingerprintRegistry: two concurrent maps keyed by alert fingerprint.
//!
//! The counter tracks how many runs are active per fingerprint and backs
//! admission control. The token map holds one cancellation token per
//! fingerprint-lifetime; closing it signals every active run for that
//! fingerprint. A closed token is never reopened: `close` removes the entry,
//! so a later `add` begins a fresh lifetime.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct FingerprintRegistry {
    counts: DashMap<String, i64>,
    cancels: DashMap<String, CancellationToken>,
}

impl FingerprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically admit one run for the fingerprint: increments the active
    /// count unless a positive `max` is already reached. The comparison and
    /// increment happen under the entry lock so concurrent workers cannot
    /// both slip past the limit.
    pub fn admit(&self, fingerprint: &str, max: i64) -> bool {
        let mut entry = self.counts.entry(fingerprint.to_string()).or_insert(0);
        if max > 0 && *entry >= max {
            return false;
        }
        *entry += 1;
        true
    }

    pub fn inc(&self, fingerprint: &str) {
        *self.counts.entry(fingerprint.to_string()).or_insert(0) += 1;
    }

    /// Decrement the active count, dropping the entry once it reaches zero.
    pub fn dec(&self, fingerprint: &str) {
        let remove = match self.counts.get_mut(fingerprint) {
            Some(mut entry) => {
                *entry -= 1;
                *entry <= 0
            }
            None => false,
        };
        if remove {
            self.counts.remove_if(fingerprint, |_, v| *v <= 0);
        }
    }

    pub fn get(&self, fingerprint: &str) -> (i64, bool) {
        match self.counts.get(fingerprint) {
            Some(entry) => (*entry, true),
            None => (0, false),
        }
    }

    /// Returns the cancellation token for the fingerprint, creating a fresh
    /// open one if this is the first run of the lifetime.
    pub fn add(&self, fingerprint: &str) -> CancellationToken {
        self.cancels
            .entry(fingerprint.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// Close the token for the fingerprint, waking every run that holds it.
    /// A no-op when the fingerprint is unknown; never closes a token twice.
    pub fn close(&self, fingerprint: &str) {
        if let Some((_, token)) = self.cancels.remove(fingerprint) {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_balances() {
        let reg = FingerprintRegistry::new();
        assert_eq!(reg.get("a"), (0, false));

        reg.inc("a");
        reg.inc("a");
        assert_eq!(reg.get("a"), (2, true));

        reg.dec("a");
        assert_eq!(reg.get("a"), (1, true));
        reg.dec("a");
        assert_eq!(reg.get("a"), (0, false));
    }

    #[test]
    fn admit_enforces_max() {
        let reg = FingerprintRegistry::new();
        assert!(reg.admit("a", 1));
        assert!(!reg.admit("a", 1));
        reg.dec("a");
        assert!(reg.admit("a", 1));
    }

    #[test]
    fn admit_ignores_nonpositive_max() {
        let reg = FingerprintRegistry::new();
        for _ in 0..10 {
            assert!(reg.admit("a", 0));
        }
        assert_eq!(reg.get("a"), (10, true));
    }

    #[test]
    fn close_is_idempotent_and_starts_new_lifetime() {
        let reg = FingerprintRegistry::new();
        let token = reg.add("a");
        assert!(!token.is_cancelled());

        reg.close("a");
        assert!(token.is_cancelled());
        // Second close is a no-op.
        reg.close("a");

        let fresh = reg.add("a");
        assert!(!fresh.is_cancelled());
    }

    #[test]
    fn add_returns_existing_token() {
        let reg = FingerprintRegistry::new();
        let t1 = reg.add("a");
        let t2 = reg.add("a");
        reg.close("a");
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }
}
