//! Ordered failover across configured chat model candidates.
//!
//! Grounded on `app/agents/failover.py`. Concrete provider/model catalog
//! loading is out of scope (providers are opaque `ChatModel`s elsewhere in
//! this crate), so `FailoverChain` takes its candidate list as input rather
//! than loading it from a config file; the seeding-when-thin and
//! last-resort-providers-last behavior is preserved verbatim.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// `(provider, model_id)` pair identifying one point in the chain.
pub type ModelCandidate = (String, String);

/// Providers kept as an absolute last resort — ordered after every other
/// regular candidate even if offered earlier in the input list.
fn is_last_resort(provider: &str) -> bool {
    provider == "ollama"
}

/// Record of a single failover event, for audit/observability.
#[derive(Debug, Clone)]
pub struct FailoverAttempt {
    pub provider: String,
    pub model: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered failover chain across candidate `(provider, model)` pairs.
///
/// Built once from the caller's active-candidate list (optionally seeded
/// with extra candidates when fewer than two are active) and advanced
/// linearly as candidates fail. There is no cooldown/half-open state here —
/// once a candidate fails in a chain instance it stays failed until
/// [`FailoverChain::reset`].
#[derive(Debug)]
pub struct FailoverChain {
    chain: Vec<ModelCandidate>,
    index: usize,
    failed_indices: HashSet<usize>,
    attempts: Vec<FailoverAttempt>,
}

impl FailoverChain {
    /// Builds the chain per spec §4.3's 6-step ordering: (1) `preferred` if
    /// active, (2) the `default` alias, (3) the `smart` alias, (4) remaining
    /// active non-last-resort candidates, (5) last-resort candidates, (6)
    /// `seed_defaults` augmentation when `active` has fewer than two
    /// entries. `default`/`smart` are the already-resolved alias candidates
    /// (resolution of the alias name to a concrete `(provider, model)` pair
    /// happens in the caller, same as `preferred`); each is inserted only if
    /// present in `active` and not already placed by an earlier step.
    pub fn new(
        active: Vec<ModelCandidate>,
        seed_defaults: Vec<ModelCandidate>,
        preferred: Option<ModelCandidate>,
    ) -> Self {
        Self::new_with_aliases(active, seed_defaults, preferred, None, None)
    }

    /// Full constructor accepting the `default`/`smart` alias candidates
    /// from spec §4.3 steps 2-3, in addition to [`FailoverChain::new`]'s
    /// params.
    pub fn new_with_aliases(
        active: Vec<ModelCandidate>,
        seed_defaults: Vec<ModelCandidate>,
        preferred: Option<ModelCandidate>,
        default_alias: Option<ModelCandidate>,
        smart_alias: Option<ModelCandidate>,
    ) -> Self {
        let mut active_models = active;

        if active_models.len() < 2 {
            let present: HashSet<ModelCandidate> = active_models.iter().cloned().collect();
            let seeded: Vec<ModelCandidate> = seed_defaults
                .into_iter()
                .filter(|c| !present.contains(c))
                .collect();
            active_models.extend(seeded);
        }

        let mut chain = Vec::new();
        let mut seen: HashSet<ModelCandidate> = HashSet::new();
        let mut add = |chain: &mut Vec<ModelCandidate>, seen: &mut HashSet<ModelCandidate>, c: ModelCandidate| {
            if seen.insert(c.clone()) {
                chain.push(c);
            }
        };

        if let Some(pref) = &preferred {
            if active_models.contains(pref) {
                add(&mut chain, &mut seen, pref.clone());
            }
        }

        if let Some(default_alias) = &default_alias {
            if active_models.contains(default_alias) {
                add(&mut chain, &mut seen, default_alias.clone());
            }
        }

        if let Some(smart_alias) = &smart_alias {
            if active_models.contains(smart_alias) {
                add(&mut chain, &mut seen, smart_alias.clone());
            }
        }

        let (mut regular, mut last_resort): (Vec<_>, Vec<_>) =
            (Vec::new(), Vec::new());
        for m in active_models {
            if is_last_resort(&m.0) {
                last_resort.push(m);
            } else {
                regular.push(m);
            }
        }
        for m in regular.drain(..) {
            add(&mut chain, &mut seen, m);
        }
        for m in last_resort.drain(..) {
            add(&mut chain, &mut seen, m);
        }

        if chain.is_empty() {
            chain.push(("ollama".to_string(), "llama3".to_string()));
        }

        Self {
            chain,
            index: 0,
            failed_indices: HashSet::new(),
            attempts: Vec::new(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.chain.len()
    }

    /// Returns the current `(provider, model_id)`, or `None` if exhausted.
    pub fn current(&self) -> Option<&ModelCandidate> {
        if self.is_exhausted() {
            None
        } else {
            self.chain.get(self.index)
        }
    }

    /// Marks the current candidate failed and advances to the next
    /// un-failed one. Returns `true` if a new candidate is now current,
    /// `false` if the chain is exhausted.
    pub fn advance(&mut self, reason: impl Into<String>) -> bool {
        if self.is_exhausted() {
            return false;
        }
        let (provider, model) = self.chain[self.index].clone();
        self.failed_indices.insert(self.index);
        self.attempts.push(FailoverAttempt {
            provider,
            model,
            reason: reason.into(),
            timestamp: Utc::now(),
        });

        let mut next_idx = self.index + 1;
        while next_idx < self.chain.len() && self.failed_indices.contains(&next_idx) {
            next_idx += 1;
        }
        self.index = next_idx;
        !self.is_exhausted()
    }

    /// Resets to the primary candidate, clearing all failure tracking.
    pub fn reset(&mut self) {
        self.index = 0;
        self.failed_indices.clear();
        self.attempts.clear();
    }

    pub fn attempts(&self) -> &[FailoverAttempt] {
        &self.attempts
    }

    /// Number of untried candidates still available, including the current
    /// one if the chain is not exhausted.
    pub fn remaining(&self) -> usize {
        let exhausted_adj = if self.is_exhausted() { 0 } else { 1 };
        self.chain
            .len()
            .saturating_sub(self.failed_indices.len())
            .saturating_sub(exhausted_adj)
            .max(0)
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(p: &str, m: &str) -> ModelCandidate {
        (p.to_string(), m.to_string())
    }

    #[test]
    fn preferred_candidate_goes_first() {
        let chain = FailoverChain::new(
            vec![cand("openai", "gpt-4"), cand("anthropic", "claude")],
            vec![],
            Some(cand("anthropic", "claude")),
        );
        assert_eq!(chain.current(), Some(&cand("anthropic", "claude")));
    }

    #[test]
    fn last_resort_providers_sort_to_the_end() {
        let chain = FailoverChain::new(
            vec![cand("ollama", "llama3"), cand("openai", "gpt-4")],
            vec![],
            None,
        );
        assert_eq!(chain.current(), Some(&cand("openai", "gpt-4")));
    }

    #[test]
    fn seeds_defaults_when_fewer_than_two_active() {
        let chain = FailoverChain::new(
            vec![cand("openai", "gpt-4")],
            vec![cand("anthropic", "claude"), cand("ollama", "llama3")],
            None,
        );
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn does_not_seed_when_two_or_more_active() {
        let chain = FailoverChain::new(
            vec![cand("openai", "gpt-4"), cand("anthropic", "claude")],
            vec![cand("mistral", "large")],
            None,
        );
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn falls_back_to_hardcoded_ollama_when_empty() {
        let chain = FailoverChain::new(vec![], vec![], None);
        assert_eq!(chain.current(), Some(&cand("ollama", "llama3")));
    }

    #[test]
    fn advance_skips_already_failed_and_exhausts_correctly() {
        let mut chain = FailoverChain::new(
            vec![cand("a", "1"), cand("b", "2"), cand("c", "3")],
            vec![],
            None,
        );
        assert!(chain.advance("timeout"));
        assert_eq!(chain.current(), Some(&cand("b", "2")));
        assert!(chain.advance("rate_limited"));
        assert_eq!(chain.current(), Some(&cand("c", "3")));
        assert!(!chain.advance("error"));
        assert!(chain.is_exhausted());
        assert_eq!(chain.attempts().len(), 3);
    }

    #[test]
    fn reset_clears_failures_and_returns_to_primary() {
        let mut chain = FailoverChain::new(vec![cand("a", "1"), cand("b", "2")], vec![], None);
        chain.advance("x");
        chain.reset();
        assert_eq!(chain.current(), Some(&cand("a", "1")));
        assert_eq!(chain.attempts().len(), 0);
        assert_eq!(chain.remaining(), 2);
    }

    #[test]
    fn remaining_accounts_for_current_and_failed() {
        let mut chain = FailoverChain::new(
            vec![cand("a", "1"), cand("b", "2"), cand("c", "3")],
            vec![],
            None,
        );
        assert_eq!(chain.remaining(), 2);
        chain.advance("x");
        assert_eq!(chain.remaining(), 1);
        chain.advance("y");
        assert_eq!(chain.remaining(), 0);
        chain.advance("z");
        assert_eq!(chain.remaining(), 0);
    }

    #[test]
    fn deduplicates_identical_candidates() {
        let chain = FailoverChain::new(
            vec![cand("a", "1"), cand("a", "1"), cand("b", "2")],
            vec![],
            None,
        );
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn default_and_smart_aliases_slot_in_after_preferred_before_the_rest() {
        let chain = FailoverChain::new_with_aliases(
            vec![cand("a", "1"), cand("b", "2"), cand("c", "3")],
            vec![],
            None,
            Some(cand("b", "2")),
            Some(cand("c", "3")),
        );
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.current(), Some(&cand("b", "2")));
        let mut chain = chain;
        assert!(chain.advance("x"));
        assert_eq!(chain.current(), Some(&cand("c", "3")));
        assert!(chain.advance("y"));
        assert_eq!(chain.current(), Some(&cand("a", "1")));
    }

    #[test]
    fn preferred_outranks_default_and_smart_aliases() {
        let chain = FailoverChain::new_with_aliases(
            vec![cand("a", "1"), cand("b", "2"), cand("c", "3")],
            vec![],
            Some(cand("c", "3")),
            Some(cand("b", "2")),
            Some(cand("a", "1")),
        );
        assert_eq!(chain.current(), Some(&cand("c", "3")));
    }

    #[test]
    fn unresolved_aliases_not_in_active_are_skipped() {
        let chain = FailoverChain::new_with_aliases(
            vec![cand("a", "1"), cand("b", "2")],
            vec![],
            None,
            Some(cand("nope", "not-active")),
            None,
        );
        assert_eq!(chain.current(), Some(&cand("a", "1")));
        assert_eq!(chain.len(), 2);
    }
}
