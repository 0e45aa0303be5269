use super::bag::Bag;
use commonware_cryptography::Digest;
use std::collections::BTreeMap;

/// Confidence tracking for the decision among one node's children.
///
/// Preference moves only when a competing child gathers an alpha
/// majority in a round; without one, the previous preference is
/// retained. A node that has only ever seen a single child finalizes at
/// the virtuous threshold, otherwise at the rogue threshold.
#[derive(Clone, Debug)]
pub struct Snowball<D: Digest> {
    beta_virtuous: u32,
    beta_rogue: u32,

    /// Successful polls recorded per child.
    successes: BTreeMap<D, u32>,

    preference: D,
    confidence: u32,
    rogue: bool,
    finalized: bool,
}

impl<D: Digest> Snowball<D> {
    /// Create an instance with a single initial choice.
    pub fn new(beta_virtuous: u32, beta_rogue: u32, choice: D) -> Self {
        let mut successes = BTreeMap::new();
        successes.insert(choice, 0);
        Self {
            beta_virtuous,
            beta_rogue,
            successes,
            preference: choice,
            confidence: 0,
            rogue: false,
            finalized: false,
        }
    }

    /// Register an additional choice. Marks the instance rogue if the
    /// choice is new.
    pub fn add_choice(&mut self, choice: D) {
        if self.successes.contains_key(&choice) {
            return;
        }
        self.successes.insert(choice, 0);
        self.rogue = true;
    }

    pub fn preference(&self) -> D {
        self.preference
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn rogue(&self) -> bool {
        self.rogue
    }

    /// Total successful polls recorded for `choice`.
    pub fn successes(&self, choice: &D) -> u32 {
        self.successes.get(choice).copied().unwrap_or_default()
    }

    /// Consecutive successful polls for the current preference.
    pub fn confidence(&self) -> u32 {
        self.confidence
    }

    /// Apply one round of votes. Returns whether the poll was successful
    /// (some choice gathered at least `alpha` votes).
    pub fn record_poll(&mut self, votes: &Bag<D>, alpha: usize) -> bool {
        let Some((choice, count)) = votes.mode() else {
            self.record_unsuccessful_poll();
            return false;
        };
        if count < alpha {
            self.record_unsuccessful_poll();
            return false;
        }
        self.record_successful_poll(choice);
        true
    }

    fn record_successful_poll(&mut self, choice: D) {
        if self.finalized {
            return;
        }

        // Votes bubbled from below may name a child that was pruned
        // before this instance saw it.
        self.add_choice(choice);
        *self.successes.entry(choice).or_default() += 1;

        if choice == self.preference {
            self.confidence += 1;
        } else {
            self.preference = choice;
            self.confidence = 1;
        }

        let beta = if self.rogue {
            self.beta_rogue
        } else {
            self.beta_virtuous
        };
        if self.confidence >= beta {
            self.finalized = true;
        }
    }

    /// Reset confidence without touching totals or preference.
    pub fn record_unsuccessful_poll(&mut self) {
        if self.finalized {
            return;
        }
        self.confidence = 0;
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::sha256::{hash, Digest as Sha256Digest};

    fn votes_for(choice: Sha256Digest, count: usize) -> Bag<Sha256Digest> {
        let mut bag = Bag::new();
        bag.add_count(choice, count);
        bag
    }

    #[test]
    fn test_virtuous_finalizes_at_beta_virtuous() {
        let a = hash(b"a");
        let mut sb = Snowball::new(2, 4, a);
        assert!(!sb.rogue());

        assert!(sb.record_poll(&votes_for(a, 4), 4));
        assert!(!sb.finalized());
        assert!(sb.record_poll(&votes_for(a, 4), 4));
        assert!(sb.finalized());
        assert_eq!(sb.preference(), a);
        assert_eq!(sb.successes(&a), 2);
    }

    #[test]
    fn test_rogue_requires_beta_rogue() {
        let a = hash(b"a");
        let b = hash(b"b");
        let mut sb = Snowball::new(2, 4, a);
        sb.add_choice(b);
        assert!(sb.rogue());

        // beta_virtuous successful polls are not enough once rogue.
        assert!(sb.record_poll(&votes_for(a, 4), 4));
        assert!(sb.record_poll(&votes_for(a, 4), 4));
        assert!(!sb.finalized());
        assert!(sb.record_poll(&votes_for(a, 4), 4));
        assert!(sb.record_poll(&votes_for(a, 4), 4));
        assert!(sb.finalized());
    }

    #[test]
    fn test_preference_flip_resets_confidence() {
        let a = hash(b"a");
        let b = hash(b"b");
        let mut sb = Snowball::new(3, 3, a);
        sb.add_choice(b);

        // Two rounds for b.
        sb.record_poll(&votes_for(b, 4), 4);
        sb.record_poll(&votes_for(b, 4), 4);
        assert_eq!(sb.preference(), b);
        assert_eq!(sb.confidence(), 2);

        // A majority for a flips the preference and restarts the streak.
        sb.record_poll(&votes_for(a, 4), 4);
        assert_eq!(sb.preference(), a);
        assert_eq!(sb.confidence(), 1);
        assert!(!sb.finalized());

        sb.record_poll(&votes_for(a, 4), 4);
        sb.record_poll(&votes_for(a, 4), 4);
        assert!(sb.finalized());
        assert_eq!(sb.preference(), a);
        assert_eq!(sb.successes(&a), 3);
        assert_eq!(sb.successes(&b), 2);
    }

    #[test]
    fn test_below_alpha_is_unsuccessful() {
        let a = hash(b"a");
        let b = hash(b"b");
        let mut sb = Snowball::new(2, 3, a);
        sb.add_choice(b);

        sb.record_poll(&votes_for(a, 4), 4);
        assert_eq!(sb.confidence(), 1);

        // Split vote: no alpha majority, confidence resets, preference
        // stays.
        let mut split = Bag::new();
        split.add_count(a, 2);
        split.add_count(b, 2);
        assert!(!sb.record_poll(&split, 4));
        assert_eq!(sb.confidence(), 0);
        assert_eq!(sb.preference(), a);
    }

    #[test]
    fn test_finalized_is_permanent() {
        let a = hash(b"a");
        let b = hash(b"b");
        let mut sb = Snowball::new(1, 1, a);
        sb.record_poll(&votes_for(a, 1), 1);
        assert!(sb.finalized());

        sb.add_choice(b);
        sb.record_poll(&votes_for(b, 1), 1);
        sb.record_unsuccessful_poll();
        assert!(sb.finalized());
        assert_eq!(sb.preference(), a);
    }
}
