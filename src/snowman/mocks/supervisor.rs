use commonware_cryptography::PublicKey;
use rand::Rng;
use std::collections::HashMap;

/// A static, stake-weighted validator set.
#[derive(Clone)]
pub struct Supervisor<P: PublicKey> {
    participants: Vec<P>,
    weights: HashMap<P, u64>,
    total: u64,
}

impl<P: PublicKey> Supervisor<P> {
    pub fn new(validators: Vec<(P, u64)>) -> Self {
        let mut participants: Vec<P> = validators.iter().map(|(peer, _)| peer.clone()).collect();
        participants.sort();
        let weights: HashMap<P, u64> = validators.into_iter().collect();
        let total = weights.values().sum();
        Self {
            participants,
            weights,
            total,
        }
    }
}

impl<P: PublicKey> crate::Supervisor for Supervisor<P> {
    type PublicKey = P;

    fn participants(&self) -> &[P] {
        &self.participants
    }

    fn weight(&self, candidate: &P) -> Option<u64> {
        self.weights.get(candidate).copied()
    }

    fn total_weight(&self) -> u64 {
        self.total
    }

    fn sample<R: Rng>(&self, rng: &mut R, k: usize) -> Vec<P> {
        if self.participants.len() <= k {
            return self.participants.clone();
        }

        // Weighted sampling without replacement.
        let mut pool: Vec<(P, u64)> = self
            .participants
            .iter()
            .map(|peer| (peer.clone(), self.weights[peer].max(1)))
            .collect();
        let mut sampled = Vec::with_capacity(k);
        for _ in 0..k {
            let total: u64 = pool.iter().map(|(_, weight)| weight).sum();
            let mut pick = rng.gen_range(0..total);
            let index = pool
                .iter()
                .position(|(_, weight)| {
                    if pick < *weight {
                        true
                    } else {
                        pick -= weight;
                        false
                    }
                })
                .expect("pick is within total weight");
            sampled.push(pool.swap_remove(index).0);
        }
        sampled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Supervisor as _;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt as _, Signer as _};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_sample_distinct_and_bounded() {
        let validators: Vec<_> = (0..7u64)
            .map(|seed| (PrivateKey::from_seed(seed).public_key(), 10))
            .collect();
        let supervisor = Supervisor::new(validators);
        let mut rng = StdRng::seed_from_u64(0);

        let sampled = supervisor.sample(&mut rng, 5);
        assert_eq!(sampled.len(), 5);
        let mut unique = sampled.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn test_sample_small_set_returns_all() {
        let validators: Vec<_> = (0..3u64)
            .map(|seed| (PrivateKey::from_seed(seed).public_key(), 1))
            .collect();
        let supervisor = Supervisor::new(validators);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(supervisor.sample(&mut rng, 5).len(), 3);
    }

    #[test]
    fn test_heavier_validators_sampled_more() {
        let heavy = PrivateKey::from_seed(0).public_key();
        let validators = vec![
            (heavy.clone(), 1_000),
            (PrivateKey::from_seed(1).public_key(), 1),
            (PrivateKey::from_seed(2).public_key(), 1),
        ];
        let supervisor = Supervisor::new(validators);
        let mut rng = StdRng::seed_from_u64(0);

        let mut hits = 0;
        for _ in 0..100 {
            let sampled = supervisor.sample(&mut rng, 1);
            if sampled[0] == heavy {
                hits += 1;
            }
        }
        assert!(hits > 90, "heavy validator sampled {hits}/100 times");
    }
}
