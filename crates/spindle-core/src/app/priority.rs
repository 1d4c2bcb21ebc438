//! Queue priority policy: which queues to try, in which order, on each
//! dequeue attempt.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityMode {
    /// Always highest weight first. A busy high-weight queue starves the rest.
    Strict,
    /// Higher weight is more likely, not guaranteed, to be tried first.
    #[default]
    Weighted,
}

/// Computes the queue try-order from a weight table.
///
/// The randomness source is a type parameter so tests can seed it.
#[derive(Debug)]
pub struct QueuePriority<R = StdRng> {
    /// Sorted by name, so every derived order has a stable tie-break.
    weights: Vec<(String, u32)>,
    mode: PriorityMode,
    rng: R,
}

impl QueuePriority<StdRng> {
    pub fn new(weights: &BTreeMap<String, u32>, mode: PriorityMode) -> Self {
        Self::with_rng(weights, mode, StdRng::from_entropy())
    }
}

impl<R: Rng> QueuePriority<R> {
    pub fn with_rng(weights: &BTreeMap<String, u32>, mode: PriorityMode, rng: R) -> Self {
        Self {
            weights: weights
                .iter()
                .map(|(name, weight)| (name.clone(), *weight))
                .collect(),
            mode,
            rng,
        }
    }

    pub fn mode(&self) -> PriorityMode {
        self.mode
    }

    /// Try-order for one dequeue attempt.
    pub fn order(&mut self) -> Vec<String> {
        match self.mode {
            PriorityMode::Strict => strict_order(&self.weights),
            PriorityMode::Weighted => weighted_order(&self.weights, &mut self.rng),
        }
    }
}

/// Descending by weight. `weights` is name-sorted and the sort is stable, so
/// equal weights come out alphabetically.
fn strict_order(weights: &[(String, u32)]) -> Vec<String> {
    let mut sorted: Vec<&(String, u32)> = weights.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    sorted.into_iter().map(|(name, _)| name.clone()).collect()
}

/// Weighted sampling without replacement: each next queue is drawn with
/// probability `weight / remaining weight`.
///
/// Same distribution as shuffling a multiset with each name repeated `weight`
/// times and keeping first occurrences, in O(n^2) for n queues regardless of
/// how large the weights are.
fn weighted_order<R: Rng>(weights: &[(String, u32)], rng: &mut R) -> Vec<String> {
    let mut remaining: Vec<&(String, u32)> = weights.iter().filter(|(_, w)| *w > 0).collect();
    let mut total: u64 = remaining.iter().map(|(_, w)| u64::from(*w)).sum();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let mut ticket = rng.gen_range(0..total);
        let mut picked = remaining.len() - 1;
        for (i, (_, weight)) in remaining.iter().enumerate() {
            let weight = u64::from(*weight);
            if ticket < weight {
                picked = i;
                break;
            }
            ticket -= weight;
        }

        let (name, weight) = remaining.remove(picked);
        total -= u64::from(*weight);
        order.push(name.clone());
    }
    order
}
