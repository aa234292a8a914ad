//! Evictor module — bounded memory through random-replacement sampling over
//! the set of unloadable pages.

use std::collections::HashMap;
use std::hash::Hash;

use log::warn;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Default number of uniform samples drawn per eviction round.
pub const PAGE_REPL_NUM_TRIES: usize = 10;

/// Capability the evictor needs from its candidates. The evictor itself only
/// stores keys plus each candidate's self-reported array position.
pub(crate) trait Evictable {
    /// Unloading must lose nothing: unpinned, clean, fully loaded and backed
    /// by an on-disk token.
    fn safe_to_unload(&self) -> bool;
    fn eviction_priority(&self) -> u64;
    /// Drops the in-memory buffer; the candidate reloads on next use.
    fn unload(&mut self);
    fn repl_index(&self) -> Option<usize>;
    fn set_repl_index(&mut self, index: Option<usize>);
}

/// Random-replacement governor: a dense array of eviction candidates with
/// O(1) insert and swap-removal via the candidates' self-stored indices.
///
/// The array holds exactly the pages that may be unloaded right now; callers
/// remove a page whenever it is pinned or dirtied and re-insert it once it is
/// clean and unpinned again.
pub(crate) struct Evictor<K> {
    array: Vec<K>,
    unload_threshold: usize,
    num_tries: usize,
    rng: SmallRng,
}

impl<K: Copy + Eq + Hash> Evictor<K> {
    pub(crate) fn new(unload_threshold: usize, num_tries: usize) -> Evictor<K> {
        Evictor {
            array: Vec::new(),
            unload_threshold,
            num_tries,
            rng: SmallRng::from_entropy(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.array.len()
    }

    /// Would admitting `space_needed` more candidates exceed the threshold?
    pub(crate) fn is_full(&self, space_needed: usize) -> bool {
        self.array.len() + space_needed > self.unload_threshold
    }

    pub(crate) fn insert<P: Evictable>(&mut self, key: K, store: &mut HashMap<K, P>) {
        let candidate = store.get_mut(&key).expect("inserted key must be in store");
        assert!(
            candidate.repl_index().is_none(),
            "candidate is already in the evictor array"
        );
        candidate.set_repl_index(Some(self.array.len()));
        self.array.push(key);
    }

    /// Removes `key` from the array if present, swapping the last element
    /// into its slot.
    pub(crate) fn remove<P: Evictable>(&mut self, key: K, store: &mut HashMap<K, P>) {
        let Some(index) = store
            .get_mut(&key)
            .and_then(|candidate| candidate.repl_index())
        else {
            return;
        };
        store.get_mut(&key).unwrap().set_repl_index(None);
        let last = self.array.len() - 1;
        self.array.swap(index, last);
        self.array.pop();
        if index < self.array.len() {
            let moved = self.array[index];
            store
                .get_mut(&moved)
                .expect("moved key must be in store")
                .set_repl_index(Some(index));
        }
    }

    /// Unloads candidates until the array is at least `space_needed` below
    /// the threshold, sampling `num_tries` candidates per round and evicting
    /// the one with the highest priority. A round with no safe sample aborts
    /// the whole attempt; the memory target is reported as missed and the
    /// cache proceeds over budget.
    ///
    /// Returns the number of candidates unloaded.
    pub(crate) fn make_space<P: Evictable>(
        &mut self,
        space_needed: usize,
        store: &mut HashMap<K, P>,
    ) -> usize {
        let target = self.unload_threshold.saturating_sub(space_needed);
        let mut evicted = 0;

        while self.array.len() > target {
            let mut victim: Option<usize> = None;
            for _ in 0..self.num_tries {
                let n = self.rng.gen_range(0..self.array.len());
                let candidate = store
                    .get(&self.array[n])
                    .expect("evictor array key must be in store");
                if !candidate.safe_to_unload() {
                    continue;
                }
                victim = match victim {
                    None => Some(n),
                    Some(best) => {
                        let best_priority = store
                            .get(&self.array[best])
                            .expect("evictor array key must be in store")
                            .eviction_priority();
                        if candidate.eviction_priority() > best_priority {
                            Some(n)
                        } else {
                            Some(best)
                        }
                    }
                };
            }

            let Some(victim) = victim else {
                warn!(
                    "evictor exceeding memory target: {} candidates resident, target is {target}",
                    self.array.len()
                );
                break;
            };

            let key = self.array[victim];
            self.remove(key, store);
            store
                .get_mut(&key)
                .expect("evicted key must be in store")
                .unload();
            evicted += 1;
        }

        evicted
    }
}
