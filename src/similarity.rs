//! The similarity engine: a thread-safe builder that ingests perceptual
//! hashes and assigns dense [`PhotoId`]s, and the sealed, read-only
//! [`SimilaritySearch`] it finalises into.
//!
//! Two indices live side by side, built from the same ingest stream:
//! an exact-match vector over the 64-bit average-hash fingerprint, and
//! an approximate-nearest-neighbour forest over the 64-bit pHash under
//! Hamming distance. Neither index supports further inserts once
//! built — see §9 of the design notes on why a hand-rolled
//! random-projection forest stands in for an off-the-shelf ANN crate
//! here (none of the usual ones speak Hamming distance over a raw
//! bit-vector the way this domain needs).

use std::sync::Mutex;

use crate::hash_primitives::hamming_distance;
use crate::photo::{self, Photo};
use crate::file_tree::FileTree;

/// Dense, zero-based, builder-local photo identifier.
pub type PhotoId = u32;

/// Sentinel returned by [`SimilarityBuilder::add_photo`] when a photo
/// could not be ingested (missing a perceptual hash).
pub const NO_PHOTO_ID: PhotoId = PhotoId::MAX;

const ANN_TREE_COUNT: usize = 16;
const ANN_LEAF_BUCKET: usize = 16;
/// How many splits, counting back up from the leaf, each tree also
/// explores the untaken side of during a query.
const ANN_SIBLING_PROBES: usize = 2;

pub const DEFAULT_THRESHOLD: f64 = 0.8;
pub const DEFAULT_MAX_K: usize = 100;

struct BuilderState {
    next_id: PhotoId,
    exact_index: Vec<(u64, PhotoId)>,
    ann_items: Vec<(PhotoId, [u8; 8])>,
}

/// Thread-safe ingestion point for photo hashes. Multiple worker
/// threads may call [`add_photo`](SimilarityBuilder::add_photo)
/// concurrently; all index mutation happens under one mutex, with
/// hash computation (which may decode an image) happening outside it.
pub struct SimilarityBuilder {
    state: Mutex<BuilderState>,
}

impl SimilarityBuilder {
    pub fn new() -> SimilarityBuilder {
        SimilarityBuilder {
            state: Mutex::new(BuilderState {
                next_id: 0,
                exact_index: Vec::new(),
                ann_items: Vec::new(),
            }),
        }
    }

    /// Pulls both perceptual hashes from `photo` (computing them if
    /// not already cached in `tree`). If either hash is unavailable,
    /// ingests nothing and returns [`NO_PHOTO_ID`]. Otherwise assigns
    /// the next id and records the hashes under the builder's mutex.
    pub fn add_photo(&self, tree: &mut FileTree, photo: &Photo) -> PhotoId {
        let Some((avg_hash, p_hash)) = photo::both_perceptual_hashes(tree, photo) else {
            return NO_PHOTO_ID;
        };

        let mut state = self.state.lock().expect("similarity builder mutex poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.ann_items.push((id, p_hash));
        state.exact_index.push((avg_hash, id));
        id
    }

    /// Finalises the ANN index (as a forest of `2 * 8 = 16` trees) and
    /// sorts the exact-match vector ascending by fingerprint. Consumes
    /// the builder.
    pub fn build(self) -> SimilaritySearch {
        let mut state = self.state.into_inner().expect("similarity builder mutex poisoned");
        state.exact_index.sort_unstable_by_key(|&(fingerprint, _)| fingerprint);
        let ann = AnnForest::build(state.ann_items, ANN_TREE_COUNT);
        SimilaritySearch {
            exact_index: state.exact_index,
            ann,
        }
    }
}

impl Default for SimilarityBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only queries over a sealed index pair. Safe to query from
/// multiple threads concurrently.
pub struct SimilaritySearch {
    exact_index: Vec<(u64, PhotoId)>,
    ann: AnnForest,
}

impl SimilaritySearch {
    /// Scans the sorted exact-match vector for runs of `>= 2`
    /// consecutive equal fingerprints. Each run is one duplicate
    /// group, in vector order (so ascending `PhotoId` within a group
    /// is not guaranteed by this alone, but ingestion order ties
    /// usually keep it so).
    pub fn get_duplicated_photos(&self) -> Vec<Vec<PhotoId>> {
        let mut groups = Vec::new();
        let mut i = 0;
        while i < self.exact_index.len() {
            let mut j = i + 1;
            while j < self.exact_index.len() && self.exact_index[j].0 == self.exact_index[i].0 {
                j += 1;
            }
            if j - i >= 2 {
                let mut group: Vec<PhotoId> =
                    self.exact_index[i..j].iter().map(|&(_, id)| id).collect();
                group.sort_unstable();
                groups.push(group);
            }
            i = j;
        }
        groups
    }

    /// The contiguous run of exact-match entries sharing `photo`'s
    /// average-hash fingerprint, if any. Empty if the fingerprint
    /// appears only once or `photo`'s average hash isn't available.
    pub fn get_duplicates_of(&self, tree: &mut FileTree, photo: &Photo) -> Vec<PhotoId> {
        use crate::hash_primitives::bytes_to_u64_be;
        use crate::image_loader::ImageHashAlg;

        let Some(hash) = photo.get_image_hash(tree, ImageHashAlg::AverageHash) else {
            return Vec::new();
        };
        let fingerprint = bytes_to_u64_be(hash);
        self.duplicates_of_fingerprint(fingerprint)
    }

    fn duplicates_of_fingerprint(&self, fingerprint: u64) -> Vec<PhotoId> {
        let start = self.exact_index.partition_point(|&(f, _)| f < fingerprint);
        if start >= self.exact_index.len() || self.exact_index[start].0 != fingerprint {
            return Vec::new();
        }
        let mut end = start;
        while end < self.exact_index.len() && self.exact_index[end].0 == fingerprint {
            end += 1;
        }
        if end - start < 2 {
            return Vec::new();
        }
        self.exact_index[start..end].iter().map(|&(_, id)| id).collect()
    }

    /// Nearest neighbours of `photo`'s pHash under Hamming distance,
    /// dropping any candidate whose similarity `(64 - hamming) / 64`
    /// is `<=` `threshold`. Preserves the ANN's approximate
    /// ascending-distance order.
    pub fn get_similars_of_photo(
        &self,
        tree: &mut FileTree,
        photo: &Photo,
        threshold: f64,
        max_k: usize,
    ) -> Vec<(PhotoId, u32)> {
        use crate::image_loader::ImageHashAlg;

        let Some(hash) = photo.get_image_hash(tree, ImageHashAlg::PHash) else {
            return Vec::new();
        };
        self.get_similars_of_hash(hash, threshold, max_k)
    }

    /// Same as [`get_similars_of_photo`](Self::get_similars_of_photo)
    /// but for a pHash computed directly from an already-decoded image
    /// (used for user-supplied query images, which may live outside
    /// any [`FileTree`]).
    pub fn get_similars_of_hash(
        &self,
        p_hash: [u8; 8],
        threshold: f64,
        max_k: usize,
    ) -> Vec<(PhotoId, u32)> {
        self.ann
            .query(p_hash, max_k)
            .into_iter()
            .filter(|&(_, hamming)| (64.0 - hamming as f64) / 64.0 > threshold)
            .collect()
    }
}

/// A forest of random-projection trees over 64-bit hash vectors under
/// Hamming distance. Each internal node splits its assigned items on
/// one bit position (chosen deterministically from a per-tree,
/// per-node seed, so a `build()` of the same inputs is reproducible
/// across runs of the same binary); recursion stops once a leaf holds
/// at most [`ANN_LEAF_BUCKET`] items or no bit remains to split on.
struct AnnForest {
    trees: Vec<AnnTree>,
    items: Vec<(PhotoId, [u8; 8])>,
}

enum AnnTree {
    Leaf(Vec<usize>),
    Split {
        bit: u8,
        zero: Box<AnnTree>,
        one: Box<AnnTree>,
    },
}

impl AnnForest {
    fn build(items: Vec<(PhotoId, [u8; 8])>, tree_count: usize) -> AnnForest {
        let all_indices: Vec<usize> = (0..items.len()).collect();
        let trees = (0..tree_count)
            .map(|tree_index| {
                let mut bits_available: Vec<u8> = (0..64).collect();
                // Deterministic per-tree shuffle of the candidate split
                // bits, so different trees in the forest tend to split
                // on different bit orders without relying on any RNG.
                let seed = splitmix64(tree_index as u64 + 1);
                shuffle_deterministic(&mut bits_available, seed);
                AnnTree::build(&items, all_indices.clone(), &bits_available, 0)
            })
            .collect();
        AnnForest { trees, items }
    }

    /// Walks every tree for the query hash, unions the reached leaves'
    /// candidates with a handful of nearby sibling leaves (for recall;
    /// see [`AnnTree::collect_with_siblings`]), ranks the deduplicated
    /// set by true Hamming distance, and returns the closest `max_k`.
    fn query(&self, query: [u8; 8], max_k: usize) -> Vec<(PhotoId, u32)> {
        let mut seen = std::collections::HashSet::new();
        let mut candidates: Vec<usize> = Vec::new();
        for tree in &self.trees {
            tree.collect_with_siblings(query, ANN_SIBLING_PROBES, &mut |idx| {
                if seen.insert(idx) {
                    candidates.push(idx);
                }
            });
        }

        let mut scored: Vec<(PhotoId, u32)> = candidates
            .into_iter()
            .map(|idx| {
                let (id, hash) = self.items[idx];
                (id, hamming_distance(hash, query))
            })
            .collect();
        scored.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(max_k);
        scored
    }
}

impl AnnTree {
    fn build(
        items: &[(PhotoId, [u8; 8])],
        indices: Vec<usize>,
        bits_available: &[u8],
        depth: usize,
    ) -> AnnTree {
        if indices.len() <= ANN_LEAF_BUCKET || depth >= bits_available.len() {
            return AnnTree::Leaf(indices);
        }

        let bit = bits_available[depth];
        let (zero, one): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&idx| !bit_is_set(items[idx].1, bit));

        // A degenerate split (every item landed on the same side) gives
        // up on further splitting and becomes a leaf, rather than
        // recursing forever on an uninformative bit.
        if zero.is_empty() || one.is_empty() {
            let mut merged = zero;
            merged.extend(one);
            return AnnTree::Leaf(merged);
        }

        AnnTree::Split {
            bit,
            zero: Box::new(AnnTree::build(items, zero, bits_available, depth + 1)),
            one: Box::new(AnnTree::build(items, one, bits_available, depth + 1)),
        }
    }

    /// Descends to the leaf the query hash lands in, then backtracks
    /// over the last `sibling_budget` splits on that path and pulls in
    /// the *un*taken side of each one too, nearest-to-leaf first. A
    /// near-duplicate whose hash disagrees with the query on the split
    /// bit chosen deep in the tree would otherwise land in a different
    /// leaf than the query and never surface; exploring those nearby
    /// siblings recovers it at the cost of a few extra leaf scans per
    /// tree instead of the primary leaf alone.
    fn collect_with_siblings(
        &self,
        query: [u8; 8],
        sibling_budget: usize,
        out: &mut impl FnMut(usize),
    ) {
        let mut path: Vec<&AnnTree> = Vec::new();
        let mut node = self;
        loop {
            path.push(node);
            match node {
                AnnTree::Leaf(indices) => {
                    for &idx in indices {
                        out(idx);
                    }
                    break;
                }
                AnnTree::Split { bit, zero, one } => {
                    node = if bit_is_set(query, *bit) { &**one } else { &**zero };
                }
            }
        }

        let mut probes_left = sibling_budget;
        for split in path.into_iter().rev().skip(1) {
            if probes_left == 0 {
                break;
            }
            let AnnTree::Split { bit, zero, one } = split else {
                continue;
            };
            let sibling = if bit_is_set(query, *bit) { zero } else { one };
            sibling.collect_all(out);
            probes_left -= 1;
        }
    }

    /// Collects every item under this subtree, ignoring the query
    /// entirely. Used to pull in a whole sibling subtree once it's been
    /// chosen for exploration by [`collect_with_siblings`].
    fn collect_all(&self, out: &mut impl FnMut(usize)) {
        match self {
            AnnTree::Leaf(indices) => {
                for &idx in indices {
                    out(idx);
                }
            }
            AnnTree::Split { zero, one, .. } => {
                zero.collect_all(out);
                one.collect_all(out);
            }
        }
    }
}

fn bit_is_set(hash: [u8; 8], bit: u8) -> bool {
    let byte = bit / 8;
    let offset = bit % 8;
    (hash[byte as usize] >> (7 - offset)) & 1 == 1
}

/// A fixed-output-length hash used purely to derive deterministic,
/// well-distributed per-tree seeds; not a cryptographic primitive.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn shuffle_deterministic(values: &mut [u8], mut seed: u64) {
    // Fisher-Yates using splitmix64 as the PRNG step; deterministic
    // given `seed`, which is all `build()`'s reproducibility promise
    // requires.
    for i in (1..values.len()).rev() {
        seed = splitmix64(seed);
        let j = (seed as usize) % (i + 1);
        values.swap(i, j);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn builder_state(items: &[(u64, [u8; 8])]) -> SimilaritySearch {
        let builder = SimilarityBuilder::new();
        {
            let mut state = builder.state.lock().unwrap();
            for &(avg, p) in items {
                let id = state.next_id;
                state.next_id += 1;
                state.exact_index.push((avg, id));
                state.ann_items.push((id, p));
            }
        }
        builder.build()
    }

    #[test]
    fn photo_id_density() {
        let builder = SimilarityBuilder::new();
        for i in 0..10u64 {
            let mut state = builder.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.exact_index.push((i, id));
            state.ann_items.push((id, [i as u8; 8]));
        }
        let search = builder.build();
        let mut ids: Vec<PhotoId> = search.exact_index.iter().map(|&(_, id)| id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn no_duplicates_among_distinct_fingerprints() {
        let search = builder_state(&[(1, [1; 8]), (2, [2; 8]), (3, [3; 8])]);
        assert!(search.get_duplicated_photos().is_empty());
    }

    #[test]
    fn exact_duplicate_group_of_three() {
        let search = builder_state(&[(7, [7; 8]), (7, [7; 8]), (7, [7; 8]), (9, [9; 8])]);
        let groups = search.get_duplicated_photos();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[test]
    fn duplicate_grouping_partitions_multi_occurring_values() {
        let search = builder_state(&[
            (1, [1; 8]),
            (2, [2; 8]),
            (2, [2; 8]),
            (3, [3; 8]),
            (3, [3; 8]),
            (3, [3; 8]),
        ]);
        let groups = search.get_duplicated_photos();
        let total: usize = groups.iter().map(|g| g.len()).sum();
        assert_eq!(total, 5); // two 2's plus three 3's; the lone 1 isn't a group
        assert!(groups.iter().all(|g| g.len() >= 2));
    }

    #[test]
    fn similars_respects_threshold() {
        let search = builder_state(&[(1, [0x00; 8]), (2, [0xFF; 8])]);
        let results = search.get_similars_of_hash([0x00; 8], 0.0, 100);
        // id 1 is identical (hamming 0, similarity 1.0 > 0.0); id 2 is
        // maximally different (hamming 64, similarity 0.0, excluded).
        assert!(results.iter().any(|&(id, h)| id == 0 && h == 0));
        assert!(results.iter().all(|&(_, h)| (64.0 - h as f64) / 64.0 > 0.0));
    }

    #[test]
    fn sibling_exploration_recovers_the_other_side_of_the_last_split() {
        // A two-leaf tree splitting purely on bit 0: item 0 has that
        // bit clear, item 1 has it set.
        let tree = AnnTree::Split {
            bit: 0,
            zero: Box::new(AnnTree::Leaf(vec![0])),
            one: Box::new(AnnTree::Leaf(vec![1])),
        };
        let query = [0x00; 8]; // bit 0 clear, same side as item 0.

        let mut primary_only = Vec::new();
        tree.collect_with_siblings(query, 0, &mut |idx| primary_only.push(idx));
        assert_eq!(primary_only, vec![0]);

        let mut with_sibling = Vec::new();
        tree.collect_with_siblings(query, 1, &mut |idx| with_sibling.push(idx));
        with_sibling.sort_unstable();
        assert_eq!(with_sibling, vec![0, 1]);
    }

    #[test]
    fn ann_forest_finds_exact_match_among_many() {
        let items: Vec<(u64, [u8; 8])> = (0..500u64)
            .map(|i| (i, [(i % 256) as u8, 0, 0, 0, 0, 0, 0, 0]))
            .collect();
        let search = builder_state(&items);
        let results = search.get_similars_of_hash([42, 0, 0, 0, 0, 0, 0, 0], 0.99, 5);
        assert!(results.iter().any(|&(_, h)| h == 0));
    }
}
