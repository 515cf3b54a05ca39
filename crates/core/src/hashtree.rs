//! Fixed-shape Merkle tree over a vnode's keyspace.
//!
//! Branching factor B, depth 2: B internal nodes over B² leaf buckets.
//! Every key maps to one leaf by hashing its encoded bkey; the leaf hash
//! covers the sorted `(bkey, object-hash)` pairs in the bucket, internal
//! hashes cover their children, the root covers the internal level.
//!
//! The tree starts "not built". The vnode folds its store into it on
//! startup and flips [`HashTree::mark_built`]; exchanges are refused
//! until then. After that, every write/repair updates the affected leaf
//! incrementally.

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// SHA-1 hash output (20 bytes).
pub type TreeHash = [u8; 20];

const EMPTY_HASH: TreeHash = [0u8; 20];

/// SHA-1 of a serialized object, the per-key leaf ingredient.
pub fn object_hash(serialized: &[u8]) -> TreeHash {
    Sha1::digest(serialized).into()
}

#[derive(Debug, Clone)]
pub struct HashTree {
    children: usize,
    leaves: Vec<BTreeMap<Vec<u8>, TreeHash>>,
    built: bool,
}

impl HashTree {
    pub fn new(children: usize) -> Self {
        assert!(children >= 2, "tree needs a branching factor of at least 2");
        Self {
            children,
            leaves: vec![BTreeMap::new(); children * children],
            built: false,
        }
    }

    /// Branching factor B.
    pub fn children(&self) -> usize {
        self.children
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn mark_built(&mut self) {
        self.built = true;
    }

    /// Leaf bucket for a key: `hash(encoded bkey) mod B²`.
    pub fn leaf_for(&self, bkey_enc: &[u8]) -> usize {
        let digest: TreeHash = Sha1::digest(bkey_enc).into();
        let head = u64::from_be_bytes(digest[..8].try_into().expect("8-byte slice"));
        (head % self.leaves.len() as u64) as usize
    }

    /// Record (or refresh) a key's object hash.
    pub fn insert(&mut self, bkey_enc: &[u8], hash: TreeHash) {
        let leaf = self.leaf_for(bkey_enc);
        self.leaves[leaf].insert(bkey_enc.to_vec(), hash);
    }

    /// Forget a key entirely (compaction path, not the tombstone path).
    pub fn remove(&mut self, bkey_enc: &[u8]) {
        let leaf = self.leaf_for(bkey_enc);
        self.leaves[leaf].remove(bkey_enc);
    }

    /// Hash of one leaf bucket: SHA-1 over its sorted `(bkey, hash)`
    /// pairs. An empty bucket hashes to all-zeros.
    pub fn leaf_hash(&self, leaf: usize) -> TreeHash {
        let bucket = &self.leaves[leaf];
        if bucket.is_empty() {
            return EMPTY_HASH;
        }
        let mut hasher = Sha1::new();
        for (bkey, hash) in bucket {
            hasher.update(bkey);
            hasher.update(hash);
        }
        hasher.finalize().into()
    }

    /// Hashes of one internal node's B leaf children.
    pub fn leaf_hashes(&self, branch: usize) -> Vec<TreeHash> {
        (0..self.children)
            .map(|i| self.leaf_hash(branch * self.children + i))
            .collect()
    }

    /// Hashes of the root's B internal children.
    pub fn branch_hashes(&self) -> Vec<TreeHash> {
        (0..self.children).map(|b| self.branch_hash(b)).collect()
    }

    fn branch_hash(&self, branch: usize) -> TreeHash {
        let mut hasher = Sha1::new();
        for hash in self.leaf_hashes(branch) {
            hasher.update(hash);
        }
        hasher.finalize().into()
    }

    pub fn root_hash(&self) -> TreeHash {
        let mut hasher = Sha1::new();
        for hash in self.branch_hashes() {
            hasher.update(hash);
        }
        hasher.finalize().into()
    }

    /// The encoded bkeys currently in a leaf bucket, in sorted order.
    pub fn keys_in_leaf(&self, leaf: usize) -> Vec<Vec<u8>> {
        self.leaves[leaf].keys().cloned().collect()
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(children: usize, entries: &[(&str, &str)]) -> HashTree {
        let mut tree = HashTree::new(children);
        for (k, v) in entries {
            tree.insert(k.as_bytes(), object_hash(v.as_bytes()));
        }
        tree.mark_built();
        tree
    }

    #[test]
    fn test_identical_trees() {
        let data = [("a", "1"), ("b", "2"), ("c", "3")];
        let t1 = tree_with(6, &data);
        let t2 = tree_with(6, &data);
        assert_eq!(t1.root_hash(), t2.root_hash());
        assert_eq!(t1.branch_hashes(), t2.branch_hashes());
    }

    #[test]
    fn test_changed_value_changes_root() {
        let t1 = tree_with(6, &[("a", "1"), ("b", "2")]);
        let t2 = tree_with(6, &[("a", "1"), ("b", "CHANGED")]);
        assert_ne!(t1.root_hash(), t2.root_hash());
    }

    #[test]
    fn test_extra_key_changes_root() {
        let t1 = tree_with(6, &[("a", "1")]);
        let t2 = tree_with(6, &[("a", "1"), ("b", "2")]);
        assert_ne!(t1.root_hash(), t2.root_hash());
    }

    #[test]
    fn test_diff_narrows_to_one_leaf() {
        let t1 = tree_with(6, &[("a", "1"), ("b", "2"), ("c", "3")]);
        let t2 = tree_with(6, &[("a", "1"), ("b", "X"), ("c", "3")]);

        let mut differing_leaves = Vec::new();
        for leaf in 0..t1.leaf_count() {
            if t1.leaf_hash(leaf) != t2.leaf_hash(leaf) {
                differing_leaves.push(leaf);
            }
        }
        assert_eq!(differing_leaves.len(), 1);
        assert_eq!(
            t1.keys_in_leaf(differing_leaves[0]),
            vec![b"b".to_vec()],
            "only the changed key's bucket differs"
        );
    }

    #[test]
    fn test_incremental_update_matches_rebuild() {
        let mut incremental = tree_with(10, &[("k1", "v1"), ("k2", "v2")]);
        incremental.insert(b"k2", object_hash(b"v2-new"));
        incremental.insert(b"k3", object_hash(b"v3"));

        let rebuilt = tree_with(10, &[("k1", "v1"), ("k2", "v2-new"), ("k3", "v3")]);
        assert_eq!(incremental.root_hash(), rebuilt.root_hash());
    }

    #[test]
    fn test_remove_restores_hash() {
        let base = tree_with(6, &[("a", "1")]);
        let mut tree = tree_with(6, &[("a", "1")]);
        tree.insert(b"b", object_hash(b"2"));
        assert_ne!(tree.root_hash(), base.root_hash());
        tree.remove(b"b");
        assert_eq!(tree.root_hash(), base.root_hash());
    }

    #[test]
    fn test_empty_tree() {
        let t1 = HashTree::new(6);
        let t2 = HashTree::new(6);
        assert_eq!(t1.root_hash(), t2.root_hash());
        assert!(!t1.is_built());
        for leaf in 0..t1.leaf_count() {
            assert_eq!(t1.leaf_hash(leaf), EMPTY_HASH);
        }
    }

    #[test]
    fn test_leaf_count_is_children_squared() {
        assert_eq!(HashTree::new(6).leaf_count(), 36);
        assert_eq!(HashTree::new(10).leaf_count(), 100);
    }

    #[test]
    fn test_leaf_for_stable_and_in_range() {
        let tree = HashTree::new(10);
        for i in 0..200 {
            let key = format!("key_{:04}", i);
            let leaf = tree.leaf_for(key.as_bytes());
            assert!(leaf < tree.leaf_count());
            assert_eq!(leaf, tree.leaf_for(key.as_bytes()));
        }
    }

    #[test]
    fn test_many_keys_spread_over_leaves() {
        let mut tree = HashTree::new(10);
        for i in 0..500 {
            let key = format!("key_{:04}", i);
            tree.insert(key.as_bytes(), object_hash(key.as_bytes()));
        }
        let occupied = (0..tree.leaf_count())
            .filter(|&l| !tree.keys_in_leaf(l).is_empty())
            .count();
        assert!(occupied > 50, "500 keys should touch many of 100 leaves");
    }
}
