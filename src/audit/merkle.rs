//! Merkle Tree for the operational audit log.
//!
//! Every appended log line becomes a leaf; the tree is rebuilt bottom-up
//! on each append so the current root always covers the whole log. An odd
//! node at any level is paired with itself.

use sha2::{Digest, Sha256};

#[derive(Debug, Default)]
pub struct MerkleTree {
    leaf_hashes: Vec<String>,
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current root hash, or the empty string for an empty tree.
    pub fn root_hash(&self) -> &str {
        self.levels
            .last()
            .and_then(|level| level.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_hashes.len()
    }

    /// Add a leaf and rebuild all levels.
    pub fn add(&mut self, data: &str) {
        self.leaf_hashes.push(Self::hash_line(data));
        self.levels = Self::build_levels(self.leaf_hashes.clone());
    }

    /// Recompute a root from the supplied entries and compare it against
    /// the current root. A whole-log tamper check, not an inclusion proof.
    pub fn validate<'a>(&self, entries: impl IntoIterator<Item = &'a str>) -> bool {
        Self::compute_root(entries) == self.root_hash()
    }

    /// Root over an arbitrary set of entries, rebuilt the same way the
    /// live tree is.
    pub fn compute_root<'a>(entries: impl IntoIterator<Item = &'a str>) -> String {
        let leaves: Vec<String> = entries.into_iter().map(Self::hash_line).collect();
        if leaves.is_empty() {
            return String::new();
        }
        Self::build_levels(leaves)
            .last()
            .and_then(|level| level.first())
            .cloned()
            .unwrap_or_default()
    }

    fn build_levels(leaves: Vec<String>) -> Vec<Vec<String>> {
        let mut levels = vec![leaves];
        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let current = levels.last().unwrap();
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(Self::hash_line(&format!("{}{}", left, right)));
            }
            levels.push(next);
        }
        levels
    }

    fn hash_line(input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tree_has_empty_root() {
        let tree = MerkleTree::new();
        assert_eq!(tree.root_hash(), "");
        assert_eq!(tree.leaf_count(), 0);
    }

    #[test]
    fn test_root_changes_on_append() {
        let mut tree = MerkleTree::new();
        tree.add("first entry");
        let root_one = tree.root_hash().to_string();
        tree.add("second entry");
        let root_two = tree.root_hash().to_string();

        assert_eq!(root_one.len(), 64);
        assert_ne!(root_one, root_two);
    }

    #[test]
    fn test_validate_matches_appended_entries() {
        let entries = ["alpha", "beta", "gamma", "delta", "epsilon"];
        let mut tree = MerkleTree::new();
        for entry in &entries {
            tree.add(entry);
        }

        assert!(tree.validate(entries.iter().copied()));
        assert!(!tree.validate(["alpha", "beta", "tampered", "delta", "epsilon"]));
    }

    #[test]
    fn test_odd_leaf_pairs_with_itself() {
        let mut tree = MerkleTree::new();
        tree.add("only");

        // Root of a single leaf is the leaf hash itself (one level).
        let leaf = MerkleTree::compute_root(["only"]);
        assert_eq!(tree.root_hash(), leaf);

        tree.add("second");
        tree.add("third");
        assert!(tree.validate(["only", "second", "third"]));
    }
}
