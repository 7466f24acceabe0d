//! Content hashing for declarations and graphs.
//!
//! Hashes are deterministic: properties are hashed in name order and graphs
//! in id order, so declaration order does not affect the result.

use sha2::{Digest, Sha256};

use super::builder::ResourceGraph;
use super::declaration::{PropertyValue, ResourceDeclaration};

/// Hasher for computing content hashes.
#[derive(Debug, Default)]
pub struct GraphHasher;

impl GraphHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a single declaration.
    #[must_use]
    pub fn hash_declaration(&self, decl: &ResourceDeclaration) -> String {
        let mut hasher = Sha256::new();
        Self::feed_declaration(&mut hasher, decl);
        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a whole graph.
    #[must_use]
    pub fn hash_graph(&self, graph: &ResourceGraph) -> String {
        let mut decls: Vec<_> = graph.declarations().iter().collect();
        decls.sort_by(|a, b| a.id.cmp(&b.id));

        let mut hasher = Sha256::new();
        for decl in decls {
            Self::feed_declaration(&mut hasher, decl);
        }
        hex::encode(hasher.finalize())
    }

    /// Returns the first 12 characters of a hash.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }

    /// Returns true if the two declarations have identical content.
    #[must_use]
    pub fn hashes_match(&self, a: &ResourceDeclaration, b: &ResourceDeclaration) -> bool {
        self.hash_declaration(a) == self.hash_declaration(b)
    }

    // Every field is length-prefixed so adjacent values cannot run together.
    fn feed_declaration(hasher: &mut Sha256, decl: &ResourceDeclaration) {
        feed_str(hasher, &decl.id);
        feed_str(hasher, decl.kind.as_str());
        hasher.update((decl.properties.len() as u64).to_be_bytes());

        for (name, value) in &decl.properties {
            feed_str(hasher, name);
            match value {
                PropertyValue::String(s) => {
                    hasher.update([b's']);
                    feed_str(hasher, s);
                }
                PropertyValue::Integer(n) => {
                    hasher.update([b'i']);
                    hasher.update(n.to_be_bytes());
                }
                PropertyValue::Cidr(range) => {
                    hasher.update([b'c']);
                    feed_str(hasher, range);
                }
                PropertyValue::Reference(id) => {
                    hasher.update([b'r']);
                    feed_str(hasher, id);
                }
            }
        }
    }
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;

    fn web(size: &str) -> ResourceDeclaration {
        ResourceDeclaration::new("web1", ResourceKind::Instance)
            .reference("network", "net1")
            .text("size", size)
    }

    #[test]
    fn test_declaration_hash_deterministic() {
        let hasher = GraphHasher::new();
        assert_eq!(hasher.hash_declaration(&web("t2.small")), hasher.hash_declaration(&web("t2.small")));
        assert_eq!(hasher.hash_declaration(&web("t2.small")).len(), 64);
    }

    #[test]
    fn test_declaration_hash_changes() {
        let hasher = GraphHasher::new();
        assert!(!hasher.hashes_match(&web("t2.small"), &web("t2.medium")));

        // Same text, different value type.
        let as_text = ResourceDeclaration::new("n", ResourceKind::Network).text("cidr", "10.0.0.0/16");
        let as_cidr = ResourceDeclaration::new("n", ResourceKind::Network).cidr("cidr", "10.0.0.0/16");
        assert!(!hasher.hashes_match(&as_text, &as_cidr));
    }

    #[test]
    fn test_graph_hash_ignores_declaration_order() {
        let net = ResourceDeclaration::new("net1", ResourceKind::Network).cidr("cidr", "10.0.0.0/16");
        let a = ResourceGraph::build(vec![net.clone(), web("t2.small")]).unwrap();
        let b = ResourceGraph::build(vec![web("t2.small"), net]).unwrap();

        let hasher = GraphHasher::new();
        assert_eq!(hasher.hash_graph(&a), hasher.hash_graph(&b));
        assert_ne!(hasher.hash_graph(&a), hasher.hash_graph(&ResourceGraph::empty()));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(GraphHasher::short_hash("abcdef0123456789"), "abcdef012345");
        assert_eq!(GraphHasher::short_hash("abc"), "abc");
    }
}
