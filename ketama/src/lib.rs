//! Ketama consistent hash ring.
//!
//! Maps keys onto a weighted set of servers using MD5-derived virtual nodes.
//! Removing or swapping a server only remaps the keys that server owned; the
//! ring itself is immutable and every mutation builds a fresh one, so a reader
//! holding a `Ring` never observes a half-built point table.

/// Virtual nodes generated per unit of weight.
pub const POINTS_PER_SERVER: usize = 40;

/// Ring positions read from each MD5 digest (offsets 0, 4 and 8).
const POSITIONS_PER_DIGEST: usize = 3;

/// A server identity and its relative weight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    identity: String,
    weight: u32,
}

impl Node {
    /// The server identity (`host:port` or a socket path).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Relative weight of this server.
    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// Immutable ketama consistent hash ring.
#[derive(Clone, Debug)]
pub struct Ring {
    /// Sorted (hash_point, node_index) pairs. Hash points are unique.
    points: Box<[(u32, u16)]>,
    nodes: Box<[Node]>,
}

impl Ring {
    /// Build a ring from server identity strings with equal weight.
    pub fn build(servers: &[&str]) -> Self {
        let mut builder = RingBuilder::new();
        for &server in servers {
            builder = builder.node(server, 1);
        }
        builder.build()
    }

    /// Route a key to the index of its owning node, or `None` on an empty ring.
    #[inline]
    pub fn route_index(&self, key: &[u8]) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        if self.nodes.len() == 1 {
            return Some(0);
        }
        Some(self.points[self.position(key)].1 as usize)
    }

    /// Route a key to the identity of its owning server.
    #[inline]
    pub fn route(&self, key: &[u8]) -> Option<&str> {
        self.route_index(key)
            .map(|idx| self.nodes[idx].identity.as_str())
    }

    /// Walk the ring clockwise from the key's position and collect up to `n`
    /// servers, wrapping around at most once.
    ///
    /// With `unique` set, each server appears at most once; otherwise the
    /// owner of every visited point is returned, duplicates included.
    pub fn route_range(&self, key: &[u8], n: usize, unique: bool) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::with_capacity(n.min(self.nodes.len()));
        if self.points.is_empty() || n == 0 {
            return out;
        }

        let start = self.position(key);
        let len = self.points.len();
        for step in 0..len {
            let (_, idx) = self.points[(start + step) % len];
            let identity = self.nodes[idx as usize].identity.as_str();
            if unique && out.contains(&identity) {
                continue;
            }
            out.push(identity);
            if out.len() == n {
                break;
            }
        }
        out
    }

    /// Build a new ring without `identity`. Remaining weights are kept.
    pub fn without(&self, identity: &str) -> Ring {
        let mut builder = RingBuilder::new();
        for node in self.nodes.iter().filter(|n| n.identity != identity) {
            builder = builder.node(&node.identity, node.weight);
        }
        builder.build()
    }

    /// Build a new ring where `old` is replaced by `new`, inheriting its weight.
    pub fn swapped(&self, old: &str, new: &str) -> Ring {
        let mut builder = RingBuilder::new();
        for node in self.nodes.iter() {
            if node.identity == old {
                builder = builder.node(new, node.weight);
            } else {
                builder = builder.node(&node.identity, node.weight);
            }
        }
        builder.build()
    }

    /// Returns true if `identity` owns points on this ring.
    pub fn contains(&self, identity: &str) -> bool {
        self.nodes.iter().any(|n| n.identity == identity)
    }

    /// Servers on the ring, in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of logical nodes (servers) in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of virtual node points on the ring.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Lower-bound search for the key's hash, wrapping past the last point.
    fn position(&self, key: &[u8]) -> usize {
        let hash = key_hash(key);
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        if idx == self.points.len() { 0 } else { idx }
    }
}

/// Builder for constructing a [`Ring`] with weighted nodes.
pub struct RingBuilder {
    nodes: Vec<Node>,
}

impl RingBuilder {
    pub fn new() -> Self {
        RingBuilder { nodes: Vec::new() }
    }

    /// Add a node with the given identity string and weight.
    ///
    /// Adding an identity twice keeps the first entry. A weight of zero is
    /// treated as one.
    pub fn node(mut self, identity: &str, weight: u32) -> Self {
        if !self.nodes.iter().any(|n| n.identity == identity) {
            self.nodes.push(Node {
                identity: identity.to_owned(),
                weight: weight.max(1),
            });
        }
        self
    }

    /// Build the immutable ring.
    ///
    /// Each server gets `floor(40 * servers * weight / total_weight)` digests
    /// of `"<identity>-<j>"`, and every digest contributes three points. When
    /// two servers land on the same point the lexicographically smallest
    /// identity keeps it, so the result never depends on insertion order.
    pub fn build(self) -> Ring {
        let total_weight: u64 = self.nodes.iter().map(|n| u64::from(n.weight)).sum();
        let server_count = self.nodes.len() as u64;

        let mut points = Vec::new();
        for (node_idx, node) in self.nodes.iter().enumerate() {
            let factor = (POINTS_PER_SERVER as u64 * server_count * u64::from(node.weight))
                / total_weight.max(1);

            for j in 0..factor {
                let digest = md5::compute(format!("{}-{j}", node.identity).as_bytes()).0;
                for k in 0..POSITIONS_PER_DIGEST {
                    let off = k * 4;
                    let hash = u32::from_le_bytes([
                        digest[off],
                        digest[off + 1],
                        digest[off + 2],
                        digest[off + 3],
                    ]);
                    points.push((hash, node_idx as u16));
                }
            }
        }

        let nodes = self.nodes;
        points.sort_unstable_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| nodes[a.1 as usize].identity.cmp(&nodes[b.1 as usize].identity))
        });
        points.dedup_by_key(|&mut (hash, _)| hash);

        Ring {
            points: points.into_boxed_slice(),
            nodes: nodes.into_boxed_slice(),
        }
    }
}

impl Default for RingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a key to a u32 using MD5 (first 4 bytes, little-endian).
#[inline]
fn key_hash(key: &[u8]) -> u32 {
    let digest = md5::compute(key).0;
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
