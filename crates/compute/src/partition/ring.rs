use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Deterministic 64-bit hash (fixed SipHash keys, stable for the life of the binary).
pub(crate) fn hash_u64<T: Hash + ?Sized>(t: &T) -> u64 {
    let mut s = DefaultHasher::new();
    t.hash(&mut s);
    s.finish()
}

/// A consistent-hash ring of virtual nodes.
///
/// Points are kept sorted by `(hash, node, replica)`, so two virtual nodes
/// landing on the same hash are ordered deterministically and a lookup always
/// resolves to the first of them.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    salt: &'static str,
    points: Vec<(u64, T, u32)>,
}

impl<T> Ring<T>
where
    T: Copy + Ord + Hash,
{
    /// `salt` keeps rings of different kinds from sharing point positions.
    pub fn new(salt: &'static str) -> Self {
        Self {
            salt,
            points: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Insert `replicas` virtual nodes for `node`. Existing points are untouched.
    pub fn insert(&mut self, node: T, replicas: u32) {
        self.points.reserve(replicas as usize);
        for replica in 0..replicas {
            let h = hash_u64(&(self.salt, node, replica));
            self.points.push((h, node, replica));
        }
        self.points.sort_unstable();
    }

    /// Remove every virtual node belonging to `node`.
    pub fn remove(&mut self, node: T) {
        self.points.retain(|p| p.1 != node);
    }

    pub fn contains(&self, node: T) -> bool {
        self.points.iter().any(|p| p.1 == node)
    }

    /// First node clockwise from `hash`, wrapping past the top of the space.
    pub fn locate(&self, hash: u64) -> Option<T> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|p| p.0 < hash);
        let idx = if idx >= self.points.len() { 0 } else { idx };
        Some(self.points[idx].1)
    }

    pub fn locate_key<K: Hash + ?Sized>(&self, key: &K) -> Option<T> {
        self.locate(hash_u64(key))
    }

    /// Distinct nodes on the ring, ascending.
    pub fn nodes(&self) -> Vec<T> {
        let mut nodes: Vec<T> = self.points.iter().map(|p| p.1).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_locates_nothing() {
        let ring: Ring<u32> = Ring::new("t");
        assert!(ring.locate(42).is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn lookup_is_deterministic() {
        let mut a: Ring<u32> = Ring::new("workers");
        let mut b: Ring<u32> = Ring::new("workers");
        for w in [3, 1, 2] {
            a.insert(w, 50);
        }
        for w in [1, 2, 3] {
            b.insert(w, 50);
        }
        for key in ["AAPL", "MSFT", "ES=F", "BTC-USD"] {
            assert_eq!(a.locate_key(key), b.locate_key(key));
        }
    }

    #[test]
    fn wraps_past_last_point() {
        let mut ring: Ring<u32> = Ring::new("w");
        ring.insert(7, 4);
        assert_eq!(ring.locate(u64::MAX), Some(7));
    }

    #[test]
    fn remove_only_affects_that_node() {
        let mut ring: Ring<u32> = Ring::new("w");
        ring.insert(1, 10);
        ring.insert(2, 10);
        ring.remove(1);
        assert_eq!(ring.len(), 10);
        assert!(!ring.contains(1));
        assert_eq!(ring.nodes(), vec![2]);
    }

    #[test]
    fn collisions_break_ties_by_node() {
        let mut ring: Ring<u32> = Ring::new("w");
        // Hand-built colliding points: both at the same hash.
        ring.points = vec![(100, 9, 0), (100, 4, 0)];
        ring.points.sort_unstable();
        assert_eq!(ring.locate(50), Some(4));
        assert_eq!(ring.locate(100), Some(4));
    }
}
