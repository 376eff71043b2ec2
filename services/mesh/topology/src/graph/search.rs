//! RouteGraph implementation methods.

use super::{DirectRoute, GraphError, RouteGraph, ShortestPaths};
use mesh_wire::PeerId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

impl RouteGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the edge `from -> to`.
    ///
    /// A second call for the same ordered pair is a no-op and returns
    /// `Ok(false)`.
    pub fn add_direct_route(
        &mut self,
        from: PeerId,
        to: PeerId,
        weight: i64,
    ) -> Result<bool, GraphError> {
        if from == to {
            return Err(GraphError::SelfLoop(from));
        }
        if weight <= 0 {
            return Err(GraphError::NonPositiveWeight(weight));
        }
        if !self.edge_set.insert((from, to)) {
            return Ok(false);
        }

        for peer in [from, to] {
            if !self.adjacency.contains_key(&peer) {
                self.adjacency.insert(peer, Vec::new());
                self.peers.push(peer);
            }
        }
        if let Some(edges) = self.adjacency.get_mut(&from) {
            edges.push(DirectRoute { from, to, weight });
        }

        // cached trees may now have a shorter path
        self.cache.clear();
        debug!(from = %from.short(), to = %to.short(), weight, "direct route added");
        Ok(true)
    }

    /// Shortest path from `from` to `to`, both endpoints included
    pub fn find_route(&mut self, from: PeerId, to: PeerId) -> Result<Vec<PeerId>, GraphError> {
        if from == to && self.adjacency.contains_key(&from) {
            return Ok(vec![from]);
        }

        if !self.cache.contains_key(&from) {
            let tree = self.dijkstra(from);
            self.cache.insert(from, tree);
        }
        let tree = match self.cache.get(&from) {
            Some(tree) => tree,
            None => return Err(GraphError::NoRoute { from, to }),
        };

        if !tree.distance.contains_key(&to) {
            return Err(GraphError::NoRoute { from, to });
        }

        let mut path = vec![to];
        let mut current = to;
        while current != from {
            match tree.previous.get(&current) {
                Some(prev) => {
                    current = *prev;
                    path.push(current);
                }
                None => return Err(GraphError::NoRoute { from, to }),
            }
        }
        path.reverse();
        Ok(path)
    }

    fn dijkstra(&self, source: PeerId) -> ShortestPaths {
        let mut tree = ShortestPaths::default();
        if !self.adjacency.contains_key(&source) {
            return tree;
        }

        // The sequence number makes equal-distance pops FIFO, so the first
        // relaxed edge decides ties.
        let mut seq: u64 = 0;
        let mut heap: BinaryHeap<Reverse<(i64, u64, usize)>> = BinaryHeap::new();
        let index: HashMap<PeerId, usize> = self
            .peers
            .iter()
            .enumerate()
            .map(|(i, p)| (*p, i))
            .collect();

        tree.distance.insert(source, 0);
        if let Some(&i) = index.get(&source) {
            heap.push(Reverse((0, seq, i)));
        }

        while let Some(Reverse((dist, _, i))) = heap.pop() {
            let current = self.peers[i];
            if dist > tree.distance.get(&current).copied().unwrap_or(i64::MAX) {
                continue;
            }

            let edges = match self.adjacency.get(&current) {
                Some(edges) => edges,
                None => continue,
            };
            for edge in edges {
                let candidate = dist.saturating_add(edge.weight);
                let known = tree.distance.get(&edge.to).copied().unwrap_or(i64::MAX);
                if candidate < known {
                    tree.distance.insert(edge.to, candidate);
                    tree.previous.insert(edge.to, current);
                    if let Some(&j) = index.get(&edge.to) {
                        seq += 1;
                        heap.push(Reverse((candidate, seq, j)));
                    }
                }
            }
        }

        debug!(
            source = %source.short(),
            reachable = tree.distance.len(),
            "shortest paths computed"
        );
        tree
    }

    /// Drop every edge and cached result
    pub fn clear(&mut self) {
        self.adjacency.clear();
        self.edge_set.clear();
        self.peers.clear();
        self.cache.clear();
    }

    /// Whether the ordered pair has an edge
    pub fn contains_edge(&self, from: &PeerId, to: &PeerId) -> bool {
        self.edge_set.contains(&(*from, *to))
    }

    /// Every edge, grouped by tail in first-seen order
    pub fn edges(&self) -> Vec<DirectRoute> {
        self.peers
            .iter()
            .filter_map(|p| self.adjacency.get(p))
            .flat_map(|edges| edges.iter().copied())
            .collect()
    }

    /// Heads of the edges leaving `peer`
    pub fn neighbors(&self, peer: &PeerId) -> Vec<PeerId> {
        self.adjacency
            .get(peer)
            .map(|edges| edges.iter().map(|e| e.to).collect())
            .unwrap_or_default()
    }

    /// Peers touching at least one edge
    pub fn node_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of directed edges
    pub fn edge_count(&self) -> usize {
        self.edge_set.len()
    }

    /// Total weight along `path`; `None` if a step has no edge
    pub fn path_weight(&self, path: &[PeerId]) -> Option<i64> {
        path.windows(2).try_fold(0i64, |acc, pair| {
            self.adjacency
                .get(&pair[0])?
                .iter()
                .find(|e| e.to == pair[1])
                .map(|e| acc + e.weight)
        })
    }

    /// Sources with a cached search result
    pub fn cached_sources(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn peers(n: usize) -> Vec<PeerId> {
        (0..n)
            .map(|i| {
                let mut bytes = [0u8; mesh_wire::PEER_ID_LEN];
                bytes[0] = i as u8 + 1;
                PeerId(bytes)
            })
            .collect()
    }

    fn link(g: &mut RouteGraph, a: PeerId, b: PeerId, w: i64) {
        g.add_direct_route(a, b, w).unwrap();
        g.add_direct_route(b, a, w).unwrap();
    }

    #[test]
    fn test_add_idempotent_and_rejects() {
        let p = peers(2);
        let mut g = RouteGraph::new();
        assert_eq!(g.add_direct_route(p[0], p[1], 1), Ok(true));
        assert_eq!(g.add_direct_route(p[0], p[1], 5), Ok(false));
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.path_weight(&[p[0], p[1]]), Some(1));

        assert_eq!(
            g.add_direct_route(p[0], p[0], 1),
            Err(GraphError::SelfLoop(p[0]))
        );
        assert_eq!(
            g.add_direct_route(p[1], p[0], 0),
            Err(GraphError::NonPositiveWeight(0))
        );
        assert_eq!(
            g.add_direct_route(p[1], p[0], -3),
            Err(GraphError::NonPositiveWeight(-3))
        );
    }

    #[test]
    fn test_shortest_of_three_candidates() {
        // a -> z via 2, 3 and 4 hops
        let p = peers(8);
        let (a, z) = (p[0], p[7]);
        let mut g = RouteGraph::new();
        link(&mut g, a, p[1], 1);
        link(&mut g, p[1], p[2], 1);
        link(&mut g, p[2], p[3], 1);
        link(&mut g, p[3], z, 1);
        link(&mut g, a, p[4], 1);
        link(&mut g, p[4], p[5], 1);
        link(&mut g, p[5], z, 1);
        link(&mut g, a, p[6], 1);
        link(&mut g, p[6], z, 1);

        let path = g.find_route(a, z).unwrap();
        assert_eq!(path, vec![a, p[6], z]);
        assert_eq!(g.path_weight(&path), Some(2));
    }

    #[test]
    fn test_tie_goes_to_first_edge() {
        let p = peers(4);
        let mut g = RouteGraph::new();
        link(&mut g, p[0], p[1], 1);
        link(&mut g, p[0], p[2], 1);
        link(&mut g, p[1], p[3], 1);
        link(&mut g, p[2], p[3], 1);

        let first = g.find_route(p[0], p[3]).unwrap();
        assert_eq!(first, vec![p[0], p[1], p[3]]);
        for _ in 0..5 {
            assert_eq!(g.find_route(p[0], p[3]).unwrap(), first);
        }
    }

    #[test]
    fn test_weights_beat_hop_count() {
        let p = peers(4);
        let mut g = RouteGraph::new();
        g.add_direct_route(p[0], p[3], 10).unwrap();
        g.add_direct_route(p[0], p[1], 2).unwrap();
        g.add_direct_route(p[1], p[2], 2).unwrap();
        g.add_direct_route(p[2], p[3], 2).unwrap();
        assert_eq!(g.find_route(p[0], p[3]).unwrap(), vec![p[0], p[1], p[2], p[3]]);
        // edges are directed
        assert!(matches!(
            g.find_route(p[3], p[0]),
            Err(GraphError::NoRoute { .. })
        ));
    }

    #[test]
    fn test_cache_and_clear() {
        let p = peers(3);
        let mut g = RouteGraph::new();
        link(&mut g, p[0], p[1], 1);
        assert!(g.find_route(p[0], p[2]).is_err());
        assert_eq!(g.cached_sources(), 1);

        link(&mut g, p[1], p[2], 1);
        assert_eq!(g.cached_sources(), 0);
        assert_eq!(g.find_route(p[0], p[2]).unwrap(), vec![p[0], p[1], p[2]]);

        g.clear();
        assert_eq!(g.cached_sources(), 0);
        assert_eq!(g.node_count(), 0);
        assert!(g.find_route(p[0], p[2]).is_err());
    }

    #[test]
    fn test_matches_floyd_warshall() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let n = 9;
            let p = peers(n);
            let mut g = RouteGraph::new();
            let mut w = vec![vec![None; n]; n];
            for i in 0..n {
                for j in 0..n {
                    if i != j && rng.gen_bool(0.3) {
                        let weight = rng.gen_range(1..10);
                        g.add_direct_route(p[i], p[j], weight).unwrap();
                        w[i][j] = Some(weight);
                    }
                }
            }

            let mut d = w.clone();
            for (i, row) in d.iter_mut().enumerate() {
                row[i] = Some(0);
            }
            for k in 0..n {
                for i in 0..n {
                    for j in 0..n {
                        if let (Some(a), Some(b)) = (d[i][k], d[k][j]) {
                            if d[i][j].map_or(true, |c| a + b < c) {
                                d[i][j] = Some(a + b);
                            }
                        }
                    }
                }
            }

            for i in 0..n {
                for j in 0..n {
                    if i == j {
                        continue;
                    }
                    match (g.find_route(p[i], p[j]), d[i][j]) {
                        (Ok(path), Some(best)) => {
                            assert_eq!(path[0], p[i]);
                            assert_eq!(*path.last().unwrap(), p[j]);
                            assert_eq!(g.path_weight(&path), Some(best));
                        }
                        (Err(GraphError::NoRoute { .. }), None) => {}
                        (got, want) => panic!("{:?} vs {:?}", got, want),
                    }
                }
            }
        }
    }
}
