use crate::config::RTreeConfig;
use crate::error::OmnidexResult;
use crate::storage::Rid;
use crate::utils::atomic_file;
use crate::utils::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

pub const RTREE_FILE: &str = "rtree.idx";

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Distance model for a spatial field pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    Euclidean,
    /// Great-circle kilometers over [lat, lon] degree coordinates.
    Haversine,
}

pub fn distance(a: [f64; 2], b: [f64; 2], metric: Metric) -> f64 {
    match metric {
        Metric::Euclidean => {
            let dx = a[0] - b[0];
            let dy = a[1] - b[1];
            (dx * dx + dy * dy).sqrt()
        }
        Metric::Haversine => {
            let (lat1, lon1) = (a[0].to_radians(), a[1].to_radians());
            let (lat2, lon2) = (b[0].to_radians(), b[1].to_radians());
            let dlat = lat2 - lat1;
            let dlon = lon2 - lon1;
            let h = (dlat / 2.0).sin().powi(2)
                + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
            2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
        }
    }
}

/// Axis-aligned minimum bounding rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl Rect {
    pub fn point(p: [f64; 2]) -> Self {
        Rect { min: p, max: p }
    }

    /// The empty rectangle: identity of `union`.
    pub fn empty() -> Self {
        Rect {
            min: [f64::INFINITY; 2],
            max: [f64::NEG_INFINITY; 2],
        }
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            min: [self.min[0].min(other.min[0]), self.min[1].min(other.min[1])],
            max: [self.max[0].max(other.max[0]), self.max[1].max(other.max[1])],
        }
    }

    pub fn area(&self) -> f64 {
        let w = self.max[0] - self.min[0];
        let h = self.max[1] - self.min[1];
        if w < 0.0 || h < 0.0 {
            0.0
        } else {
            w * h
        }
    }

    fn enlargement(&self, other: &Rect) -> f64 {
        self.union(other).area() - self.area()
    }

    fn contains_point(&self, p: [f64; 2]) -> bool {
        p[0] >= self.min[0] && p[0] <= self.max[0] && p[1] >= self.min[1] && p[1] <= self.max[1]
    }

    fn is_empty(&self) -> bool {
        self.min[0] > self.max[0] || self.min[1] > self.max[1]
    }

    /// Distance from `p` to the nearest point of the rectangle; zero inside.
    fn min_dist(&self, p: [f64; 2], metric: Metric) -> f64 {
        if self.is_empty() {
            return f64::INFINITY;
        }
        let clamped = [
            p[0].clamp(self.min[0], self.max[0]),
            p[1].clamp(self.min[1], self.max[1]),
        ];
        distance(p, clamped, metric)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeafEntry {
    rect: Rect,
    rid: Rid,
    /// Insertion sequence, the deterministic tie-break for equal distances.
    seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum NodeKind {
    Leaf(Vec<LeafEntry>),
    Internal(Vec<usize>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    mbr: Rect,
    kind: NodeKind,
}

/// R-tree over 2-D points: Guttman insertion with least-enlargement subtree
/// choice and quadratic-seed splits, best-first kNN and depth-first radius
/// search. Nodes live in an arena and the whole tree snapshots to
/// `rtree.idx` via bincode.
#[derive(Debug, Serialize, Deserialize)]
pub struct RTreeIndex {
    max_entries: usize,
    min_entries: usize,
    metric: Metric,
    root: usize,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    next_seq: u64,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl RTreeIndex {
    pub fn create(dir: &Path, config: RTreeConfig, metric: Metric) -> Self {
        let max_entries = config.max_entries.max(4);
        RTreeIndex {
            max_entries,
            min_entries: (max_entries / 2).max(2),
            metric,
            root: 0,
            nodes: vec![Some(Node {
                mbr: Rect::empty(),
                kind: NodeKind::Leaf(Vec::new()),
            })],
            free: Vec::new(),
            next_seq: 0,
            path: Some(dir.join(RTREE_FILE)),
        }
    }

    pub fn open(dir: &Path) -> OmnidexResult<Self> {
        let path = dir.join(RTREE_FILE);
        let bytes = std::fs::read(&path)?;
        let mut index: RTreeIndex = bincode::deserialize(&bytes)?;
        index.path = Some(path);
        Ok(index)
    }

    pub fn persist(&self) -> OmnidexResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = bincode::serialize(self)?;
        atomic_file::write_atomic(path, &bytes)
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("arena slot is freed")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("arena slot is freed")
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, idx: usize) {
        self.nodes[idx] = None;
        self.free.push(idx);
    }

    /// Child needing the least MBR enlargement; ties prefer the smaller
    /// area, then the lower child position.
    fn choose_child(&self, children: &[usize], rect: &Rect) -> usize {
        let mut best = 0;
        let mut best_enlargement = f64::INFINITY;
        let mut best_area = f64::INFINITY;
        for (pos, child) in children.iter().enumerate() {
            let mbr = self.node(*child).mbr;
            let enlargement = mbr.enlargement(rect);
            let area = mbr.area();
            if enlargement < best_enlargement
                || (enlargement == best_enlargement && area < best_area)
            {
                best = pos;
                best_enlargement = enlargement;
                best_area = area;
            }
        }
        best
    }

    pub fn insert_point(&mut self, p: [f64; 2], rid: Rid) {
        let rect = Rect::point(p);
        let seq = self.next_seq;
        self.next_seq += 1;

        // Descend to a leaf, remembering the path for MBR updates and
        // split propagation.
        let mut path = Vec::new();
        let mut cur = self.root;
        loop {
            match &self.node(cur).kind {
                NodeKind::Internal(children) => {
                    let pos = self.choose_child(children, &rect);
                    let child = children[pos];
                    path.push(cur);
                    cur = child;
                }
                NodeKind::Leaf(_) => break,
            }
        }

        {
            let node = self.node_mut(cur);
            node.mbr = node.mbr.union(&rect);
            let NodeKind::Leaf(entries) = &mut node.kind else {
                unreachable!()
            };
            entries.push(LeafEntry { rect, rid, seq });
        }

        let mut split = if self.overflowing(cur) {
            Some(self.split_node(cur))
        } else {
            None
        };

        // Walk back to the root updating MBRs and propagating splits.
        while let Some(parent) = path.pop() {
            if let Some(new_child) = split.take() {
                let NodeKind::Internal(children) = &mut self.node_mut(parent).kind else {
                    unreachable!()
                };
                children.push(new_child);
            }
            self.recompute_mbr(parent);
            if self.overflowing(parent) {
                split = Some(self.split_node(parent));
            }
        }
        if let Some(new_child) = split {
            let old_root = self.root;
            let mbr = self.node(old_root).mbr.union(&self.node(new_child).mbr);
            self.root = self.alloc(Node {
                mbr,
                kind: NodeKind::Internal(vec![old_root, new_child]),
            });
        }
    }

    fn overflowing(&self, idx: usize) -> bool {
        match &self.node(idx).kind {
            NodeKind::Leaf(entries) => entries.len() > self.max_entries,
            NodeKind::Internal(children) => children.len() > self.max_entries,
        }
    }

    fn recompute_mbr(&mut self, idx: usize) {
        let mbr = match &self.node(idx).kind {
            NodeKind::Leaf(entries) => entries
                .iter()
                .fold(Rect::empty(), |acc, e| acc.union(&e.rect)),
            NodeKind::Internal(children) => children
                .iter()
                .fold(Rect::empty(), |acc, c| acc.union(&self.node(*c).mbr)),
        };
        self.node_mut(idx).mbr = mbr;
    }

    /// Quadratic split: seed the two groups with the pair wasting the most
    /// area, then assign each remaining item to the group whose MBR grows
    /// least. Returns the arena index of the new sibling.
    fn split_node(&mut self, idx: usize) -> usize {
        match self.node(idx).kind.clone() {
            NodeKind::Leaf(entries) => {
                let rects: Vec<Rect> = entries.iter().map(|e| e.rect).collect();
                let (left, right) = quadratic_partition(&rects, self.min_entries);
                let pick = |idxs: &[usize]| -> Vec<LeafEntry> {
                    idxs.iter().map(|i| entries[*i].clone()).collect()
                };
                let left_entries = pick(&left);
                let right_entries = pick(&right);
                let left_mbr = left_entries
                    .iter()
                    .fold(Rect::empty(), |acc, e| acc.union(&e.rect));
                let right_mbr = right_entries
                    .iter()
                    .fold(Rect::empty(), |acc, e| acc.union(&e.rect));
                *self.node_mut(idx) = Node {
                    mbr: left_mbr,
                    kind: NodeKind::Leaf(left_entries),
                };
                self.alloc(Node {
                    mbr: right_mbr,
                    kind: NodeKind::Leaf(right_entries),
                })
            }
            NodeKind::Internal(children) => {
                let rects: Vec<Rect> = children.iter().map(|c| self.node(*c).mbr).collect();
                let (left, right) = quadratic_partition(&rects, self.min_entries);
                let left_children: Vec<usize> = left.iter().map(|i| children[*i]).collect();
                let right_children: Vec<usize> = right.iter().map(|i| children[*i]).collect();
                let left_mbr = left_children
                    .iter()
                    .fold(Rect::empty(), |acc, c| acc.union(&self.node(*c).mbr));
                let right_mbr = right_children
                    .iter()
                    .fold(Rect::empty(), |acc, c| acc.union(&self.node(*c).mbr));
                *self.node_mut(idx) = Node {
                    mbr: left_mbr,
                    kind: NodeKind::Internal(left_children),
                };
                self.alloc(Node {
                    mbr: right_mbr,
                    kind: NodeKind::Internal(right_children),
                })
            }
        }
    }

    /// Best-first kNN: a priority queue ordered by minimum distance expands
    /// nodes lazily; the first k entries popped are the k nearest. Equal
    /// distances resolve by insertion order.
    pub fn knn(
        &self,
        p: [f64; 2],
        k: usize,
        cancel: Option<&CancelToken>,
    ) -> OmnidexResult<Vec<(Rid, f64)>> {
        let mut out = Vec::with_capacity(k);
        if k == 0 {
            return Ok(out);
        }
        let mut queue: BinaryHeap<std::cmp::Reverse<QueueItem>> = BinaryHeap::new();
        queue.push(std::cmp::Reverse(QueueItem {
            dist: self.node(self.root).mbr.min_dist(p, self.metric),
            entry_seq: None,
            target: Target::Node(self.root),
        }));

        while let Some(std::cmp::Reverse(item)) = queue.pop() {
            match item.target {
                Target::Node(idx) => {
                    if let Some(token) = cancel {
                        token.checkpoint()?;
                    }
                    match &self.node(idx).kind {
                        NodeKind::Leaf(entries) => {
                            for entry in entries {
                                queue.push(std::cmp::Reverse(QueueItem {
                                    dist: distance(p, entry.rect.min, self.metric),
                                    entry_seq: Some(entry.seq),
                                    target: Target::Entry(entry.rid),
                                }));
                            }
                        }
                        NodeKind::Internal(children) => {
                            for child in children {
                                queue.push(std::cmp::Reverse(QueueItem {
                                    dist: self.node(*child).mbr.min_dist(p, self.metric),
                                    entry_seq: None,
                                    target: Target::Node(*child),
                                }));
                            }
                        }
                    }
                }
                Target::Entry(rid) => {
                    out.push((rid, item.dist));
                    if out.len() == k {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Depth-first radius search pruning subtrees farther than `radius`.
    pub fn within_radius(
        &self,
        p: [f64; 2],
        radius: f64,
        cancel: Option<&CancelToken>,
    ) -> OmnidexResult<Vec<(Rid, f64)>> {
        let mut hits: Vec<(f64, u64, Rid)> = Vec::new();
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            if let Some(token) = cancel {
                token.checkpoint()?;
            }
            let node = self.node(idx);
            if node.mbr.min_dist(p, self.metric) > radius {
                continue;
            }
            match &node.kind {
                NodeKind::Leaf(entries) => {
                    for entry in entries {
                        let d = distance(p, entry.rect.min, self.metric);
                        if d <= radius {
                            hits.push((d, entry.seq, entry.rid));
                        }
                    }
                }
                NodeKind::Internal(children) => stack.extend(children.iter().copied()),
            }
        }
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(hits.into_iter().map(|(d, _, rid)| (rid, d)).collect())
    }

    /// Rids stored at exactly this coordinate.
    pub fn search_point(&self, p: [f64; 2]) -> Vec<Rid> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            let node = self.node(idx);
            if !node.mbr.contains_point(p) {
                continue;
            }
            match &node.kind {
                NodeKind::Leaf(entries) => {
                    for entry in entries {
                        if entry.rect.min == p {
                            out.push(entry.rid);
                        }
                    }
                }
                NodeKind::Internal(children) => stack.extend(children.iter().copied()),
            }
        }
        out.sort_unstable();
        out
    }

    /// Remove every entry at exactly this coordinate, shrinking MBRs and
    /// dropping emptied subtrees on the way back up.
    pub fn delete_point(&mut self, p: [f64; 2]) -> Vec<Rid> {
        let mut removed = Vec::new();
        self.delete_rec(self.root, p, &mut removed);
        // An emptied internal root collapses back to a leaf.
        let root_state = match &self.node(self.root).kind {
            NodeKind::Internal(children) if children.is_empty() => Some(None),
            NodeKind::Internal(children) if children.len() == 1 => Some(Some(children[0])),
            _ => None,
        };
        match root_state {
            Some(None) => {
                let root = self.root;
                *self.node_mut(root) = Node {
                    mbr: Rect::empty(),
                    kind: NodeKind::Leaf(Vec::new()),
                };
            }
            Some(Some(only)) => {
                let old = self.root;
                self.root = only;
                self.release(old);
            }
            None => {}
        }
        removed
    }

    fn delete_rec(&mut self, idx: usize, p: [f64; 2], removed: &mut Vec<Rid>) -> bool {
        if !self.node(idx).mbr.contains_point(p) {
            return false;
        }
        match self.node(idx).kind.clone() {
            NodeKind::Leaf(_) => {
                let NodeKind::Leaf(entries) = &mut self.node_mut(idx).kind else {
                    unreachable!()
                };
                entries.retain(|entry| {
                    if entry.rect.min == p {
                        removed.push(entry.rid);
                        false
                    } else {
                        true
                    }
                });
                self.recompute_mbr(idx);
                match &self.node(idx).kind {
                    NodeKind::Leaf(entries) => entries.is_empty(),
                    _ => unreachable!(),
                }
            }
            NodeKind::Internal(children) => {
                let mut keep = Vec::with_capacity(children.len());
                for child in children {
                    if self.delete_rec(child, p, removed) {
                        self.release(child);
                    } else {
                        keep.push(child);
                    }
                }
                let emptied = keep.is_empty();
                let NodeKind::Internal(children) = &mut self.node_mut(idx).kind else {
                    unreachable!()
                };
                *children = keep;
                self.recompute_mbr(idx);
                emptied
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count_entries(self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn count_entries(&self, idx: usize) -> usize {
        match &self.node(idx).kind {
            NodeKind::Leaf(entries) => entries.len(),
            NodeKind::Internal(children) => {
                children.iter().map(|c| self.count_entries(*c)).sum()
            }
        }
    }

    /// Root MBR, for the union invariant.
    pub fn root_mbr(&self) -> Rect {
        self.node(self.root).mbr
    }

    #[cfg(test)]
    fn check_mbr_invariant(&self, idx: usize) -> Rect {
        let node = self.node(idx);
        match &node.kind {
            NodeKind::Leaf(entries) => {
                let union = entries
                    .iter()
                    .fold(Rect::empty(), |acc, e| acc.union(&e.rect));
                assert_eq!(union, node.mbr);
                union
            }
            NodeKind::Internal(children) => {
                let union = children
                    .iter()
                    .fold(Rect::empty(), |acc, c| acc.union(&self.check_mbr_invariant(*c)));
                assert_eq!(union, node.mbr);
                union
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    Node(usize),
    Entry(Rid),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct QueueItem {
    dist: f64,
    /// None for nodes, which must expand before equal-distance entries
    /// are emitted.
    entry_seq: Option<u64>,
    target: Target,
}

impl Eq for QueueItem {}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.total_cmp(&other.dist).then_with(|| {
            match (self.entry_seq, other.entry_seq) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(&b),
            }
        })
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Guttman's quadratic split over item rectangles: returns the two index
/// groups, each at least `min_fill` strong.
fn quadratic_partition(rects: &[Rect], min_fill: usize) -> (Vec<usize>, Vec<usize>) {
    let n = rects.len();
    debug_assert!(n >= 2);

    // Pick seeds: the pair whose combined MBR wastes the most area.
    let (mut seed_a, mut seed_b, mut worst) = (0, 1, f64::NEG_INFINITY);
    for i in 0..n {
        for j in i + 1..n {
            let waste = rects[i].union(&rects[j]).area() - rects[i].area() - rects[j].area();
            if waste > worst {
                worst = waste;
                seed_a = i;
                seed_b = j;
            }
        }
    }

    let mut group_a = vec![seed_a];
    let mut group_b = vec![seed_b];
    let mut mbr_a = rects[seed_a];
    let mut mbr_b = rects[seed_b];
    let mut remaining: Vec<usize> = (0..n).filter(|i| *i != seed_a && *i != seed_b).collect();

    while !remaining.is_empty() {
        // Force-assign when one group needs every remaining item to reach
        // the minimum fill.
        if group_a.len() + remaining.len() == min_fill {
            for i in remaining.drain(..) {
                mbr_a = mbr_a.union(&rects[i]);
                group_a.push(i);
            }
            break;
        }
        if group_b.len() + remaining.len() == min_fill {
            for i in remaining.drain(..) {
                mbr_b = mbr_b.union(&rects[i]);
                group_b.push(i);
            }
            break;
        }

        // Next item: the one with the strongest preference between groups.
        let (mut pick_pos, mut pick_pref) = (0, f64::NEG_INFINITY);
        for (pos, i) in remaining.iter().enumerate() {
            let pref =
                (mbr_a.enlargement(&rects[*i]) - mbr_b.enlargement(&rects[*i])).abs();
            if pref > pick_pref {
                pick_pref = pref;
                pick_pos = pos;
            }
        }
        let i = remaining.swap_remove(pick_pos);
        let grow_a = mbr_a.enlargement(&rects[i]);
        let grow_b = mbr_b.enlargement(&rects[i]);
        let to_a = match grow_a.total_cmp(&grow_b) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => {
                (mbr_a.area(), group_a.len()) <= (mbr_b.area(), group_b.len())
            }
        };
        if to_a {
            mbr_a = mbr_a.union(&rects[i]);
            group_a.push(i);
        } else {
            mbr_b = mbr_b.union(&rects[i]);
            group_b.push(i);
        }
    }
    (group_a, group_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn euclid_tree() -> RTreeIndex {
        let dir = TempDir::new().unwrap();
        let mut tree = RTreeIndex::create(dir.path(), RTreeConfig { max_entries: 4 }, Metric::Euclidean);
        tree.path = None;
        tree
    }

    #[test]
    fn knn_returns_points_in_ascending_distance() {
        let mut tree = euclid_tree();
        for i in 0..50u64 {
            let x = (i % 10) as f64;
            let y = (i / 10) as f64;
            tree.insert_point([x, y], i);
        }
        let got = tree.knn([0.0, 0.0], 3, None).unwrap();
        let rids: Vec<Rid> = got.iter().map(|(rid, _)| *rid).collect();
        assert_eq!(rids, vec![0, 1, 10]);
        assert!(got.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn knn_ties_resolve_by_insertion_order() {
        let mut tree = euclid_tree();
        // Four points equidistant from the origin.
        tree.insert_point([1.0, 0.0], 10);
        tree.insert_point([0.0, 1.0], 11);
        tree.insert_point([-1.0, 0.0], 12);
        tree.insert_point([0.0, -1.0], 13);
        let got = tree.knn([0.0, 0.0], 4, None).unwrap();
        let rids: Vec<Rid> = got.iter().map(|(rid, _)| *rid).collect();
        assert_eq!(rids, vec![10, 11, 12, 13]);
    }

    #[test]
    fn radius_search_prunes_and_sorts() {
        let mut tree = euclid_tree();
        for i in 0..100u64 {
            tree.insert_point([i as f64, 0.0], i);
        }
        let got = tree.within_radius([0.0, 0.0], 3.5, None).unwrap();
        let rids: Vec<Rid> = got.iter().map(|(rid, _)| *rid).collect();
        assert_eq!(rids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn haversine_radius_matches_known_geography() {
        let dir = TempDir::new().unwrap();
        let mut tree =
            RTreeIndex::create(dir.path(), RTreeConfig { max_entries: 8 }, Metric::Haversine);
        tree.insert_point([47.60, -122.33], 0);
        tree.insert_point([47.62, -122.30], 1);
        tree.insert_point([48.00, -121.00], 2);
        let got = tree.within_radius([47.61, -122.31], 5.0, None).unwrap();
        let rids: Vec<Rid> = got.iter().map(|(rid, _)| *rid).collect();
        assert_eq!(rids, vec![1, 0]);
    }

    #[test]
    fn mbr_invariant_survives_inserts_and_deletes() {
        let mut tree = euclid_tree();
        for i in 0..80u64 {
            tree.insert_point([(i * 13 % 37) as f64, (i * 7 % 23) as f64], i);
        }
        tree.check_mbr_invariant(tree.root);
        for i in (0..80u64).step_by(3) {
            tree.delete_point([(i * 13 % 37) as f64, (i * 7 % 23) as f64]);
        }
        tree.check_mbr_invariant(tree.root);
    }

    #[test]
    fn delete_removes_exact_point_only() {
        let mut tree = euclid_tree();
        tree.insert_point([1.0, 1.0], 0);
        tree.insert_point([1.0, 1.0], 1);
        tree.insert_point([2.0, 2.0], 2);
        let removed = tree.delete_point([1.0, 1.0]);
        assert_eq!(removed.len(), 2);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.search_point([2.0, 2.0]), vec![2]);
        assert!(tree.delete_point([1.0, 1.0]).is_empty());
    }

    #[test]
    fn persist_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut tree =
                RTreeIndex::create(dir.path(), RTreeConfig::default(), Metric::Euclidean);
            for i in 0..20u64 {
                tree.insert_point([i as f64, i as f64], i);
            }
            tree.persist().unwrap();
        }
        let tree = RTreeIndex::open(dir.path()).unwrap();
        assert_eq!(tree.len(), 20);
        assert_eq!(tree.knn([0.0, 0.0], 1, None).unwrap()[0].0, 0);
    }
}
