//! A* enumeration of complete paths, best first.
//!
//! Partial paths grow backwards from the end node. The heuristic for a
//! partial path starting at node `n` is the exact best score from the start
//! node to `n`, so complete paths come out in non-increasing score order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

use crate::error::DecoderError;
use crate::lattice::bestpath::LatticePath;
use crate::lattice::Lattice;
use crate::logmath::clamp_score;

/// Shared suffix of partial paths: `node`, reached through `arc`, followed
/// by `next`.
struct PathLink {
    node: usize,
    arc: Option<usize>,
    next: Option<Rc<PathLink>>,
}

struct Candidate {
    /// Suffix score plus the heuristic.
    estimate: i64,
    suffix: i64,
    seq: u64,
    link: Rc<PathLink>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.estimate
            .cmp(&other.estimate)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct NBestPaths<'a> {
    lattice: &'a Lattice,
    forward: Vec<Option<i64>>,
    rank: Vec<usize>,
    heap: BinaryHeap<Candidate>,
    seq: u64,
    failed: bool,
}

impl<'a> NBestPaths<'a> {
    fn new(lattice: &'a Lattice) -> Result<Self, DecoderError> {
        let order = lattice.topological_order()?;
        let (forward, _) = lattice.forward_best(&order);
        let mut rank = vec![0; lattice.nodes.len()];
        for (r, &n) in order.iter().enumerate() {
            rank[n] = r;
        }
        let mut paths = Self {
            lattice,
            forward,
            rank,
            heap: BinaryHeap::new(),
            seq: 0,
            failed: false,
        };
        if let Some(h) = paths.forward[lattice.end] {
            paths.push(
                h,
                0,
                Rc::new(PathLink {
                    node: lattice.end,
                    arc: None,
                    next: None,
                }),
            );
        }
        Ok(paths)
    }

    fn push(&mut self, estimate: i64, suffix: i64, link: Rc<PathLink>) {
        self.heap.push(Candidate {
            estimate,
            suffix,
            seq: self.seq,
            link,
        });
        self.seq += 1;
    }

    fn expand(&mut self, candidate: &Candidate) -> Result<(), DecoderError> {
        let lattice = self.lattice;
        let node = candidate.link.node;
        for &a in lattice.in_arcs(node) {
            let arc = lattice.arc(a);
            // Topological rank strictly decreases along a backward walk.
            if self.rank[arc.from] >= self.rank[node] {
                return Err(DecoderError::invariant(format!(
                    "N-best search revisits node {}",
                    arc.from
                )));
            }
            let Some(h) = self.forward[arc.from] else {
                continue;
            };
            let suffix = candidate.suffix + arc.score() as i64;
            let link = Rc::new(PathLink {
                node: arc.from,
                arc: Some(a),
                next: Some(Rc::clone(&candidate.link)),
            });
            self.push(suffix + h, suffix, link);
        }
        Ok(())
    }
}

fn unwind(link: &Rc<PathLink>, score: i64) -> LatticePath {
    let mut nodes = Vec::new();
    let mut arcs = Vec::new();
    let mut at = Some(link);
    while let Some(l) = at {
        nodes.push(l.node);
        if let Some(a) = l.arc {
            arcs.push(a);
        }
        at = l.next.as_ref();
    }
    LatticePath {
        nodes,
        arcs,
        score: clamp_score(score),
    }
}

impl Iterator for NBestPaths<'_> {
    type Item = Result<LatticePath, DecoderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while let Some(candidate) = self.heap.pop() {
            if candidate.link.node == self.lattice.start {
                return Some(Ok(unwind(&candidate.link, candidate.suffix)));
            }
            if let Err(err) = self.expand(&candidate) {
                self.failed = true;
                return Some(Err(err));
            }
        }
        None
    }
}

impl Lattice {
    /// Complete paths in non-increasing score order. Equal scores come out
    /// in the order their last extension was generated.
    pub fn nbest_paths(&self) -> Result<NBestPaths<'_>, DecoderError> {
        NBestPaths::new(self)
    }

    /// The `k` best complete paths.
    pub fn nbest(&self, k: usize) -> Result<Vec<LatticePath>, DecoderError> {
        self.nbest_paths()?.take(k).collect()
    }
}
