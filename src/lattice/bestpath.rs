use crate::error::DecoderError;
use crate::lattice::{Lattice, NodeKind};
use crate::logmath::{clamp_score, Score};
use crate::search::lextree::base_text;

/// A complete start-to-end path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatticePath {
    /// Node ids from the start node to the end node.
    pub nodes: Vec<usize>,
    pub arcs: Vec<usize>,
    pub score: Score,
}

impl LatticePath {
    /// Word nodes of the path, without the start and end nodes.
    pub fn word_nodes<'a>(&'a self, lattice: &'a Lattice) -> impl Iterator<Item = usize> + 'a {
        self.nodes.iter().copied().filter(move |&n| {
            matches!(lattice.node(n).kind, NodeKind::Word | NodeKind::Filler)
        })
    }

    /// Space-separated non-filler words in their base spelling.
    pub fn text(&self, lattice: &Lattice) -> String {
        self.word_nodes(lattice)
            .filter(|&n| lattice.node(n).kind == NodeKind::Word)
            .map(|n| base_text(&lattice.node(n).text))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Lattice {
    /// Best score from the start node to every node, summed in `i64`.
    /// `None` marks nodes the start cannot reach.
    pub(crate) fn forward_best(
        &self,
        order: &[usize],
    ) -> (Vec<Option<i64>>, Vec<Option<usize>>) {
        let n = self.nodes.len();
        let mut best: Vec<Option<i64>> = vec![None; n];
        let mut via: Vec<Option<usize>> = vec![None; n];
        best[self.start] = Some(0);
        for &node in order {
            let Some(here) = best[node] else {
                continue;
            };
            for &a in &self.out_arcs[node] {
                let arc = &self.arcs[a];
                let candidate = here + arc.score() as i64;
                let better = match (best[arc.to], via[arc.to]) {
                    (Some(b), Some(v)) => candidate > b || (candidate == b && a < v),
                    (Some(b), None) => candidate > b,
                    (None, _) => true,
                };
                if better {
                    best[arc.to] = Some(candidate);
                    via[arc.to] = Some(a);
                }
            }
        }
        (best, via)
    }

    /// Highest-scoring complete path. Where equal scores meet at a node the
    /// earlier-created arc wins.
    pub fn best_path(&self) -> Result<LatticePath, DecoderError> {
        let order = self.topological_order()?;
        let (best, via) = self.forward_best(&order);
        let total = best[self.end].ok_or_else(|| {
            DecoderError::corrupt_lattice("end node is unreachable from the start node")
        })?;

        let mut nodes = vec![self.end];
        let mut arcs = Vec::new();
        let mut at = self.end;
        while at != self.start {
            let a = via[at].ok_or_else(|| {
                DecoderError::invariant(format!("best path lost its way at node {at}"))
            })?;
            if arcs.len() > self.arcs.len() {
                return Err(DecoderError::invariant("best path revisits a node"));
            }
            arcs.push(a);
            at = self.arcs[a].from;
            nodes.push(at);
        }
        nodes.reverse();
        arcs.reverse();
        Ok(LatticePath {
            nodes,
            arcs,
            score: clamp_score(total),
        })
    }
}
