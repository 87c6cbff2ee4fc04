//! Word lattices built from a pass's backpointer table.
//!
//! A node is a word hypothesis over an inclusive frame interval; an arc joins
//! two nodes whose intervals are adjacent and carries the acoustic score of
//! the destination word plus the LM score of the transition. Node ids are
//! topologically ordered: the start node first, then nodes by
//! `(start_frame, end_frame, word)`, the end node last.

pub mod bestpath;
pub mod format;
pub mod nbest;
pub mod posterior;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;

use crate::error::DecoderError;
use crate::logmath::{add_scores, Score, WORST_SCORE};
use crate::search::lextree::{LexiconTree, END_WORD, START_WORD};
use crate::search::lmcache::{LmHistory, LmScorer};
use crate::search::PassOutput;
use crate::types::WordId;

pub use self::bestpath::LatticePath;
pub use self::nbest::NBestPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Word,
    Filler,
}

impl NodeKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Word => "word",
            Self::Filler => "filler",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "start" => Some(Self::Start),
            "end" => Some(Self::End),
            "word" => Some(Self::Word),
            "filler" => Some(Self::Filler),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatticeNode {
    pub word: WordId,
    pub text: String,
    pub start_frame: usize,
    /// Inclusive.
    pub end_frame: usize,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatticeArc {
    pub from: usize,
    pub to: usize,
    /// Acoustic score of the destination word.
    pub ascr: Score,
    /// LM score of entering the destination from the source.
    pub lscr: Score,
    /// Forward log mass of the source node, once posteriors are computed.
    pub alpha: f64,
    /// Backward log mass of the destination node.
    pub beta: f64,
    /// Natural-log posterior of traversing this arc.
    pub posterior: f64,
}

impl LatticeArc {
    pub fn new(from: usize, to: usize, ascr: Score, lscr: Score) -> Self {
        Self {
            from,
            to,
            ascr,
            lscr,
            alpha: f64::NEG_INFINITY,
            beta: f64::NEG_INFINITY,
            posterior: f64::NEG_INFINITY,
        }
    }

    pub fn score(&self) -> Score {
        add_scores(self.ascr, self.lscr)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lattice {
    utterance_id: String,
    n_frames: usize,
    nodes: Vec<LatticeNode>,
    arcs: Vec<LatticeArc>,
    out_arcs: Vec<Vec<usize>>,
    in_arcs: Vec<Vec<usize>>,
    start: usize,
    end: usize,
    node_alpha: Vec<f64>,
    node_beta: Vec<f64>,
    /// Log mass of all start-to-end paths; set by `compute_posteriors`.
    total: Option<f64>,
}

type NodeKey = (usize, usize, WordId);

impl Lattice {
    /// Collects every word exit of `output` that lies on some complete path.
    pub(crate) fn from_backpointers(
        utterance_id: &str,
        output: &PassOutput,
        tree: &LexiconTree,
        lm: &mut LmScorer,
    ) -> Result<Self, DecoderError> {
        let exit = output
            .exit
            .ok_or_else(|| DecoderError::corrupt_lattice("pass has no final word exit"))?;
        let table = &output.table;
        let entries = table.entries();
        let final_frame = entries
            .get(exit.index)
            .map(|e| e.end_frame)
            .ok_or_else(|| DecoderError::invariant("final exit is not in the backpointer table"))?;

        // Word nodes in (start, end, word) order sit between Start and End.
        let keys: BTreeMap<NodeKey, ()> = entries
            .iter()
            .map(|e| ((e.start_frame, e.end_frame, e.word), ()))
            .collect();
        let mut node_of: HashMap<NodeKey, usize> = HashMap::with_capacity(keys.len());
        let mut nodes = Vec::with_capacity(keys.len() + 2);
        nodes.push(LatticeNode {
            word: START_WORD,
            text: tree.word(START_WORD).text.clone(),
            start_frame: 0,
            end_frame: 0,
            kind: NodeKind::Start,
        });
        for &(sf, ef, word) in keys.keys() {
            let entry = tree.word(word);
            node_of.insert((sf, ef, word), nodes.len());
            nodes.push(LatticeNode {
                word,
                text: entry.text.clone(),
                start_frame: sf,
                end_frame: ef,
                kind: if entry.filler {
                    NodeKind::Filler
                } else {
                    NodeKind::Word
                },
            });
        }
        let end = nodes.len();
        nodes.push(LatticeNode {
            word: END_WORD,
            text: tree.word(END_WORD).text.clone(),
            start_frame: final_frame + 1,
            end_frame: final_frame + 1,
            kind: NodeKind::End,
        });

        let mut arcs: Vec<LatticeArc> = Vec::new();
        let mut arc_of: HashMap<(usize, usize), usize> = HashMap::new();
        let mut add_arc = |arc: LatticeArc| {
            if arc.score() <= WORST_SCORE {
                return;
            }
            match arc_of.get(&(arc.from, arc.to)) {
                Some(&i) if arcs[i].score() >= arc.score() => {}
                Some(&i) => arcs[i] = arc,
                None => {
                    arc_of.insert((arc.from, arc.to), arcs.len());
                    arcs.push(arc);
                }
            }
        };

        for e in entries {
            let to = node_of[&(e.start_frame, e.end_frame, e.word)];
            if e.start_frame == 0 {
                let lscr = lm.word_score(tree, e.word, LmHistory::START);
                add_arc(LatticeArc::new(0, to, e.ascr, lscr));
                continue;
            }
            for p in table.frame_entries(e.start_frame - 1) {
                let from = node_of[&(p.start_frame, p.end_frame, p.word)];
                let lscr = lm.word_score(tree, e.word, p.history);
                add_arc(LatticeArc::new(from, to, e.ascr, lscr));
            }
        }
        for e in table.frame_entries(final_frame) {
            let from = node_of[&(e.start_frame, e.end_frame, e.word)];
            let lscr = lm.end_score(tree, e.history);
            add_arc(LatticeArc::new(from, end, 0, lscr));
        }

        let lattice = Self::assemble(utterance_id, output.n_frames, nodes, arcs)?;
        tracing::debug!(
            utterance_id,
            n_nodes = lattice.nodes.len(),
            n_arcs = lattice.arcs.len(),
            n_entries = entries.len(),
            "lattice built"
        );
        Ok(lattice)
    }

    /// Builds a lattice from explicit nodes and arcs. Nodes off every
    /// start-to-end path are dropped; surviving nodes and arcs keep their
    /// relative order, so arc ids follow creation order.
    pub fn from_parts(
        utterance_id: &str,
        n_frames: usize,
        nodes: Vec<LatticeNode>,
        arcs: Vec<LatticeArc>,
    ) -> Result<Self, DecoderError> {
        let lattice = Self::assemble(utterance_id, n_frames, nodes, arcs)?;
        lattice.validate()?;
        Ok(lattice)
    }

    fn assemble(
        utterance_id: &str,
        n_frames: usize,
        nodes: Vec<LatticeNode>,
        arcs: Vec<LatticeArc>,
    ) -> Result<Self, DecoderError> {
        let start = sole_node(&nodes, NodeKind::Start)?;
        let end = sole_node(&nodes, NodeKind::End)?;
        if let Some(arc) = arcs
            .iter()
            .find(|a| a.from >= nodes.len() || a.to >= nodes.len())
        {
            return Err(DecoderError::corrupt_lattice(format!(
                "arc {} -> {} refers to a missing node",
                arc.from, arc.to
            )));
        }

        let keep = connected(nodes.len(), &arcs, start, end);
        if !keep[end] {
            return Err(DecoderError::corrupt_lattice(
                "no path connects the start and end nodes",
            ));
        }
        let mut remap = vec![usize::MAX; nodes.len()];
        let mut kept_nodes = Vec::with_capacity(nodes.len());
        for (old, node) in nodes.into_iter().enumerate() {
            if keep[old] {
                remap[old] = kept_nodes.len();
                kept_nodes.push(node);
            }
        }
        let mut kept_arcs: Vec<LatticeArc> = arcs
            .into_iter()
            .filter(|a| keep[a.from] && keep[a.to])
            .map(|mut a| {
                a.from = remap[a.from];
                a.to = remap[a.to];
                a
            })
            .collect();

        let n = kept_nodes.len();
        let mut out_arcs = vec![Vec::new(); n];
        let mut in_arcs = vec![Vec::new(); n];
        for (i, arc) in kept_arcs.iter().enumerate() {
            out_arcs[arc.from].push(i);
            in_arcs[arc.to].push(i);
        }

        Ok(Self {
            utterance_id: utterance_id.to_string(),
            n_frames,
            nodes: kept_nodes,
            arcs: kept_arcs,
            out_arcs,
            in_arcs,
            start: remap[start],
            end: remap[end],
            node_alpha: Vec::new(),
            node_beta: Vec::new(),
            total: None,
        })
    }

    pub fn utterance_id(&self) -> &str {
        &self.utterance_id
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn nodes(&self) -> &[LatticeNode] {
        &self.nodes
    }

    pub fn node(&self, id: usize) -> &LatticeNode {
        &self.nodes[id]
    }

    pub fn arcs(&self) -> &[LatticeArc] {
        &self.arcs
    }

    pub fn arc(&self, id: usize) -> &LatticeArc {
        &self.arcs[id]
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn out_arcs(&self, node: usize) -> &[usize] {
        &self.out_arcs[node]
    }

    pub fn in_arcs(&self, node: usize) -> &[usize] {
        &self.in_arcs[node]
    }

    /// Checks frame adjacency of every arc and the placement of the start
    /// and end nodes. Failures are invariant violations.
    pub fn validate(&self) -> Result<(), DecoderError> {
        if self.nodes[self.start].start_frame != 0 || self.nodes[self.start].end_frame != 0 {
            return Err(DecoderError::invariant("start node is not at frame 0"));
        }
        for (id, node) in self.nodes.iter().enumerate() {
            if node.start_frame > node.end_frame {
                return Err(DecoderError::invariant(format!(
                    "node {id} ends before it starts"
                )));
            }
            if (id != self.start && node.kind == NodeKind::Start)
                || (id != self.end && node.kind == NodeKind::End)
            {
                return Err(DecoderError::invariant(format!(
                    "node {id} is a second {} node",
                    node.kind.label()
                )));
            }
        }
        for arc in &self.arcs {
            if arc.from == self.end || arc.to == self.start {
                return Err(DecoderError::invariant(format!(
                    "arc {} -> {} leaves the end node or enters the start node",
                    arc.from, arc.to
                )));
            }
            let (src, dst) = (&self.nodes[arc.from], &self.nodes[arc.to]);
            let adjacent = if arc.from == self.start {
                dst.start_frame == 0
            } else {
                src.end_frame + 1 == dst.start_frame
            };
            if !adjacent {
                return Err(DecoderError::invariant(format!(
                    "arc {} -> {} joins frames {}..{} and {}..{}",
                    arc.from,
                    arc.to,
                    src.start_frame,
                    src.end_frame,
                    dst.start_frame,
                    dst.end_frame
                )));
            }
        }
        Ok(())
    }

    /// Kahn's algorithm; ready nodes are taken in id order.
    pub fn topological_order(&self) -> Result<Vec<usize>, DecoderError> {
        let mut in_degree: Vec<usize> = self.in_arcs.iter().map(Vec::len).collect();
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&n| in_degree[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(n) = ready.pop_front() {
            order.push(n);
            for &a in &self.out_arcs[n] {
                let to = self.arcs[a].to;
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    ready.push_back(to);
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(DecoderError::invariant(format!(
                "lattice has a cycle through {} nodes",
                self.nodes.len() - order.len()
            )));
        }
        Ok(order)
    }

    /// Keeps only the arcs in `keep` (indexed by arc id), then drops nodes
    /// that no longer lie on a complete path. Posteriors are invalidated.
    pub(crate) fn retain_arcs(&mut self, keep: &[bool]) -> Result<(), DecoderError> {
        let arcs: Vec<LatticeArc> = self
            .arcs
            .iter()
            .zip(keep)
            .filter(|(_, k)| **k)
            .map(|(a, _)| LatticeArc::new(a.from, a.to, a.ascr, a.lscr))
            .collect();
        let nodes = std::mem::take(&mut self.nodes);
        *self = Self::assemble(&self.utterance_id, self.n_frames, nodes, arcs)?;
        Ok(())
    }
}

fn sole_node(nodes: &[LatticeNode], kind: NodeKind) -> Result<usize, DecoderError> {
    let mut found = nodes.iter().enumerate().filter(|(_, n)| n.kind == kind);
    match (found.next(), found.next()) {
        (Some((id, _)), None) => Ok(id),
        (None, _) => Err(DecoderError::corrupt_lattice(format!(
            "lattice has no {} node",
            kind.label()
        ))),
        (Some(_), Some(_)) => Err(DecoderError::corrupt_lattice(format!(
            "lattice has more than one {} node",
            kind.label()
        ))),
    }
}

/// Nodes reachable from `start` that can also reach `end`.
fn connected(n_nodes: usize, arcs: &[LatticeArc], start: usize, end: usize) -> Vec<bool> {
    let mut succ = vec![Vec::new(); n_nodes];
    let mut pred = vec![Vec::new(); n_nodes];
    for arc in arcs {
        succ[arc.from].push(arc.to);
        pred[arc.to].push(arc.from);
    }
    let forward = reach(&succ, start);
    let backward = reach(&pred, end);
    forward
        .into_iter()
        .zip(backward)
        .map(|(f, b)| f && b)
        .collect()
}

fn reach(edges: &[Vec<usize>], from: usize) -> Vec<bool> {
    let mut seen = vec![false; edges.len()];
    let mut stack = vec![from];
    seen[from] = true;
    while let Some(n) = stack.pop() {
        for &next in &edges[n] {
            if !seen[next] {
                seen[next] = true;
                stack.push(next);
            }
        }
    }
    seen
}
