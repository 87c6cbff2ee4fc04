//! First pass: frame-synchronous beam search over the lexicon tree.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::PassParams;
use crate::error::DecoderError;
use crate::logmath::{add_scores, LogMath, Score, WORST_SCORE};
use crate::pipeline::traits::LanguageModel;
use crate::search::bptbl::{acoustic_share, BackpointerEntry, BackpointerTable};
use crate::search::hmm::{advance, History, Hmm, HmmPool};
use crate::search::lextree::{LexiconTree, NodeId};
use crate::search::lmcache::{LmHistory, LmScorer};
use crate::search::{
    choose_final_exit, collapsed_stats, histogram_cut, shift_lookahead, CollapseTracker,
    FrameStats, PassOutput, SearchPass, SearchState,
};
use crate::types::{PassKind, PhoneId, WordId};

struct Evaluated {
    node: NodeId,
    slot: usize,
    best: Score,
    hmm: Hmm,
}

pub struct TreeSearch {
    tree: Arc<LexiconTree>,
    params: PassParams,
    lm: LmScorer,
    state: SearchState,
    frame: usize,
    pool: HmmPool,
    /// Pool slot of each node's instance, if it has one.
    slots: Vec<Option<usize>>,
    active: BTreeSet<NodeId>,
    table: BackpointerTable,
    collapse: CollapseTracker,
}

impl TreeSearch {
    pub fn new(
        tree: Arc<LexiconTree>,
        language_model: Arc<dyn LanguageModel>,
        logmath: LogMath,
        params: &PassParams,
    ) -> Self {
        let n_nodes = tree.n_nodes();
        Self {
            lm: LmScorer::new(language_model, logmath, params, false),
            params: params.clone(),
            state: SearchState::Idle,
            frame: 0,
            pool: HmmPool::new(),
            slots: vec![None; n_nodes],
            active: BTreeSet::new(),
            table: BackpointerTable::new(),
            collapse: CollapseTracker::new(params.max_collapse_frames),
            tree,
        }
    }

    /// Index of the next frame `step` will consume.
    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn table(&self) -> &BackpointerTable {
        &self.table
    }

    pub fn n_active(&self) -> usize {
        self.active.len()
    }

    /// Current best state score of every live instance, relative to the
    /// best score of the last frame that kept anything.
    pub fn active_scores(&self) -> Vec<(NodeId, Score)> {
        self.active
            .iter()
            .filter_map(|&n| self.slots[n].map(|s| (n, self.pool.get(s).best_score())))
            .collect()
    }

    fn enter_node(&mut self, node: NodeId, score: Score, history: History) {
        let slot = match self.slots[node] {
            Some(slot) => slot,
            None => {
                let n_states = self.tree.topology(self.tree.node(node).phone()).n_states();
                let slot = self.pool.alloc(n_states);
                self.slots[node] = Some(slot);
                self.active.insert(node);
                slot
            }
        };
        self.pool.get_mut(slot).enter(score, history);
    }

    /// Enters every root of a left context, lifting the path score to each
    /// root's lookahead.
    fn enter_roots(&mut self, left: Option<PhoneId>, score: Score, history: History) {
        let tree = Arc::clone(&self.tree);
        let base = add_scores(score, self.params.pip);
        for &root in tree.roots(left) {
            let entry = add_scores(base, tree.node(root).lookahead);
            self.enter_node(root, entry, history);
        }
    }

    fn release_node(&mut self, node: NodeId) {
        if let Some(slot) = self.slots[node].take() {
            self.pool.release(slot);
        }
        self.active.remove(&node);
    }

    fn release_all(&mut self) {
        self.pool.clear();
        self.slots.iter_mut().for_each(|s| *s = None);
        self.active.clear();
    }

    /// Restarts the search from the most recent word exit, or from the
    /// utterance start when there is none.
    fn reseed(&mut self, frame: usize) {
        self.release_all();
        let recent = frame
            .checked_sub(1)
            .and_then(|f| self.table.last_frame_with_entries(f))
            .and_then(|f| self.table.best_in_frame(f));
        match recent {
            Some(index) => {
                let entry = self.table.entries()[index];
                tracing::warn!(
                    frame,
                    word = %self.tree.word(entry.word).text,
                    from_frame = entry.end_frame,
                    "re-seeding tree search after sustained collapse"
                );
                let score = self.table.rebased_score(index).unwrap_or(WORST_SCORE);
                self.enter_roots(Some(entry.last_phone), score, Some(index));
            }
            None => {
                tracing::warn!(frame, "re-seeding tree search from utterance start");
                self.enter_roots(None, 0, None);
            }
        }
    }

    fn absorb_collapse(&mut self, frame: usize, active_before: usize) -> FrameStats {
        let reseeded = self.collapse.collapsed(frame);
        if reseeded {
            self.reseed(frame);
        }
        self.table.close_frame();
        self.frame += 1;
        collapsed_stats(frame, active_before, reseeded)
    }

    /// Word exits of the retained instances, at most one per word.
    fn collect_exits(
        &mut self,
        evaluated: &[Evaluated],
        retained: &[usize],
        word_threshold: Score,
        frame: usize,
    ) -> Result<BTreeMap<WordId, BackpointerEntry>, DecoderError> {
        let tree = Arc::clone(&self.tree);
        let mut exits: BTreeMap<WordId, BackpointerEntry> = BTreeMap::new();
        for &i in retained {
            let e = &evaluated[i];
            let node = tree.node(e.node);
            let exit = e.hmm.exit_score();
            if node.words.is_empty() || exit <= WORST_SCORE || exit < word_threshold {
                continue;
            }
            let (pred_score, start_frame, history) = match e.hmm.exit_history() {
                Some(p) => {
                    let pred = self.table.get(p).ok_or_else(|| {
                        DecoderError::invariant(format!("history points at missing exit {p}"))
                    })?;
                    let pred_score = pred.score as i64 + self.table.frame_offset(pred.end_frame);
                    (pred_score, pred.end_frame + 1, pred.history)
                }
                None => (0, 0, LmHistory::START),
            };
            // Trade the lookahead carried so far for the exact LM score.
            let acoustic = shift_lookahead(exit, node.lookahead, 0);
            let offset = self.table.offset();
            for &w in &node.words {
                let lscr = self.lm.word_score(&tree, w, history);
                let score = add_scores(acoustic, lscr);
                if score <= WORST_SCORE {
                    continue;
                }
                let word = tree.word(w);
                let entry = BackpointerEntry {
                    word: w,
                    start_frame,
                    end_frame: frame,
                    score,
                    ascr: acoustic_share(score as i64 + offset, pred_score, lscr),
                    lscr,
                    prev: e.hmm.exit_history(),
                    history: history.extend(w, word.filler),
                    last_phone: node.phone(),
                };
                if exits.get(&w).map_or(true, |existing| score >= existing.score) {
                    exits.insert(w, entry);
                }
            }
        }

        let mut ranked: Vec<(Score, WordId)> = exits.values().map(|e| (e.score, e.word)).collect();
        let keep = histogram_cut(&mut ranked, self.params.max_words_per_frame);
        if keep < ranked.len() {
            let kept: BTreeSet<WordId> = ranked[..keep].iter().map(|&(_, w)| w).collect();
            exits.retain(|w, _| kept.contains(w));
        }
        for entry in exits.values() {
            self.table.check(entry)?;
        }
        Ok(exits)
    }
}

impl SearchPass for TreeSearch {
    fn kind(&self) -> PassKind {
        PassKind::Tree
    }

    fn state(&self) -> SearchState {
        self.state
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        if self.state == SearchState::Started {
            return Err(DecoderError::invalid_state("start", self.state.label()));
        }
        self.release_all();
        self.table.clear();
        self.collapse.reset();
        self.frame = 0;
        self.enter_roots(None, 0, None);
        self.state = SearchState::Started;
        tracing::debug!(roots = self.active.len(), "tree search started");
        Ok(())
    }

    fn step(&mut self, senone_scores: &[Score]) -> Result<FrameStats, DecoderError> {
        if self.state != SearchState::Started {
            return Err(DecoderError::invalid_state("step", self.state.label()));
        }
        if senone_scores.len() != self.tree.n_senones() {
            return Err(DecoderError::invalid_input(format!(
                "expected {} senone scores, got {}",
                self.tree.n_senones(),
                senone_scores.len()
            )));
        }
        let frame = self.frame;
        let tree = Arc::clone(&self.tree);

        let mut evaluated = Vec::with_capacity(self.active.len());
        let mut best = WORST_SCORE;
        for &node_id in &self.active {
            let slot = self.slots[node_id].ok_or_else(|| {
                DecoderError::invariant(format!("active node {node_id} has no instance"))
            })?;
            let node = tree.node(node_id);
            let (score, hmm) = advance(
                self.pool.get(slot),
                tree.topology(node.phone()),
                &node.model.senones,
                senone_scores,
                frame,
            );
            best = best.max(score);
            evaluated.push(Evaluated {
                node: node_id,
                slot,
                best: score,
                hmm,
            });
        }
        let active_before = evaluated.len();
        if best <= WORST_SCORE {
            return Ok(self.absorb_collapse(frame, active_before));
        }

        let threshold = add_scores(best, self.params.beam);
        let mut survivors: Vec<(Score, usize)> = evaluated
            .iter()
            .enumerate()
            .filter(|(_, e)| e.best >= threshold)
            .map(|(i, e)| (e.best, i))
            .collect();
        let keep = histogram_cut(&mut survivors, self.params.max_hmm_per_frame);
        let mut retained: Vec<usize> = survivors[..keep].iter().map(|&(_, i)| i).collect();
        retained.sort_unstable();

        let exits = self.collect_exits(
            &evaluated,
            &retained,
            add_scores(best, self.params.wbeam),
            frame,
        )?;

        // Nothing below fails; the frame is committed from here on.
        let mut kept = vec![false; evaluated.len()];
        for &i in &retained {
            kept[i] = true;
        }
        let mut min_retained: Option<Score> = None;
        for (i, e) in evaluated.iter().enumerate() {
            if kept[i] {
                self.pool.set(e.slot, e.hmm);
                min_retained = Some(min_retained.map_or(e.best, |m| m.min(e.best)));
            } else {
                self.release_node(e.node);
            }
        }

        let phone_threshold = add_scores(best, self.params.pbeam);
        for &i in &retained {
            let e = &evaluated[i];
            let exit = e.hmm.exit_score();
            if exit <= WORST_SCORE || exit < phone_threshold {
                continue;
            }
            let node = tree.node(e.node);
            let base = add_scores(exit, self.params.pip);
            for &child in &node.children {
                let score = shift_lookahead(base, node.lookahead, tree.node(child).lookahead);
                self.enter_node(child, score, e.hmm.exit_history());
            }
        }

        let word_exits = exits.len();
        let mut best_by_context: BTreeMap<PhoneId, usize> = BTreeMap::new();
        for entry in exits.into_values() {
            let index = self.table.push(entry)?;
            let replace = best_by_context
                .get(&entry.last_phone)
                .map_or(true, |&current| entry.score >= self.table.entries()[current].score);
            if replace {
                best_by_context.insert(entry.last_phone, index);
            }
        }
        for (phone, index) in best_by_context {
            let score = self.table.entries()[index].score;
            self.enter_roots(Some(phone), score, Some(index));
        }

        // Keep live scores near zero so long utterances cannot reach WORST_SCORE.
        self.pool.rebase_all(best);
        self.table.renormalize(best);
        self.table.close_frame();
        self.collapse.recovered();
        self.frame += 1;

        Ok(FrameStats {
            frame,
            active_before,
            active_after: retained.len(),
            best_score: best,
            threshold,
            min_retained,
            word_exits,
            collapsed: false,
            reseeded: false,
        })
    }

    fn finish(&mut self) -> Result<PassOutput, DecoderError> {
        if self.state != SearchState::Started {
            return Err(DecoderError::invalid_state("finish", self.state.label()));
        }
        let n_frames = self.frame;
        let tree = Arc::clone(&self.tree);
        let exit = choose_final_exit(&self.table, n_frames, &tree, &mut self.lm);
        self.release_all();
        self.state = SearchState::Finished;
        let collapse = self.collapse.take_runs();
        tracing::debug!(
            n_frames,
            n_exits = self.table.len(),
            final_score = ?exit.map(|e| e.score),
            "tree search finished"
        );
        Ok(PassOutput {
            kind: PassKind::Tree,
            table: std::mem::take(&mut self.table),
            exit,
            n_frames,
            collapse,
        })
    }
}
