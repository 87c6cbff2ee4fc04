//! Second pass: rescoring the first pass's word candidates with one linear
//! HMM chain per word and full trigram context at word entry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::PassParams;
use crate::error::DecoderError;
use crate::logmath::{add_scores, LogMath, Score, WORST_SCORE};
use crate::pipeline::traits::LanguageModel;
use crate::search::bptbl::{acoustic_share, BackpointerEntry, BackpointerTable};
use crate::search::hmm::{advance, History, Hmm, HmmPool};
use crate::search::lextree::LexiconTree;
use crate::search::lmcache::{LmHistory, LmScorer};
use crate::search::{
    choose_final_exit, collapsed_stats, histogram_cut, CollapseTracker, FrameStats, PassOutput,
    SearchPass, SearchState,
};
use crate::types::{PassKind, WordId};

/// A word and the position of a phone within it.
type ChainKey = (WordId, usize);

struct Evaluated {
    key: ChainKey,
    slot: usize,
    best: Score,
    hmm: Hmm,
}

pub struct FlatSearch {
    tree: Arc<LexiconTree>,
    params: PassParams,
    lm: LmScorer,
    state: SearchState,
    frame: usize,
    sf_window: usize,
    candidates: Vec<WordId>,
    /// First-pass start frames per non-filler candidate.
    start_frames: HashMap<WordId, Vec<usize>>,
    pool: HmmPool,
    slots: BTreeMap<ChainKey, usize>,
    table: BackpointerTable,
    collapse: CollapseTracker,
}

impl FlatSearch {
    pub fn new(
        tree: Arc<LexiconTree>,
        language_model: Arc<dyn LanguageModel>,
        logmath: LogMath,
        params: &PassParams,
        sf_window: usize,
    ) -> Self {
        Self {
            lm: LmScorer::new(language_model, logmath, params, true),
            params: params.clone(),
            state: SearchState::Idle,
            frame: 0,
            sf_window,
            candidates: Vec::new(),
            start_frames: HashMap::new(),
            pool: HmmPool::new(),
            slots: BTreeMap::new(),
            table: BackpointerTable::new(),
            collapse: CollapseTracker::new(params.max_collapse_frames),
            tree,
        }
    }

    /// Restricts the vocabulary to the words the first pass completed, each
    /// near the frames where it started there. Fillers are always allowed.
    pub fn prepare(&mut self, first_pass: &BackpointerTable) {
        let mut start_frames: HashMap<WordId, BTreeSet<usize>> = HashMap::new();
        for entry in first_pass.entries() {
            start_frames
                .entry(entry.word)
                .or_default()
                .insert(entry.start_frame);
        }
        let mut candidates: BTreeSet<WordId> = start_frames.keys().copied().collect();
        candidates.extend(filler_words(&self.tree));
        self.candidates = candidates.into_iter().collect();
        self.start_frames = start_frames
            .into_iter()
            .filter(|(w, _)| !self.tree.word(*w).filler)
            .map(|(w, frames)| (w, frames.into_iter().collect()))
            .collect();
        tracing::debug!(
            n_candidates = self.candidates.len(),
            window = self.sf_window,
            "flat search vocabulary prepared"
        );
    }

    pub fn candidates(&self) -> &[WordId] {
        &self.candidates
    }

    pub fn table(&self) -> &BackpointerTable {
        &self.table
    }

    pub fn n_active(&self) -> usize {
        self.slots.len()
    }

    /// Whether `word` may begin on `frame`.
    pub fn allowed(&self, word: WordId, frame: usize) -> bool {
        if self.tree.word(word).filler {
            return true;
        }
        self.start_frames
            .get(&word)
            .is_some_and(|frames| frames.iter().any(|&sf| sf.abs_diff(frame) <= self.sf_window))
    }

    fn enter(&mut self, key: ChainKey, score: Score, history: History) {
        let slot = match self.slots.get(&key) {
            Some(&slot) => slot,
            None => {
                let phone = self.tree.word(key.0).chain[key.1].phone;
                let slot = self.pool.alloc(self.tree.topology(phone).n_states());
                self.slots.insert(key, slot);
                slot
            }
        };
        self.pool.get_mut(slot).enter(score, history);
    }

    /// Enters the first phone of each word allowed on `frame` from the best
    /// predecessor among `exits`, with the full LM score of that transition.
    fn enter_words(&mut self, frame: usize, exits: &[usize], ignore_window: bool) {
        let tree = Arc::clone(&self.tree);
        for i in 0..self.candidates.len() {
            let w = self.candidates[i];
            if !ignore_window && !self.allowed(w, frame) {
                continue;
            }
            let mut best: Option<(Score, usize)> = None;
            for &p in exits {
                let pred = self.table.entries()[p];
                let pred_score = self.table.rebased_score(p).unwrap_or(WORST_SCORE);
                let lscr = self.lm.word_score(&tree, w, pred.history);
                let score = add_scores(add_scores(pred_score, lscr), self.params.pip);
                if score > WORST_SCORE && best.map_or(true, |(b, _)| score >= b) {
                    best = Some((score, p));
                }
            }
            if let Some((score, p)) = best {
                self.enter((w, 0), score, Some(p));
            }
        }
    }

    fn enter_from_start(&mut self, ignore_window: bool) {
        let tree = Arc::clone(&self.tree);
        for i in 0..self.candidates.len() {
            let w = self.candidates[i];
            if !ignore_window && !self.allowed(w, 0) {
                continue;
            }
            let lscr = self.lm.word_score(&tree, w, LmHistory::START);
            let score = add_scores(lscr, self.params.pip);
            if score > WORST_SCORE {
                self.enter((w, 0), score, None);
            }
        }
    }

    fn release_all(&mut self) {
        self.pool.clear();
        self.slots.clear();
    }

    fn reseed(&mut self, frame: usize) {
        self.release_all();
        let recent = frame
            .checked_sub(1)
            .and_then(|f| self.table.last_frame_with_entries(f))
            .and_then(|f| self.table.best_in_frame(f));
        match recent {
            Some(index) => {
                tracing::warn!(
                    frame,
                    from_frame = self.table.entries()[index].end_frame,
                    "re-seeding flat search after sustained collapse"
                );
                self.enter_words(frame + 1, &[index], true);
            }
            None => {
                tracing::warn!(frame, "re-seeding flat search from utterance start");
                self.enter_from_start(true);
            }
        }
    }

    fn collect_exits(
        &mut self,
        evaluated: &[Evaluated],
        retained: &[usize],
        word_threshold: Score,
        frame: usize,
    ) -> Result<BTreeMap<WordId, BackpointerEntry>, DecoderError> {
        let tree = Arc::clone(&self.tree);
        let mut exits = BTreeMap::new();
        for &i in retained {
            let e = &evaluated[i];
            let (w, pos) = e.key;
            let word = tree.word(w);
            let exit = e.hmm.exit_score();
            if pos + 1 != word.chain.len() || exit <= WORST_SCORE || exit < word_threshold {
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
            // The LM score was paid on entry; recover it for the record.
            let lscr = self.lm.word_score(&tree, w, history);
            let offset = self.table.offset();
            let entry = BackpointerEntry {
                word: w,
                start_frame,
                end_frame: frame,
                score: exit,
                ascr: acoustic_share(exit as i64 + offset, pred_score, lscr),
                lscr,
                prev: e.hmm.exit_history(),
                history: history.extend(w, word.filler),
                last_phone: word.last_phone().unwrap_or(0),
            };
            exits.insert(w, entry);
        }

        let mut ranked: Vec<(Score, WordId)> = exits
            .values()
            .map(|e: &BackpointerEntry| (e.score, e.word))
            .collect();
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

impl SearchPass for FlatSearch {
    fn kind(&self) -> PassKind {
        PassKind::Flat
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
        self.enter_from_start(false);
        self.state = SearchState::Started;
        tracing::debug!(entered = self.slots.len(), "flat search started");
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

        let mut evaluated = Vec::with_capacity(self.slots.len());
        let mut best = WORST_SCORE;
        for (&key, &slot) in &self.slots {
            let model = &tree.word(key.0).chain[key.1];
            let (score, hmm) = advance(
                self.pool.get(slot),
                tree.topology(model.phone),
                &model.senones,
                senone_scores,
                frame,
            );
            best = best.max(score);
            evaluated.push(Evaluated {
                key,
                slot,
                best: score,
                hmm,
            });
        }
        let active_before = evaluated.len();
        if best <= WORST_SCORE {
            let reseeded = self.collapse.collapsed(frame);
            if reseeded {
                self.reseed(frame);
            }
            self.table.close_frame();
            self.frame += 1;
            return Ok(collapsed_stats(frame, active_before, reseeded));
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
                self.pool.release(e.slot);
                self.slots.remove(&e.key);
            }
        }

        let phone_threshold = add_scores(best, self.params.pbeam);
        for &i in &retained {
            let e = &evaluated[i];
            let (w, pos) = e.key;
            let exit = e.hmm.exit_score();
            if pos + 1 >= tree.word(w).chain.len() || exit <= WORST_SCORE || exit < phone_threshold
            {
                continue;
            }
            self.enter(
                (w, pos + 1),
                add_scores(exit, self.params.pip),
                e.hmm.exit_history(),
            );
        }

        let word_exits = exits.len();
        let mut pushed = Vec::with_capacity(word_exits);
        for entry in exits.into_values() {
            pushed.push(self.table.push(entry)?);
        }
        if !pushed.is_empty() {
            self.enter_words(frame + 1, &pushed, false);
        }

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
            "flat search finished"
        );
        Ok(PassOutput {
            kind: PassKind::Flat,
            table: std::mem::take(&mut self.table),
            exit,
            n_frames,
            collapse,
        })
    }
}

fn filler_words(tree: &LexiconTree) -> impl Iterator<Item = WordId> + '_ {
    tree.words()
        .iter()
        .enumerate()
        .filter(|(_, w)| w.filler)
        .map(|(id, _)| id)
}
