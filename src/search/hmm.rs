//! Left-to-right phone HMMs and their one-frame Viterbi update.

use crate::error::DecoderError;
use crate::logmath::{add_scores, clamp_score, LogMath, Score, WORST_SCORE};
use crate::types::{PhoneId, SenoneId};

pub const MAX_HMM_STATES: usize = 5;

/// Backpointer index of the word exit a path started from; `None` is the
/// utterance start.
pub type History = Option<usize>;

/// Transition scores of one phone. `tmat[i][j]` moves from emitting state
/// `i` to state `j`; column `n_states` is the exit.
#[derive(Debug, Clone, PartialEq)]
pub struct HmmTopology {
    n_states: usize,
    tmat: [[Score; MAX_HMM_STATES + 1]; MAX_HMM_STATES],
}

impl HmmTopology {
    /// Only self, next and skip-by-one transitions are allowed.
    pub fn from_probabilities(rows: &[Vec<f64>], logmath: &LogMath) -> Result<Self, DecoderError> {
        let n_states = rows.len();
        if n_states == 0 || n_states > MAX_HMM_STATES {
            return Err(DecoderError::config(format!(
                "HMM must have between 1 and {MAX_HMM_STATES} emitting states, got {n_states}"
            )));
        }
        let mut tmat = [[WORST_SCORE; MAX_HMM_STATES + 1]; MAX_HMM_STATES];
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_states + 1 {
                return Err(DecoderError::config(format!(
                    "transition row {i} has {} columns, expected {}",
                    row.len(),
                    n_states + 1
                )));
            }
            for (j, &p) in row.iter().enumerate() {
                if !p.is_finite() || p < 0.0 {
                    return Err(DecoderError::config(format!(
                        "transition {i}->{j} is not a probability: {p}"
                    )));
                }
                if p > 0.0 && (j < i || j > i + 2) {
                    return Err(DecoderError::config(format!(
                        "transition {i}->{j} is not left-to-right"
                    )));
                }
                tmat[i][j] = logmath.log(p);
            }
        }
        let exits = tmat[n_states - 1][n_states] > WORST_SCORE
            || (n_states >= 2 && tmat[n_states - 2][n_states] > WORST_SCORE);
        if !exits {
            return Err(DecoderError::config("HMM has no path to its exit state"));
        }
        Ok(Self { n_states, tmat })
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn transition(&self, from: usize, to: usize) -> Score {
        self.tmat[from][to]
    }
}

/// A phone HMM in context: which topology it follows and which senone
/// scores each of its states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneModel {
    pub phone: PhoneId,
    pub senones: Vec<SenoneId>,
}

/// Live search state of one phone HMM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hmm {
    n_states: u8,
    active: u8,
    score: [Score; MAX_HMM_STATES],
    history: [History; MAX_HMM_STATES],
    entry_score: Score,
    entry_history: History,
    exit_score: Score,
    exit_history: History,
    best: Score,
    frame: Option<usize>,
}

impl Hmm {
    pub fn new(n_states: usize) -> Self {
        Self {
            n_states: n_states.min(MAX_HMM_STATES) as u8,
            active: 0,
            score: [WORST_SCORE; MAX_HMM_STATES],
            history: [None; MAX_HMM_STATES],
            entry_score: WORST_SCORE,
            entry_history: None,
            exit_score: WORST_SCORE,
            exit_history: None,
            best: WORST_SCORE,
            frame: None,
        }
    }

    /// Offers a path into the first state for the next `advance`. Equal
    /// scores replace the pending entry.
    pub fn enter(&mut self, score: Score, history: History) {
        if score > WORST_SCORE && score >= self.entry_score {
            self.entry_score = score;
            self.entry_history = history;
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.n_states as usize);
    }

    pub fn n_states(&self) -> usize {
        self.n_states as usize
    }

    pub fn best_score(&self) -> Score {
        self.best
    }

    pub fn state_score(&self, state: usize) -> Score {
        self.score[state]
    }

    pub fn state_history(&self, state: usize) -> History {
        self.history[state]
    }

    pub fn entry_score(&self) -> Score {
        self.entry_score
    }

    pub fn exit_score(&self) -> Score {
        self.exit_score
    }

    pub fn exit_history(&self) -> History {
        self.exit_history
    }

    pub fn active_mask(&self) -> u8 {
        self.active
    }

    /// Live if any state holds a score or an entry is pending.
    pub fn is_active(&self) -> bool {
        self.active != 0 || self.entry_score > WORST_SCORE
    }

    pub fn frame(&self) -> Option<usize> {
        self.frame
    }

    /// Subtracts `by` from every live score, pending entry and exit.
    pub fn rebase(&mut self, by: Score) {
        for score in &mut self.score {
            *score = rebased(*score, by);
        }
        self.entry_score = rebased(self.entry_score, by);
        self.exit_score = rebased(self.exit_score, by);
        self.best = rebased(self.best, by);
    }
}

fn rebased(score: Score, by: Score) -> Score {
    if score <= WORST_SCORE {
        return WORST_SCORE;
    }
    clamp_score(score as i64 - by as i64).max(WORST_SCORE + 1)
}

/// One frame of the Viterbi recurrence. Returns the best state score and the
/// updated copy; `hmm` itself is untouched so callers can discard the frame.
pub fn advance(
    hmm: &Hmm,
    topo: &HmmTopology,
    senones: &[SenoneId],
    scores: &[Score],
    frame: usize,
) -> (Score, Hmm) {
    let n = hmm.n_states();
    let mut next = *hmm;
    let mut best = WORST_SCORE;
    let mut active = 0u8;

    for i in 0..n {
        let mut score = add_scores(hmm.score[i], topo.tmat[i][i]);
        let mut history = hmm.history[i];
        if i >= 1 {
            let from_prev = add_scores(hmm.score[i - 1], topo.tmat[i - 1][i]);
            if from_prev > score {
                score = from_prev;
                history = hmm.history[i - 1];
            }
        }
        if i >= 2 {
            let from_skip = add_scores(hmm.score[i - 2], topo.tmat[i - 2][i]);
            if from_skip > score {
                score = from_skip;
                history = hmm.history[i - 2];
            }
        }
        if i == 0 && hmm.entry_score >= score && hmm.entry_score > WORST_SCORE {
            score = hmm.entry_score;
            history = hmm.entry_history;
        }

        let obs = senones
            .get(i)
            .and_then(|&s| scores.get(s))
            .copied()
            .unwrap_or(WORST_SCORE);
        score = add_scores(score, obs);

        next.score[i] = score;
        next.history[i] = if score > WORST_SCORE { history } else { None };
        if score > WORST_SCORE {
            active |= 1 << i;
        }
        if score > best {
            best = score;
        }
    }

    let last = n - 1;
    let mut exit = add_scores(next.score[last], topo.tmat[last][n]);
    let mut exit_history = next.history[last];
    if n >= 2 {
        let skip = add_scores(next.score[n - 2], topo.tmat[n - 2][n]);
        if skip > exit {
            exit = skip;
            exit_history = next.history[n - 2];
        }
    }

    next.exit_score = exit;
    next.exit_history = if exit > WORST_SCORE { exit_history } else { None };
    next.entry_score = WORST_SCORE;
    next.entry_history = None;
    next.best = best;
    next.active = active;
    next.frame = Some(frame);
    (best, next)
}

/// Slot arena for HMM instances with a free list.
#[derive(Debug, Default)]
pub struct HmmPool {
    slots: Vec<Hmm>,
    free: Vec<usize>,
    live: usize,
}

impl HmmPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, n_states: usize) -> usize {
        self.live += 1;
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Hmm::new(n_states);
                slot
            }
            None => {
                self.slots.push(Hmm::new(n_states));
                self.slots.len() - 1
            }
        }
    }

    pub fn release(&mut self, slot: usize) {
        if let Some(hmm) = self.slots.get_mut(slot) {
            hmm.clear();
            self.free.push(slot);
            self.live = self.live.saturating_sub(1);
        }
    }

    pub fn get(&self, slot: usize) -> &Hmm {
        &self.slots[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Hmm {
        &mut self.slots[slot]
    }

    pub fn set(&mut self, slot: usize, hmm: Hmm) {
        self.slots[slot] = hmm;
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Rebases every instance; released slots hold no scores and stay empty.
    pub fn rebase_all(&mut self, by: Score) {
        for hmm in &mut self.slots {
            hmm.rebase(by);
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
