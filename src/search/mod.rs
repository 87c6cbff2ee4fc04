pub mod bptbl;
pub mod fwdflat;
pub mod fwdtree;
pub mod hmm;
pub mod lextree;
pub mod lmcache;


use crate::error::DecoderError;
use crate::logmath::{add_scores, clamp_score, Score, WORST_SCORE};
use crate::types::PassKind;

use self::bptbl::BackpointerTable;
use self::fwdflat::FlatSearch;
use self::fwdtree::TreeSearch;
use self::lextree::LexiconTree;
use self::lmcache::LmScorer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Idle,
    Started,
    Finished,
}

impl SearchState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Finished => "finished",
        }
    }
}

/// What one `step` did.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStats {
    pub frame: usize,
    pub active_before: usize,
    pub active_after: usize,
    /// Relative to the previous frame's best; see `BackpointerTable::offset`.
    pub best_score: Score,
    /// `best_score + beam`; every retained instance scores at least this.
    pub threshold: Score,
    /// Lowest best-state score among retained instances.
    pub min_retained: Option<Score>,
    pub word_exits: usize,
    pub collapsed: bool,
    pub reseeded: bool,
}

/// The chosen final word exit, with the `</s>` transition applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalExit {
    pub index: usize,
    /// Unnormalised path score, saturated to the score range.
    pub score: Score,
    pub end_lscr: Score,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassOutput {
    pub kind: PassKind,
    pub table: BackpointerTable,
    pub exit: Option<FinalExit>,
    pub n_frames: usize,
    pub collapse: Vec<CollapseRun>,
}

pub trait SearchPass {
    fn kind(&self) -> PassKind;

    fn state(&self) -> SearchState;

    fn start(&mut self) -> Result<(), DecoderError>;

    /// Consumes one frame of senone scores. On error nothing changes.
    fn step(&mut self, senone_scores: &[Score]) -> Result<FrameStats, DecoderError>;

    fn finish(&mut self) -> Result<PassOutput, DecoderError>;
}

/// The two passes behind one interface, composed by the session.
pub enum Pass {
    Tree(TreeSearch),
    Flat(FlatSearch),
}

impl SearchPass for Pass {
    fn kind(&self) -> PassKind {
        match self {
            Self::Tree(p) => p.kind(),
            Self::Flat(p) => p.kind(),
        }
    }

    fn state(&self) -> SearchState {
        match self {
            Self::Tree(p) => p.state(),
            Self::Flat(p) => p.state(),
        }
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        match self {
            Self::Tree(p) => p.start(),
            Self::Flat(p) => p.start(),
        }
    }

    fn step(&mut self, senone_scores: &[Score]) -> Result<FrameStats, DecoderError> {
        match self {
            Self::Tree(p) => p.step(senone_scores),
            Self::Flat(p) => p.step(senone_scores),
        }
    }

    fn finish(&mut self) -> Result<PassOutput, DecoderError> {
        match self {
            Self::Tree(p) => p.finish(),
            Self::Flat(p) => p.finish(),
        }
    }
}

/// A run of consecutive frames in which every hypothesis was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollapseRun {
    pub start_frame: usize,
    pub frames: usize,
    /// Reached the re-seed limit.
    pub sustained: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct CollapseTracker {
    limit: usize,
    current: Option<(usize, usize)>,
    runs: Vec<CollapseRun>,
}

impl CollapseTracker {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            current: None,
            runs: Vec::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
        self.runs.clear();
    }

    /// Records a collapsed frame; true once the run is long enough to
    /// re-seed.
    pub(crate) fn collapsed(&mut self, frame: usize) -> bool {
        let (start, len) = self.current.unwrap_or((frame, 0));
        self.current = Some((start, len + 1));
        len + 1 >= self.limit
    }

    pub(crate) fn recovered(&mut self) {
        if let Some((start_frame, frames)) = self.current.take() {
            let run = CollapseRun {
                start_frame,
                frames,
                sustained: frames >= self.limit,
            };
            if run.sustained {
                tracing::warn!(start_frame, frames, "sustained beam collapse");
            } else {
                tracing::warn!(start_frame, frames, "transient beam collapse absorbed");
            }
            self.runs.push(run);
        }
    }

    pub(crate) fn take_runs(&mut self) -> Vec<CollapseRun> {
        self.recovered();
        std::mem::take(&mut self.runs)
    }
}

/// Picks the utterance-final word among the last frame that has exits,
/// scoring each with its transition to `</s>`. Earlier entries win ties.
pub(crate) fn choose_final_exit(
    table: &BackpointerTable,
    n_frames: usize,
    tree: &LexiconTree,
    lm: &mut LmScorer,
) -> Option<FinalExit> {
    let last = table.last_frame_with_entries(n_frames.checked_sub(1)?)?;
    let mut best: Option<(Score, FinalExit)> = None;
    for index in table.frame_range(last) {
        let entry = &table.entries()[index];
        let end_lscr = lm.end_score(tree, entry.history);
        let score = add_scores(entry.score, end_lscr);
        if score <= WORST_SCORE {
            continue;
        }
        if best.map_or(true, |(b, _)| score > b) {
            let total = entry.score as i64 + table.frame_offset(last) + end_lscr as i64;
            best = Some((
                score,
                FinalExit {
                    index,
                    score: clamp_score(total),
                    end_lscr,
                },
            ));
        }
    }
    best.map(|(_, exit)| exit)
}

/// Stats for a frame in which nothing survived.
pub(crate) fn collapsed_stats(frame: usize, active_before: usize, reseeded: bool) -> FrameStats {
    FrameStats {
        frame,
        active_before,
        active_after: 0,
        best_score: WORST_SCORE,
        threshold: WORST_SCORE,
        min_retained: None,
        word_exits: 0,
        collapsed: true,
        reseeded,
    }
}

/// Moves `score` from one lookahead level to another.
pub(crate) fn shift_lookahead(score: Score, from: Score, to: Score) -> Score {
    if from <= WORST_SCORE || to <= WORST_SCORE {
        return WORST_SCORE;
    }
    add_scores(score, to - from)
}

/// Sorts `(score, key)` candidates best first and returns how many survive a
/// cap of `limit` (0 = unlimited). Ties keep the lower key.
pub(crate) fn histogram_cut<K: Ord + Copy>(candidates: &mut [(Score, K)], limit: usize) -> usize {
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    if limit == 0 {
        candidates.len()
    } else {
        candidates.len().min(limit)
    }
}

#[cfg(test)]
mod collapse_tests {
    use super::*;

    #[test]
    fn short_runs_are_transient() {
        let mut tracker = CollapseTracker::new(3);
        assert!(!tracker.collapsed(4));
        tracker.recovered();
        assert!(!tracker.collapsed(8));
        assert!(!tracker.collapsed(9));
        assert!(tracker.collapsed(10));
        let runs = tracker.take_runs();
        assert_eq!(
            runs,
            vec![
                CollapseRun {
                    start_frame: 4,
                    frames: 1,
                    sustained: false
                },
                CollapseRun {
                    start_frame: 8,
                    frames: 3,
                    sustained: true
                },
            ]
        );
    }

    #[test]
    fn histogram_cut_keeps_best() {
        let mut c = vec![(-5, 2usize), (-1, 7), (-5, 1), (-9, 0)];
        let keep = histogram_cut(&mut c, 2);
        assert_eq!(keep, 2);
        assert_eq!(&c[..keep], &[(-1, 7), (-5, 1)]);
        assert_eq!(histogram_cut(&mut c, 0), 4);
    }
}
