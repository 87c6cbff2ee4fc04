use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PassParams;
use crate::logmath::{add_scores, LogMath, Score, WORST_SCORE};
use crate::pipeline::traits::{LanguageModel, LmScore};
use crate::search::lextree::{LexiconTree, END_WORD, START_WORD};
use crate::types::WordId;

/// The two most recent non-filler words of a path. Fillers never enter it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LmHistory {
    pub real: WordId,
    pub prev_real: Option<WordId>,
}

impl LmHistory {
    pub const START: LmHistory = LmHistory {
        real: START_WORD,
        prev_real: None,
    };

    /// History after `word` has been appended to this one.
    pub fn extend(self, word: WordId, filler: bool) -> Self {
        if filler {
            self
        } else {
            Self {
                real: word,
                prev_real: Some(self.real),
            }
        }
    }
}

/// Weighted LM scores for one pass, cached per utterance.
pub(crate) struct LmScorer {
    lm: Arc<dyn LanguageModel>,
    logmath: LogMath,
    lw: f64,
    wip: Score,
    silence_penalty: Score,
    filler_penalty: Score,
    trigram: bool,
    cache: HashMap<(WordId, WordId, Option<WordId>), Score>,
}

impl LmScorer {
    pub(crate) fn new(
        lm: Arc<dyn LanguageModel>,
        logmath: LogMath,
        params: &PassParams,
        trigram: bool,
    ) -> Self {
        Self {
            lm,
            logmath,
            lw: params.lw,
            wip: params.wip,
            silence_penalty: params.silence_penalty,
            filler_penalty: params.filler_penalty,
            trigram,
            cache: HashMap::new(),
        }
    }

    pub(crate) fn scale(&self, ln_prob: f64) -> Score {
        self.logmath.from_ln(self.lw * ln_prob)
    }

    /// Weighted LM score plus insertion penalty for `word` following `hist`.
    /// Fillers get their fixed penalty instead.
    pub(crate) fn word_score(&mut self, tree: &LexiconTree, word: WordId, hist: LmHistory) -> Score {
        let entry = tree.word(word);
        if entry.filler {
            return if entry.silence {
                self.silence_penalty
            } else {
                self.filler_penalty
            };
        }
        add_scores(self.lm_score(tree, word, hist), self.wip)
    }

    /// Weighted `</s>` score closing a path with history `hist`.
    pub(crate) fn end_score(&mut self, tree: &LexiconTree, hist: LmHistory) -> Score {
        self.lm_score(tree, END_WORD, hist)
    }

    fn lm_score(&mut self, tree: &LexiconTree, word: WordId, hist: LmHistory) -> Score {
        let prev2 = if self.trigram { hist.prev_real } else { None };
        let key = (word, hist.real, prev2);
        if let Some(&score) = self.cache.get(&key) {
            return score;
        }
        let lm_ids = (
            tree.word(word).lm_id,
            tree.word(hist.real).lm_id,
            prev2.and_then(|w| tree.word(w).lm_id),
        );
        let raw: Option<LmScore> = match lm_ids {
            (Some(w), Some(p1), Some(p2)) => Some(self.lm.trigram(w, p1, p2)),
            (Some(w), Some(p1), None) => Some(self.lm.bigram(w, p1)),
            _ => None,
        };
        let score = raw.map_or(WORST_SCORE, |s| self.scale(s.ln_prob));
        self.cache.insert(key, score);
        score
    }
}
