use serde::Serialize;

use crate::logmath::Score;

/// Index of a word in the compiled lexicon (pronunciation variants are
/// distinct words).
pub type WordId = usize;
pub type PhoneId = usize;
pub type SenoneId = usize;
/// Index of a word in the language model's vocabulary.
pub type LmWordId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Tree,
    Flat,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WordSegment {
    pub word: String,
    pub word_id: WordId,
    /// Frame interval is [start_frame, end_frame], both inclusive.
    pub start_frame: usize,
    /// Frame interval is [start_frame, end_frame], both inclusive.
    pub end_frame: usize,
    pub ascr: Score,
    pub lscr: Score,
    /// Fillers appear in segments but not in the hypothesis text.
    pub filler: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodeWarning {
    /// Fewer than `max_collapse_frames` consecutive frames lost every
    /// hypothesis; the frames were absorbed by the words in progress.
    TransientBeamCollapse {
        pass: PassKind,
        start_frame: usize,
        frames: usize,
    },
    /// The search collapsed long enough to be re-seeded.
    SustainedBeamCollapse {
        pass: PassKind,
        start_frame: usize,
        frames: usize,
    },
    /// No word ended on the final frame; the hypothesis ends earlier.
    NoFinalWordExit {
        last_exit_frame: usize,
        n_frames: usize,
    },
    /// No word completed anywhere in the utterance.
    NoHypothesis,
    /// Lattice posteriors failed; best path and N-best are unavailable.
    LatticeUnavailable { message: String },
}

impl DecodeWarning {
    pub fn is_collapse(&self) -> bool {
        matches!(
            self,
            Self::TransientBeamCollapse { .. } | Self::SustainedBeamCollapse { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeOutput {
    pub utterance_id: String,
    pub text: String,
    pub words: Vec<WordSegment>,
    pub score: Score,
    pub n_frames: usize,
    pub warnings: Vec<DecodeWarning>,
}

impl DecodeOutput {
    /// True when the result should be treated with suspicion.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NBestEntry {
    pub text: String,
    pub words: Vec<String>,
    pub score: Score,
}
