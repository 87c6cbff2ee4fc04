use crate::error::DecoderError;
use crate::logmath::Score;
use crate::types::{LmWordId, PhoneId, SenoneId};

/// Turns one feature frame into per-senone log-likelihoods.
pub trait AcousticScorer: Send + Sync {
    fn n_senones(&self) -> usize;

    /// Must be deterministic for deterministic input.
    fn score_frame(&self, features: &[f32]) -> Result<Vec<Score>, DecoderError>;
}

/// Phone inventory and HMM structure of the acoustic model.
pub trait AcousticModel: Send + Sync {
    fn n_phones(&self) -> usize;

    fn n_senones(&self) -> usize;

    fn phone_id(&self, name: &str) -> Option<PhoneId>;

    fn phone_name(&self, phone: PhoneId) -> &str;

    fn silence_phone(&self) -> PhoneId;

    /// Transition probabilities for `phone`: one row per emitting state,
    /// `n_states + 1` columns, the last column being the non-emitting exit.
    fn transitions(&self, phone: PhoneId) -> &[Vec<f64>];

    /// Senones for each emitting state of `phone` in the given context.
    /// `None` stands for a word boundary or an unknown neighbour.
    fn senone_sequence(
        &self,
        phone: PhoneId,
        left: Option<PhoneId>,
        right: Option<PhoneId>,
    ) -> Vec<SenoneId>;
}

/// Natural-log probability returned by a language model lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmScore {
    pub ln_prob: f64,
    /// Order of the n-gram that matched after backing off.
    pub order: usize,
    /// Diagnostic only; the search never branches on it.
    pub backoff: bool,
}

pub trait LanguageModel: Send + Sync {
    fn vocabulary(&self) -> &[String];

    fn word_id(&self, word: &str) -> Option<LmWordId>;

    fn unigram(&self, word: LmWordId) -> LmScore;

    fn bigram(&self, word: LmWordId, prev: LmWordId) -> LmScore;

    fn trigram(&self, word: LmWordId, prev: LmWordId, prev2: LmWordId) -> LmScore;
}

/// Pronunciations by word text, consulted only while compiling the lexicon.
pub trait Dictionary: Send + Sync {
    /// Each pronunciation is a sequence of phone names.
    fn pronunciations(&self, word: &str) -> Vec<Vec<String>>;

    /// Noise and silence words scored by penalties rather than the LM.
    fn filler_words(&self) -> Vec<String>;
}
