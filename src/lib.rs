pub mod config;
pub mod error;
pub mod lattice;
pub mod logmath;
pub mod pipeline;
pub mod search;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::{DecoderConfig, SearchParams};
pub use error::DecoderError;
pub use lattice::{Lattice, LatticePath};
pub use logmath::{LogMath, Score};
pub use pipeline::builder::DecoderBuilder;
pub use pipeline::defaults::{
    ContextIndependentModel, NgramModel, NgramSpec, PassthroughScorer, PhoneSetSpec,
    PronunciationDict,
};
pub use pipeline::runtime::{Decoder, DecoderSession, Utterance};
pub use pipeline::traits::{AcousticModel, AcousticScorer, Dictionary, LanguageModel};
pub use types::{DecodeOutput, DecodeWarning, NBestEntry, WordSegment};
