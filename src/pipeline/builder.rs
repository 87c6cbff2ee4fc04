use std::sync::Arc;

use crate::config::DecoderConfig;
use crate::error::DecoderError;
use crate::pipeline::defaults::PassthroughScorer;
use crate::pipeline::runtime::{Decoder, DecoderParts};
use crate::pipeline::traits::{AcousticModel, AcousticScorer, Dictionary, LanguageModel};
use crate::search::lextree::{LexiconTree, LexiconTreeBuilder};

pub struct DecoderBuilder {
    config: DecoderConfig,
    acoustic_model: Option<Box<dyn AcousticModel>>,
    dictionary: Option<Box<dyn Dictionary>>,
    language_model: Option<Arc<dyn LanguageModel>>,
    scorer: Option<Box<dyn AcousticScorer>>,
    lexicon: Option<Arc<LexiconTree>>,
}

impl DecoderBuilder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            acoustic_model: None,
            dictionary: None,
            language_model: None,
            scorer: None,
            lexicon: None,
        }
    }

    pub fn with_acoustic_model(mut self, acoustic_model: Box<dyn AcousticModel>) -> Self {
        self.acoustic_model = Some(acoustic_model);
        self
    }

    pub fn with_dictionary(mut self, dictionary: Box<dyn Dictionary>) -> Self {
        self.dictionary = Some(dictionary);
        self
    }

    pub fn with_language_model(mut self, language_model: Arc<dyn LanguageModel>) -> Self {
        self.language_model = Some(language_model);
        self
    }

    /// Replaces the default scorer, which reads each frame as natural-log
    /// senone likelihoods.
    pub fn with_scorer(mut self, scorer: Box<dyn AcousticScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Reuses a lexicon tree compiled earlier with the same weights. The
    /// acoustic model and dictionary are then not needed.
    pub fn with_lexicon(mut self, lexicon: Arc<LexiconTree>) -> Self {
        self.lexicon = Some(lexicon);
        self
    }

    pub fn build(self) -> Result<Decoder, DecoderError> {
        let params = self.config.resolve()?;
        let language_model = self
            .language_model
            .ok_or_else(|| DecoderError::config("a language model is required"))?;

        let tree = match self.lexicon {
            Some(lexicon) => lexicon,
            None => {
                let acoustic_model = self.acoustic_model.ok_or_else(|| {
                    DecoderError::config("an acoustic model is required to compile the lexicon")
                })?;
                let dictionary = self.dictionary.ok_or_else(|| {
                    DecoderError::config("a dictionary is required to compile the lexicon")
                })?;
                let tree = LexiconTreeBuilder::new(
                    acoustic_model.as_ref(),
                    dictionary.as_ref(),
                    language_model.as_ref(),
                    &params,
                )
                .build()?;
                Arc::new(tree)
            }
        };
        tree.check_params(&params.tree)?;

        let scorer: Arc<dyn AcousticScorer> = match self.scorer {
            Some(scorer) => Arc::from(scorer),
            None => Arc::new(PassthroughScorer::new(tree.n_senones(), params.logmath)),
        };
        if scorer.n_senones() != tree.n_senones() {
            return Err(DecoderError::config(format!(
                "scorer produces {} senone scores but the acoustic model has {}",
                scorer.n_senones(),
                tree.n_senones()
            )));
        }

        tracing::info!(
            n_words = tree.n_words(),
            n_nodes = tree.n_nodes(),
            n_senones = tree.n_senones(),
            fwdflat = params.fwdflat,
            bestpath = params.bestpath,
            "decoder ready"
        );
        Ok(Decoder::from_parts(DecoderParts {
            tree,
            language_model,
            scorer,
            params,
        }))
    }
}
