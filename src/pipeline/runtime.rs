use std::collections::HashSet;
use std::sync::Arc;

use crate::config::SearchParams;
use crate::error::DecoderError;
use crate::lattice::{Lattice, LatticePath, NodeKind};
use crate::logmath::{Score, WORST_SCORE};
use crate::pipeline::traits::{AcousticScorer, LanguageModel};
use crate::search::fwdflat::FlatSearch;
use crate::search::fwdtree::TreeSearch;
use crate::search::lextree::LexiconTree;
use crate::search::lmcache::LmScorer;
use crate::search::{CollapseRun, FrameStats, Pass, PassOutput, SearchPass};
use crate::types::{DecodeOutput, DecodeWarning, NBestEntry, PassKind, WordSegment};

/// Upper bound on paths examined while collecting distinct N-best entries.
const MAX_NBEST_PATHS: usize = 10_000;

pub struct Decoder {
    tree: Arc<LexiconTree>,
    language_model: Arc<dyn LanguageModel>,
    scorer: Arc<dyn AcousticScorer>,
    params: SearchParams,
    last: Option<Utterance>,
}

pub(crate) struct DecoderParts {
    pub tree: Arc<LexiconTree>,
    pub language_model: Arc<dyn LanguageModel>,
    pub scorer: Arc<dyn AcousticScorer>,
    pub params: SearchParams,
}

impl Decoder {
    pub(crate) fn from_parts(parts: DecoderParts) -> Self {
        Self {
            tree: parts.tree,
            language_model: parts.language_model,
            scorer: parts.scorer,
            params: parts.params,
            last: None,
        }
    }

    pub fn params(&self) -> &SearchParams {
        &self.params
    }

    pub fn lexicon(&self) -> &Arc<LexiconTree> {
        &self.tree
    }

    /// Begins an utterance. Sessions are independent of each other and of
    /// the decoder, so several may run at once.
    pub fn start_utterance(&self, utterance_id: &str) -> Result<DecoderSession, DecoderError> {
        if utterance_id.trim().is_empty() {
            return Err(DecoderError::invalid_input("utterance id is empty"));
        }
        let mut pass = Pass::Tree(TreeSearch::new(
            Arc::clone(&self.tree),
            Arc::clone(&self.language_model),
            self.params.logmath,
            &self.params.tree,
        ));
        pass.start()?;
        tracing::debug!(utterance_id, "utterance started");
        Ok(DecoderSession {
            utterance_id: utterance_id.to_string(),
            tree: Arc::clone(&self.tree),
            language_model: Arc::clone(&self.language_model),
            scorer: Arc::clone(&self.scorer),
            params: self.params.clone(),
            pass,
            frames: Vec::new(),
        })
    }

    /// Finishes `session` and keeps its result for `get_lattice` and
    /// `get_nbest`. A failed utterance clears the previous one.
    pub fn finish_utterance(&mut self, session: DecoderSession) -> Result<DecodeOutput, DecoderError> {
        self.last = None;
        let utterance = session.finish()?;
        let output = utterance.output.clone();
        self.last = Some(utterance);
        Ok(output)
    }

    /// Decodes a whole utterance of feature frames.
    pub fn decode(&mut self, utterance_id: &str, frames: &[Vec<f32>]) -> Result<DecodeOutput, DecoderError> {
        let mut session = self.start_utterance(utterance_id)?;
        for frame in frames {
            session.process_frame(frame)?;
        }
        self.finish_utterance(session)
    }

    pub fn last_utterance(&self) -> Option<&Utterance> {
        self.last.as_ref()
    }

    /// Text form of the last utterance's lattice.
    pub fn get_lattice(&self) -> Result<String, DecoderError> {
        let utterance = self
            .last
            .as_ref()
            .ok_or_else(|| DecoderError::invalid_state("read a lattice", "idle"))?;
        utterance
            .lattice
            .as_ref()
            .map(Lattice::to_text)
            .ok_or_else(|| DecoderError::NoHypothesis {
                id: utterance.output.utterance_id.clone(),
            })
    }

    pub fn get_nbest(&self, utterance_id: &str, k: usize) -> Result<Vec<NBestEntry>, DecoderError> {
        match &self.last {
            Some(utterance) if utterance.output.utterance_id == utterance_id => utterance.nbest(k),
            _ => Err(DecoderError::UnknownUtterance {
                id: utterance_id.to_string(),
            }),
        }
    }
}

/// One utterance in progress. Frames are buffered so the flat pass can
/// replay them after the tree pass.
pub struct DecoderSession {
    utterance_id: String,
    tree: Arc<LexiconTree>,
    language_model: Arc<dyn LanguageModel>,
    scorer: Arc<dyn AcousticScorer>,
    params: SearchParams,
    pass: Pass,
    frames: Vec<Vec<Score>>,
}

impl DecoderSession {
    pub fn utterance_id(&self) -> &str {
        &self.utterance_id
    }

    pub fn n_frames(&self) -> usize {
        self.frames.len()
    }

    /// Scores one feature frame and advances the search. On error the
    /// session is unchanged and may continue.
    pub fn process_frame(&mut self, features: &[f32]) -> Result<FrameStats, DecoderError> {
        let scores = self.scorer.score_frame(features)?;
        self.process_scores(scores)
    }

    /// Advances the search with precomputed senone scores.
    pub fn process_scores(&mut self, scores: Vec<Score>) -> Result<FrameStats, DecoderError> {
        let stats = self.pass.step(&scores)?;
        self.frames.push(scores);
        Ok(stats)
    }

    pub fn finish(mut self) -> Result<Utterance, DecoderError> {
        if self.frames.is_empty() {
            return Err(DecoderError::invalid_input(format!(
                "utterance '{}' has no frames",
                self.utterance_id
            )));
        }
        let mut warnings = Vec::new();
        let first = self.pass.finish()?;
        collapse_warnings(first.kind, &first.collapse, &mut warnings);

        let output = if self.params.fwdflat && !first.table.is_empty() {
            let second = self.run_flat(&first)?;
            collapse_warnings(second.kind, &second.collapse, &mut warnings);
            if second.exit.is_none() && first.exit.is_some() {
                tracing::warn!(
                    utterance_id = %self.utterance_id,
                    "flat pass found no final word; keeping the tree pass result"
                );
                first
            } else {
                second
            }
        } else {
            first
        };
        output.table.validate()?;

        let n_frames = output.n_frames;
        let Some(exit) = output.exit else {
            warnings.push(DecodeWarning::NoHypothesis);
            tracing::warn!(utterance_id = %self.utterance_id, n_frames, "no word completed");
            return Ok(Utterance {
                output: DecodeOutput {
                    utterance_id: self.utterance_id,
                    text: String::new(),
                    words: Vec::new(),
                    score: WORST_SCORE,
                    n_frames,
                    warnings,
                },
                lattice: None,
                tree: Arc::clone(&self.tree),
            });
        };
        let last_exit_frame = output.table.entries()[exit.index].end_frame;
        if last_exit_frame + 1 < n_frames {
            warnings.push(DecodeWarning::NoFinalWordExit {
                last_exit_frame,
                n_frames,
            });
        }

        let lattice = keep_lattice(&self.utterance_id, self.build_lattice(&output), &mut warnings)?;

        let (words, score) = match (&lattice, self.params.bestpath) {
            (Some(lattice), true) => {
                let path = lattice.best_path()?;
                (self.path_segments(lattice, &path), path.score)
            }
            _ => (self.backtrace_segments(&output, exit.index)?, exit.score),
        };
        let text = self.hypothesis_text(&words);

        tracing::info!(
            utterance_id = %self.utterance_id,
            n_frames,
            pass = ?output.kind,
            n_words = words.len(),
            score,
            n_warnings = warnings.len(),
            "utterance decoded"
        );
        Ok(Utterance {
            output: DecodeOutput {
                utterance_id: self.utterance_id,
                text,
                words,
                score,
                n_frames,
                warnings,
            },
            lattice,
            tree: Arc::clone(&self.tree),
        })
    }

    fn run_flat(&self, first: &PassOutput) -> Result<PassOutput, DecoderError> {
        let mut flat = FlatSearch::new(
            Arc::clone(&self.tree),
            Arc::clone(&self.language_model),
            self.params.logmath,
            &self.params.flat,
            self.params.fwdflat_sf_window,
        );
        flat.prepare(&first.table);
        let mut pass = Pass::Flat(flat);
        pass.start()?;
        for frame in &self.frames {
            pass.step(frame)?;
        }
        pass.finish()
    }

    fn build_lattice(&self, output: &PassOutput) -> Result<Lattice, DecoderError> {
        let (params, trigram) = match output.kind {
            PassKind::Tree => (&self.params.tree, false),
            PassKind::Flat => (&self.params.flat, true),
        };
        let mut lm = LmScorer::new(
            Arc::clone(&self.language_model),
            self.params.logmath,
            params,
            trigram,
        );
        let mut lattice =
            Lattice::from_backpointers(&self.utterance_id, output, &self.tree, &mut lm)?;
        lattice.validate()?;
        lattice.compute_posteriors(&self.params.logmath, self.params.posterior_scale)?;
        if let Some(beam) = self.params.lattice_beam {
            lattice.prune_by_posterior(beam)?;
            lattice.compute_posteriors(&self.params.logmath, self.params.posterior_scale)?;
        }
        Ok(lattice)
    }

    fn backtrace_segments(&self, output: &PassOutput, index: usize) -> Result<Vec<WordSegment>, DecoderError> {
        let entries = output.table.entries();
        Ok(output
            .table
            .backtrace(index)?
            .into_iter()
            .map(|i| {
                let e = &entries[i];
                let word = self.tree.word(e.word);
                WordSegment {
                    word: word.text.clone(),
                    word_id: e.word,
                    start_frame: e.start_frame,
                    end_frame: e.end_frame,
                    ascr: e.ascr,
                    lscr: e.lscr,
                    filler: word.filler,
                }
            })
            .collect())
    }

    fn path_segments(&self, lattice: &Lattice, path: &LatticePath) -> Vec<WordSegment> {
        // arcs[i] enters nodes[i + 1].
        path.arcs
            .iter()
            .map(|&a| lattice.arc(a))
            .filter(|arc| arc.to != lattice.end())
            .map(|arc| {
                let node = lattice.node(arc.to);
                WordSegment {
                    word: node.text.clone(),
                    word_id: node.word,
                    start_frame: node.start_frame,
                    end_frame: node.end_frame,
                    ascr: arc.ascr,
                    lscr: arc.lscr,
                    filler: node.kind == NodeKind::Filler,
                }
            })
            .collect()
    }

    /// Base forms of the non-filler words.
    fn hypothesis_text(&self, words: &[WordSegment]) -> String {
        words
            .iter()
            .filter(|w| !w.filler)
            .map(|w| self.tree.word(w.word_id).base.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Numeric lattice failures leave the backtrace hypothesis with a warning;
/// broken invariants abort the utterance.
fn keep_lattice(
    utterance_id: &str,
    built: Result<Lattice, DecoderError>,
    warnings: &mut Vec<DecodeWarning>,
) -> Result<Option<Lattice>, DecoderError> {
    match built {
        Ok(lattice) => Ok(Some(lattice)),
        Err(err) if err.is_fatal() => {
            tracing::error!(utterance_id, error = %err, "lattice is inconsistent");
            Err(err)
        }
        Err(err) => {
            tracing::warn!(utterance_id, error = %err, "lattice unavailable");
            warnings.push(DecodeWarning::LatticeUnavailable {
                message: err.to_string(),
            });
            Ok(None)
        }
    }
}

fn collapse_warnings(pass: PassKind, runs: &[CollapseRun], warnings: &mut Vec<DecodeWarning>) {
    warnings.extend(runs.iter().map(|run| {
        if run.sustained {
            DecodeWarning::SustainedBeamCollapse {
                pass,
                start_frame: run.start_frame,
                frames: run.frames,
            }
        } else {
            DecodeWarning::TransientBeamCollapse {
                pass,
                start_frame: run.start_frame,
                frames: run.frames,
            }
        }
    }));
}

/// A finished utterance: its hypothesis and, when it could be built, its
/// lattice.
#[derive(Debug, Clone)]
pub struct Utterance {
    output: DecodeOutput,
    lattice: Option<Lattice>,
    tree: Arc<LexiconTree>,
}

impl Utterance {
    pub fn output(&self) -> &DecodeOutput {
        &self.output
    }

    pub fn lattice(&self) -> Option<&Lattice> {
        self.lattice.as_ref()
    }

    pub fn into_output(self) -> DecodeOutput {
        self.output
    }

    /// Up to `k` distinct word sequences, best first. Paths differing only
    /// in fillers, segmentation or pronunciation variants count once.
    pub fn nbest(&self, k: usize) -> Result<Vec<NBestEntry>, DecoderError> {
        let lattice = self.lattice.as_ref().ok_or_else(|| DecoderError::NoHypothesis {
            id: self.output.utterance_id.clone(),
        })?;
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(k);
        for path in lattice.nbest_paths()?.take(MAX_NBEST_PATHS) {
            if entries.len() >= k {
                break;
            }
            let path = path?;
            let words: Vec<String> = path
                .word_nodes(lattice)
                .map(|n| lattice.node(n))
                .filter(|node| node.kind == NodeKind::Word)
                .map(|node| self.tree.word(node.word).base.clone())
                .collect();
            if !seen.insert(words.clone()) {
                continue;
            }
            entries.push(NBestEntry {
                text: words.join(" "),
                words,
                score: path.score,
            });
        }
        Ok(entries)
    }
}
