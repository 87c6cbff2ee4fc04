use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Deserialize;

use crate::error::DecoderError;
use crate::logmath::{LogMath, Score};
use crate::pipeline::traits::{AcousticModel, AcousticScorer, Dictionary, LanguageModel, LmScore};
use crate::search::hmm::MAX_HMM_STATES;
use crate::search::lextree::base_text;
use crate::types::{LmWordId, PhoneId, SenoneId};

/// Treats each feature frame as a ready-made vector of per-senone natural-log
/// likelihoods.
pub struct PassthroughScorer {
    n_senones: usize,
    logmath: LogMath,
}

impl PassthroughScorer {
    pub fn new(n_senones: usize, logmath: LogMath) -> Self {
        Self { n_senones, logmath }
    }
}

impl AcousticScorer for PassthroughScorer {
    fn n_senones(&self) -> usize {
        self.n_senones
    }

    fn score_frame(&self, features: &[f32]) -> Result<Vec<Score>, DecoderError> {
        if features.len() != self.n_senones {
            return Err(DecoderError::invalid_input(format!(
                "frame has {} values, expected {} senone scores",
                features.len(),
                self.n_senones
            )));
        }
        if let Some(pos) = features.iter().position(|v| v.is_nan()) {
            return Err(DecoderError::invalid_input(format!(
                "senone score {pos} is NaN"
            )));
        }
        Ok(features
            .iter()
            .map(|&v| self.logmath.from_ln(v as f64))
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhoneSetSpec {
    pub phones: Vec<String>,
    #[serde(default = "default_n_states")]
    pub n_states: usize,
    #[serde(default = "default_self_loop")]
    pub self_loop: f64,
    #[serde(default)]
    pub skip: f64,
    pub silence: String,
}

fn default_n_states() -> usize {
    3
}
fn default_self_loop() -> f64 {
    0.5
}

/// Context-independent phones: every phone has its own senones whatever its
/// neighbours, and all phones share one left-to-right topology.
#[derive(Debug, Clone)]
pub struct ContextIndependentModel {
    phones: Vec<String>,
    ids: HashMap<String, PhoneId>,
    transitions: Vec<Vec<f64>>,
    n_states: usize,
    silence: PhoneId,
}

impl ContextIndependentModel {
    pub fn uniform(
        phones: &[&str],
        n_states: usize,
        self_loop: f64,
        silence: &str,
    ) -> Result<Self, DecoderError> {
        Self::from_spec(&PhoneSetSpec {
            phones: phones.iter().map(|p| p.to_string()).collect(),
            n_states,
            self_loop,
            skip: 0.0,
            silence: silence.to_string(),
        })
    }

    pub fn from_spec(spec: &PhoneSetSpec) -> Result<Self, DecoderError> {
        let n = spec.n_states;
        if n == 0 || n > MAX_HMM_STATES {
            return Err(DecoderError::config(format!(
                "phones need 1 to {MAX_HMM_STATES} states, got {n}"
            )));
        }
        let (p, s) = (spec.self_loop, spec.skip);
        if !(0.0..1.0).contains(&p) || !(0.0..1.0).contains(&s) || p + s >= 1.0 {
            return Err(DecoderError::config(format!(
                "self-loop {p} and skip {s} leave no forward transition"
            )));
        }

        let mut transitions = vec![vec![0.0; n + 1]; n];
        for (i, row) in transitions.iter_mut().enumerate() {
            row[i] = p;
            if s > 0.0 && i + 2 <= n {
                row[i + 2] = s;
                row[i + 1] = 1.0 - p - s;
            } else {
                row[i + 1] = 1.0 - p;
            }
        }

        let mut ids = HashMap::with_capacity(spec.phones.len());
        for (id, name) in spec.phones.iter().enumerate() {
            if ids.insert(name.clone(), id).is_some() {
                return Err(DecoderError::config(format!("phone '{name}' listed twice")));
            }
        }
        let silence = *ids.get(&spec.silence).ok_or_else(|| {
            DecoderError::config(format!("silence phone '{}' is not in the phone set", spec.silence))
        })?;

        Ok(Self {
            phones: spec.phones.clone(),
            ids,
            transitions,
            n_states: n,
            silence,
        })
    }

    /// Senone of `state` of `phone`.
    pub fn senone(&self, phone: &str, state: usize) -> Option<SenoneId> {
        let id = self.phone_id(phone)?;
        (state < self.n_states).then_some(id * self.n_states + state)
    }
}

impl AcousticModel for ContextIndependentModel {
    fn n_phones(&self) -> usize {
        self.phones.len()
    }

    fn n_senones(&self) -> usize {
        self.phones.len() * self.n_states
    }

    fn phone_id(&self, name: &str) -> Option<PhoneId> {
        self.ids.get(name).copied()
    }

    fn phone_name(&self, phone: PhoneId) -> &str {
        self.phones.get(phone).map(String::as_str).unwrap_or("?")
    }

    fn silence_phone(&self) -> PhoneId {
        self.silence
    }

    fn transitions(&self, _phone: PhoneId) -> &[Vec<f64>] {
        &self.transitions
    }

    fn senone_sequence(
        &self,
        phone: PhoneId,
        _left: Option<PhoneId>,
        _right: Option<PhoneId>,
    ) -> Vec<SenoneId> {
        (0..self.n_states)
            .map(|state| phone * self.n_states + state)
            .collect()
    }
}

/// In-memory pronunciation dictionary.
#[derive(Debug, Clone, Default)]
pub struct PronunciationDict {
    words: BTreeMap<String, Vec<Vec<String>>>,
    fillers: BTreeSet<String>,
}

impl PronunciationDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pronunciation; repeated calls add alternates in order.
    pub fn insert(&mut self, word: &str, phones: &[&str]) {
        self.words
            .entry(word.to_string())
            .or_default()
            .push(phones.iter().map(|p| p.to_string()).collect());
    }

    pub fn add_filler(&mut self, word: &str, phones: &[&str]) {
        self.insert(word, phones);
        self.fillers.insert(word.to_string());
    }

    pub fn remove(&mut self, word: &str) {
        self.words.remove(word);
        self.fillers.remove(word);
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Parses CMU-style lines (`WORD PH PH ...`, alternates as `WORD(2)`,
    /// `;;;` comments).
    pub fn parse_cmu(text: &str) -> Result<Self, DecoderError> {
        let mut dict = Self::new();
        dict.add_cmu(text, false)?;
        Ok(dict)
    }

    pub fn add_cmu(&mut self, text: &str, fillers: bool) -> Result<(), DecoderError> {
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(";;;") {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let Some(head) = tokens.next() else {
                continue;
            };
            let phones: Vec<&str> = tokens.collect();
            if phones.is_empty() {
                return Err(DecoderError::config(format!(
                    "dictionary line {} has no phones for '{head}'",
                    lineno + 1
                )));
            }
            let word = base_text(head);
            if fillers {
                self.add_filler(word, &phones);
            } else {
                self.insert(word, &phones);
            }
        }
        Ok(())
    }
}

impl Dictionary for PronunciationDict {
    fn pronunciations(&self, word: &str) -> Vec<Vec<String>> {
        self.words.get(word).cloned().unwrap_or_default()
    }

    fn filler_words(&self) -> Vec<String> {
        self.fillers.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NgramEntry {
    pub words: Vec<String>,
    pub log10_prob: f64,
    #[serde(default)]
    pub log10_backoff: f64,
}

/// N-grams with log10 probabilities and backoff weights, as in ARPA files.
#[derive(Debug, Clone, Deserialize)]
pub struct NgramSpec {
    pub unigrams: Vec<NgramEntry>,
    #[serde(default)]
    pub bigrams: Vec<NgramEntry>,
    #[serde(default)]
    pub trigrams: Vec<NgramEntry>,
}

#[derive(Debug, Clone, Copy)]
struct Gram {
    ln_prob: f64,
    ln_backoff: f64,
}

/// Backoff trigram model held in hash maps.
#[derive(Debug, Clone, Default)]
pub struct NgramModel {
    vocab: Vec<String>,
    ids: HashMap<String, LmWordId>,
    unigrams: Vec<Gram>,
    bigrams: HashMap<(LmWordId, LmWordId), Gram>,
    trigrams: HashMap<(LmWordId, LmWordId, LmWordId), f64>,
}

impl NgramModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_spec(spec: &NgramSpec) -> Result<Self, DecoderError> {
        let mut lm = Self::new();
        for entry in &spec.unigrams {
            let [word] = entry.words.as_slice() else {
                return Err(DecoderError::config(format!(
                    "unigram entry has {} words",
                    entry.words.len()
                )));
            };
            lm.add_unigram(word, entry.log10_prob, entry.log10_backoff);
        }
        for entry in &spec.bigrams {
            let [w1, w2] = entry.words.as_slice() else {
                return Err(DecoderError::config(format!(
                    "bigram entry has {} words",
                    entry.words.len()
                )));
            };
            lm.add_bigram(w1, w2, entry.log10_prob, entry.log10_backoff)?;
        }
        for entry in &spec.trigrams {
            let [w1, w2, w3] = entry.words.as_slice() else {
                return Err(DecoderError::config(format!(
                    "trigram entry has {} words",
                    entry.words.len()
                )));
            };
            lm.add_trigram(w1, w2, w3, entry.log10_prob)?;
        }
        Ok(lm)
    }

    /// Adds or replaces a unigram and returns its id.
    pub fn add_unigram(&mut self, word: &str, log10_prob: f64, log10_backoff: f64) -> LmWordId {
        let gram = Gram {
            ln_prob: log10_prob * std::f64::consts::LN_10,
            ln_backoff: log10_backoff * std::f64::consts::LN_10,
        };
        match self.ids.get(word) {
            Some(&id) => {
                self.unigrams[id] = gram;
                id
            }
            None => {
                let id = self.vocab.len();
                self.vocab.push(word.to_string());
                self.ids.insert(word.to_string(), id);
                self.unigrams.push(gram);
                id
            }
        }
    }

    /// `w2` following `w1`.
    pub fn add_bigram(
        &mut self,
        w1: &str,
        w2: &str,
        log10_prob: f64,
        log10_backoff: f64,
    ) -> Result<(), DecoderError> {
        let key = (self.id_of(w1)?, self.id_of(w2)?);
        self.bigrams.insert(
            key,
            Gram {
                ln_prob: log10_prob * std::f64::consts::LN_10,
                ln_backoff: log10_backoff * std::f64::consts::LN_10,
            },
        );
        Ok(())
    }

    /// `w3` following `w1 w2`.
    pub fn add_trigram(
        &mut self,
        w1: &str,
        w2: &str,
        w3: &str,
        log10_prob: f64,
    ) -> Result<(), DecoderError> {
        let key = (self.id_of(w1)?, self.id_of(w2)?, self.id_of(w3)?);
        self.trigrams
            .insert(key, log10_prob * std::f64::consts::LN_10);
        Ok(())
    }

    fn id_of(&self, word: &str) -> Result<LmWordId, DecoderError> {
        self.ids.get(word).copied().ok_or_else(|| {
            DecoderError::config(format!("n-gram uses '{word}' which has no unigram"))
        })
    }
}

impl LanguageModel for NgramModel {
    fn vocabulary(&self) -> &[String] {
        &self.vocab
    }

    fn word_id(&self, word: &str) -> Option<LmWordId> {
        self.ids.get(word).copied()
    }

    fn unigram(&self, word: LmWordId) -> LmScore {
        LmScore {
            ln_prob: self
                .unigrams
                .get(word)
                .map_or(f64::NEG_INFINITY, |g| g.ln_prob),
            order: 1,
            backoff: false,
        }
    }

    fn bigram(&self, word: LmWordId, prev: LmWordId) -> LmScore {
        if let Some(gram) = self.bigrams.get(&(prev, word)) {
            return LmScore {
                ln_prob: gram.ln_prob,
                order: 2,
                backoff: false,
            };
        }
        let bow = self.unigrams.get(prev).map_or(0.0, |g| g.ln_backoff);
        let uni = self.unigram(word);
        LmScore {
            ln_prob: bow + uni.ln_prob,
            order: 1,
            backoff: true,
        }
    }

    fn trigram(&self, word: LmWordId, prev: LmWordId, prev2: LmWordId) -> LmScore {
        if let Some(&ln_prob) = self.trigrams.get(&(prev2, prev, word)) {
            return LmScore {
                ln_prob,
                order: 3,
                backoff: false,
            };
        }
        let bow = self
            .bigrams
            .get(&(prev2, prev))
            .map_or(0.0, |g| g.ln_backoff);
        let bi = self.bigram(word, prev);
        LmScore {
            ln_prob: bow + bi.ln_prob,
            order: bi.order,
            backoff: true,
        }
    }
}
