//! Multi-root phonetic prefix tree over the decoding vocabulary.
//!
//! Words sharing leading phones share nodes. The first phone of a word is
//! modelled in the context of the previous word's last phone, so the tree has
//! one set of root nodes per possible left context; everything below the
//! roots is shared by all of them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::config::{PassParams, SearchParams};
use crate::error::DecoderError;
use crate::logmath::{LogMath, Score, WORST_SCORE};
use crate::pipeline::traits::{AcousticModel, Dictionary, LanguageModel};
use crate::search::hmm::{HmmTopology, PhoneModel};
use crate::types::{LmWordId, PhoneId, WordId};

pub type NodeId = usize;

pub const START_WORD: WordId = 0;
pub const END_WORD: WordId = 1;
pub const START_TOKEN: &str = "<s>";
pub const END_TOKEN: &str = "</s>";

#[derive(Debug, Clone, PartialEq)]
pub struct LexiconWord {
    /// Unique text; alternate pronunciations carry a `(n)` suffix.
    pub text: String,
    pub base: String,
    pub lm_id: Option<LmWordId>,
    pub phones: Vec<PhoneId>,
    /// Linear phone models used by the flat pass.
    pub chain: Vec<PhoneModel>,
    pub filler: bool,
    pub silence: bool,
    /// Best weighted LM score this word can receive on its own.
    pub lookahead: Score,
}

impl LexiconWord {
    pub fn last_phone(&self) -> Option<PhoneId> {
        self.phones.last().copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexNode {
    pub model: PhoneModel,
    pub left: Option<PhoneId>,
    /// Known only when every continuation below this node starts with the
    /// same phone and no word ends here.
    pub right: Option<PhoneId>,
    pub children: Vec<NodeId>,
    pub words: Vec<WordId>,
    pub lookahead: Score,
    pub depth: usize,
}

impl LexNode {
    pub fn phone(&self) -> PhoneId {
        self.model.phone
    }
}

#[derive(Debug, Clone)]
pub struct LexiconTree {
    nodes: Vec<LexNode>,
    roots: BTreeMap<Option<PhoneId>, Vec<NodeId>>,
    words: Vec<LexiconWord>,
    word_ids: HashMap<String, WordId>,
    topologies: Vec<HmmTopology>,
    missing_words: Vec<String>,
    n_senones: usize,
    lw: f64,
    silence_penalty: Score,
    filler_penalty: Score,
}

impl LexiconTree {
    pub fn node(&self, id: NodeId) -> &LexNode {
        &self.nodes[id]
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[LexNode] {
        &self.nodes
    }

    /// Root nodes entered after a word ending in `left` (`None` at the start
    /// of the utterance).
    pub fn roots(&self, left: Option<PhoneId>) -> &[NodeId] {
        self.roots.get(&left).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn left_contexts(&self) -> impl Iterator<Item = Option<PhoneId>> + '_ {
        self.roots.keys().copied()
    }

    pub fn word(&self, id: WordId) -> &LexiconWord {
        &self.words[id]
    }

    pub fn words(&self) -> &[LexiconWord] {
        &self.words
    }

    pub fn n_words(&self) -> usize {
        self.words.len()
    }

    pub fn word_id(&self, text: &str) -> Option<WordId> {
        self.word_ids.get(text).copied()
    }

    pub fn topology(&self, phone: PhoneId) -> &HmmTopology {
        &self.topologies[phone]
    }

    /// LM words left out because the dictionary had no pronunciation.
    pub fn missing_words(&self) -> &[String] {
        &self.missing_words
    }

    pub fn n_senones(&self) -> usize {
        self.n_senones
    }

    /// Lookahead scores bake in the weights the tree was built with.
    pub fn check_params(&self, params: &PassParams) -> Result<(), DecoderError> {
        if self.lw != params.lw
            || self.silence_penalty != params.silence_penalty
            || self.filler_penalty != params.filler_penalty
        {
            return Err(DecoderError::config(format!(
                "lexicon tree was compiled with lw {} but the decoder uses lw {}",
                self.lw, params.lw
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DecoderError> {
        let mut parent_of: Vec<Option<NodeId>> = vec![None; self.nodes.len()];
        for (id, node) in self.nodes.iter().enumerate() {
            for &child in &node.children {
                let Some(child_node) = self.nodes.get(child) else {
                    return Err(DecoderError::invariant(format!(
                        "lexicon node {id} points at missing child {child}"
                    )));
                };
                if child_node.depth != node.depth + 1 || child_node.left != Some(node.phone()) {
                    return Err(DecoderError::invariant(format!(
                        "lexicon node {child} does not continue node {id}"
                    )));
                }
                if child_node.lookahead > node.lookahead {
                    return Err(DecoderError::invariant(format!(
                        "lexicon node {child} has a better lookahead than its parent {id}"
                    )));
                }
                parent_of[child] = Some(id);
            }
            for &w in &node.words {
                let word = self.words.get(w).ok_or_else(|| {
                    DecoderError::invariant(format!("lexicon node {id} ends unknown word {w}"))
                })?;
                if word.phones.len() != node.depth + 1 || word.last_phone() != Some(node.phone()) {
                    return Err(DecoderError::invariant(format!(
                        "word '{}' does not end at lexicon node {id}",
                        word.text
                    )));
                }
            }
        }
        for (left, roots) in &self.roots {
            for &root in roots {
                let node = &self.nodes[root];
                if node.depth != 0 || node.left != *left || parent_of[root].is_some() {
                    return Err(DecoderError::invariant(format!(
                        "lexicon root {root} is not a root for its context"
                    )));
                }
            }
        }
        Ok(())
    }
}

pub struct LexiconTreeBuilder<'a> {
    acoustic_model: &'a dyn AcousticModel,
    dictionary: &'a dyn Dictionary,
    language_model: &'a dyn LanguageModel,
    logmath: LogMath,
    params: PassParams,
    strict_vocabulary: bool,
}

#[derive(Default)]
struct TrieNode {
    phone: PhoneId,
    children: BTreeMap<PhoneId, usize>,
    words: Vec<WordId>,
    lookahead: Score,
}

impl<'a> LexiconTreeBuilder<'a> {
    pub fn new(
        acoustic_model: &'a dyn AcousticModel,
        dictionary: &'a dyn Dictionary,
        language_model: &'a dyn LanguageModel,
        params: &SearchParams,
    ) -> Self {
        Self {
            acoustic_model,
            dictionary,
            language_model,
            logmath: params.logmath,
            params: params.tree.clone(),
            strict_vocabulary: params.strict_vocabulary,
        }
    }

    pub fn build(self) -> Result<LexiconTree, DecoderError> {
        let am = self.acoustic_model;
        let lm = self.language_model;

        let topologies = (0..am.n_phones())
            .map(|p| HmmTopology::from_probabilities(am.transitions(p), &self.logmath))
            .collect::<Result<Vec<_>, _>>()?;

        let start_lm = lm.word_id(START_TOKEN).ok_or_else(|| {
            DecoderError::config(format!("language model has no {START_TOKEN} token"))
        })?;
        let end_lm = lm.word_id(END_TOKEN).ok_or_else(|| {
            DecoderError::config(format!("language model has no {END_TOKEN} token"))
        })?;

        let mut words = vec![
            sentinel_word(START_TOKEN, start_lm),
            sentinel_word(END_TOKEN, end_lm),
        ];
        let fillers: BTreeSet<String> = self.dictionary.filler_words().into_iter().collect();
        let mut missing_words = Vec::new();

        for (lm_id, text) in lm.vocabulary().iter().enumerate() {
            if lm_id == start_lm || lm_id == end_lm || fillers.contains(text) {
                continue;
            }
            let prons = self.dictionary.pronunciations(text);
            if prons.is_empty() {
                if self.strict_vocabulary {
                    return Err(DecoderError::config(format!(
                        "word '{text}' has no pronunciation"
                    )));
                }
                tracing::warn!(word = %text, "word missing from dictionary; excluded from search");
                missing_words.push(text.clone());
                continue;
            }
            let unigram = self.scale(lm.unigram(lm_id).ln_prob);
            for (alt, pron) in prons.iter().enumerate() {
                let phones = self.resolve_phones(text, pron)?;
                words.push(LexiconWord {
                    text: variant_text(text, alt),
                    base: text.clone(),
                    lm_id: Some(lm_id),
                    chain: self.chain_models(&phones)?,
                    phones,
                    filler: false,
                    silence: false,
                    lookahead: unigram,
                });
            }
        }

        if words.len() == 2 {
            return Err(DecoderError::config(
                "vocabulary is empty: no language model word has a pronunciation",
            ));
        }

        let silence_phone = am.silence_phone();
        for text in &fillers {
            let prons = self.dictionary.pronunciations(text);
            if prons.is_empty() {
                return Err(DecoderError::config(format!(
                    "filler '{text}' has no pronunciation"
                )));
            }
            for (alt, pron) in prons.iter().enumerate() {
                let phones = self.resolve_phones(text, pron)?;
                let silence = phones.as_slice() == [silence_phone];
                words.push(LexiconWord {
                    text: variant_text(text, alt),
                    base: text.clone(),
                    lm_id: None,
                    chain: self.chain_models(&phones)?,
                    phones,
                    filler: true,
                    silence,
                    lookahead: if silence {
                        self.params.silence_penalty
                    } else {
                        self.params.filler_penalty
                    },
                });
            }
        }

        let mut word_ids = HashMap::with_capacity(words.len());
        for (id, word) in words.iter().enumerate() {
            if word_ids.insert(word.text.clone(), id).is_some() {
                return Err(DecoderError::config(format!(
                    "word '{}' is listed twice",
                    word.text
                )));
            }
        }

        let trie = build_trie(&words);
        let mut tree = LexiconTree {
            nodes: Vec::new(),
            roots: BTreeMap::new(),
            words,
            word_ids,
            topologies,
            missing_words,
            n_senones: am.n_senones(),
            lw: self.params.lw,
            silence_penalty: self.params.silence_penalty,
            filler_penalty: self.params.filler_penalty,
        };

        let contexts: BTreeSet<Option<PhoneId>> = std::iter::once(None)
            .chain(tree.words.iter().filter_map(|w| w.last_phone().map(Some)))
            .collect();

        // Shared subtrees below each first phone.
        let mut shared_children: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
        for &first in trie[0].children.values() {
            let children = trie[first]
                .children
                .values()
                .map(|&c| self.compile_subtree(&trie, c, trie[first].phone, 1, &mut tree.nodes))
                .collect::<Result<Vec<_>, _>>()?;
            shared_children.insert(first, children);
        }

        for left in contexts {
            let mut roots = Vec::new();
            for &first in trie[0].children.values() {
                let node = &trie[first];
                let right = unique_continuation(&trie, first);
                let senones = self.senones(node.phone, left, right)?;
                tree.nodes.push(LexNode {
                    model: PhoneModel {
                        phone: node.phone,
                        senones,
                    },
                    left,
                    right,
                    children: shared_children[&first].clone(),
                    words: node.words.clone(),
                    lookahead: node.lookahead,
                    depth: 0,
                });
                roots.push(tree.nodes.len() - 1);
            }
            tree.roots.insert(left, roots);
        }

        tree.validate()?;
        tracing::debug!(
            n_words = tree.words.len(),
            n_nodes = tree.nodes.len(),
            n_contexts = tree.roots.len(),
            n_missing = tree.missing_words.len(),
            "lexicon tree compiled"
        );
        Ok(tree)
    }

    fn scale(&self, ln_prob: f64) -> Score {
        self.logmath.from_ln(self.params.lw * ln_prob)
    }

    fn resolve_phones(&self, word: &str, pron: &[String]) -> Result<Vec<PhoneId>, DecoderError> {
        if pron.is_empty() {
            return Err(DecoderError::config(format!(
                "word '{word}' has an empty pronunciation"
            )));
        }
        pron.iter()
            .map(|name| {
                self.acoustic_model.phone_id(name).ok_or_else(|| {
                    DecoderError::config(format!("word '{word}' uses unknown phone '{name}'"))
                })
            })
            .collect()
    }

    fn senones(
        &self,
        phone: PhoneId,
        left: Option<PhoneId>,
        right: Option<PhoneId>,
    ) -> Result<Vec<usize>, DecoderError> {
        let am = self.acoustic_model;
        let senones = am.senone_sequence(phone, left, right);
        let n_states = am.transitions(phone).len();
        if senones.len() != n_states {
            return Err(DecoderError::config(format!(
                "phone '{}' has {n_states} states but {} senones",
                am.phone_name(phone),
                senones.len()
            )));
        }
        if let Some(&bad) = senones.iter().find(|&&s| s >= am.n_senones()) {
            return Err(DecoderError::config(format!(
                "phone '{}' refers to senone {bad} of {}",
                am.phone_name(phone),
                am.n_senones()
            )));
        }
        Ok(senones)
    }

    fn chain_models(&self, phones: &[PhoneId]) -> Result<Vec<PhoneModel>, DecoderError> {
        phones
            .iter()
            .enumerate()
            .map(|(i, &phone)| {
                let left = if i == 0 { None } else { Some(phones[i - 1]) };
                let right = phones.get(i + 1).copied();
                Ok(PhoneModel {
                    phone,
                    senones: self.senones(phone, left, right)?,
                })
            })
            .collect()
    }

    fn compile_subtree(
        &self,
        trie: &[TrieNode],
        at: usize,
        left: PhoneId,
        depth: usize,
        nodes: &mut Vec<LexNode>,
    ) -> Result<NodeId, DecoderError> {
        let node = &trie[at];
        let right = unique_continuation(trie, at);
        let senones = self.senones(node.phone, Some(left), right)?;
        let id = nodes.len();
        nodes.push(LexNode {
            model: PhoneModel {
                phone: node.phone,
                senones,
            },
            left: Some(left),
            right,
            children: Vec::new(),
            words: node.words.clone(),
            lookahead: node.lookahead,
            depth,
        });
        let mut children = Vec::with_capacity(node.children.len());
        for &child in node.children.values() {
            children.push(self.compile_subtree(trie, child, node.phone, depth + 1, nodes)?);
        }
        nodes[id].children = children;
        Ok(id)
    }
}

fn sentinel_word(text: &str, lm_id: LmWordId) -> LexiconWord {
    LexiconWord {
        text: text.to_string(),
        base: text.to_string(),
        lm_id: Some(lm_id),
        phones: Vec::new(),
        chain: Vec::new(),
        filler: false,
        silence: false,
        lookahead: WORST_SCORE,
    }
}

fn variant_text(word: &str, alt: usize) -> String {
    if alt == 0 {
        word.to_string()
    } else {
        format!("{word}({})", alt + 1)
    }
}

/// Inverse of the variant naming: `WORD(2)` -> `WORD`.
pub fn base_text(text: &str) -> &str {
    match text.rfind('(') {
        Some(open)
            if open > 0
                && text.ends_with(')')
                && text.len() > open + 2
                && text[open + 1..text.len() - 1]
                    .chars()
                    .all(|c| c.is_ascii_digit()) =>
        {
            &text[..open]
        }
        _ => text,
    }
}

/// Index 0 is a phone-less root whose children are the first phones.
fn build_trie(words: &[LexiconWord]) -> Vec<TrieNode> {
    let mut trie = vec![TrieNode {
        lookahead: WORST_SCORE,
        ..TrieNode::default()
    }];
    for (id, word) in words.iter().enumerate() {
        if word.phones.is_empty() {
            continue;
        }
        let mut at = 0;
        for &phone in &word.phones {
            at = match trie[at].children.get(&phone) {
                Some(&next) => next,
                None => {
                    trie.push(TrieNode {
                        phone,
                        lookahead: WORST_SCORE,
                        ..TrieNode::default()
                    });
                    let next = trie.len() - 1;
                    trie[at].children.insert(phone, next);
                    next
                }
            };
            if word.lookahead > trie[at].lookahead {
                trie[at].lookahead = word.lookahead;
            }
        }
        trie[at].words.push(id);
    }
    trie
}

fn unique_continuation(trie: &[TrieNode], at: usize) -> Option<PhoneId> {
    let node = &trie[at];
    if !node.words.is_empty() || node.children.len() != 1 {
        return None;
    }
    node.children.keys().next().copied()
}

/// Words that share a node because their pronunciations are identical.
pub fn homophone_groups(tree: &LexiconTree) -> Vec<Vec<WordId>> {
    let mut seen = HashSet::new();
    let mut groups = Vec::new();
    for node in tree.nodes() {
        if node.words.len() > 1 && seen.insert(node.words.clone()) {
            groups.push(node.words.clone());
        }
    }
    groups
}
