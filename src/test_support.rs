//! Tiny three-word task shared by unit tests: "GO FORWARD" over ten frames.

use crate::pipeline::defaults::{ContextIndependentModel, NgramModel, PronunciationDict};

pub(crate) const PHONES: [&str; 9] = ["G", "OW", "F", "AO", "R", "B", "AE", "K", "SIL"];

/// Target phone state of each frame; two states per phone.
pub(crate) const SCRIPT: [(&str, usize); 10] = [
    ("G", 0),
    ("G", 1),
    ("OW", 0),
    ("OW", 1),
    ("F", 0),
    ("F", 1),
    ("AO", 0),
    ("AO", 1),
    ("R", 0),
    ("R", 1),
];

const TARGET_LN: f32 = -0.01;
const OTHER_LN: f32 = -6.0;

pub(crate) fn acoustic_model() -> ContextIndependentModel {
    ContextIndependentModel::uniform(&PHONES, 2, 0.5, "SIL").expect("valid phone set")
}

pub(crate) fn dictionary() -> PronunciationDict {
    let mut dict = PronunciationDict::new();
    dict.insert("GO", &["G", "OW"]);
    dict.insert("FORWARD", &["F", "AO", "R"]);
    dict.insert("BACK", &["B", "AE", "K"]);
    dict.add_filler("<sil>", &["SIL"]);
    dict
}

pub(crate) fn language_model() -> NgramModel {
    let mut lm = NgramModel::new();
    lm.add_unigram("<s>", -99.0, 0.0);
    lm.add_unigram("</s>", -0.5, 0.0);
    for w in ["GO", "FORWARD", "BACK"] {
        lm.add_unigram(w, -0.5, 0.0);
    }
    lm.add_bigram("<s>", "GO", -0.1, 0.0).expect("known words");
    lm.add_bigram("GO", "FORWARD", -0.1, 0.0).expect("known words");
    lm.add_bigram("FORWARD", "</s>", -0.1, 0.0).expect("known words");
    lm
}

/// Natural-log senone scores favouring one phone state.
pub(crate) fn frame(am: &ContextIndependentModel, target: Option<(&str, usize)>) -> Vec<f32> {
    let n = PHONES.len() * 2;
    let mut values = vec![OTHER_LN; n];
    if let Some((phone, state)) = target {
        values[am.senone(phone, state).expect("scripted senone")] = TARGET_LN;
    }
    values
}

pub(crate) fn script(am: &ContextIndependentModel) -> Vec<Vec<f32>> {
    SCRIPT.iter().map(|&t| frame(am, Some(t))).collect()
}

/// A frame in which every senone is impossible.
pub(crate) fn dead_frame() -> Vec<f32> {
    vec![f32::NEG_INFINITY; PHONES.len() * 2]
}
