use std::sync::Arc;

use libtest_mimic::{Arguments, Failed, Trial};
use ngram_decoder::{
    ContextIndependentModel, DecodeOutput, DecodeWarning, Decoder, DecoderBuilder, DecoderConfig,
    DecoderError, Lattice, NgramModel, PronunciationDict,
};

const SUITE_NAME: &str = "decode_scenarios";

const PHONES: [&str; 9] = ["G", "OW", "F", "AO", "R", "B", "AE", "K", "SIL"];
const SCRIPT: [(&str, usize); 10] = [
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

fn main() {
    let args = Arguments::from_args();
    let scenarios: [(&str, fn() -> Result<(), String>); 13] = [
        ("decodes_go_forward", decodes_go_forward),
        ("long_low_scoring_utterance_decodes", long_low_scoring_utterance_decodes),
        ("transient_collapse_is_reported", transient_collapse_is_reported),
        ("sustained_collapse_recovers", sustained_collapse_recovers),
        ("missing_dictionary_word_only_warns", missing_dictionary_word_only_warns),
        ("strict_vocabulary_fails_build", strict_vocabulary_fails_build),
        ("bad_frames_leave_session_usable", bad_frames_leave_session_usable),
        ("lattice_holds_hypothesis_words", lattice_holds_hypothesis_words),
        ("lattice_file_round_trips", lattice_file_round_trips),
        ("nbest_starts_with_best_hypothesis", nbest_starts_with_best_hypothesis),
        ("nbest_merges_pronunciation_variants", nbest_merges_pronunciation_variants),
        ("empty_utterance_is_rejected", empty_utterance_is_rejected),
        ("nbest_for_unknown_utterance_fails", nbest_for_unknown_utterance_fails),
    ];
    let tests = scenarios
        .into_iter()
        .map(|(name, scenario)| {
            Trial::test(format!("{SUITE_NAME}::{name}"), move || {
                scenario().map_err(Failed::from)
            })
        })
        .collect();
    libtest_mimic::run(&args, tests).exit();
}

fn acoustic_model() -> ContextIndependentModel {
    ContextIndependentModel::uniform(&PHONES, 2, 0.5, "SIL").expect("valid phone set")
}

fn dictionary() -> PronunciationDict {
    PronunciationDict::parse_cmu(
        ";;; command words\n\
         GO G OW\n\
         FORWARD F AO R\n\
         BACK B AE K\n",
    )
    .and_then(|mut dict| dict.add_cmu("<sil> SIL\n", true).map(|()| dict))
    .expect("valid dictionary")
}

fn language_model() -> NgramModel {
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

fn decoder_with(config: DecoderConfig, dict: PronunciationDict) -> Result<Decoder, DecoderError> {
    DecoderBuilder::new(config)
        .with_acoustic_model(Box::new(acoustic_model()))
        .with_dictionary(Box::new(dict))
        .with_language_model(Arc::new(language_model()))
        .build()
}

fn decoder(config: DecoderConfig) -> Result<Decoder, String> {
    decoder_with(config, dictionary()).map_err(|err| format!("build failed: {err}"))
}

fn frame(am: &ContextIndependentModel, phone: &str, state: usize) -> Vec<f32> {
    let mut values = vec![-6.0f32; PHONES.len() * 2];
    if let Some(s) = am.senone(phone, state) {
        values[s] = -0.01;
    }
    values
}

fn script() -> Vec<Vec<f32>> {
    let am = acoustic_model();
    SCRIPT.iter().map(|&(p, s)| frame(&am, p, s)).collect()
}

fn with_dead_frames(at: usize, count: usize) -> Vec<Vec<f32>> {
    let mut frames = script();
    for _ in 0..count {
        frames.insert(at, vec![f32::NEG_INFINITY; PHONES.len() * 2]);
    }
    frames
}

fn expect_text(out: &DecodeOutput, text: &str) -> Result<(), String> {
    if out.text != text {
        return Err(format!(
            "{}: expected '{text}', got '{}'",
            out.utterance_id, out.text
        ));
    }
    Ok(())
}

fn decodes_go_forward() -> Result<(), String> {
    let mut decoder = decoder(DecoderConfig::default())?;
    let out = decoder
        .decode("go-forward", &script())
        .map_err(|err| err.to_string())?;
    expect_text(&out, "GO FORWARD")?;
    if out.is_degraded() {
        return Err(format!("unexpected warnings: {:?}", out.warnings));
    }
    let spans: Vec<(&str, usize, usize)> = out
        .words
        .iter()
        .map(|w| (w.word.as_str(), w.start_frame, w.end_frame))
        .collect();
    if spans != [("GO", 0, 3), ("FORWARD", 4, 9)] {
        return Err(format!("unexpected segmentation: {spans:?}"));
    }
    Ok(())
}

/// Six hundred frames, each a hundred nats below the usual script. Without
/// per-frame normalisation the path scores would run into `WORST_SCORE`.
fn long_low_scoring_utterance_decodes() -> Result<(), String> {
    let frames: Vec<Vec<f32>> = script()
        .into_iter()
        .flat_map(|f| std::iter::repeat(f).take(60))
        .map(|f| f.into_iter().map(|v| v - 100.0).collect())
        .collect();
    let mut decoder = decoder(DecoderConfig::default())?;
    let out = decoder
        .decode("long-low", &frames)
        .map_err(|err| err.to_string())?;
    expect_text(&out, "GO FORWARD")?;
    if out.is_degraded() {
        return Err(format!("unexpected warnings: {:?}", out.warnings));
    }
    if out.n_frames != 600 {
        return Err(format!("expected 600 frames, got {}", out.n_frames));
    }
    let spans: Vec<(usize, usize)> = out.words.iter().map(|w| (w.start_frame, w.end_frame)).collect();
    if spans != [(0, 239), (240, 599)] {
        return Err(format!("unexpected segmentation: {spans:?}"));
    }
    Ok(())
}

fn transient_collapse_is_reported() -> Result<(), String> {
    let frames = with_dead_frames(4, 1);

    let mut tree_only = decoder(DecoderConfig {
        fwdflat: false,
        ..DecoderConfig::default()
    })?;
    let out = tree_only
        .decode("transient", &frames)
        .map_err(|err| err.to_string())?;
    expect_text(&out, "GO FORWARD")?;
    let found = out.warnings.iter().any(|w| {
        matches!(
            w,
            DecodeWarning::TransientBeamCollapse {
                start_frame: 4,
                frames: 1,
                ..
            }
        )
    });
    if !found {
        return Err(format!("no transient collapse warning in {:?}", out.warnings));
    }

    let mut full = decoder(DecoderConfig::default())?;
    let out = full
        .decode("transient", &frames)
        .map_err(|err| err.to_string())?;
    if !out.warnings.iter().any(DecodeWarning::is_collapse) {
        return Err("two-pass decode lost the collapse warning".to_string());
    }
    if out
        .warnings
        .iter()
        .any(|w| matches!(w, DecodeWarning::SustainedBeamCollapse { .. }))
    {
        return Err(format!("one dead frame reported as sustained: {:?}", out.warnings));
    }
    Ok(())
}

fn sustained_collapse_recovers() -> Result<(), String> {
    let mut decoder = decoder(DecoderConfig {
        fwdflat: false,
        ..DecoderConfig::default()
    })?;
    let out = decoder
        .decode("sustained", &with_dead_frames(4, 3))
        .map_err(|err| err.to_string())?;
    let sustained = out.warnings.iter().any(|w| {
        matches!(
            w,
            DecodeWarning::SustainedBeamCollapse { frames: 3, .. }
        )
    });
    if !sustained {
        return Err(format!("no sustained collapse warning in {:?}", out.warnings));
    }
    if out.n_frames != 13 {
        return Err(format!("expected 13 frames, got {}", out.n_frames));
    }
    Ok(())
}

fn missing_dictionary_word_only_warns() -> Result<(), String> {
    let mut dict = dictionary();
    dict.remove("BACK");
    let mut decoder = decoder_with(DecoderConfig::default(), dict)
        .map_err(|err| format!("lenient build failed: {err}"))?;
    if decoder.lexicon().missing_words() != ["BACK".to_string()] {
        return Err(format!(
            "unexpected missing words: {:?}",
            decoder.lexicon().missing_words()
        ));
    }
    let out = decoder
        .decode("missing", &script())
        .map_err(|err| err.to_string())?;
    expect_text(&out, "GO FORWARD")
}

fn strict_vocabulary_fails_build() -> Result<(), String> {
    let mut dict = dictionary();
    dict.remove("BACK");
    let config = DecoderConfig {
        strict_vocabulary: true,
        ..DecoderConfig::default()
    };
    match decoder_with(config, dict) {
        Err(DecoderError::Config { .. }) => Ok(()),
        Err(other) => Err(format!("expected a config error, got {other}")),
        Ok(_) => Err("strict build accepted a missing word".to_string()),
    }
}

fn bad_frames_leave_session_usable() -> Result<(), String> {
    let mut decoder = decoder(DecoderConfig::default())?;
    let frames = script();
    let mut session = decoder
        .start_utterance("retry")
        .map_err(|err| err.to_string())?;
    for (i, frame) in frames.iter().enumerate() {
        if i == 5 {
            let mut bad = frame.clone();
            bad[2] = f32::NAN;
            if !matches!(session.process_frame(&bad), Err(DecoderError::InvalidInput { .. })) {
                return Err("NaN frame was accepted".to_string());
            }
            if session.process_frame(&frame[1..]).is_ok() {
                return Err("short frame was accepted".to_string());
            }
        }
        session.process_frame(frame).map_err(|err| err.to_string())?;
    }
    if session.n_frames() != frames.len() {
        return Err(format!("session holds {} frames", session.n_frames()));
    }
    let out = decoder
        .finish_utterance(session)
        .map_err(|err| err.to_string())?;
    expect_text(&out, "GO FORWARD")
}

fn lattice_holds_hypothesis_words() -> Result<(), String> {
    let mut decoder = decoder(DecoderConfig::default())?;
    decoder
        .decode("lattice", &script())
        .map_err(|err| err.to_string())?;
    let text = decoder.get_lattice().map_err(|err| err.to_string())?;
    let lattice = Lattice::read_text(&text).map_err(|err| err.to_string())?;
    for (word, sf, ef) in [("GO", 0, 3), ("FORWARD", 4, 9)] {
        let present = lattice
            .nodes()
            .iter()
            .any(|n| n.text == word && n.start_frame == sf && n.end_frame == ef);
        if !present {
            return Err(format!("lattice has no node {word} [{sf}, {ef}]"));
        }
    }
    let best = lattice.best_path().map_err(|err| err.to_string())?;
    if best.text(&lattice) != "GO FORWARD" {
        return Err(format!("lattice best path is '{}'", best.text(&lattice)));
    }
    Ok(())
}

fn lattice_file_round_trips() -> Result<(), String> {
    let mut decoder = decoder(DecoderConfig::default())?;
    decoder
        .decode("file", &script())
        .map_err(|err| err.to_string())?;
    let lattice = decoder
        .last_utterance()
        .and_then(|u| u.lattice())
        .ok_or("no lattice kept")?;
    let path = std::env::temp_dir().join("ngram_decoder_scenario_lattice.lat");
    lattice.save(&path).map_err(|err| err.to_string())?;
    let loaded = Lattice::load(&path).map_err(|err| err.to_string());
    let _ = std::fs::remove_file(&path);
    let loaded = loaded?;
    if loaded.nodes() != lattice.nodes() {
        return Err("loaded lattice nodes differ from the saved ones".to_string());
    }
    let scored = |l: &Lattice| -> Vec<(usize, usize, i32, i32)> {
        l.arcs().iter().map(|a| (a.from, a.to, a.ascr, a.lscr)).collect()
    };
    if scored(&loaded) != scored(lattice) {
        return Err(format!(
            "loaded arcs differ: {:?} vs {:?}",
            scored(&loaded),
            scored(lattice)
        ));
    }
    let (saved_best, loaded_best) = (
        lattice.best_path().map_err(|err| err.to_string())?,
        loaded.best_path().map_err(|err| err.to_string())?,
    );
    if saved_best != loaded_best {
        return Err("best path changed across save and load".to_string());
    }
    Ok(())
}

fn nbest_starts_with_best_hypothesis() -> Result<(), String> {
    let mut decoder = decoder(DecoderConfig {
        lattice_beam: 0.0,
        ..DecoderConfig::default()
    })?;
    let out = decoder
        .decode("nbest", &script())
        .map_err(|err| err.to_string())?;
    let nbest = decoder
        .get_nbest("nbest", 4)
        .map_err(|err| err.to_string())?;
    let first = nbest.first().ok_or("empty N-best list")?;
    if first.text != out.text {
        return Err(format!("N-best head '{}' != hypothesis '{}'", first.text, out.text));
    }
    if nbest.len() > 4 || nbest.windows(2).any(|w| w[0].score < w[1].score) {
        return Err(format!("N-best list out of order: {nbest:?}"));
    }
    Ok(())
}

/// `GO(2)` repeats `GO`'s pronunciation, so every path through `GO` has a
/// twin through `GO(2)` with the same score.
fn nbest_merges_pronunciation_variants() -> Result<(), String> {
    let dict = PronunciationDict::parse_cmu(
        "GO G OW\n\
         GO(2) G OW\n\
         FORWARD F AO R\n\
         BACK B AE K\n",
    )
    .and_then(|mut dict| dict.add_cmu("<sil> SIL\n", true).map(|()| dict))
    .map_err(|err| err.to_string())?;
    let config = DecoderConfig {
        lattice_beam: 0.0,
        ..DecoderConfig::default()
    };
    let mut decoder = decoder_with(config, dict).map_err(|err| format!("build failed: {err}"))?;
    let out = decoder
        .decode("variants", &script())
        .map_err(|err| err.to_string())?;
    expect_text(&out, "GO FORWARD")?;

    let lattice = decoder
        .last_utterance()
        .and_then(|u| u.lattice())
        .ok_or("no lattice")?;
    if !lattice.nodes().iter().any(|n| n.text == "GO(2)") {
        return Err("lattice lost the GO(2) variant".to_string());
    }
    let best = lattice.best_path().map_err(|err| err.to_string())?;
    if best.text(lattice) != "GO FORWARD" {
        return Err(format!("best path text '{}'", best.text(lattice)));
    }

    let nbest = decoder
        .get_nbest("variants", 10)
        .map_err(|err| err.to_string())?;
    let texts: Vec<&str> = nbest.iter().map(|e| e.text.as_str()).collect();
    if texts.first() != Some(&"GO FORWARD") {
        return Err(format!("unexpected N-best head: {texts:?}"));
    }
    if texts.iter().any(|t| t.contains('(')) {
        return Err(format!("variant spelling leaked into N-best: {texts:?}"));
    }
    let mut unique = texts.clone();
    unique.sort_unstable();
    unique.dedup();
    if unique.len() != texts.len() {
        return Err(format!("duplicate N-best entries: {texts:?}"));
    }
    Ok(())
}

fn empty_utterance_is_rejected() -> Result<(), String> {
    let mut decoder = decoder(DecoderConfig::default())?;
    match decoder.decode("empty", &[]) {
        Err(DecoderError::InvalidInput { .. }) => {}
        other => return Err(format!("expected invalid input, got {other:?}")),
    }
    match decoder.get_lattice() {
        Err(DecoderError::InvalidState { .. }) => Ok(()),
        other => Err(format!("expected invalid state, got {other:?}")),
    }
}

fn nbest_for_unknown_utterance_fails() -> Result<(), String> {
    let mut decoder = decoder(DecoderConfig::default())?;
    decoder
        .decode("known", &script())
        .map_err(|err| err.to_string())?;
    match decoder.get_nbest("unknown", 3) {
        Err(DecoderError::UnknownUtterance { id }) if id == "unknown" => Ok(()),
        other => Err(format!("expected unknown utterance, got {other:?}")),
    }
}
