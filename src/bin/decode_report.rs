use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ngram_decoder::{
    ContextIndependentModel, Decoder, DecoderBuilder, DecoderConfig, NgramModel, NgramSpec,
    PhoneSetSpec, PronunciationDict,
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[path = "decode_report/json_report_formatter.rs"]
mod json_report_formatter;

use json_report_formatter::{write_report, Report, Summary, UtteranceReport};

#[derive(Debug, Parser)]
#[command(name = "decode_report")]
#[command(about = "Decode a scenario of senone-score frames and write a JSON report")]
struct Args {
    /// Scenario JSON: phone set, dictionary, language model and utterances.
    #[arg(long, env = "NGRAM_DECODER_SCENARIO")]
    scenario: PathBuf,
    /// Decoder configuration JSON; overrides the scenario's own config.
    #[arg(long, env = "NGRAM_DECODER_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "NGRAM_DECODER_OUT", default_value = "reports/decode_report.json")]
    out: PathBuf,
    /// Directory receiving one text lattice per utterance.
    #[arg(long, env = "NGRAM_DECODER_LATTICE_DIR")]
    lattice_dir: Option<PathBuf>,
    #[arg(long, env = "NGRAM_DECODER_NBEST", default_value_t = 0)]
    nbest: usize,
    #[arg(long, env = "NGRAM_DECODER_LIMIT")]
    limit: Option<usize>,
    #[arg(long, env = "NGRAM_DECODER_OFFSET", default_value_t = 0)]
    offset: usize,
}

#[derive(Debug, Deserialize)]
struct Scenario {
    phone_set: PhoneSetSpec,
    /// CMU-style dictionary text.
    dictionary: String,
    #[serde(default)]
    fillers: String,
    language_model: NgramSpec,
    #[serde(default)]
    config: Option<DecoderConfig>,
    utterances: Vec<ScenarioUtterance>,
}

#[derive(Debug, Deserialize)]
struct ScenarioUtterance {
    id: String,
    /// Natural-log senone likelihoods, one row per frame.
    frames: Vec<Vec<f32>>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("decode_report: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = Args::parse();

    let scenario = load_scenario(&args.scenario)?;
    let config = match args.config.as_ref() {
        Some(path) => DecoderConfig::load(path)
            .map_err(|err| format!("Failed to load config '{}': {err}", path.display()))?,
        None => scenario.config.clone().unwrap_or_default(),
    };

    let mut decoder = build_decoder(&scenario, config.clone())?;

    let utterances: Vec<&ScenarioUtterance> = scenario
        .utterances
        .iter()
        .skip(args.offset)
        .take(args.limit.unwrap_or(usize::MAX))
        .collect();
    if utterances.is_empty() {
        return Err("No utterances selected after applying offset/limit.".to_string());
    }
    if let Some(dir) = args.lattice_dir.as_ref() {
        fs::create_dir_all(dir).map_err(|err| {
            format!("Failed to create lattice directory '{}': {err}", dir.display())
        })?;
    }

    let progress = ProgressBar::new(utterances.len() as u64);
    progress.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    progress.set_message("starting...");

    let mut reports = Vec::with_capacity(utterances.len());
    for utterance in utterances {
        progress.set_message(utterance.id.clone());
        reports.push(decode_one(&mut decoder, utterance, &args));
        progress.inc(1);
    }
    progress.finish_with_message("done");

    let summary = Summary::from_utterances(&reports);
    let report = Report {
        generated_at: Utc::now().to_rfc3339(),
        scenario: args.scenario.display().to_string(),
        config,
        summary,
        utterances: reports,
    };
    write_report(&args.out, &report)?;
    eprintln!(
        "Wrote {} utterances ({} failed, {} degraded) to {}",
        report.summary.n_utterances,
        report.summary.n_failed,
        report.summary.n_degraded,
        args.out.display()
    );
    Ok(())
}

fn load_scenario(path: &Path) -> Result<Scenario, String> {
    let data = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read scenario '{}': {err}", path.display()))?;
    serde_json::from_str(&data)
        .map_err(|err| format!("Failed to parse scenario '{}': {err}", path.display()))
}

fn build_decoder(scenario: &Scenario, config: DecoderConfig) -> Result<Decoder, String> {
    let acoustic_model = ContextIndependentModel::from_spec(&scenario.phone_set)
        .map_err(|err| format!("Invalid phone set: {err}"))?;
    let mut dictionary = PronunciationDict::parse_cmu(&scenario.dictionary)
        .map_err(|err| format!("Invalid dictionary: {err}"))?;
    dictionary
        .add_cmu(&scenario.fillers, true)
        .map_err(|err| format!("Invalid filler dictionary: {err}"))?;
    let language_model = NgramModel::from_spec(&scenario.language_model)
        .map_err(|err| format!("Invalid language model: {err}"))?;

    DecoderBuilder::new(config)
        .with_acoustic_model(Box::new(acoustic_model))
        .with_dictionary(Box::new(dictionary))
        .with_language_model(Arc::new(language_model))
        .build()
        .map_err(|err| format!("Failed to build decoder: {err}"))
}

fn decode_one(decoder: &mut Decoder, utterance: &ScenarioUtterance, args: &Args) -> UtteranceReport {
    let started = Instant::now();
    let output = match decoder.decode(&utterance.id, &utterance.frames) {
        Ok(output) => output,
        Err(err) => {
            tracing::error!(utterance_id = %utterance.id, error = %err, "decode failed");
            return UtteranceReport::failed(&utterance.id, err.to_string(), started.elapsed());
        }
    };

    let nbest = if args.nbest > 0 {
        decoder.get_nbest(&utterance.id, args.nbest).unwrap_or_else(|err| {
            tracing::warn!(utterance_id = %utterance.id, error = %err, "no N-best list");
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let lattice_path = args.lattice_dir.as_ref().and_then(|dir| {
        let lattice = decoder.last_utterance().and_then(|u| u.lattice())?;
        let path = dir.join(format!("{}.lat", utterance.id));
        match lattice.save(&path) {
            Ok(()) => Some(path.display().to_string()),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to write lattice");
                None
            }
        }
    });

    UtteranceReport::decoded(output, nbest, lattice_path, started.elapsed())
}
