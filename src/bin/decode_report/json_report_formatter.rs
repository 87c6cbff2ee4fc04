use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use ngram_decoder::{DecodeOutput, DecoderConfig, NBestEntry};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Report {
    pub generated_at: String,
    pub scenario: String,
    pub config: DecoderConfig,
    pub summary: Summary,
    pub utterances: Vec<UtteranceReport>,
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub n_utterances: usize,
    pub n_failed: usize,
    pub n_degraded: usize,
    pub total_frames: usize,
    pub total_elapsed_ms: f64,
}

impl Summary {
    pub fn from_utterances(utterances: &[UtteranceReport]) -> Self {
        let decoded = utterances.iter().filter_map(|u| u.output.as_ref());
        Self {
            n_utterances: utterances.len(),
            n_failed: utterances.iter().filter(|u| u.error.is_some()).count(),
            n_degraded: decoded.clone().filter(|o| o.is_degraded()).count(),
            total_frames: decoded.map(|o| o.n_frames).sum(),
            total_elapsed_ms: utterances.iter().map(|u| u.elapsed_ms).sum(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UtteranceReport {
    pub utterance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<DecodeOutput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nbest: Vec<NBestEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lattice_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: f64,
}

impl UtteranceReport {
    pub fn decoded(
        output: DecodeOutput,
        nbest: Vec<NBestEntry>,
        lattice_path: Option<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            utterance_id: output.utterance_id.clone(),
            output: Some(output),
            nbest,
            lattice_path,
            error: None,
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }

    pub fn failed(utterance_id: &str, error: String, elapsed: Duration) -> Self {
        Self {
            utterance_id: utterance_id.to_string(),
            output: None,
            nbest: Vec::new(),
            lattice_path: None,
            error: Some(error),
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        }
    }
}

pub fn write_report(path: &Path, report: &Report) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            format!(
                "Failed to create report output directory '{}': {err}",
                parent.display()
            )
        })?;
    }

    let mut file = File::create(path)
        .map_err(|err| format!("Failed to create report file '{}': {err}", path.display()))?;
    serde_json::to_writer_pretty(&mut file, report).map_err(|err| {
        format!(
            "Failed to serialize report JSON '{}': {err}",
            path.display()
        )
    })?;
    file.write_all(b"\n")
        .map_err(|err| format!("Failed to finalize report file '{}': {err}", path.display()))?;
    Ok(())
}
