use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DecoderError;
use crate::logmath::{LogMath, Score};

/// Decoder tuning knobs, expressed as probabilities and weights the way the
/// command-line decoders of the Sphinx family take them. `resolve` turns
/// them into integer log-domain parameters for the search passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub log_base: f64,
    /// HMM pruning beam of the tree pass.
    pub beam: f64,
    /// Word-exit beam of the tree pass.
    pub wbeam: f64,
    /// Phone-transition beam of the tree pass.
    pub pbeam: f64,
    pub lw: f64,
    pub wip: f64,
    pub pip: f64,
    pub silprob: f64,
    pub fillprob: f64,
    /// Active HMM cap per frame; 0 disables histogram pruning.
    pub max_hmm_per_frame: usize,
    /// Word-exit cap per frame; 0 disables it.
    pub max_words_per_frame: usize,
    /// Consecutive collapsed frames after which the search re-seeds.
    pub max_collapse_frames: usize,
    pub fwdflat: bool,
    pub fwdflat_beam: f64,
    pub fwdflat_wbeam: f64,
    pub fwdflat_lw: f64,
    pub fwdflat_sf_window: usize,
    pub bestpath: bool,
    /// Acoustic scale divisor for lattice posteriors.
    pub ascale: f64,
    /// Posterior threshold below which lattice arcs are dropped; 0 keeps all.
    pub lattice_beam: f64,
    pub strict_vocabulary: bool,
}

impl DecoderConfig {
    pub const DEFAULT_BEAM: f64 = 1e-48;
    pub const DEFAULT_WBEAM: f64 = 7e-29;
    pub const DEFAULT_PBEAM: f64 = 1e-48;
    pub const DEFAULT_LW: f64 = 6.5;
    pub const DEFAULT_WIP: f64 = 0.65;
    pub const DEFAULT_PIP: f64 = 1.0;
    pub const DEFAULT_SILPROB: f64 = 0.005;
    pub const DEFAULT_FILLPROB: f64 = 1e-8;
    pub const DEFAULT_MAX_HMM_PER_FRAME: usize = 30_000;
    pub const DEFAULT_MAX_COLLAPSE_FRAMES: usize = 3;
    pub const DEFAULT_FWDFLAT_BEAM: f64 = 1e-64;
    pub const DEFAULT_FWDFLAT_WBEAM: f64 = 7e-29;
    pub const DEFAULT_FWDFLAT_LW: f64 = 8.5;
    pub const DEFAULT_FWDFLAT_SF_WINDOW: usize = 25;
    pub const DEFAULT_ASCALE: f64 = 20.0;
    pub const DEFAULT_LATTICE_BEAM: f64 = 1e-5;

    pub fn load(path: &Path) -> Result<Self, DecoderError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| DecoderError::io("read decoder config", e))?;
        serde_json::from_str(&data).map_err(|e| DecoderError::json("parse decoder config", e))
    }

    /// Validates the configuration and converts it to search parameters.
    pub fn resolve(&self) -> Result<SearchParams, DecoderError> {
        let logmath = LogMath::new(self.log_base)?;

        for (name, value) in [
            ("beam", self.beam),
            ("wbeam", self.wbeam),
            ("pbeam", self.pbeam),
            ("fwdflat_beam", self.fwdflat_beam),
            ("fwdflat_wbeam", self.fwdflat_wbeam),
            ("silprob", self.silprob),
            ("fillprob", self.fillprob),
        ] {
            check_probability(name, value)?;
        }
        for (name, value) in [
            ("lw", self.lw),
            ("fwdflat_lw", self.fwdflat_lw),
            ("wip", self.wip),
            ("pip", self.pip),
            ("ascale", self.ascale),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(DecoderError::config(format!(
                    "{name} must be a positive finite number, got {value}"
                )));
            }
        }
        if self.pip > 1.0 {
            return Err(DecoderError::config(format!(
                "pip must not exceed 1.0, got {}",
                self.pip
            )));
        }
        if !self.lattice_beam.is_finite() || !(0.0..=1.0).contains(&self.lattice_beam) {
            return Err(DecoderError::config(format!(
                "lattice_beam must lie in [0, 1], got {}",
                self.lattice_beam
            )));
        }
        if self.max_collapse_frames == 0 {
            return Err(DecoderError::config("max_collapse_frames must be at least 1"));
        }

        let tree = PassParams {
            beam: logmath.log(self.beam),
            pbeam: logmath.log(self.pbeam),
            wbeam: logmath.log(self.wbeam),
            lw: self.lw,
            wip: logmath.log(self.wip),
            pip: logmath.log(self.pip),
            silence_penalty: logmath.from_ln(self.lw * self.silprob.ln()),
            filler_penalty: logmath.from_ln(self.lw * self.fillprob.ln()),
            max_hmm_per_frame: self.max_hmm_per_frame,
            max_words_per_frame: self.max_words_per_frame,
            max_collapse_frames: self.max_collapse_frames,
        };
        let flat = PassParams {
            beam: logmath.log(self.fwdflat_beam),
            pbeam: logmath.log(self.fwdflat_beam),
            wbeam: logmath.log(self.fwdflat_wbeam),
            lw: self.fwdflat_lw,
            silence_penalty: logmath.from_ln(self.fwdflat_lw * self.silprob.ln()),
            filler_penalty: logmath.from_ln(self.fwdflat_lw * self.fillprob.ln()),
            ..tree.clone()
        };

        Ok(SearchParams {
            logmath,
            tree,
            flat,
            fwdflat: self.fwdflat,
            fwdflat_sf_window: self.fwdflat_sf_window,
            bestpath: self.bestpath,
            posterior_scale: 1.0 / self.ascale,
            lattice_beam: if self.lattice_beam > 0.0 {
                Some(self.lattice_beam.ln())
            } else {
                None
            },
            strict_vocabulary: self.strict_vocabulary,
        })
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            log_base: LogMath::DEFAULT_BASE,
            beam: Self::DEFAULT_BEAM,
            wbeam: Self::DEFAULT_WBEAM,
            pbeam: Self::DEFAULT_PBEAM,
            lw: Self::DEFAULT_LW,
            wip: Self::DEFAULT_WIP,
            pip: Self::DEFAULT_PIP,
            silprob: Self::DEFAULT_SILPROB,
            fillprob: Self::DEFAULT_FILLPROB,
            max_hmm_per_frame: Self::DEFAULT_MAX_HMM_PER_FRAME,
            max_words_per_frame: 0,
            max_collapse_frames: Self::DEFAULT_MAX_COLLAPSE_FRAMES,
            fwdflat: true,
            fwdflat_beam: Self::DEFAULT_FWDFLAT_BEAM,
            fwdflat_wbeam: Self::DEFAULT_FWDFLAT_WBEAM,
            fwdflat_lw: Self::DEFAULT_FWDFLAT_LW,
            fwdflat_sf_window: Self::DEFAULT_FWDFLAT_SF_WINDOW,
            bestpath: true,
            ascale: Self::DEFAULT_ASCALE,
            lattice_beam: Self::DEFAULT_LATTICE_BEAM,
            strict_vocabulary: false,
        }
    }
}

fn check_probability(name: &str, value: f64) -> Result<(), DecoderError> {
    if value.is_nan() || value <= 0.0 || value > 1.0 {
        return Err(DecoderError::config(format!(
            "{name} must be a probability in (0, 1], got {value}"
        )));
    }
    Ok(())
}

/// Per-pass search parameters in `LogMath` units. Beams are negative
/// offsets from the frame's best score.
#[derive(Debug, Clone, PartialEq)]
pub struct PassParams {
    pub beam: Score,
    pub pbeam: Score,
    pub wbeam: Score,
    pub lw: f64,
    pub wip: Score,
    pub pip: Score,
    pub silence_penalty: Score,
    pub filler_penalty: Score,
    pub max_hmm_per_frame: usize,
    pub max_words_per_frame: usize,
    pub max_collapse_frames: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub logmath: LogMath,
    pub tree: PassParams,
    pub flat: PassParams,
    pub fwdflat: bool,
    pub fwdflat_sf_window: usize,
    pub bestpath: bool,
    /// Multiplier applied to natural-log arc scores before forward-backward.
    pub posterior_scale: f64,
    /// Natural-log posterior threshold for lattice pruning.
    pub lattice_beam: Option<f64>,
    pub strict_vocabulary: bool,
}
