//! Forward-backward over the lattice DAG.

use crate::error::DecoderError;
use crate::lattice::Lattice;
use crate::logmath::{log_sum_exp, LogMath};

impl Lattice {
    /// Computes forward (alpha) and backward (beta) log masses and the
    /// posterior of every arc. Arc weights are `scale * ln(ascr + lscr)`,
    /// so a scale below one flattens the acoustic peaks.
    pub fn compute_posteriors(&mut self, logmath: &LogMath, scale: f64) -> Result<(), DecoderError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(DecoderError::config(format!(
                "posterior scale must be positive, got {scale}"
            )));
        }
        let order = self.topological_order()?;
        let weights: Vec<f64> = self
            .arcs
            .iter()
            .map(|a| scale * logmath.ln(a.score()))
            .collect();

        let n = self.nodes.len();
        let mut alpha = vec![f64::NEG_INFINITY; n];
        alpha[self.start] = 0.0;
        for &node in &order {
            for &a in &self.out_arcs[node] {
                let to = self.arcs[a].to;
                alpha[to] = log_sum_exp(alpha[to], alpha[node] + weights[a]);
            }
        }

        let mut beta = vec![f64::NEG_INFINITY; n];
        beta[self.end] = 0.0;
        for &node in order.iter().rev() {
            for &a in &self.in_arcs[node] {
                let from = self.arcs[a].from;
                beta[from] = log_sum_exp(beta[from], beta[node] + weights[a]);
            }
        }

        let total = alpha[self.end];
        if !total.is_finite() {
            return Err(DecoderError::corrupt_lattice(format!(
                "forward mass of the end node is {total}"
            )));
        }
        let backward_total = beta[self.start];
        if !backward_total.is_finite() || (backward_total - total).abs() > 1e-6 * total.abs().max(1.0) {
            return Err(DecoderError::corrupt_lattice(format!(
                "forward mass {total} and backward mass {backward_total} disagree"
            )));
        }

        for (i, arc) in self.arcs.iter_mut().enumerate() {
            let posterior = alpha[arc.from] + weights[i] + beta[arc.to] - total;
            if !posterior.is_finite() {
                return Err(DecoderError::corrupt_lattice(format!(
                    "arc {} -> {} has posterior {posterior}",
                    arc.from, arc.to
                )));
            }
            arc.alpha = alpha[arc.from];
            arc.beta = beta[arc.to];
            arc.posterior = posterior.min(0.0);
        }

        self.node_alpha = alpha;
        self.node_beta = beta;
        self.total = Some(total);
        Ok(())
    }

    pub fn has_posteriors(&self) -> bool {
        self.total.is_some()
    }

    /// Log mass of all complete paths.
    pub fn total_log_mass(&self) -> Option<f64> {
        self.total
    }

    /// Natural-log posterior of passing through `node`.
    pub fn node_posterior(&self, node: usize) -> Option<f64> {
        let total = self.total?;
        Some((self.node_alpha[node] + self.node_beta[node] - total).min(0.0))
    }

    /// Drops arcs whose posterior is below `min_ln_posterior`, except those
    /// on the best path, then removes nodes left off every complete path.
    /// Posteriors must be recomputed afterwards. Returns the number of arcs
    /// removed.
    pub fn prune_by_posterior(&mut self, min_ln_posterior: f64) -> Result<usize, DecoderError> {
        if !self.has_posteriors() {
            return Err(DecoderError::corrupt_lattice(
                "posteriors must be computed before pruning",
            ));
        }
        let best = self.best_path()?;
        let mut keep: Vec<bool> = self
            .arcs
            .iter()
            .map(|a| a.posterior >= min_ln_posterior)
            .collect();
        for &a in &best.arcs {
            keep[a] = true;
        }
        let before = self.arcs.len();
        self.retain_arcs(&keep)?;
        let removed = before - self.arcs.len();
        tracing::debug!(
            utterance_id = %self.utterance_id,
            removed,
            remaining = self.arcs.len(),
            "lattice pruned by posterior"
        );
        Ok(removed)
    }
}
