//! Classifier-free guidance over the token-conditioned transformer.

use candle_core::Tensor;

use super::token_conditioned::{ForwardOptions, TokenConditionedTransformer};
use crate::Result;

/// Blend conditioned and null logits: `null + (cond - null) * scale`.
pub fn apply_cfg(cond: &Tensor, null: &Tensor, cond_scale: f64) -> Result<Tensor> {
    Ok(((cond - null)? * cond_scale)?.add(null)?)
}

impl TokenConditionedTransformer {
    /// Forward pass with classifier-free guidance.
    ///
    /// Runs once with the condition kept (drop probability 0) and, unless
    /// `cond_scale == 1` or the model is unconditioned, once more with the
    /// condition fully dropped. `opts.cond_drop_prob` is ignored.
    pub fn forward_with_cond_scale(
        &self,
        all_token_ids: &[Tensor],
        opts: ForwardOptions<'_>,
        cond_scale: f64,
    ) -> Result<Vec<Option<Tensor>>> {
        let cond_opts = ForwardOptions {
            cond_drop_prob: Some(0.0),
            ..opts
        };
        let cond_logits = self.forward(all_token_ids, cond_opts)?;

        if cond_scale == 1.0 {
            return Ok(cond_logits);
        }
        if !self.has_condition() {
            tracing::debug!(cond_scale, "unconditioned model, ignoring guidance scale");
            return Ok(cond_logits);
        }

        let null_opts = ForwardOptions {
            cond_drop_prob: Some(1.0),
            ..opts
        };
        let null_logits = self.forward(all_token_ids, null_opts)?;

        cond_logits
            .into_iter()
            .zip(null_logits)
            .map(|pair| match pair {
                (Some(cond), Some(null)) => apply_cfg(&cond, &null, cond_scale).map(Some),
                _ => Ok(None),
            })
            .collect()
    }
}
