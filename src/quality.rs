//! Quality scoring for individual steps and whole jobs.
//!
//! Scores are stand-ins for real audio analysis: a step scores from its
//! tool's catalog quality factor with a small random perturbation, and the
//! job score is a weighted mean that favours later steps.

use rand::Rng;

use crate::catalog::ToolDescriptor;
use crate::config::QualityConfig;

/// Score given to a step whose tool reports a nominal quality factor of 1.0.
const BASE_STEP_SCORE: f64 = 0.75;

/// Score used when a job produced no steps at all.
const EMPTY_JOB_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Default)]
pub struct QualityAssessor {
    config: QualityConfig,
}

impl QualityAssessor {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Scores one completed step in `[0, 1]`.
    pub fn assess_step(&self, tool: &ToolDescriptor) -> f64 {
        let spread = self.config.perturbation.abs();
        let noise = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        (BASE_STEP_SCORE * tool.quality_factor + noise).clamp(0.0, 1.0)
    }

    /// Combines step scores, in execution order, into the job score.
    ///
    /// Weights rise linearly from 0.5 for the first step to 1.0 for the
    /// last. The completion bonus is added only if `all_succeeded`.
    pub fn assess_final(&self, scores: &[f64], all_succeeded: bool) -> f64 {
        if scores.is_empty() {
            return EMPTY_JOB_SCORE;
        }

        let n = scores.len();
        let weight = |i: usize| {
            if n == 1 {
                1.0
            } else {
                0.5 + 0.5 * i as f64 / (n - 1) as f64
            }
        };

        let (weighted, total) = scores
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(sum, total), (i, score)| {
                (sum + score * weight(i), total + weight(i))
            });
        let mut score = weighted / total;

        if all_succeeded {
            score += self.config.completion_bonus;
        }
        score.clamp(0.0, 1.0)
    }
}
