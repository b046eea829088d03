//! Group-relative advantage estimation.
//!
//! Converts a group of graded samples for one task into per-sample training
//! advantages by centering on the group mean:
//!
//!   A_i = R_i - mean({R_j})
//!
//! A sample whose advantage is exactly zero carries no learning signal and is
//! dropped before packing. Groups with identical rewards (including groups of
//! size one) therefore contribute nothing: group-relative training needs
//! within-group reward variance.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::rollout::types::{SampleGroup, Task};
use crate::training::pack::TokenizedResult;

/// Compute mean-centered advantages for a group of rewards.
///
/// # Edge cases
///
/// - If `rewards` is empty, returns an empty vector.
/// - If all rewards are identical (a size-1 group is a special case), every
///   advantage is exactly 0.0.
pub fn group_advantages(rewards: &[f64]) -> Vec<f64> {
    if rewards.is_empty() {
        return Vec::new();
    }
    let mean = rewards.iter().sum::<f64>() / rewards.len() as f64;
    rewards.iter().map(|r| r - mean).collect()
}

/// Apply advantages to graded groups and keep the samples worth training on.
///
/// Each surviving sample becomes a [`TokenizedResult`] carrying its task's
/// prompt tokens plus its own completion tokens. Samples with zero advantage
/// are excluded; samples whose completion token ids never arrived from the
/// backend cannot be packed and are skipped with a warning.
pub fn select_for_training(
    groups: &[SampleGroup],
    tasks: &[Arc<dyn Task>],
) -> Vec<TokenizedResult> {
    let prompts: HashMap<&str, &[u32]> = tasks
        .iter()
        .map(|task| (task.id(), task.prompt_tokens()))
        .collect();

    let mut results = Vec::new();
    for group in groups {
        let Some(prompt_tokens) = prompts.get(group.task_id.as_str()) else {
            warn!(task = %group.task_id, "group without a matching task, skipping");
            continue;
        };

        let advantages = group_advantages(&group.rewards());
        let mut kept = 0usize;
        for (sample, advantage) in group.samples.iter().zip(advantages) {
            if advantage == 0.0 {
                continue;
            }
            if sample.token_ids.is_empty() {
                warn!(
                    task = %sample.task_id,
                    choice = sample.choice_index,
                    "sample has no completion token ids, skipping"
                );
                continue;
            }
            kept += 1;
            results.push(TokenizedResult {
                task_id: sample.task_id.clone(),
                choice_index: sample.choice_index,
                prompt_tokens: prompt_tokens.to_vec(),
                completion_tokens: sample.token_ids.clone(),
                logprobs: sample.logprobs.clone(),
                reward: sample.reward,
                advantage,
            });
        }
        debug!(
            task = %group.task_id,
            group_size = group.samples.len(),
            kept,
            "advantages applied"
        );
    }
    results
}
