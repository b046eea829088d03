//! Baleen: rollout collection and training-batch packing for GRPO-style
//! LLM fine-tuning loops.
//!
//! Each iteration samples many candidate completions per task from the
//! current model, grades them, converts rewards into group-relative
//! advantages, and bin-packs the advantage-bearing rollouts into
//! fixed-length buffers for an external fine-tuning step.

pub mod config;
pub mod metrics;
pub mod model;
pub mod rollout;
pub mod store;
pub mod training;
