//! Training-side pipeline: advantages, packing, and the iteration loop.
//!
//! The actual forward/backward/optimizer step is an external collaborator
//! behind the [`iteration::FineTuner`] capability; this module owns
//! everything up to (and the bookkeeping after) that hand-off.

pub mod advantage;
pub mod iteration;
pub mod pack;

pub use advantage::{group_advantages, select_for_training};
pub use iteration::{FineTuner, IterationLoop, IterationReport, LocalFineTuner};
pub use pack::{pack, OversizedResult, PackError, PackOutput, PackedBuffer, Segment, TokenizedResult};
