//! Background audio processing for episodes.
//!
//! Episodes move `pending → processing → success | failed`. Handlers attach
//! audio, mark the episode `processing` and hand a [`ProcessingJob`] to the
//! [`ProcessingQueue`]; a worker runs [`EpisodeProcessor::process`] and
//! records exactly one terminal state.

mod error;
mod processor;
mod queue;

pub use error::{ProcessingError, ProcessingResult};
pub use processor::{EpisodeProcessor, ProcessingJob, ProcessingOutcome};
pub use queue::{ProcessingQueue, QueueStats};
