//! Sync loop, progress tracking and reorg handling.

mod exception;
pub mod range;
mod reorg;
mod stream;
mod sync_recorder;

pub use exception::ExceptionRecorder;
pub use reorg::ReorgController;
pub use stream::{shutdown_channel, StreamController};
pub use sync_recorder::{create_recorder, default_recorder_spec, SyncRecorder};
