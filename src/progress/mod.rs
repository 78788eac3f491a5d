mod reporter;
mod types;

pub use reporter::{BroadcastReporter, FanoutReporter, ProgressReporter, TracingReporter};
pub use types::{ProgressEvent, ProgressEventKind};
