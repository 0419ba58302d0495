//! Command dispatch: queues, completions and binary reassembly.

pub mod completion;
pub mod engine;
pub mod reassembly;

pub use completion::{CommandOutcome, CompletionHandle};
pub use engine::{DispatchEngine, QueuedCommand};
pub use reassembly::{Appended, ReassemblyTable};
