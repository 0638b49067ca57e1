//! The step loop, the stack resumer, and the run event vocabulary.

mod events;
mod resume;
mod step;

pub use events::{EventSink, RunEvent, RunOutcome, RunResult};
pub use resume::StackResumer;
pub use step::{LoopExit, LoopOutcome, ResumeMode, Runner, StepLoop};
