pub mod call;
pub mod recorder;

pub use call::{CallOrigin, CallOutcome, OperationCall};
pub use recorder::{Trace, TraceRecorder};
