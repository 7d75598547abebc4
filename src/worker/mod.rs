//! Worker gateway: invocation, output streaming, result parsing and failover

pub mod failover;
pub mod process;
pub mod results;
pub mod signatures;
pub mod template;

pub use failover::{describe_chain, AttemptFailure, AttemptRecord, BatchOutcome, FailoverGateway};
pub use process::{invoke, OutputLine, OutputSink, Stream, WorkerHandle};
pub use results::{
    collect_results, default_result, parse_results, ParseOutcome, ResultStatus, WorkerResult,
};
pub use template::InvocationContext;
