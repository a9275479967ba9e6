pub mod error;
pub mod pipeline;
pub mod pool;
pub mod worker;

pub use error::{PoolError, TranscodeError};
pub use pipeline::{EncodeOutput, TranscodePipeline};
pub use pool::{PoolConfig, TickReport, WorkerPool};
pub use worker::{JobOutcome, Worker, WorkerSettings, WorkerState};
