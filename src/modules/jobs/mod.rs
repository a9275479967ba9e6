pub mod memory;
pub mod model;
pub mod repository;
pub mod store;

pub use memory::MemoryJobStore;
pub use model::{ClaimedJob, EncodeOutputs, Job, JobStatus, QueueStats};
pub use repository::PgJobStore;
pub use store::{JobStore, StoreError, StoreResult};
