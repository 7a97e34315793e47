pub mod memory;
pub mod model;
pub mod repo;
pub mod store;

pub use memory::InMemoryJobStore;
pub use model::{Job, JobId, JobStatus, NewJob, StatusCounts};
pub use repo::JobsRepo;
pub use store::JobStore;
