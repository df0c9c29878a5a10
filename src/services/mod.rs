pub mod gpu;
pub mod job_registry;
pub mod separation;
pub mod separator;
pub mod storage;
pub mod worker;
