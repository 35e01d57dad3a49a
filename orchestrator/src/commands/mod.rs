pub mod job;
pub mod queue;
pub mod shared;
pub mod worker;
