pub mod fetch;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod submission;
pub mod worker;
