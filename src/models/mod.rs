pub mod api;
pub mod directive;
pub mod job;
