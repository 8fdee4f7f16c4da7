//! Image Jobs
//!
//! Clients submit an image URL with an ordered list of directives and poll for the
//! outcome. Submission and execution are decoupled by a Redis work queue; the worker
//! drives each job through `PENDING -> PROCESSING -> COMPLETED | FAILED`.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
