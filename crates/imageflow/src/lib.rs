pub mod api;
pub mod config;
pub mod convert;
pub mod db;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod queue;
pub mod runner;
pub mod submit;
pub mod telemetry;
