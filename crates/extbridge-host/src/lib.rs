//! Library entry points for the extension bridge daemon.

pub mod app;
pub mod config;
pub mod controller;
pub mod worker_transport;
