//! Observability of the driver's behaviour: counters the host application
//! can scrape. Structured logging is emitted throughout the crate via
//! `tracing` and needs no support code here.

pub mod metrics;
