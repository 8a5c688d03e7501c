//! Bounded-concurrency pipeline that renders inbound email bodies into PDF documents.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
