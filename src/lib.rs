//! pdf2html tasks: background PDF-to-HTML conversion with polled status.

pub mod api;
pub mod config;
pub mod conversion;
pub mod error;
pub mod store;
pub mod tasks;
pub mod worker;
