//! Test utilities for blobprobe.
//!
//! This crate provides utilities to facilitate testing of blobprobe and its storage
//! backends. See the modules for all available utilities.

pub mod server;
pub mod tracing;
