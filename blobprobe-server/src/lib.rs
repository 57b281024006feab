//! The command line front end of blobprobe.
//!
//! This builds on top of [`blobprobe_service`], loading the configuration, wiring up logging and
//! error reporting, and executing a single run whose record is printed to stdout.
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod observability;
