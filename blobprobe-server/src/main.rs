//! Measures the latency of a single blob lifecycle against a storage account.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use std::process::ExitCode;

use anyhow::Result;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<ExitCode> {
    blobprobe_server::cli::execute()
}
