//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

use std::io;

use structured_logger::Builder;
use structured_logger::json::new_writer;

fn setup_logging() {
    Builder::with_level("info")
        .with_target_writer("*", new_writer(io::stderr()))
        .init();
}

fn main() {
    setup_logging();
    if let Err(err) = meridian_cli::run() {
        eprintln!("meridian: {err}");
        std::process::exit(1);
    }
}
