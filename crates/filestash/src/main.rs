//! Filestash.
//!
//! Command line access to a file-backed cache directory: list its entries, evict keys, locate
//! data files and remove expired entries.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod commands;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
