//! The `ltx` binary: the Linux Test Executor.
//!
//! No flags, no configuration. The scheduler owns stdin and stdout and
//! drives the executor with framed MessagePack messages; stderr carries
//! human-readable diagnostics. Exit status is 0 on a clean input hangup
//! and 1 on any fatal assertion.
//!
//! ```text
//! ssh sut ltx
//! ```

#![warn(
	// missing_copy_implementations,
	missing_debug_implementations,
	// missing_docs,
	trivial_numeric_casts,
	unused_extern_crates,
	unused_import_braces,
	unused_qualifications,
	unused_results,
	clippy::pedantic,
)] // from https://github.com/rust-unofficial/patterns/blob/master/anti_patterns/deny-warnings.md

use ltx::agent::Agent;
use std::{env, process, thread};

fn main() {
	env::set_var("RUST_BACKTRACE", "full");
	std::panic::set_hook(Box::new(|info| {
		eprintln!(
			"thread '{}' {}",
			thread::current().name().unwrap_or("<unnamed>"),
			info
		);
		eprintln!("{:?}", backtrace::Backtrace::new());
		process::exit(1);
	}));
	Agent::new().run();
}
