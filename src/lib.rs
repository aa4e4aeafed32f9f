//! LTX ("Linux Test Executor") is a small, dumb agent that runs on a system
//! under test. A remote scheduler drives it over stdin/stdout with framed
//! MessagePack requests: run commands in parallel slots, stream back their
//! merged output and exit status, probe liveness, transfer files. The
//! transport (ssh, serial console, subprocess pipe) is the scheduler's
//! problem; LTX only ever sees the two byte streams.
//!
//! The crate is a library so each piece stays independently testable; the
//! `ltx` binary under `src/bin` is a thin shell around [`agent::Agent`].

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
#![allow(
	clippy::cast_possible_truncation,
	clippy::cast_sign_loss,
	clippy::module_name_repetitions,
	clippy::missing_errors_doc,
	clippy::missing_panics_doc,
	clippy::must_use_candidate
)]

pub mod agent;
pub mod buf;
pub mod codec;
pub mod exec;
pub mod logger;
pub mod msg;
pub mod reactor;
pub mod table;

/// Announced in the startup Log frame and nowhere else.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
