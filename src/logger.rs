//! The diagnostic surface: every entry goes to the local stderr, and, when
//! running in the executor process itself, out as a Log frame too.
//!
//! The pid recorded by [`init`] gates the framing: between `fork` and
//! `exec` a child runs this same code, and a child must never write to the
//! scheduler stream. Failed expectations exit quietly with the diagnostic;
//! fatal assertions add a backtrace first.

use crate::msg;
use backtrace::Backtrace;
use nix::{errno::Errno, time::ClockId, unistd};
use std::{
	io::{self, Write}, os::unix::io::BorrowedFd, process, sync::atomic::{AtomicI32, Ordering}
};

static PARENT: AtomicI32 = AtomicI32::new(0);

/// stdout is owned by the scheduler; LTX never closes it.
pub(crate) fn data_out() -> BorrowedFd<'static> {
	unsafe { BorrowedFd::borrow_raw(1) }
}

/// Records the executor pid; Log frames are suppressed in any other process.
pub fn init() {
	PARENT.store(unistd::getpid().as_raw(), Ordering::Relaxed);
}

pub fn in_parent() -> bool {
	unistd::getpid().as_raw() == PARENT.load(Ordering::Relaxed)
}

/// Monotonic nanoseconds for frame timestamps. The raw clock is immune to
/// NTP slew; older kernels without it fall back to the adjusted one.
pub fn now_ns() -> u64 {
	let ts = nix::time::clock_gettime(ClockId::CLOCK_MONOTONIC_RAW)
		.or_else(|_| nix::time::clock_gettime(ClockId::CLOCK_MONOTONIC));
	match ts {
		Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
		Err(err) => {
			// cannot route through the frame path: it would need this clock
			let _ = writeln!(io::stderr(), "[logger] clock_gettime = {}", err);
			process::exit(1);
		}
	}
}

/// One line to the local stderr; `text` carries its own position prefix
/// and trailing newline.
pub fn line(text: &str) {
	let _ = io::stderr().write_all(text.as_bytes());
}

/// Best effort: the stream is non-blocking and may already be gone, and
/// this runs on the way out of a process that has nothing left to lose.
fn emit_frame(text: &str) {
	if !in_parent() {
		return;
	}
	let frame = msg::log_frame(None, now_ns(), text.as_bytes());
	let mut off = 0;
	while off < frame.len() {
		match unistd::write(data_out(), &frame[off..]) {
			Ok(n) => off += n,
			Err(Errno::EINTR) => continue,
			Err(_) => break,
		}
	}
}

/// Failed expectation: diagnostic on both channels, exit 1.
pub fn fail(text: String) -> ! {
	line(&text);
	emit_frame(&text);
	process::exit(1);
}

/// Fatal assertion: like [`fail`] plus a stderr backtrace.
pub fn fatal(text: String) -> ! {
	line(&text);
	let _ = writeln!(io::stderr(), "{:?}", Backtrace::new());
	emit_frame(&text);
	process::exit(1);
}

/// Fatal assertion with the call site baked in.
#[macro_export]
macro_rules! fatal {
	($fmt:literal $(, $arg:expr)* $(,)?) => {
		$crate::logger::fatal(format!(
			concat!("[", file!(), ":", line!(), "] ", $fmt, "\n") $(, $arg)*
		))
	};
}

/// Failed expectation with the call site baked in; no backtrace.
#[macro_export]
macro_rules! fail {
	($fmt:literal $(, $arg:expr)* $(,)?) => {
		$crate::logger::fail(format!(
			concat!("[", file!(), ":", line!(), "] ", $fmt, "\n") $(, $arg)*
		))
	};
}

/// Unwraps a syscall result; an `Err` is a failed expectation carrying the
/// expression text and the symbolic errno.
#[macro_export]
macro_rules! check {
	($e:expr) => {
		match $e {
			Ok(v) => v,
			Err(err) => $crate::logger::fail(format!(
				concat!("[", file!(), ":", line!(), "] {} = {}\n"),
				stringify!($e),
				err
			)),
		}
	};
}

/// Logs through the agent so the frame rides the output buffer in order
/// with the surrounding protocol traffic.
#[macro_export]
macro_rules! diag {
	($agent:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
		$agent.log(format!(
			concat!("[", file!(), ":", line!(), "] ", $fmt, "\n") $(, $arg)*
		))
	};
}
