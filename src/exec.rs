//! Child launcher: merged stdout+stderr piped back to the executor.

use crate::check;
use nix::{
	fcntl::OFlag, unistd::{self, ForkResult, Pid}
};
use std::{
	ffi::CStr, os::unix::io::{AsRawFd, OwnedFd}
};

/// Forks and execs `path` with a single-element argv. The child's stdout
/// and stderr both point at the returned pipe's write end; the read end
/// comes back for the caller to register with the reactor.
pub fn spawn(path: &CStr) -> nix::Result<(Pid, OwnedFd)> {
	let (rd, wr) = unistd::pipe2(OFlag::O_CLOEXEC)?;
	match unsafe { unistd::fork() }? {
		ForkResult::Child => run_child(path, &wr),
		ForkResult::Parent { child } => {
			drop(wr);
			Ok((child, rd))
		}
	}
}

fn run_child(path: &CStr, wr: &OwnedFd) -> ! {
	// dup2 clears close-on-exec on the duplicates; every other descriptor
	// (the pipe ends, the epoll fd, the signalfd) closes across exec. The
	// inherited SIGCHLD mask stays in place; the disposition is default.
	let _ = check!(unistd::dup2(wr.as_raw_fd(), 1));
	let _ = check!(unistd::dup2(wr.as_raw_fd(), 2));
	// From here on stderr is the pipe, so a failed exec surfaces to the
	// scheduler as child output followed by a status-1 Result.
	let _ = check!(unistd::execvp(path, &[path]));
	unreachable!();
}
