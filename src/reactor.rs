//! A thin epoll wrapper dispatching on a closed set of event sources.
//!
//! Each registration packs a [`Source`] into the epoll data word; the
//! event loop decodes it back and matches. Child pipes carry their slot id
//! in the token, so the reactor needs no table back-pointers.

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use std::os::unix::io::{BorrowedFd, RawFd};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Source {
	/// Scheduler input (stdin), level-triggered readable.
	SchedIn,
	/// Scheduler output (stdout), edge-triggered writable.
	SchedOut,
	/// The SIGCHLD signalfd.
	Sigchld,
	/// A child's pipe read end.
	ChildOut { slot: u8 },
}

const CHILD_BASE: u64 = 0x100;

impl Source {
	fn token(self) -> u64 {
		match self {
			Source::SchedIn => 0,
			Source::SchedOut => 1,
			Source::Sigchld => 2,
			Source::ChildOut { slot } => CHILD_BASE | u64::from(slot),
		}
	}

	pub fn from_token(token: u64) -> Option<Self> {
		match token {
			0 => Some(Source::SchedIn),
			1 => Some(Source::SchedOut),
			2 => Some(Source::Sigchld),
			t if t & CHILD_BASE != 0 && t & !0x17f == 0 => {
				Some(Source::ChildOut { slot: (t & 0x7f) as u8 })
			}
			_ => None,
		}
	}
}

#[derive(Debug)]
pub struct Reactor {
	epoll: Epoll,
}

impl Reactor {
	pub fn new() -> nix::Result<Self> {
		Ok(Self { epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)? })
	}

	pub fn add(&self, fd: RawFd, source: Source, flags: EpollFlags) -> nix::Result<()> {
		// Registered fds outlive their registration; ownership stays with
		// the caller (the process for the std streams, the table for pipes).
		let fd = unsafe { BorrowedFd::borrow_raw(fd) };
		self.epoll.add(fd, EpollEvent::new(flags, source.token()))
	}

	pub fn delete(&self, fd: RawFd) -> nix::Result<()> {
		let fd = unsafe { BorrowedFd::borrow_raw(fd) };
		self.epoll.delete(fd)
	}

	pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: isize) -> nix::Result<usize> {
		let timeout = nix::sys::epoll::EpollTimeout::try_from(timeout_ms as i32).unwrap();
		self.epoll.wait(events, timeout)
	}
}
