//! The owning context and the event loop.
//!
//! One `Agent` owns everything the process mutates: the two stream
//! buffers, the epoll reactor, the SIGCHLD signalfd and the child table.
//! All of it is touched only from [`Agent::run`]'s dispatch, so there is
//! no locking anywhere — the only parallelism in the program is between
//! the executor and the children it forks.

use crate::{
	buf::{self, IoBuf}, check, codec::DecodeError, diag, exec, fail, fatal, logger, msg::{self, Request}, reactor::{Reactor, Source}, table::ChildTable
};
use log::trace;
use nix::{
	errno::Errno, fcntl::{self, FcntlArg, OFlag}, libc, sys::{
		epoll::{EpollEvent, EpollFlags}, sendfile::sendfile, signal::{self, SigSet, SigmaskHow, Signal}, signalfd::{SfdFlags, SignalFd}, wait::{self, WaitPidFlag, WaitStatus}
	}, unistd::{self, Pid}
};
use std::{
	ffi::CStr, fs::File, os::unix::io::{AsFd, AsRawFd, RawFd}, path::Path
};

const DATA_IN: RawFd = 0;
const DATA_OUT: RawFd = 1;

/// Largest single read off a child pipe.
const CHUNK: usize = 1024;
/// Worst-case Log frame header in front of a chunk.
const LOG_OVERHEAD: usize = 16;
/// Above this much queued output, drain before decoding further input.
const HIGH_WATER: usize = buf::CAPACITY / 4;
const MAX_EVENTS: usize = 64;
const WAIT_MS: isize = 100;

fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
	loop {
		match f() {
			Err(Errno::EINTR) => continue,
			result => return result,
		}
	}
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) {
	let bits = check!(fcntl::fcntl(fd, FcntlArg::F_GETFL));
	let mut flags = OFlag::from_bits_retain(bits);
	flags.set(OFlag::O_NONBLOCK, nonblocking);
	let _ = check!(fcntl::fcntl(fd, FcntlArg::F_SETFL(flags)));
}

/// Scoped blocking window for the bulk transfer; restores `O_NONBLOCK`
/// on every exit path.
#[derive(Debug)]
struct Blocking {
	fd: RawFd,
}

impl Blocking {
	fn begin(fd: RawFd) -> Self {
		set_nonblocking(fd, false);
		Self { fd }
	}
}

impl Drop for Blocking {
	fn drop(&mut self) {
		set_nonblocking(self.fd, true);
	}
}

#[derive(Debug)]
pub struct Agent {
	reactor: Reactor,
	sigfd: SignalFd,
	in_buf: IoBuf,
	out_buf: IoBuf,
	table: ChildTable,
	out_blocked: bool,
	stop: bool,
}

impl Agent {
	pub fn new() -> Self {
		logger::init();
		// SIGCHLD has to be blocked before the first fork so no exit can
		// slip past the signalfd. Children inherit the mask but keep the
		// default disposition and run normally.
		let mut mask = SigSet::empty();
		mask.add(Signal::SIGCHLD);
		check!(signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None));
		let sigfd = check!(SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK));
		let reactor = check!(Reactor::new());
		set_nonblocking(DATA_OUT, true);
		check!(reactor.add(DATA_IN, Source::SchedIn, EpollFlags::EPOLLIN));
		check!(reactor.add(DATA_OUT, Source::SchedOut, EpollFlags::EPOLLOUT | EpollFlags::EPOLLET));
		check!(reactor.add(sigfd.as_raw_fd(), Source::Sigchld, EpollFlags::EPOLLIN));
		Self {
			reactor,
			sigfd,
			in_buf: IoBuf::new(),
			out_buf: IoBuf::new(),
			table: ChildTable::new(),
			out_blocked: false,
			stop: false,
		}
	}

	/// Runs until the scheduler hangs up, then finishes pending drains.
	pub fn run(&mut self) {
		diag!(self, "Linux Test Executor {}", crate::VERSION);
		self.drain_out();
		let mut events = [EpollEvent::empty(); MAX_EVENTS];
		while !self.stop {
			let n = match self.reactor.wait(&mut events, WAIT_MS) {
				Ok(n) => n,
				Err(Errno::EINTR) => 0,
				Err(err) => fail!("reactor.wait() = {}", err),
			};
			for event in &events[..n] {
				match Source::from_token(event.data()) {
					Some(source) => self.dispatch(source, event.events()),
					None => fatal!("unknown event token {}", event.data()),
				}
			}
			if !self.out_blocked && !self.out_buf.is_empty() {
				self.drain_out();
			}
		}
		diag!(self, "Linux Test Executor exiting");
		let _blocking = Blocking::begin(DATA_OUT);
		self.flush_out();
	}

	fn dispatch(&mut self, source: Source, flags: EpollFlags) {
		trace!("event {:?} {:?}", source, flags);
		match source {
			Source::SchedIn => self.on_sched_in(flags),
			Source::SchedOut => self.on_sched_out(),
			Source::Sigchld => self.on_sigchld(),
			Source::ChildOut { slot } => self.on_child_out(slot),
		}
	}

	fn on_sched_out(&mut self) {
		self.out_blocked = false;
		// A high-water deferral can leave whole messages parked in the
		// input buffer with no stdin readiness left to revive them; the
		// writable edge is the signal that the channel drained, so the
		// paused pass resumes here.
		if !self.in_buf.is_empty() {
			self.process_input();
		}
	}

	fn on_sched_in(&mut self, flags: EpollFlags) {
		if flags.contains(EpollFlags::EPOLLIN) {
			if self.in_buf.avail() == 0 {
				fatal!("input buffer overflow: {} byte message still incomplete", self.in_buf.len());
			}
			let result = retry_eintr(|| unistd::read(DATA_IN, self.in_buf.spare()));
			match result {
				Ok(0) => self.stop = true,
				Ok(n) => {
					self.in_buf.fill(n);
					self.process_input();
				}
				Err(Errno::EAGAIN) => {}
				Err(err) => fail!("read(data_in) = {}", err),
			}
		} else if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
			self.stop = true;
		}
	}

	/// Decodes as many whole messages as the input holds, acknowledging
	/// each by echoing its bytes, then compacts the residue.
	fn process_input(&mut self) {
		loop {
			if self.out_buf.len() >= HIGH_WATER {
				self.drain_out();
				if self.out_blocked && self.out_buf.len() >= HIGH_WATER {
					break;
				}
			}
			let (request, span) = match Request::decode(self.in_buf.data()) {
				Ok(decoded) => decoded,
				Err(DecodeError::Short) => break,
				Err(DecodeError::Malformed(what)) => fatal!("protocol violation: {}", what),
			};
			self.echo(span);
			self.in_buf.consume(span);
			match request {
				Request::Ping => self.handle_ping(),
				Request::Exec { slot, path } => self.handle_exec(slot, &path),
				Request::GetFile { path } => self.handle_get_file(&path),
			}
		}
		self.in_buf.compact();
	}

	/// The acknowledgement for every accepted request: its own bytes,
	/// straight back.
	fn echo(&mut self, span: usize) {
		let Self { in_buf, out_buf, .. } = self;
		if out_buf.append(&in_buf.data()[..span]).is_err() {
			fatal!("output buffer overflow: {} + {} bytes", out_buf.len(), span);
		}
	}

	fn push(&mut self, frame: &[u8]) {
		if self.out_buf.append(frame).is_err() {
			fatal!("output buffer overflow: {} + {} bytes", self.out_buf.len(), frame.len());
		}
	}

	fn handle_ping(&mut self) {
		let frame = msg::pong_frame(logger::now_ns());
		self.push(&frame);
	}

	fn handle_exec(&mut self, slot: u8, path: &CStr) {
		trace!("exec slot {} path {:?}", slot, path);
		if self.table.occupied(slot) {
			fatal!("table id {} is already occupied", slot);
		}
		let (pid, pipe) = check!(exec::spawn(path));
		let raw = pipe.as_raw_fd();
		if let Err(err) = self.table.allocate(slot, pid, pipe) {
			fatal!("table id {}: {:?}", slot, err);
		}
		check!(self.reactor.add(raw, Source::ChildOut { slot }, EpollFlags::EPOLLIN));
	}

	fn handle_get_file(&mut self, path: &Path) {
		let file = check!(File::open(path));
		let len = check!(file.metadata()).len();
		if len > u64::from(u32::MAX) {
			fatal!("{} byte file does not fit a bin32 payload", len);
		}
		let header = msg::data_frame_header(len);
		self.push(&header);
		// The bulk send runs with the stream blocking so the transfer
		// always completes; queued frames go out first, in order.
		let _blocking = Blocking::begin(DATA_OUT);
		self.flush_out();
		let mut remaining = len as usize;
		while remaining > 0 {
			let count = remaining;
			let sent = check!(retry_eintr(|| {
				sendfile(logger::data_out(), file.as_fd(), None, count)
			}));
			if sent == 0 {
				fatal!("sendfile stalled with {} bytes left", remaining);
			}
			remaining -= sent;
		}
		// the blocking window proved the stream writable again
		self.out_blocked = false;
	}

	fn on_sigchld(&mut self) {
		loop {
			let info = match self.sigfd.read_signal() {
				Ok(Some(info)) => info,
				Ok(None) => break,
				Err(err) => fail!("read_signal() = {}", err),
			};
			self.child_event(
				Pid::from_raw(info.ssi_pid as i32),
				info.ssi_code,
				info.ssi_status,
			);
		}
		// One SIGCHLD can stand for several exits; sweep for the rest.
		self.reap_sweep();
	}

	fn child_event(&mut self, pid: Pid, code: i32, status: i32) {
		if !matches!(code, libc::CLD_EXITED | libc::CLD_KILLED | libc::CLD_DUMPED) {
			return;
		}
		match wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
			// already reaped by an earlier sweep
			Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return,
			Ok(_) => {}
			Err(err) => fail!("waitpid({}) = {}", pid, err),
		}
		self.record_exit(pid, code as u8, status as u8);
	}

	fn reap_sweep(&mut self) {
		loop {
			match wait::waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
				Ok(WaitStatus::Exited(pid, status)) => {
					self.record_exit(pid, libc::CLD_EXITED as u8, status as u8);
				}
				Ok(WaitStatus::Signaled(pid, sig, dumped)) => {
					let code = if dumped { libc::CLD_DUMPED } else { libc::CLD_KILLED };
					self.record_exit(pid, code as u8, sig as i32 as u8);
				}
				Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
				Ok(_) => continue,
				Err(err) => fail!("waitpid(any) = {}", err),
			}
		}
	}

	fn record_exit(&mut self, pid: Pid, code: u8, status: u8) {
		let Some(slot) = self.table.record_exit(pid, code, status) else {
			trace!("exit of unknown pid {}", pid);
			return;
		};
		// The Result must trail every Log frame the pipe yields, so it
		// waits for EOF; the pipe is usually already closed by now.
		if self.table.pipe_closed(slot) {
			self.emit_result(slot);
		}
	}

	fn emit_result(&mut self, slot: u8) {
		let Some((code, status)) = self.table.exit_of(slot) else {
			fatal!("result for table id {} without an exit record", slot);
		};
		let frame = msg::result_frame(slot, logger::now_ns(), code, status);
		self.push(&frame);
		self.table.release(slot);
	}

	fn on_child_out(&mut self, slot: u8) {
		let Some(fd) = self.table.pipe_fd(slot) else {
			// stale readiness after EOF handling; nothing to do
			return;
		};
		if self.out_buf.avail() < CHUNK + LOG_OVERHEAD {
			self.drain_out();
			if self.out_buf.avail() < CHUNK + LOG_OVERHEAD {
				// blocked; level-triggered epoll re-delivers the chunk
				return;
			}
		}
		let mut chunk = [0u8; CHUNK];
		let result = retry_eintr(|| unistd::read(fd, &mut chunk));
		let n = match result {
			Ok(n) => n,
			Err(Errno::EAGAIN) => return,
			Err(err) => fail!("read(child pipe) = {}", err),
		};
		if n == 0 {
			check!(self.reactor.delete(fd));
			drop(self.table.close_pipe(slot));
			if self.table.exit_of(slot).is_some() {
				self.emit_result(slot);
			}
			return;
		}
		let frame = msg::log_frame(Some(slot), logger::now_ns(), &chunk[..n]);
		self.push(&frame);
	}

	/// Writes queued output until empty or the stream would block.
	fn drain_out(&mut self) {
		while !self.out_buf.is_empty() {
			let result = retry_eintr(|| unistd::write(logger::data_out(), self.out_buf.data()));
			match result {
				Ok(n) => self.out_buf.consume(n),
				Err(Errno::EAGAIN) => {
					self.out_blocked = true;
					break;
				}
				Err(err) => fail!("write(data_out) = {}", err),
			}
		}
		self.out_buf.compact();
	}

	/// Writes queued output to completion; the caller has already made the
	/// stream blocking.
	fn flush_out(&mut self) {
		while !self.out_buf.is_empty() {
			let result = retry_eintr(|| unistd::write(logger::data_out(), self.out_buf.data()));
			match result {
				Ok(n) => self.out_buf.consume(n),
				Err(err) => fail!("write(data_out) = {}", err),
			}
		}
	}

	/// Stderr line plus, in the executor process, a Log frame in order
	/// with the surrounding traffic.
	pub fn log(&mut self, text: String) {
		logger::line(&text);
		if logger::in_parent() {
			let frame = msg::log_frame(None, logger::now_ns(), text.as_bytes());
			self.push(&frame);
		}
	}
}
