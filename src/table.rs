//! The child table: one slot per concurrently running command.
//!
//! Slot ids are assigned by the scheduler and echoed back in Log and
//! Result frames; they are a single byte with the top bit reserved, so the
//! table holds exactly 127 entries and id 127 is forbidden. A slot stays
//! occupied until its child's Result has been emitted and its pipe has hit
//! EOF — only then may the scheduler reuse the id.

use nix::unistd::Pid;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

pub const SLOTS: usize = 127;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TableError {
	OutOfRange,
	Occupied,
}

#[derive(Debug)]
struct Child {
	pid: Pid,
	/// Read end of the pipe carrying the child's merged stdout+stderr;
	/// taken on EOF.
	pipe: Option<OwnedFd>,
	/// `(si_code, si_status)` once the exit has been observed.
	exit: Option<(u8, u8)>,
}

#[derive(Debug)]
pub struct ChildTable {
	slots: [Option<Child>; SLOTS],
}

impl ChildTable {
	pub fn new() -> Self {
		Self { slots: std::array::from_fn(|_| None) }
	}

	pub fn occupied(&self, slot: u8) -> bool {
		usize::from(slot) < SLOTS && self.slots[usize::from(slot)].is_some()
	}

	pub fn allocate(&mut self, slot: u8, pid: Pid, pipe: OwnedFd) -> Result<(), TableError> {
		let entry = self.slots.get_mut(usize::from(slot)).ok_or(TableError::OutOfRange)?;
		if entry.is_some() {
			return Err(TableError::Occupied);
		}
		*entry = Some(Child { pid, pipe: Some(pipe), exit: None });
		Ok(())
	}

	/// Linear scan; the table is small and exits are rare events.
	pub fn find_by_pid(&self, pid: Pid) -> Option<u8> {
		self.slots
			.iter()
			.position(|slot| slot.as_ref().is_some_and(|child| child.pid == pid))
			.map(|idx| idx as u8)
	}

	/// Stores the exit record for `pid` and returns its slot. `None` when
	/// the pid is unknown or its exit was already recorded.
	pub fn record_exit(&mut self, pid: Pid, code: u8, status: u8) -> Option<u8> {
		let slot = self.find_by_pid(pid)?;
		let child = self.slots[usize::from(slot)].as_mut().unwrap();
		if child.exit.is_some() {
			return None;
		}
		child.exit = Some((code, status));
		Some(slot)
	}

	pub fn exit_of(&self, slot: u8) -> Option<(u8, u8)> {
		self.slots.get(usize::from(slot))?.as_ref()?.exit
	}

	pub fn pipe_fd(&self, slot: u8) -> Option<RawFd> {
		let child = self.slots.get(usize::from(slot))?.as_ref()?;
		child.pipe.as_ref().map(AsRawFd::as_raw_fd)
	}

	pub fn pipe_closed(&self, slot: u8) -> bool {
		match self.slots.get(usize::from(slot)).and_then(Option::as_ref) {
			Some(child) => child.pipe.is_none(),
			None => true,
		}
	}

	/// Takes the pipe out of the slot; dropping the returned fd closes it.
	pub fn close_pipe(&mut self, slot: u8) -> Option<OwnedFd> {
		self.slots.get_mut(usize::from(slot))?.as_mut()?.pipe.take()
	}

	/// Frees the slot for reuse. Call only after the Result frame is out
	/// and the pipe has been closed.
	pub fn release(&mut self, slot: u8) {
		debug_assert!(self.pipe_closed(slot));
		self.slots[usize::from(slot)] = None;
	}
}
