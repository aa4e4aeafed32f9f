//! Fixed-capacity byte buffers for the two scheduler streams.
//!
//! One producer, one consumer, no wraparound: bytes are appended at
//! `start + used` and consumed from `start`, and the residue is memmoved
//! back to offset zero after a processing pass. Overflow is not handled —
//! the backpressure contract makes it the peer's bug, and the caller
//! escalates [`Overflow`] to a fatal diagnostic.

/// Large enough for the largest protocol header plus the largest single
/// read; a Get-file body never touches the buffer.
pub const CAPACITY: usize = 8192;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Overflow;

#[derive(Debug)]
pub struct IoBuf {
	data: Box<[u8]>,
	start: usize,
	used: usize,
}

impl IoBuf {
	pub fn new() -> Self {
		Self::with_capacity(CAPACITY)
	}

	pub fn with_capacity(cap: usize) -> Self {
		Self { data: vec![0; cap].into_boxed_slice(), start: 0, used: 0 }
	}

	pub fn len(&self) -> usize {
		self.used
	}

	pub fn is_empty(&self) -> bool {
		self.used == 0
	}

	/// The unconsumed bytes.
	pub fn data(&self) -> &[u8] {
		&self.data[self.start..self.start + self.used]
	}

	/// Room left for appending without compaction.
	pub fn avail(&self) -> usize {
		self.data.len() - self.start - self.used
	}

	pub fn append(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
		if bytes.len() > self.avail() {
			return Err(Overflow);
		}
		let at = self.start + self.used;
		self.data[at..at + bytes.len()].copy_from_slice(bytes);
		self.used += bytes.len();
		Ok(())
	}

	/// Uninitialised tail for a readv-style refill; pair with [`fill`].
	///
	/// [`fill`]: IoBuf::fill
	pub fn spare(&mut self) -> &mut [u8] {
		let at = self.start + self.used;
		&mut self.data[at..]
	}

	/// Marks `n` bytes of [`spare`] as written.
	///
	/// [`spare`]: IoBuf::spare
	pub fn fill(&mut self, n: usize) {
		debug_assert!(self.start + self.used + n <= self.data.len());
		self.used += n;
	}

	pub fn consume(&mut self, n: usize) {
		debug_assert!(n <= self.used);
		self.start += n;
		self.used -= n;
		if self.used == 0 {
			self.start = 0;
		}
	}

	/// Memmoves the residue to offset zero, recovering append room.
	pub fn compact(&mut self) {
		if self.start > 0 {
			self.data.copy_within(self.start..self.start + self.used, 0);
			self.start = 0;
		}
	}
}
