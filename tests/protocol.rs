//! End-to-end protocol tests. Each test spawns the real `ltx` binary with
//! piped stdio and drives the wire protocol byte for byte, the way the
//! scheduler does. The executor echoes every accepted message before its
//! reply frames, so `send` asserts the echo inline.

use ltx::codec::{DecodeError, Decoder, Encoder};
use std::{
	env, fs, io::{Read, Write}, os::unix::{ffi::OsStrExt, fs::PermissionsExt}, path::{Path, PathBuf}, process::{Child, ChildStdin, ChildStdout, Command, Stdio}
};

struct Ltx {
	child: Child,
	/// `None` once closed to signal the hangup.
	stdin: Option<ChildStdin>,
	stdout: ChildStdout,
	buf: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Frame {
	Log { slot: Option<u8>, text: Vec<u8> },
	Result { slot: u8, code: u8, status: u8 },
}

fn parse_frame(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
	let mut d = Decoder::new(buf);
	let arity = d.array()?;
	let frame = match d.fixint()? {
		4 => {
			assert_eq!(arity, 4, "log frame arity");
			let slot = match d.peek()? {
				0xc0 => {
					d.nil()?;
					None
				}
				_ => Some(d.fixint()?),
			};
			let _ns = d.u64()?;
			Frame::Log { slot, text: d.str_bytes()?.to_vec() }
		}
		5 => {
			assert_eq!(arity, 5, "result frame arity");
			let slot = d.fixint()?;
			let _ns = d.u64()?;
			Frame::Result { slot, code: d.uint()? as u8, status: d.uint()? as u8 }
		}
		ty => panic!("unexpected frame type {} in {:02x?}", ty, buf),
	};
	Ok((frame, d.consumed()))
}

impl Ltx {
	fn spawn() -> Self {
		let mut child = Command::new(env!("CARGO_BIN_EXE_ltx"))
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.unwrap();
		let stdin = child.stdin.take();
		let stdout = child.stdout.take().unwrap();
		let mut ltx = Self { child, stdin, stdout, buf: Vec::new() };
		// the version banner is the first thing on the stream
		match ltx.frame() {
			Frame::Log { slot: None, text } => {
				let text = String::from_utf8(text).unwrap();
				assert!(text.contains("Linux Test Executor"), "banner: {}", text);
			}
			other => panic!("expected the version banner, got {:?}", other),
		}
		ltx
	}

	fn read_more(&mut self) {
		let mut chunk = [0u8; 4096];
		let n = self.stdout.read(&mut chunk).unwrap();
		assert!(n > 0, "executor hung up; buffered: {:02x?}", self.buf);
		self.buf.extend_from_slice(&chunk[..n]);
	}

	fn expect_exact(&mut self, want: &[u8]) {
		while self.buf.len() < want.len() {
			self.read_more();
		}
		assert_eq!(&self.buf[..want.len()], want, "stream prefix mismatch");
		drop(self.buf.drain(..want.len()));
	}

	fn expect_n(&mut self, n: usize) -> Vec<u8> {
		while self.buf.len() < n {
			self.read_more();
		}
		self.buf.drain(..n).collect()
	}

	/// Writes one message and consumes its echo acknowledgement.
	fn send(&mut self, bytes: &[u8]) {
		self.write_raw(bytes);
		self.expect_exact(bytes);
	}

	fn write_raw(&mut self, bytes: &[u8]) {
		let stdin = self.stdin.as_mut().unwrap();
		stdin.write_all(bytes).unwrap();
		stdin.flush().unwrap();
	}

	fn hang_up(&mut self) {
		drop(self.stdin.take());
	}

	fn frame(&mut self) -> Frame {
		loop {
			match parse_frame(&self.buf) {
				Ok((frame, span)) => {
					drop(self.buf.drain(..span));
					return frame;
				}
				Err(DecodeError::Short) => self.read_more(),
				Err(err) => panic!("bad frame: {} in {:02x?}", err, self.buf),
			}
		}
	}

	/// Skips Log frames until `slot`'s Result arrives.
	fn result_for(&mut self, slot: u8) -> (u8, u8) {
		loop {
			match self.frame() {
				Frame::Result { slot: got, code, status } => {
					assert_eq!(got, slot, "result for the wrong slot");
					return (code, status);
				}
				Frame::Log { .. } => {}
			}
		}
	}

	/// For protocol-violation tests: the executor must exit 1.
	fn wait_fatal(mut self) {
		let status = self.child.wait().unwrap();
		assert_eq!(status.code(), Some(1));
	}
}

impl Drop for Ltx {
	fn drop(&mut self) {
		let _ = self.child.kill();
		let _ = self.child.wait();
	}
}

fn exec_msg(slot: u8, path: &str) -> Vec<u8> {
	let mut out = Vec::new();
	let mut e = Encoder::new(&mut out);
	e.array(3);
	e.uint(3);
	e.uint(u64::from(slot));
	e.str_bytes(path.as_bytes());
	out
}

fn get_file_msg(path: &Path) -> Vec<u8> {
	let mut out = Vec::new();
	let mut e = Encoder::new(&mut out);
	e.array(2);
	e.uint(6);
	e.str_bytes(path.as_os_str().as_bytes());
	out
}

fn scratch_path(name: &str) -> PathBuf {
	env::temp_dir().join(format!("ltx-test-{}-{}", std::process::id(), name))
}

/// An executable that sleeps long enough to order itself after fast peers.
fn slow_script(name: &str) -> PathBuf {
	let path = scratch_path(name);
	fs::write(&path, "#!/bin/sh\nsleep 0.3\n").unwrap();
	fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
	path
}

const PING: &[u8] = &[0x91, 0x00];
const PONG_HEAD: &[u8] = &[0x92, 0x01, 0xcf];

#[test]
fn ping_is_echoed_then_ponged() {
	let mut ltx = Ltx::spawn();
	ltx.send(PING);
	ltx.expect_exact(PONG_HEAD);
	let _ns = ltx.expect_n(8);
}

#[test]
fn ping_flood_stays_ordered_and_monotonic() {
	let mut ltx = Ltx::spawn();
	let floods = 64;
	ltx.write_raw(&PING.repeat(floods));
	let mut last = 0u64;
	for _ in 0..floods {
		ltx.expect_exact(PING);
		ltx.expect_exact(PONG_HEAD);
		let ns = u64::from_be_bytes(ltx.expect_n(8).try_into().unwrap());
		assert!(ns >= last, "pong timestamps went backwards");
		last = ns;
	}
}

#[test]
fn exec_true_yields_exactly_one_result() {
	let mut ltx = Ltx::spawn();
	ltx.send(&exec_msg(0, "/bin/true"));
	// scenario bytes: [5, 0, ns, CLD_EXITED, 0] with nothing in between
	ltx.expect_exact(&[0x95, 0x05, 0x00, 0xcf]);
	let _ns = ltx.expect_n(8);
	ltx.expect_exact(&[0x01, 0x00]);
}

#[test]
fn exec_captures_child_output_before_the_result() {
	let mut ltx = Ltx::spawn();
	ltx.send(&exec_msg(0, "/bin/echo"));
	// argv is just ["/bin/echo"], so the child prints a bare newline
	assert_eq!(ltx.frame(), Frame::Log { slot: Some(0), text: b"\n".to_vec() });
	assert_eq!(ltx.frame(), Frame::Result { slot: 0, code: 1, status: 0 });
}

#[test]
fn exec_accepts_trailing_nils_for_argv() {
	let mut ltx = Ltx::spawn();
	let mut msg = Vec::new();
	let mut e = Encoder::new(&mut msg);
	e.array(5);
	e.uint(3);
	e.uint(1);
	e.str_bytes(b"/bin/true");
	e.nil();
	e.nil();
	ltx.send(&msg);
	assert_eq!(ltx.result_for(1), (1, 0));
}

#[test]
fn exec_failure_comes_back_as_a_status_one_result() {
	let mut ltx = Ltx::spawn();
	ltx.send(&exec_msg(2, "/nonexistent/binary"));
	// the failed exec's diagnostic rides the pipe as child output
	assert_eq!(ltx.result_for(2), (1, 1));
}

#[test]
fn concurrent_children_finish_out_of_order() {
	let script = slow_script("concurrent");
	let mut ltx = Ltx::spawn();
	ltx.send(&exec_msg(0, script.to_str().unwrap()));
	ltx.send(&exec_msg(1, "/bin/echo"));
	let mut order = Vec::new();
	let (mut done0, mut done1) = (false, false);
	while !(done0 && done1) {
		match ltx.frame() {
			Frame::Result { slot, code, status } => {
				assert_eq!((code, status), (1, 0));
				order.push(("result", slot));
				match slot {
					0 => done0 = true,
					1 => done1 = true,
					_ => panic!("result for an unknown slot"),
				}
			}
			Frame::Log { slot: Some(slot), .. } => order.push(("log", slot)),
			Frame::Log { slot: None, .. } => {}
		}
	}
	let at = |what| order.iter().position(|entry| *entry == what).unwrap();
	assert!(at(("result", 1)) < at(("result", 0)), "slow child finished first: {:?}", order);
	assert!(at(("log", 1)) < at(("result", 1)), "log after result: {:?}", order);
}

#[test]
fn slots_are_reusable_after_the_result() {
	let mut ltx = Ltx::spawn();
	for _ in 0..3 {
		ltx.send(&exec_msg(3, "/bin/true"));
		assert_eq!(ltx.result_for(3), (1, 0));
	}
}

#[test]
fn get_file_streams_the_exact_bytes() {
	let path = scratch_path("hello");
	fs::write(&path, "hello").unwrap();
	let mut ltx = Ltx::spawn();
	ltx.send(&get_file_msg(&path));
	ltx.expect_exact(&[0x92, 0x08, 0xc4, 0x05]);
	ltx.expect_exact(b"hello");
}

#[test]
fn get_file_wide_payload_uses_bin32() {
	let body: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
	let path = scratch_path("wide");
	fs::write(&path, &body).unwrap();
	let mut ltx = Ltx::spawn();
	ltx.send(&get_file_msg(&path));
	ltx.expect_exact(&[0x92, 0x08, 0xc6, 0x00, 0x00, 0x01, 0x2c]);
	ltx.expect_exact(&body);
}

#[test]
fn an_empty_array_is_fatal() {
	let mut ltx = Ltx::spawn();
	ltx.write_raw(&[0x80]);
	ltx.wait_fatal();
}

#[test]
fn a_reserved_message_type_is_fatal() {
	let mut ltx = Ltx::spawn();
	ltx.write_raw(&[0x91, 0x07]);
	ltx.wait_fatal();
}

#[test]
fn an_inbound_pong_is_fatal() {
	let mut ltx = Ltx::spawn();
	ltx.write_raw(&[0x91, 0x01]);
	ltx.wait_fatal();
}

#[test]
fn the_reserved_table_id_is_fatal() {
	let mut ltx = Ltx::spawn();
	ltx.write_raw(&exec_msg(127, "/bin/true"));
	ltx.wait_fatal();
}

#[test]
fn an_occupied_slot_is_fatal() {
	let script = slow_script("occupied");
	let mut ltx = Ltx::spawn();
	ltx.send(&exec_msg(0, script.to_str().unwrap()));
	ltx.write_raw(&exec_msg(0, "/bin/true"));
	ltx.wait_fatal();
}

#[test]
fn a_split_message_is_reassembled() {
	let mut ltx = Ltx::spawn();
	let msg = exec_msg(4, "/bin/true");
	let (head, tail) = msg.split_at(5);
	ltx.write_raw(head);
	ltx.write_raw(tail);
	ltx.expect_exact(&msg);
	assert_eq!(ltx.result_for(4), (1, 0));
}

#[test]
fn hangup_after_traffic_exits_cleanly() {
	let mut ltx = Ltx::spawn();
	ltx.send(PING);
	ltx.expect_exact(PONG_HEAD);
	let _ns = ltx.expect_n(8);
	ltx.hang_up();
	let status = ltx.child.wait().unwrap();
	assert_eq!(status.code(), Some(0));
}
