//! The wire message model.
//!
//! Every message is a MessagePack array whose first element is the message
//! type byte. [`Request::decode`] pulls one whole scheduler message off the
//! front of the input; the frame builders below produce everything LTX
//! sends. Replies to accepted requests are not built here: an accepted
//! message is acknowledged by echoing its received bytes verbatim, which
//! the agent does straight from the input buffer.

use crate::codec::{DecodeError, Decoder, Encoder};
use std::{
	ffi::CString, os::unix::ffi::OsStringExt, path::PathBuf
};

pub const PING: u8 = 0;
pub const PONG: u8 = 1;
pub const ENV: u8 = 2;
pub const EXEC: u8 = 3;
pub const LOG: u8 = 4;
pub const RESULT: u8 = 5;
pub const GET_FILE: u8 = 6;
pub const SET_FILE: u8 = 7;
pub const DATA: u8 = 8;

/// A validated scheduler request. Payload bytes are copied out so the
/// input buffer can be consumed and compacted behind it.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Request {
	Ping,
	Exec { slot: u8, path: CString },
	GetFile { path: PathBuf },
}

impl Request {
	/// Decodes one whole message from the front of `input`, returning it
	/// with its span in bytes. [`DecodeError::Short`] means the tail
	/// message is still arriving; everything else is a protocol violation
	/// and fatal at the call site.
	pub fn decode(input: &[u8]) -> Result<(Request, usize), DecodeError> {
		let mut d = Decoder::new(input);
		let arity = d.array()?;
		if arity == 0 {
			return Err(DecodeError::Malformed("empty message array"));
		}
		let request = match d.fixint()? {
			PING => {
				if arity != 1 {
					return Err(DecodeError::Malformed("ping carries no payload"));
				}
				Request::Ping
			}
			EXEC => Self::decode_exec(&mut d, arity)?,
			GET_FILE => {
				if arity != 2 {
					return Err(DecodeError::Malformed("get-file takes exactly a path"));
				}
				let path = d.str_bytes()?.to_vec();
				Request::GetFile { path: PathBuf::from(std::ffi::OsString::from_vec(path)) }
			}
			PONG | LOG | RESULT => {
				return Err(DecodeError::Malformed("message type is not handled by the executor"))
			}
			ENV | SET_FILE | DATA => {
				return Err(DecodeError::Malformed("reserved message type"))
			}
			_ => return Err(DecodeError::Malformed("unknown message type")),
		};
		Ok((request, d.consumed()))
	}

	fn decode_exec(d: &mut Decoder, arity: usize) -> Result<Request, DecodeError> {
		if arity < 3 {
			return Err(DecodeError::Malformed("exec takes a table id and a path"));
		}
		let slot = d.fixint()?;
		if usize::from(slot) >= crate::table::SLOTS {
			return Err(DecodeError::Malformed("table id out of range"));
		}
		let path = d.str_bytes()?;
		if path.len() > 255 {
			return Err(DecodeError::Malformed("exec path longer than str8"));
		}
		let path = CString::new(path)
			.map_err(|_| DecodeError::Malformed("exec path contains a nul byte"))?;
		// The protocol shape reserves room for argv, but the executor only
		// ever passes argv[0]; anything beyond trailing nils is refused.
		for _ in 3..arity {
			d.nil().map_err(|err| match err {
				DecodeError::Short => DecodeError::Short,
				DecodeError::Malformed(_) => DecodeError::Malformed("exec arguments are not supported"),
			})?;
		}
		Ok(Request::Exec { slot, path })
	}
}

/// `[1, now_ns]`, sent after the ping echo.
pub fn pong_frame(ns: u64) -> Vec<u8> {
	let mut out = Vec::with_capacity(11);
	let mut e = Encoder::new(&mut out);
	e.array(2);
	e.uint(u64::from(PONG));
	e.u64(ns);
	out
}

/// `[4, slot-or-nil, now_ns, text]`; nil tags the executor's own entries.
/// `text` is raw child output and need not be UTF-8.
pub fn log_frame(slot: Option<u8>, ns: u64, text: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(16 + text.len());
	let mut e = Encoder::new(&mut out);
	e.array(4);
	e.uint(u64::from(LOG));
	match slot {
		Some(slot) => e.uint(u64::from(slot)),
		None => e.nil(),
	}
	e.u64(ns);
	e.str_bytes(text);
	out
}

/// `[5, slot, now_ns, si_code, si_status]`.
pub fn result_frame(slot: u8, ns: u64, code: u8, status: u8) -> Vec<u8> {
	let mut out = Vec::with_capacity(16);
	let mut e = Encoder::new(&mut out);
	e.array(5);
	e.uint(u64::from(RESULT));
	e.uint(u64::from(slot));
	e.u64(ns);
	e.uint(u64::from(code));
	e.uint(u64::from(status));
	out
}

/// `[8, bin(len)…` — header only; the body follows straight from the file.
pub fn data_frame_header(len: u64) -> Vec<u8> {
	let mut out = Vec::with_capacity(8);
	let mut e = Encoder::new(&mut out);
	e.array(2);
	e.uint(u64::from(DATA));
	e.bin_header(len);
	out
}
