//! Builds outbound queries and reads the header/question section of inbound packets.
//!
//! Grounded on the teacher's `net::dns` header handling, extended to cover question
//! encoding/decoding, which the teacher's stub never needed.

use bilge::prelude::*;
use utils::bytes::{as_slice, cast};

use super::header::{Flags, Header, Opcode, Question, Rcode, CLASS_IN};
use super::name::{self, NameError};

pub const HEADER_LEN: usize = 12;

/// Builds a standard recursive query for `name` / `qtype`, using `id` as the transaction id.
pub fn build(id: u16, name_str: &str, qtype: u16) -> Result<Vec<u8>, NameError> {
	let mut out = vec![0u8; HEADER_LEN];

	name::encode(name_str, &mut out)?;

	let question = Question { qtype: qtype.into(), qclass: CLASS_IN.into() };
	out.extend_from_slice(as_slice::<u8, _>(&question));

	let flags = Flags::new(Rcode::Ok, u3::new(0), false, true, false, false, Opcode::Query, false);
	let header = Header {
		id: id.into(),
		flags: flags.into(),
		qdcount: 1u16.into(),
		ancount: 0u16.into(),
		nscount: 0u16.into(),
		arcount: 0u16.into(),
	};
	out[..HEADER_LEN].copy_from_slice(as_slice::<u8, _>(&header));

	Ok(out)
}

#[derive(Debug)]
pub enum ParseError {
	Truncated,
	Name(NameError),
}

impl From<NameError> for ParseError {
	fn from(e: NameError) -> Self {
		Self::Name(e)
	}
}

/// The decoded question that follows the header, along with the offset of the first byte past
/// it (where the answer section, if any, begins).
pub struct DecodedQuestion {
	pub name: String,
	pub qtype: u16,
	pub qclass: u16,
	pub end: usize,
}

pub fn header(packet: &[u8]) -> Result<&Header, ParseError> {
	if packet.len() < HEADER_LEN {
		return Err(ParseError::Truncated);
	}

	Ok(cast::<Header, _>(&packet[..HEADER_LEN]))
}

/// Reads the first question in the question section, starting right after the header.
pub fn question(packet: &[u8]) -> Result<DecodedQuestion, ParseError> {
	if packet.len() < HEADER_LEN {
		return Err(ParseError::Truncated);
	}

	let (name, pos) = name::decode(packet, HEADER_LEN)?;

	let fixed_end = pos.checked_add(4).ok_or(ParseError::Truncated)?;
	let fixed = packet.get(pos..fixed_end).ok_or(ParseError::Truncated)?;
	let question = cast::<Question, _>(fixed);

	Ok(DecodedQuestion { name, qtype: question.qtype.get(), qclass: question.qclass.get(), end: fixed_end })
}
