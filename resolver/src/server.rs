//! Server-side request intake and response composition.
//!
//! No teacher precedent — `net::dns` is resolver-only. Grounded on spec.md §4.6/§6's
//! `ServerRequest`/`ServerPort` shapes, built on the same `resolver::wire` codec the resolver
//! side uses.

use std::net::{Ipv4Addr, SocketAddr};

use bilge::prelude::*;

use crate::wire::header::{Flags, Header, Opcode, Rcode, CLASS_IN, TYPE_A, TYPE_AAAA, TYPE_CNAME, TYPE_PTR};
use crate::wire::name::{self, CompressionTable, NameError};
use crate::wire::query::{self, DecodedQuestion, ParseError};
use utils::bytes::as_slice;
use utils::error::Result as IoResult;

/// What became of a response's send attempt, reported back from `respond` itself rather than
/// discovered later — spec.md §7's "`respond` returns zero on immediate send, positive to
/// indicate queued for writability retry, negative on fatal send error".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendOutcome {
	Sent,
	Queued,
	Failed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Section {
	Answer,
	Authority,
	Additional,
}

#[derive(Clone, Debug)]
pub enum RecordData {
	A(Ipv4Addr),
	/// Opaque: spec.md's Non-goals exclude decoding AAAA, but the responder can still emit one
	/// verbatim on the user's behalf.
	Aaaa([u8; 16]),
	Ptr(String),
	Cname(String),
}

impl RecordData {
	fn rtype(&self) -> u16 {
		match self {
			Self::A(_) => TYPE_A,
			Self::Aaaa(_) => TYPE_AAAA,
			Self::Ptr(_) => TYPE_PTR,
			Self::Cname(_) => TYPE_CNAME,
		}
	}
}

struct RecordEntry {
	name: String,
	ttl: u32,
	data: RecordData,
}

/// One inbound query awaiting a response. `respond` consumes the builder lists, sends the
/// assembled packet through the `send` closure supplied at construction, and fills `response`
/// exactly once — matching spec.md §3's invariant that the builder lists and the response never
/// coexist.
pub struct ServerRequest<'s> {
	pub id: u16,
	pub peer: SocketAddr,
	pub questions: Vec<DecodedQuestion>,
	answers: Vec<RecordEntry>,
	authority: Vec<RecordEntry>,
	additional: Vec<RecordEntry>,
	response: Option<Vec<u8>>,
	send_outcome: Option<SendOutcome>,
	send: Box<dyn FnMut(&[u8]) -> IoResult<bool> + 's>,
}

impl<'s> ServerRequest<'s> {
	/// Parses an inbound datagram's header and its (single) question — every query this
	/// resolver itself emits, and every query any reasonable stub sends, carries exactly one.
	/// `send` is called once, by `respond`, with the encoded response packet; it should return
	/// `Ok(true)` if the packet went out immediately, `Ok(false)` if it was queued for a later
	/// writability retry, and `Err(())` on a fatal send error.
	pub fn from_query(packet: &[u8], peer: SocketAddr, send: impl FnMut(&[u8]) -> IoResult<bool> + 's) -> Result<Self, ParseError> {
		let header = query::header(packet)?;
		let id = header.id.get();
		let question = query::question(packet)?;

		Ok(Self {
			id,
			peer,
			questions: vec![question],
			answers: Vec::new(),
			authority: Vec::new(),
			additional: Vec::new(),
			response: None,
			send_outcome: None,
			send: Box::new(send),
		})
	}

	fn push(&mut self, section: Section, name: impl Into<String>, ttl: u32, data: RecordData) {
		let entry = RecordEntry { name: name.into(), ttl, data };

		match section {
			Section::Answer => self.answers.push(entry),
			Section::Authority => self.authority.push(entry),
			Section::Additional => self.additional.push(entry),
		}
	}

	pub fn add_a_reply(&mut self, section: Section, name: impl Into<String>, ttl: u32, addr: Ipv4Addr) {
		self.push(section, name, ttl, RecordData::A(addr));
	}

	pub fn add_aaaa_reply(&mut self, section: Section, name: impl Into<String>, ttl: u32, addr: [u8; 16]) {
		self.push(section, name, ttl, RecordData::Aaaa(addr));
	}

	pub fn add_ptr_reply(&mut self, section: Section, name: impl Into<String>, ttl: u32, target: impl Into<String>) {
		self.push(section, name, ttl, RecordData::Ptr(target.into()));
	}

	pub fn add_cname_reply(&mut self, section: Section, name: impl Into<String>, ttl: u32, target: impl Into<String>) {
		self.push(section, name, ttl, RecordData::Cname(target.into()));
	}

	/// Assembles the response packet with name compression, releasing the builder lists, and
	/// sends it through the `send` closure supplied to `from_query`. Calling this more than once
	/// just returns the first call's outcome without sending again.
	pub fn respond(&mut self, rcode: Rcode, authoritative: bool) -> Result<SendOutcome, NameError> {
		if self.response.is_none() {
			let packet = self.encode(rcode, authoritative)?;
			self.answers.clear();
			self.authority.clear();
			self.additional.clear();

			let outcome = match (self.send)(&packet) {
				Ok(true) => SendOutcome::Sent,
				Ok(false) => SendOutcome::Queued,
				Err(()) => SendOutcome::Failed,
			};

			self.response = Some(packet);
			self.send_outcome = Some(outcome);
		}

		Ok(self.send_outcome.expect("send_outcome is set alongside response"))
	}

	/// The assembled response, if `respond` has been called.
	pub fn response(&self) -> Option<&[u8]> {
		self.response.as_deref()
	}

	fn encode(&self, rcode: Rcode, authoritative: bool) -> Result<Vec<u8>, NameError> {
		let mut out = vec![0u8; query::HEADER_LEN];
		let mut table = CompressionTable::new();

		for q in &self.questions {
			name::encode_compressed(&q.name, &mut out, &mut table)?;
			out.extend_from_slice(&q.qtype.to_be_bytes());
			out.extend_from_slice(&q.qclass.to_be_bytes());
		}

		for entry in &self.answers {
			encode_record(&mut out, &mut table, entry)?;
		}
		for entry in &self.authority {
			encode_record(&mut out, &mut table, entry)?;
		}
		for entry in &self.additional {
			encode_record(&mut out, &mut table, entry)?;
		}

		let flags = Flags::new(rcode, u3::new(0), true, true, false, authoritative, Opcode::Query, true);
		let header = Header {
			id: self.id.into(),
			flags: flags.into(),
			qdcount: (self.questions.len() as u16).into(),
			ancount: (self.answers.len() as u16).into(),
			nscount: (self.authority.len() as u16).into(),
			arcount: (self.additional.len() as u16).into(),
		};
		out[..query::HEADER_LEN].copy_from_slice(as_slice::<u8, _>(&header));

		Ok(out)
	}
}

fn encode_record(out: &mut Vec<u8>, table: &mut CompressionTable, entry: &RecordEntry) -> Result<(), NameError> {
	name::encode_compressed(&entry.name, out, table)?;

	out.extend_from_slice(&entry.data.rtype().to_be_bytes());
	out.extend_from_slice(&CLASS_IN.to_be_bytes());
	out.extend_from_slice(&entry.ttl.to_be_bytes());

	let rdlength_pos = out.len();
	out.extend_from_slice(&[0, 0]);

	let rdata_start = out.len();
	match &entry.data {
		RecordData::A(addr) => out.extend_from_slice(&addr.octets()),
		RecordData::Aaaa(bytes) => out.extend_from_slice(bytes),
		RecordData::Ptr(target) | RecordData::Cname(target) => name::encode_compressed(target, out, table)?,
	}

	let rdlength = (out.len() - rdata_start) as u16;
	out[rdlength_pos..rdlength_pos + 2].copy_from_slice(&rdlength.to_be_bytes());

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::{query as wquery, reply};

	/// A `send` closure for tests that don't exercise the wire-level send outcome: pretends
	/// every packet goes out immediately, matching a healthy non-blocking socket.
	fn always_sent(_packet: &[u8]) -> IoResult<bool> {
		Ok(true)
	}

	#[test]
	fn respond_releases_builder_lists_and_is_idempotent() {
		let built = wquery::build(0x1234, "example.com", TYPE_A).unwrap();
		let mut req = ServerRequest::from_query(&built, "127.0.0.1:53".parse().unwrap(), always_sent).unwrap();

		req.add_a_reply(Section::Answer, "example.com", 300, Ipv4Addr::new(93, 184, 216, 34));
		let first = req.respond(Rcode::Ok, true).unwrap();
		assert_eq!(first, SendOutcome::Sent);

		assert!(req.answers.is_empty());
		let first_packet = req.response().unwrap().to_vec();

		let second = req.respond(Rcode::Ok, true).unwrap();
		assert_eq!(second, SendOutcome::Sent);
		assert_eq!(req.response().unwrap(), first_packet);
	}

	#[test]
	fn respond_reports_a_fatal_send_error() {
		let built = wquery::build(0x1234, "example.com", TYPE_A).unwrap();
		let mut req = ServerRequest::from_query(&built, "127.0.0.1:53".parse().unwrap(), |_| Err(())).unwrap();

		req.add_a_reply(Section::Answer, "example.com", 300, Ipv4Addr::new(93, 184, 216, 34));
		assert_eq!(req.respond(Rcode::Ok, true).unwrap(), SendOutcome::Failed);
	}

	#[test]
	fn encoded_response_round_trips_through_the_reply_parser() {
		let built = wquery::build(0xbeef, "www.example.com", TYPE_A).unwrap();
		let mut req = ServerRequest::from_query(&built, "127.0.0.1:53".parse().unwrap(), always_sent).unwrap();

		req.add_a_reply(Section::Answer, "www.example.com", 60, Ipv4Addr::new(10, 0, 0, 1));
		assert_eq!(req.respond(Rcode::Ok, false).unwrap(), SendOutcome::Sent);
		let packet = req.response().unwrap().to_vec();

		let parsed = reply::parse(&packet).unwrap();
		assert_eq!(parsed.id, 0xbeef);
		assert_eq!(parsed.rcode, Rcode::Ok);

		let (addrs, ttl) = reply::extract_ipv4(&packet, &parsed, "www.example.com");
		assert_eq!(addrs, [Ipv4Addr::new(10, 0, 0, 1)]);
		assert_eq!(ttl, Some(60));
	}
}
