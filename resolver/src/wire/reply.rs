//! Parses a reply packet into its header, skips the echoed question section, and walks the
//! answer records, following CNAME chains to the eventual A/PTR data.
//!
//! The teacher's `net::dns` module never parsed a reply's answer section at all; this is
//! grounded on RFC1035 §4.1.3/§3.3 record shapes plus montague's record-walking style.

use std::net::Ipv4Addr;

use utils::bytes::cast;

use super::header::{Header, Rcode, CLASS_IN, TYPE_A, TYPE_CNAME, TYPE_PTR};
use super::name;
use super::query::{self, ParseError};

/// One answer-section record: its owner name, type/class/ttl, and the bounds of its rdata
/// within the original packet (rdata is read lazily, since most records are skipped).
pub struct Record {
	pub name: String,
	pub rtype: u16,
	pub class: u16,
	pub ttl: u32,
	pub rdata_start: usize,
	pub rdata_len: usize,
}

pub struct Reply {
	pub id: u16,
	pub rcode: Rcode,
	pub authoritative: bool,
	pub truncated: bool,
	pub recursion_available: bool,
	pub qdcount: u16,
	pub answers: Vec<Record>,
}

/// Parses the header, skips over `qdcount` questions, and reads every answer record.
pub fn parse(packet: &[u8]) -> Result<Reply, ParseError> {
	let header = query::header(packet)?;
	let id = header.id.get();
	let flags = header.flags.get();
	let qdcount = header.qdcount.get();
	let ancount = header.ancount.get();

	let mut pos = query::HEADER_LEN;

	for _ in 0..qdcount {
		let (_, next) = name::decode(packet, pos)?;
		pos = next.checked_add(4).ok_or(ParseError::Truncated)?;
	}

	let mut answers = Vec::with_capacity(ancount as usize);

	for _ in 0..ancount {
		let (name, next) = name::decode(packet, pos)?;

		let fixed_end = next.checked_add(10).ok_or(ParseError::Truncated)?;
		let fixed = packet.get(next..fixed_end).ok_or(ParseError::Truncated)?;
		let rr = cast::<super::header::RR, _>(fixed);

		let rdata_start = fixed_end;
		let rdata_len = rr.rdlength.get() as usize;
		let rdata_end = rdata_start.checked_add(rdata_len).ok_or(ParseError::Truncated)?;

		if packet.get(rdata_start..rdata_end).is_none() {
			return Err(ParseError::Truncated);
		}

		answers.push(Record { name, rtype: rr.ty.get(), class: rr.class.get(), ttl: rr.ttl.get(), rdata_start, rdata_len });

		pos = rdata_end;
	}

	Ok(Reply {
		id,
		rcode: flags.rcode(),
		authoritative: flags.aa(),
		truncated: flags.tc(),
		recursion_available: flags.ra(),
		qdcount,
		answers,
	})
}

/// Follows any CNAME chain starting at `qname` and collects every A record along the way,
/// along with the minimum TTL across them (the bound an aggregate cache entry must honor).
pub fn extract_ipv4(packet: &[u8], reply: &Reply, qname: &str) -> (Vec<Ipv4Addr>, Option<u32>) {
	let mut owner = qname.trim_end_matches('.').to_ascii_lowercase();
	let mut addrs = Vec::new();
	let mut min_ttl: Option<u32> = None;

	for rec in &reply.answers {
		if rec.name.trim_end_matches('.').to_ascii_lowercase() != owner {
			continue;
		}

		if rec.class != CLASS_IN {
			continue;
		}

		match rec.rtype {
			TYPE_CNAME => {
				if let Ok((alias, _)) = name::decode(packet, rec.rdata_start) {
					owner = alias.trim_end_matches('.').to_ascii_lowercase();
				}
			}
			TYPE_A if rec.rdata_len == 4 => {
				let bytes = &packet[rec.rdata_start..rec.rdata_start + 4];
				addrs.push(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
				min_ttl = Some(min_ttl.map_or(rec.ttl, |m| m.min(rec.ttl)));
			}
			_ => {}
		}
	}

	(addrs, min_ttl)
}

/// Reads the hostname out of the first PTR record answering `qname` (a reverse lookup).
pub fn extract_ptr(packet: &[u8], reply: &Reply, qname: &str) -> Option<(String, u32)> {
	let owner = qname.trim_end_matches('.').to_ascii_lowercase();

	reply
		.answers
		.iter()
		.find(|rec| rec.rtype == TYPE_PTR && rec.class == CLASS_IN && rec.name.trim_end_matches('.').to_ascii_lowercase() == owner)
		.and_then(|rec| name::decode(packet, rec.rdata_start).ok().map(|(host, _)| (host, rec.ttl)))
}
