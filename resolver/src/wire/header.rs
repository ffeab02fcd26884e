use bilge::prelude::*;
use macros::Cast;
use utils::endian::{u16be, u32be, BigEndian};

pub const CLASS_IN: u16 = 1;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_AAAA: u16 = 28;

#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
	Query = 0,
	IQuery = 1,
	Status = 2,
	#[fallback]
	Reserved,
}

/// The response code carried in the low nibble of the second flags byte.
///
/// Values beyond `Refused` are not assigned by RFC1035; the resolver maps anything it
/// doesn't recognize to [`Rcode::Reserved`], which in turn surfaces as `Outcome::Unknown`.
#[bitsize(4)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Rcode {
	Ok = 0,
	FormatErr = 1,
	ServerFailure = 2,
	NameErr = 3,
	NotImplemented = 4,
	Refused = 5,
	#[fallback]
	Reserved,
}

#[bitsize(16)]
#[derive(FromBits, Clone, Copy, Debug)]
pub struct Flags {
	pub rcode: Rcode,
	pub z: u3,
	pub ra: bool,
	pub rd: bool,
	pub tc: bool,
	pub aa: bool,
	pub opcode: Opcode,
	pub qr: bool,
}

/// The fixed 12-byte DNS message header (RFC1035 §4.1.1).
#[derive(Cast)]
#[repr(C)]
pub struct Header {
	pub id: u16be,
	pub flags: BigEndian<Flags>,
	pub qdcount: u16be,
	pub ancount: u16be,
	pub nscount: u16be,
	pub arcount: u16be,
}

/// The fixed portion of a resource record, following its (possibly compressed) owner name.
#[derive(Cast)]
#[repr(C)]
pub struct RR {
	pub ty: u16be,
	pub class: u16be,
	pub ttl: u32be,
	pub rdlength: u16be,
}

/// The fixed portion of a question, following its owner name.
#[derive(Cast)]
#[repr(C)]
pub struct Question {
	pub qtype: u16be,
	pub qclass: u16be,
}
