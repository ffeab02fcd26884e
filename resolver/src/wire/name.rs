//! DNS name (de)serialization, including 14-bit back-pointer compression.
//!
//! The decoder is grounded on `dylnuge-montague`'s `dns::protocol::names` (the teacher's own
//! DNS stub never decompresses names); the encoder adds a suffix-compression table the
//! teacher repo has no counterpart for, needed by the server-side responder.

use core::fmt;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_LABEL_LEN: usize = 63;

/// Capacity of the responder's suffix-offset compression table.
const TABLE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
	LabelTooLong,
	NameTooLong,
	PointerOutOfBounds,
	PointerLoop,
	Truncated,
}

impl fmt::Display for NameError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let msg = match self {
			Self::LabelTooLong => "label exceeds 63 bytes",
			Self::NameTooLong => "encoded name exceeds 255 bytes",
			Self::PointerOutOfBounds => "name pointer targets an offset outside the packet",
			Self::PointerLoop => "name pointer does not point strictly backward",
			Self::Truncated => "packet ended while reading a name",
		};

		f.write_str(msg)
	}
}

/// Reads a (possibly compressed) name starting at `start`. Returns the name, joined with `.`,
/// and the cursor position immediately following the name *in the original encoding* — i.e.
/// following the two pointer bytes if a pointer was taken, not following wherever the pointer
/// chain eventually terminated.
pub fn decode(packet: &[u8], start: usize) -> Result<(String, usize), NameError> {
	let mut pos = start;
	let mut resume_at = None;
	let mut budget = MAX_NAME_LEN;
	let mut name = String::new();

	loop {
		let len = *packet.get(pos).ok_or(NameError::Truncated)?;

		match len & 0xC0 {
			0xC0 => {
				let next = *packet.get(pos + 1).ok_or(NameError::Truncated)?;
				let pointer = (((len & 0x3F) as usize) << 8) | next as usize;

				if pointer >= packet.len() {
					return Err(NameError::PointerOutOfBounds);
				}

				// A pointer must point strictly backward: this alone guarantees termination
				// without needing a separate loop detector, since each hop strictly decreases
				// the position.
				if pointer >= pos {
					return Err(NameError::PointerLoop);
				}

				if resume_at.is_none() {
					resume_at = Some(pos + 2);
				}

				pos = pointer;
			}
			0x00 if len == 0 => {
				pos += 1;
				break;
			}
			0x00 => {
				let label_len = len as usize;

				if label_len > MAX_LABEL_LEN {
					return Err(NameError::LabelTooLong);
				}

				let label_start = pos + 1;
				let label_end = label_start.checked_add(label_len).ok_or(NameError::Truncated)?;
				let label = packet.get(label_start..label_end).ok_or(NameError::Truncated)?;

				budget = budget.checked_sub(label_len + 1).ok_or(NameError::NameTooLong)?;

				if !name.is_empty() {
					name.push('.');
				}
				name.push_str(&String::from_utf8_lossy(label));

				pos = label_end;
			}
			_ => return Err(NameError::PointerLoop),
		}
	}

	Ok((name, resume_at.unwrap_or(pos)))
}

/// Writes `name` without compression: length-prefixed labels terminated by a zero octet.
pub fn encode(name: &str, out: &mut Vec<u8>) -> Result<(), NameError> {
	let mut total = 0usize;

	for label in name.split('.').filter(|s| !s.is_empty()) {
		let bytes = label.as_bytes();

		if bytes.len() > MAX_LABEL_LEN {
			return Err(NameError::LabelTooLong);
		}

		total += bytes.len() + 1;
		if total > MAX_NAME_LEN {
			return Err(NameError::NameTooLong);
		}

		out.push(bytes.len() as u8);
		out.extend_from_slice(bytes);
	}

	out.push(0);

	Ok(())
}

/// Suffix -> packet-offset table used to replace a repeated name suffix with a 14-bit
/// back-pointer. A simple fixed-capacity linear-probe array, per spec: compression is an
/// optimization, so a full table just falls back to emitting the labels literally.
pub struct CompressionTable {
	entries: [Option<(String, u16)>; TABLE_CAPACITY],
}

impl Default for CompressionTable {
	fn default() -> Self {
		Self { entries: [const { None }; TABLE_CAPACITY] }
	}
}

impl CompressionTable {
	pub fn new() -> Self {
		Self::default()
	}

	fn slot(key: &str) -> usize {
		let mut hash: u64 = 0xcbf29ce484222325;

		for byte in key.bytes() {
			hash ^= byte as u64;
			hash = hash.wrapping_mul(0x100000001b3);
		}

		(hash % TABLE_CAPACITY as u64) as usize
	}

	fn find(&self, key: &str) -> Option<u16> {
		let start = Self::slot(key);

		for probe in 0..TABLE_CAPACITY {
			match &self.entries[(start + probe) % TABLE_CAPACITY] {
				Some((k, offset)) if k == key => return Some(*offset),
				None => return None,
				_ => continue,
			}
		}

		None
	}

	fn insert(&mut self, key: String, offset: u16) {
		let start = Self::slot(&key);

		for probe in 0..TABLE_CAPACITY {
			let slot = &mut self.entries[(start + probe) % TABLE_CAPACITY];

			if slot.is_none() {
				*slot = Some((key, offset));
				return;
			}
		}
	}
}

/// Writes `name` into `out`, where `out` is the whole in-progress packet (so `out.len()` is
/// always the absolute offset a pointer would need). Replaces the longest already-seen suffix
/// with a back-pointer and records every new suffix this call emits for future reuse.
pub fn encode_compressed(name: &str, out: &mut Vec<u8>, table: &mut CompressionTable) -> Result<(), NameError> {
	let labels: Vec<&str> = name.split('.').filter(|s| !s.is_empty()).collect();
	let mut total = 0usize;

	for i in 0..labels.len() {
		let suffix = labels[i..].join(".");

		if let Some(pointer) = table.find(&suffix) {
			let encoded = 0xC000u16 | pointer;
			out.push((encoded >> 8) as u8);
			out.push((encoded & 0xFF) as u8);
			return Ok(());
		}

		let offset = out.len();
		if offset < 0x4000 {
			table.insert(suffix, offset as u16);
		}

		let bytes = labels[i].as_bytes();

		if bytes.len() > MAX_LABEL_LEN {
			return Err(NameError::LabelTooLong);
		}

		total += bytes.len() + 1;
		if total > MAX_NAME_LEN {
			return Err(NameError::NameTooLong);
		}

		out.push(bytes.len() as u8);
		out.extend_from_slice(bytes);
	}

	out.push(0);

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip_simple_name() {
		let mut packet = vec![0; 12];
		encode("www.example.com", &mut packet).unwrap();

		let (name, end) = decode(&packet, 12).unwrap();
		assert_eq!(name, "www.example.com");
		assert_eq!(end, packet.len());
	}

	#[test]
	fn rejects_forward_pointer() {
		let packet = [0xC0, 0x02, 0x00];
		assert_eq!(decode(&packet, 0), Err(NameError::PointerLoop));
	}

	#[test]
	fn rejects_oversized_label() {
		let mut out = Vec::new();
		let label = "a".repeat(64);
		assert_eq!(encode(&label, &mut out), Err(NameError::LabelTooLong));
	}

	#[test]
	fn decodes_rfc1035_pointer_example() {
		// RFC1035 4.1.4's own example packet.
		let mut packet = [0u8; 93];
		packet[20..32].copy_from_slice(&[1, b'f', 3, b'i', b's', b'i', 4, b'a', b'r', b'p', b'a', 0]);
		packet[40..46].copy_from_slice(&[3, b'f', b'o', b'o', 0b11000000, 20]);
		packet[64..66].copy_from_slice(&[0b11000000, 26]);
		packet[92] = 0;

		let (name, end) = decode(&packet, 20).unwrap();
		assert_eq!(name, "f.isi.arpa");
		assert_eq!(end, 32);

		let (name, end) = decode(&packet, 40).unwrap();
		assert_eq!(name, "foo.f.isi.arpa");
		assert_eq!(end, 46);

		let (name, end) = decode(&packet, 64).unwrap();
		assert_eq!(name, "arpa");
		assert_eq!(end, 66);

		let (name, end) = decode(&packet, 92).unwrap();
		assert_eq!(name, "");
		assert_eq!(end, 93);
	}

	#[test]
	fn compression_reuses_suffix_offset() {
		let mut out = vec![0; 12];
		let mut table = CompressionTable::new();

		encode_compressed("www.example.com", &mut out, &mut table).unwrap();
		let first_len = out.len();

		encode_compressed("mail.example.com", &mut out, &mut table).unwrap();

		// "example.com" should have compressed to a 2-byte pointer instead of being
		// spelled out again.
		assert!(out.len() - first_len < "example.com".len());

		let (name, _) = decode(&out, 12).unwrap();
		assert_eq!(name, "www.example.com");

		let (name, _) = decode(&out, first_len).unwrap();
		assert_eq!(name, "mail.example.com");
	}
}
