//! Windows nameserver discovery via the IP Helper API's adapter list.
//!
//! No teacher precedent (the teacher is Unix-only). Per spec.md §1 the actual discovery
//! mechanism is an external collaborator — this adapter does the minimum FFI needed to turn
//! `GetAdaptersAddresses`'s linked list of per-adapter DNS servers into the flat
//! `Vec<Ipv4Addr>` `Context::resolv_conf_parse`'s Windows path feeds into the registry; it does
//! not attempt to reproduce Windows' own per-adapter priority/suffix heuristics.

use core::net::Ipv4Addr;
use core::ptr;

use windows_sys::Win32::Foundation::{ERROR_BUFFER_OVERFLOW, ERROR_SUCCESS, NO_ERROR};
use windows_sys::Win32::NetworkManagement::IpHelper::{
	GetAdaptersAddresses, GAA_FLAG_SKIP_ANYCAST, GAA_FLAG_SKIP_MULTICAST, GAA_FLAG_SKIP_UNICAST, IP_ADAPTER_ADDRESSES_LH,
};
use windows_sys::Win32::Networking::WinSock::{AF_INET, AF_UNSPEC, SOCKADDR_IN};

/// Starting buffer size for the adapter list, grown on `ERROR_BUFFER_OVERFLOW` as
/// `GetAdaptersAddresses` itself reports is needed.
const INITIAL_BUF_LEN: u32 = 15_000;

/// Enumerates every configured IPv4 DNS server address across all adapters, de-duplicated in
/// first-seen order.
pub fn discover_nameservers() -> std::io::Result<Vec<Ipv4Addr>> {
	let flags = GAA_FLAG_SKIP_UNICAST | GAA_FLAG_SKIP_ANYCAST | GAA_FLAG_SKIP_MULTICAST;
	let mut buf: Vec<u8> = vec![0; INITIAL_BUF_LEN as usize];

	loop {
		let mut size = buf.len() as u32;

		let rc = unsafe {
			GetAdaptersAddresses(AF_UNSPEC as u32, flags, ptr::null(), buf.as_mut_ptr() as *mut IP_ADAPTER_ADDRESSES_LH, &mut size)
		};

		if rc == ERROR_BUFFER_OVERFLOW {
			buf.resize(size as usize, 0);
			continue;
		}

		if rc != ERROR_SUCCESS && rc != NO_ERROR {
			return Err(std::io::Error::from_raw_os_error(rc as i32));
		}

		break;
	}

	let mut out = Vec::new();
	let mut adapter = buf.as_ptr() as *const IP_ADAPTER_ADDRESSES_LH;

	while !adapter.is_null() {
		let mut dns = unsafe { (*adapter).FirstDnsServerAddress };

		while !dns.is_null() {
			let sockaddr = unsafe { (*dns).Address.lpSockaddr };

			if !sockaddr.is_null() && unsafe { (*sockaddr).sa_family } == AF_INET as u16 {
				let sin = sockaddr as *const SOCKADDR_IN;
				let raw = unsafe { (*sin).sin_addr.S_un.S_addr };
				let addr = Ipv4Addr::from(raw.to_ne_bytes());

				if !out.contains(&addr) {
					out.push(addr);
				}
			}

			dns = unsafe { (*dns).Next };
		}

		adapter = unsafe { (*adapter).Next };
	}

	Ok(out)
}
