//! Ownership wrapper around a non-blocking UDP socket.
//!
//! The teacher's `net::udp` module multiplexes datagrams over its own virtual IP stack
//! (ephemeral-port map, pseudo-header checksums). This resolver runs directly over real OS
//! sockets, so it only needs `runtime::Io`'s non-blocking recvfrom/sendto plumbing — every
//! datagram, inbound or outbound, carries an explicit peer address either way.

use std::net::{SocketAddr, UdpSocket};

use runtime::Io;
use stakker::Fwd;
use utils::error::Result;

pub struct Socket {
	io: Io<UdpSocket>,
}

impl Socket {
	/// Binds an OS-assigned ephemeral port, used for the per-nameserver sockets.
	pub fn bind_ephemeral(callback: Fwd<(SocketAddr, Vec<u8>)>) -> std::io::Result<Self> {
		let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))?;
		socket.set_nonblocking(true)?;

		Ok(Self { io: Io::new(socket, callback) })
	}

	/// Binds a fixed address, used by the server-side responder.
	pub fn bind(addr: SocketAddr, callback: Fwd<(SocketAddr, Vec<u8>)>) -> std::io::Result<Self> {
		let socket = UdpSocket::bind(addr)?;
		socket.set_nonblocking(true)?;

		Ok(Self { io: Io::new(socket, callback) })
	}

	/// Sends a pre-encoded packet to `dest`. The returned `bool` is `true` if it went out
	/// immediately, `false` if it was queued for retry on "would block" (same as `runtime::Io`).
	pub fn write_to(&self, dest: SocketAddr, packet: &[u8]) -> Result<bool> {
		let ((), sent) = self.io.write_to(dest, |cursor| {
			cursor.push(packet);
		})?;

		Ok(sent)
	}
}
