extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use core::time::Duration;
use std::io::{self, ErrorKind};

use collections::bytes::Cursor;
use log::error;
use stakker::Fwd;

mod rt;
pub mod time;

pub use rt::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{
		c_void as BufType, in_addr, recvfrom, sa_family_t, sendto, sockaddr, sockaddr_in, socklen_t, AF_INET, POLLERR, POLLHUP, POLLIN, POLLNVAL,
		POLLOUT,
	};
	pub use libc::{poll, pollfd as Poll};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}

	pub fn sockaddr_in(addr: super::Ipv4Addr, port: u16) -> sockaddr_in {
		sockaddr_in {
			sin_family: AF_INET as sa_family_t,
			sin_port: port.to_be(),
			sin_addr: in_addr { s_addr: u32::from_ne_bytes(addr.octets()) },
			sin_zero: [0; 8],
		}
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use u8 as BufType;
	pub use windows_sys::Win32::Networking::WinSock::{
		recvfrom, sendto, WSAPoll as poll, AF_INET, IN_ADDR, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT,
		SOCKADDR_IN as sockaddr_in, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}

	pub fn sockaddr_in(addr: super::Ipv4Addr, port: u16) -> sockaddr_in {
		sockaddr_in {
			sin_family: AF_INET as _,
			sin_port: port.to_be(),
			sin_addr: IN_ADDR { S_un: windows_sys::Win32::Networking::WinSock::IN_ADDR_0 { S_addr: u32::from_ne_bytes(addr.octets()) } },
			sin_zero: [0; 8],
		}
	}
}

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock) {
				return Ok(None);
			}

			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

fn addr_of(ip: Ipv4Addr, port: u16) -> sockaddr_in {
	sys::sockaddr_in(ip, port)
}

fn addr_from(raw: &sockaddr_in) -> SocketAddr {
	let octets = {
		#[cfg(target_family = "unix")]
		{
			raw.sin_addr.s_addr.to_ne_bytes()
		}
		#[cfg(target_family = "windows")]
		{
			unsafe { raw.sin_addr.S_un.S_addr.to_ne_bytes() }
		}
	};

	SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), u16::from_be(raw.sin_port)))
}

/// Sends a datagram to `dest` on a non-blocking socket, returning `Ok(false)` on "would block".
fn send_to(fd: RawFd, buf: &[u8], dest: SocketAddr) -> Result<bool> {
	let SocketAddr::V4(dest) = dest else {
		error!("IPv6 destinations are not supported");
		return Err(());
	};

	let addr = addr_of(*dest.ip(), dest.port());

	let r = unsafe {
		sys::sendto(
			fd,
			buf.as_ptr() as *const BufType,
			buf.len() as _,
			0,
			&addr as *const sockaddr_in as *const _,
			core::mem::size_of::<sockaddr_in>() as _,
		)
	};

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to socket", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

/// Receives a datagram into `buf`, truncating it to the amount read and returning the sender's address.
fn recv_from(fd: RawFd, buf: &mut Vec<u8>) -> Result<Option<SocketAddr>> {
	let mut addr: sockaddr_in = unsafe { core::mem::zeroed() };
	let mut addrlen = core::mem::size_of::<sockaddr_in>() as _;

	let r = unsafe {
		sys::recvfrom(
			fd,
			buf.as_mut_ptr() as *mut BufType,
			buf.len() as _,
			0,
			&mut addr as *mut sockaddr_in as *mut _,
			&mut addrlen,
		)
	};

	if let Some(n) = ret_to_err(r as _)? {
		buf.truncate(n);
		Ok(Some(addr_from(&addr)))
	} else {
		Ok(None)
	}
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of<T: AsRawFd>(&mut self, socket: &T) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0.. {
			let Poll { fd, events, revents } = &mut self.fds[idx];
			let entry = &mut self.entries[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & POLLERR != 0 {
				panic!("Socket error while polling");
			}

			if *revents & POLLHUP != 0 {
				panic!("Socket hangup");
			}

			if *revents & POLLNVAL != 0 {
				panic!("Socket invalid");
			}

			if *revents & POLLIN != 0 {
				entry.flush_read(*fd)?;
			}

			if *revents & POLLOUT != 0 {
				entry.flush_write(*fd)?;
			};

			*events = POLLIN;

			if !entry.queue.is_empty() {
				*events |= POLLOUT;
			}

			*revents = 0;

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

struct Entry {
	fwd: Fwd<(SocketAddr, Vec<u8>)>,
	queue: VecDeque<(SocketAddr, Box<[u8]>)>,
}

impl Entry {
	fn flush_read(&mut self, fd: RawFd) -> Result {
		let mut buf = vec![0; 1500];

		while let Some(src) = recv_from(fd, &mut buf)? {
			self.fwd.fwd((src, buf));
			buf = vec![0; 1500];
		}

		Ok(())
	}

	fn flush_write(&mut self, fd: RawFd) -> Result {
		assert!(!self.queue.is_empty());

		loop {
			let Some((dest, buf)) = self.queue.back() else { return Ok(()) };

			if !send_to(fd, buf, *dest)? {
				return Ok(());
			}

			self.queue.pop_back();
		}
	}
}

/// A non-blocking UDP socket driven by the process-wide poll(2) loop.
///
/// Unlike a bare `std::net::UdpSocket`, every read yields the sender's address: this serves
/// both sockets "connected" to a single peer (where the address is informational) and sockets
/// bound to accept datagrams from any peer.
pub struct Io<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Io<T> {
	pub fn new(inner: T, fwd: Fwd<(SocketAddr, Vec<u8>)>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { fwd, queue: VecDeque::new() });

			Self { inner }
		})
	}

	/// Writes a datagram to `dest`, queuing it for retry on "would block". The returned `bool` is
	/// `true` if the datagram went out immediately, `false` if it was queued instead.
	pub fn write_to<X>(&self, dest: SocketAddr, f: impl FnOnce(Cursor) -> X) -> Result<(X, bool)> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		let sent = send_to(as_raw(&self.inner), &vec, dest)?;
		if !sent {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front((dest, vec.into_boxed_slice()));
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok((res, sent))
	}
}

impl<T: AsRawFd> Drop for Io<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}
