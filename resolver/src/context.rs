//! The top-level actor tying the wire codec, nameserver registry, request table, and search
//! engine together into the resolver/responder described in spec.md §2's data-flow paragraph.
//!
//! No direct teacher precedent at this scale — `net::dns::Resolver` (see `TEACHER.txt`) is the
//! closest analogue: single nameserver, no search, no health tracking, no server side — but its
//! `init`/`CX![]`/`cx.after`/`fwd_to!` plumbing is the pattern this module generalizes.

use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use core::time::Duration;
use std::path::Path;
use std::rc::Rc;

use log::{debug, warn};
use stakker::{fwd_to, Actor, CX};

use crate::config::{resolv_conf, ConfigError, ParseFlags};
use crate::entropy;
use crate::nameserver::{self, NsId};
use crate::request::{self, Answer, Callback, Flags, Origin, Outcome, QueryType, Request, SearchParams};
use crate::search::{self, SearchStateInner};
use crate::server;
use crate::slab;
use crate::udp;
use crate::wire;
use crate::wire::header::Rcode;

/// Failure returned synchronously by `resolve_ipv4`/`resolve_reverse` — spec.md §6 names only
/// one synchronous failure mode for these calls (allocation failure). Rust's allocator aborts
/// rather than returning from `Vec`/`String` growth, so this variant exists for parity with that
/// contract but is not constructed by this implementation; see `DESIGN.md`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ResolveError;

/// The five global tunables from spec.md §3, settable before the resolver starts.
#[derive(Clone, Copy, Debug)]
pub struct ResolverConfig {
	pub cap: usize,
	pub timeout: Duration,
	pub max_retransmits: u32,
	pub max_reissues: u32,
	pub max_consecutive_timeouts: u32,
}

impl Default for ResolverConfig {
	fn default() -> Self {
		Self { cap: request::DEFAULT_CAP, timeout: Duration::from_secs(5), max_retransmits: 3, max_reissues: 1, max_consecutive_timeouts: 3 }
	}
}

impl ResolverConfig {
	pub fn cap(mut self, cap: usize) -> Self {
		self.cap = cap;
		self
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn max_retransmits(mut self, n: u32) -> Self {
		self.max_retransmits = n;
		self
	}

	pub fn max_reissues(mut self, n: u32) -> Self {
		self.max_reissues = n;
		self
	}

	pub fn max_consecutive_timeouts(mut self, n: u32) -> Self {
		self.max_consecutive_timeouts = n;
		self
	}
}

/// The user-supplied callback for a bound server port: receives the parsed query and builds its
/// reply via `ServerRequest`'s `add_*_reply`/`respond`. A boxed closure rather than a `Fwd`,
/// since `Fwd`/`Ret` are consume-only with no way to hand the built `ServerRequest` back to the
/// caller for `respond` to fill in — the spec's builder pattern needs that round trip inside a
/// single call. See `DESIGN.md`.
pub type ServerCallback = Box<dyn FnMut(&mut server::ServerRequest<'_>)>;

struct ServerPortState {
	socket: udp::Socket,
	callback: ServerCallback,
}

pub struct Context {
	registry: nameserver::Registry,
	requests: request::Table,
	search: Rc<SearchStateInner>,
	config: ResolverConfig,
	server_port: Option<ServerPortState>,
}

impl Context {
	/// A default-valued config to customize before passing to [`Context::init`].
	pub fn builder() -> ResolverConfig {
		ResolverConfig::default()
	}

	/// The actor-init entry point (mirrors the teacher's `Resolver::init` shape): constructs a
	/// `Context` with no nameservers and no server port configured yet.
	pub fn init(_cx: CX![], config: ResolverConfig) -> Option<Self> {
		Some(Self {
			registry: nameserver::Registry::default(),
			requests: request::Table::new(config.cap),
			search: Rc::new(SearchStateInner::default()),
			config,
			server_port: None,
		})
	}

	#[cfg(any(test, debug_assertions))]
	fn check_invariants(&self) {
		self.requests.check_invariants();
	}

	#[cfg(not(any(test, debug_assertions)))]
	fn check_invariants(&self) {}

	// ---- Resolver API (spec.md §6) ----

	pub fn resolve_ipv4(&mut self, cx: CX![], name: impl Into<String>, flags: Flags, callback: Callback) -> Result<(), ResolveError> {
		self.start_lookup(cx, name.into(), QueryType::A, flags, callback);
		Ok(())
	}

	pub fn resolve_reverse(&mut self, cx: CX![], addr: Ipv4Addr, flags: Flags, callback: Callback) -> Result<(), ResolveError> {
		let [a, b, c, d] = addr.octets();
		let name = format!("{d}.{c}.{b}.{a}.in-addr.arpa");
		self.start_lookup(cx, name, QueryType::Ptr, flags, callback);
		Ok(())
	}

	fn start_lookup(&mut self, cx: CX![], name: String, qtype: QueryType, flags: Flags, callback: Callback) {
		let search = self.search.clone();
		let searching = !flags.contains(Flags::NO_SEARCH) && !search.suffixes.is_empty();

		let qname = search::candidate_at(&name, &search, flags, 0).unwrap_or_else(|| name.clone());
		let search_params = searching.then(|| SearchParams { origname: name, qtype, suffix_idx: 0, search, flags });

		self.submit(cx, qname, qtype, Origin::User { callback, search: search_params });
	}

	fn submit(&mut self, cx: CX![], qname: String, qtype: QueryType, origin: Origin) {
		let Ok(packet) = wire::query::build(0, &qname, wire_type(qtype)) else {
			// Only a malformed name (too long, empty label, label > 63 bytes) fails here, and a
			// name this crate itself generated or the caller supplied is surfaced as a format
			// failure rather than dropped silently.
			self.finish_origin(cx, origin, Err(Outcome::Format));
			return;
		};

		let req = Request::new(packet, qtype, qname, origin);
		self.requests.enqueue_waiting(req);
		self.pump_waiting(cx);
		self.check_invariants();
	}

	pub fn nameserver_add(&mut self, cx: CX![], addr: Ipv4Addr) -> Result<(), nameserver::AddError> {
		let actor = cx.access_actor().clone();
		let fwd = fwd_to!([actor], on_ns_datagram() as (SocketAddr, Vec<u8>));
		let socket = udp::Socket::bind_ephemeral(fwd)?;

		self.registry.add(addr, socket)?;
		self.pump_waiting(cx);

		Ok(())
	}

	pub fn nameserver_ip_add(&mut self, cx: CX![], addr: &str) -> Result<(), nameserver::AddError> {
		let addr: Ipv4Addr = addr.parse().map_err(|_| nameserver::AddError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad address")))?;
		self.nameserver_add(cx, addr)
	}

	pub fn count_nameservers(&self) -> usize {
		self.registry.count()
	}

	pub fn clear_nameservers_and_suspend(&mut self, cx: CX![]) {
		self.registry.clear();
		self.requests.clear_and_suspend(|timer| cx.timer_del(timer));
	}

	pub fn resume(&mut self, cx: CX![]) {
		self.pump_waiting(cx);
	}

	pub fn search_clear(&mut self, _cx: CX![]) {
		let ndots = self.search.ndots;
		self.search = Rc::new(SearchStateInner { ndots, suffixes: Vec::new() });
	}

	pub fn search_add(&mut self, _cx: CX![], domain: impl Into<String>) {
		let mut suffixes = self.search.suffixes.clone();
		suffixes.push(domain.into());
		self.search = Rc::new(SearchStateInner { ndots: self.search.ndots, suffixes });
	}

	pub fn search_ndots_set(&mut self, _cx: CX![], ndots: u32) {
		self.search = Rc::new(SearchStateInner { ndots, suffixes: self.search.suffixes.clone() });
	}

	/// `resolv_conf_parse`: spec.md §6's five numbered codes, with `OpenFailed` additionally
	/// installing the documented fallback (loopback nameserver + hostname-derived search).
	pub fn resolv_conf_parse(&mut self, cx: CX![], flags: ParseFlags, path: &Path) -> Result<(), ConfigError> {
		let parsed = match resolv_conf::parse(path, flags) {
			Ok(parsed) => parsed,
			Err(ConfigError::OpenFailed) => {
				self.install_fallback_config(cx);
				return Err(ConfigError::OpenFailed);
			}
			Err(e) => return Err(e),
		};

		for addr in parsed.nameservers {
			if let Err(e) = self.nameserver_add(cx, addr) {
				debug!("resolv.conf nameserver {addr} rejected: {e:?}");
			}
		}

		if let Some(suffixes) = parsed.search {
			let ndots = parsed.ndots.unwrap_or(self.search.ndots);
			self.search = Rc::new(SearchStateInner { ndots, suffixes });
		} else if let Some(ndots) = parsed.ndots {
			self.search_ndots_set(cx, ndots);
		}

		if let Some(timeout) = parsed.timeout {
			self.config.timeout = timeout;
		}
		if let Some(attempts) = parsed.attempts {
			self.config.max_retransmits = attempts;
		}

		Ok(())
	}

	fn install_fallback_config(&mut self, cx: CX![]) {
		if let Err(e) = self.nameserver_add(cx, Ipv4Addr::LOCALHOST) {
			warn!("failed to install fallback loopback nameserver: {e:?}");
		}

		let hostname_domain = hostname_search_domain();
		self.search = Rc::new(SearchStateInner { ndots: self.search.ndots, suffixes: hostname_domain.into_iter().collect() });
	}

	/// Binds `addr` and registers `callback` as the server-side responder for datagrams arriving
	/// on it. Replaces any previously registered port; this crate supports one live server port
	/// at a time (see `DESIGN.md`).
	pub fn add_server_port(&mut self, cx: CX![], addr: SocketAddr, callback: ServerCallback) -> std::io::Result<()> {
		let actor = cx.access_actor().clone();
		let fwd = fwd_to!([actor], on_server_datagram() as (SocketAddr, Vec<u8>));
		let socket = udp::Socket::bind(addr, fwd)?;

		self.server_port = Some(ServerPortState { socket, callback });
		Ok(())
	}

	/// Fails every queued request (inflight and waiting) with `SHUTDOWN` if `fail_requests`, then
	/// drops all nameserver sockets and the server port.
	pub fn shutdown(&mut self, cx: CX![], fail_requests: bool) {
		self.requests.drain_all(|mut req| {
			if let Some(timer) = req.timeout.take() {
				cx.timer_del(timer);
			}

			if fail_requests {
				if let Origin::User { callback, .. } = req.origin {
					callback.ret(Err(Outcome::Shutdown));
				}
			}
		});

		self.registry.clear();
		self.server_port = None;
	}

	// ---- Request engine (spec.md §4.3/§4.4) ----

	fn pump_waiting(&mut self, cx: CX![]) {
		while self.requests.has_capacity() && self.registry.good_count() > 0 {
			let Some(waiting_id) = self.requests.waiting_iter().next().map(|(id, _)| id) else { break };
			let Some(ns) = self.registry.pick() else { break };

			let trans_id = self.requests.pick_trans_id(entropy::next_u16);
			let id = self.requests.promote(waiting_id, trans_id, ns);

			let req = self.requests.inflight_get_mut(id);
			req.packet[0] = (trans_id >> 8) as u8;
			req.packet[1] = trans_id as u8;

			self.transmit(cx, id);
		}
	}

	fn transmit(&mut self, cx: CX![], id: slab::Id) {
		let ns = self.requests.inflight_get(id).ns.expect("inflight request must have a nameserver");

		let Some(addr) = self.registry.addr(ns) else {
			self.fail_nameserver(cx, ns);
			return;
		};

		let dest = SocketAddr::V4(SocketAddrV4::new(addr, 53));

		let result = {
			let req = self.requests.inflight_get(id);
			self.registry.socket(ns).expect("resolved nameserver has a socket").write_to(dest, &req.packet)
		};

		match result {
			Ok(_sent) => {
				let req = self.requests.inflight_get_mut(id);
				req.tx_count += 1;
				req.transmit_me = false;
				self.arm_timeout(cx, id);
			}
			Err(()) => self.fail_nameserver(cx, ns),
		}

		self.check_invariants();
	}

	fn arm_timeout(&mut self, cx: CX![], id: slab::Id) {
		let actor = cx.access_actor().clone();
		let timeout = self.config.timeout;

		let key = cx.after(timeout, move |s| actor.apply(s, move |ctx, cx| ctx.on_timeout(cx, id)));
		self.requests.inflight_get_mut(id).timeout = Some(key);
	}

	fn on_timeout(&mut self, cx: CX![], id: slab::Id) {
		let ns = self.requests.inflight_get(id).ns.expect("inflight request must have a nameserver");

		let server_failed = self.registry.record_timeout(ns, self.config.max_consecutive_timeouts);
		if server_failed {
			self.fail_nameserver(cx, ns);
		}

		if self.requests.inflight_get(id).tx_count >= self.config.max_retransmits {
			self.complete(cx, id, Err(Outcome::Timeout));
			return;
		}

		if server_failed {
			match self.registry.pick() {
				Some(new_ns) => self.requests.inflight_get_mut(id).ns = Some(new_ns),
				None => {
					self.complete(cx, id, Err(Outcome::Timeout));
					return;
				}
			}
		}

		self.transmit(cx, id);
	}

	/// up -> down, schedules a probe, and re-homes every inflight request assigned to `ns` that
	/// hasn't transmitted yet (spec.md §4.2's "re-home any request that has not yet transmitted").
	fn fail_nameserver(&mut self, cx: CX![], ns: NsId) {
		let Some(delay) = self.registry.mark_failed(ns) else { return };
		self.schedule_probe(cx, ns, delay);

		let to_rehome: Vec<slab::Id> = self.requests.inflight_iter().filter(|(_, r)| r.ns == Some(ns) && r.tx_count == 0).map(|(id, _)| id).collect();

		for id in to_rehome {
			self.rehome(cx, id, Outcome::ServerFailed);
		}
	}

	/// Moves a request that hasn't transmitted a byte yet onto a freshly picked nameserver,
	/// because the one it was sitting on went down under it. Unlike `reissue` (§4.4, a semantic
	/// error reply from a server that did answer), nothing about this request's own query was at
	/// fault, so it costs nothing from `reissue_count`/`max_reissues` — per spec.md §4.2/§4.4,
	/// that budget is scoped to reissues, not to this kind of re-home.
	fn rehome(&mut self, cx: CX![], id: slab::Id, outcome_if_abandoned: Outcome) {
		let Some(new_ns) = self.registry.pick() else {
			self.complete(cx, id, Err(outcome_if_abandoned));
			return;
		};

		let req = self.requests.inflight_get_mut(id);
		if let Some(timer) = req.timeout.take() {
			cx.timer_del(timer);
		}
		req.ns = Some(new_ns);
		req.transmit_me = true;

		self.transmit(cx, id);
	}

	/// Moves a request to a freshly picked nameserver after a semantic error or send failure.
	/// Distinct from retransmit (same server, after a timeout) per spec.md §4.4.
	fn reissue(&mut self, cx: CX![], id: slab::Id, outcome_if_abandoned: Outcome) {
		let req = self.requests.inflight_get(id);

		if req.reissue_count >= self.config.max_reissues {
			self.complete(cx, id, Err(outcome_if_abandoned));
			return;
		}

		let old_ns = req.ns;

		let Some(new_ns) = self.registry.pick() else {
			self.complete(cx, id, Err(outcome_if_abandoned));
			return;
		};

		if Some(new_ns) == old_ns {
			self.complete(cx, id, Err(outcome_if_abandoned));
			return;
		}

		let req = self.requests.inflight_get_mut(id);
		if let Some(timer) = req.timeout.take() {
			cx.timer_del(timer);
		}
		req.ns = Some(new_ns);
		req.tx_count = 0;
		req.reissue_count += 1;
		req.transmit_me = true;

		self.transmit(cx, id);
	}

	// ---- Reply dispatch (spec.md §4.3's `reply_handle`) ----

	fn on_ns_datagram(&mut self, cx: CX![], src: SocketAddr, buf: Vec<u8>) {
		let SocketAddr::V4(src) = src else { return };

		let Some(ns) = self.registry.find_by_addr(*src.ip()) else {
			debug!("dropping reply from unconfigured address {src}");
			return;
		};

		let reply = match wire::reply::parse(&buf) {
			Ok(reply) => reply,
			Err(_) => {
				debug!("dropping malformed reply from {src}");
				return;
			}
		};

		let Some(id) = self.requests.find_inflight(reply.id) else { return };

		if self.requests.inflight_get(id).ns != Some(ns) {
			// A reply whose trans-id happens to match but whose source doesn't match the
			// request's assigned nameserver — dropped as a likely off-path spoof attempt.
			return;
		}

		self.reply_handle(cx, id, &buf, reply);
	}

	fn reply_handle(&mut self, cx: CX![], id: slab::Id, buf: &[u8], reply: wire::reply::Reply) {
		if reply.truncated {
			self.complete(cx, id, Err(Outcome::Truncated));
			return;
		}

		let outcome = match reply.rcode {
			Rcode::Ok => None,
			Rcode::FormatErr => Some(Outcome::Format),
			Rcode::ServerFailure => Some(Outcome::ServerFailed),
			Rcode::NameErr => Some(Outcome::NotExist),
			Rcode::NotImplemented => Some(Outcome::NotImpl),
			Rcode::Refused => Some(Outcome::Refused),
			Rcode::Reserved => Some(Outcome::Unknown),
		};

		let ns = self.requests.inflight_get(id).ns.expect("inflight reply target must have a nameserver");

		match outcome {
			None => {
				self.registry.record_success(ns);
				self.finish_success(cx, id, buf, &reply);
			}
			Some(bad @ (Outcome::ServerFailed | Outcome::NotImpl | Outcome::Refused)) => {
				self.fail_nameserver(cx, ns);
				self.reissue(cx, id, bad);
			}
			Some(other) => self.complete(cx, id, Err(other)),
		}
	}

	fn finish_success(&mut self, cx: CX![], id: slab::Id, buf: &[u8], reply: &wire::reply::Reply) {
		let qtype = self.requests.inflight_get(id).qtype;
		let qname = self.requests.inflight_get(id).qname.clone();

		match qtype {
			QueryType::A => {
				let (addrs, ttl) = wire::reply::extract_ipv4(buf, reply, &qname);
				let mut arr = [Ipv4Addr::UNSPECIFIED; 4];
				let count = addrs.len().min(arr.len());
				arr[..count].copy_from_slice(&addrs[..count]);

				self.complete(cx, id, Ok(Answer::A(arr, count as u8, ttl.unwrap_or(0))));
			}
			QueryType::Ptr => match wire::reply::extract_ptr(buf, reply, &qname) {
				Some((host, _ttl)) => self.complete(cx, id, Ok(Answer::Ptr(host))),
				None => self.complete(cx, id, Err(Outcome::NotExist)),
			},
		}
	}

	/// Removes `id` from the inflight list, cancels its timeout, and dispatches `result` to
	/// whatever the request was for (user callback, possibly advancing a search; or a probe).
	fn complete(&mut self, cx: CX![], id: slab::Id, result: Result<Answer, Outcome>) {
		let mut req = self.requests.remove_inflight(id);
		if let Some(timer) = req.timeout.take() {
			cx.timer_del(timer);
		}

		self.finish_origin(cx, req.origin, result);
		self.pump_waiting(cx);
		self.check_invariants();
	}

	fn finish_origin(&mut self, cx: CX![], origin: Origin, result: Result<Answer, Outcome>) {
		match origin {
			Origin::Probe { target } => self.handle_probe_result(cx, target, result),
			Origin::User { callback, search: Some(params) } if result.is_err() => {
				self.advance_search(cx, params, callback, result.unwrap_err());
			}
			Origin::User { callback, .. } => callback.ret(result),
		}
	}

	/// Builds the next search candidate and re-submits it, or — once the candidate list is
	/// exhausted — surfaces `last_error` to the user callback (spec.md §4.5).
	fn advance_search(&mut self, cx: CX![], params: SearchParams, callback: Callback, last_error: Outcome) {
		let next_idx = params.suffix_idx + 1;

		match search::candidate_at(&params.origname, &params.search, params.flags, next_idx) {
			Some(qname) => {
				let next_params = SearchParams { origname: params.origname, qtype: params.qtype, suffix_idx: next_idx, search: params.search, flags: params.flags };
				self.submit(cx, qname, params.qtype, Origin::User { callback, search: Some(next_params) });
			}
			None => callback.ret(Err(last_error)),
		}
	}

	// ---- Nameserver health (spec.md §4.2's probing) ----

	fn schedule_probe(&mut self, cx: CX![], ns: NsId, delay: Duration) {
		if let Some(old) = self.registry.take_probe_timer(ns) {
			cx.timer_del(old);
		}

		let actor = cx.access_actor().clone();
		let key = cx.after(delay, move |s| actor.apply(s, move |ctx, cx| ctx.fire_probe(cx, ns)));
		self.registry.set_probe_timer(ns, key);
	}

	fn fire_probe(&mut self, cx: CX![], ns: NsId) {
		if self.registry.get(ns).is_none() {
			return;
		}

		let trans_id = self.requests.pick_trans_id(entropy::next_u16);
		let Ok(packet) = wire::query::build(trans_id, "www.google.com", wire::TYPE_A) else { return };

		let mut req = Request::new(packet, QueryType::A, "www.google.com".into(), Origin::Probe { target: ns });
		req.id = trans_id;
		req.ns = Some(ns);

		let id = self.requests.insert_inflight(req);
		self.transmit(cx, id);
	}

	fn handle_probe_result(&mut self, cx: CX![], ns: NsId, result: Result<Answer, Outcome>) {
		// A probe is judged "coherent" (server is back up) on any real answer, or on NXDOMAIN —
		// spec.md §4.2 explicitly treats NONE and NXDOMAIN alike here, unlike a normal lookup
		// where NXDOMAIN is a failure that advances the search.
		match result {
			Ok(_) | Err(Outcome::NotExist) => self.registry.mark_probe_succeeded(ns),
			Err(_) => {
				if let Some(delay) = self.registry.mark_probe_failed(ns) {
					self.schedule_probe(cx, ns, delay);
				}
			}
		}
	}

	// ---- Server side (spec.md §4.6) ----

	fn on_server_datagram(&mut self, _cx: CX![], src: SocketAddr, buf: Vec<u8>) {
		let Some(port) = &mut self.server_port else { return };
		let ServerPortState { socket, callback } = port;

		let mut req = match server::ServerRequest::from_query(&buf, src, |packet| socket.write_to(src, packet)) {
			Ok(req) => req,
			Err(_) => {
				debug!("dropping malformed server query from {src}");
				return;
			}
		};

		callback(&mut req);
	}
}

fn wire_type(qtype: QueryType) -> u16 {
	match qtype {
		QueryType::A => wire::TYPE_A,
		QueryType::Ptr => wire::TYPE_PTR,
	}
}

/// The search domain `resolv_conf_parse`'s `OpenFailed` fallback installs: the local hostname's
/// own domain part, if the hostname is itself dotted (matches glibc's `res_init` fallback).
fn hostname_search_domain() -> Option<String> {
	let hostname = sys_hostname()?;
	let (_, domain) = hostname.split_once('.')?;

	Some(domain.to_string())
}

#[cfg(unix)]
fn sys_hostname() -> Option<String> {
	let mut buf = vec![0u8; 256];

	let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
	if rc != 0 {
		return None;
	}

	let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
	String::from_utf8(buf[..end].to_vec()).ok()
}

#[cfg(windows)]
fn sys_hostname() -> Option<String> {
	std::env::var("COMPUTERNAME").ok()
}

/// End-to-end scenarios from spec.md §8, driven against a real `Stakker` core with a
/// manually-advanced clock (`core.run(t, ...)` runs whatever is due at `t`, with no real
/// sleeping) and real-but-inert loopback sockets standing in for nameservers — replies are
/// synthesized with `server::ServerRequest` and injected straight through `on_ns_datagram`
/// rather than actually round-tripped over the socket, since `runtime`'s poll loop is built as a
/// single top-level driver and isn't meant to be stepped piecewise from a test. See `DESIGN.md`.
#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::time::Instant;

	use stakker::{actor, ret_nop, ActorOwn, Stakker};

	use super::*;
	use crate::wire::header::Rcode;

	fn spawn(core: &mut Stakker, config: ResolverConfig) -> ActorOwn<Context> {
		let ctx = actor!(core, Context::init(config), ret_nop!());
		core.run(Instant::now(), false);
		ctx
	}

	fn fast_config() -> ResolverConfig {
		ResolverConfig::default().timeout(Duration::from_millis(50)).max_retransmits(3).max_reissues(2)
	}

	fn single_inflight(ctx: &Context) -> (u16, Vec<u8>, String, Ipv4Addr) {
		let (_, req) = ctx.requests.inflight_iter().next().expect("one inflight request");
		let ns = req.ns.expect("inflight request must have a nameserver");
		let addr = ctx.registry.addr(ns).expect("nameserver must resolve");
		(req.id, req.packet.clone(), req.qname.clone(), addr)
	}

	fn build_a_reply(query: &[u8], qname: &str, rcode: Rcode, answer: Option<Ipv4Addr>) -> Vec<u8> {
		let mut req = server::ServerRequest::from_query(query, "0.0.0.0:0".parse().unwrap(), |_| Ok(true)).unwrap();

		if let Some(addr) = answer {
			req.add_a_reply(server::Section::Answer, qname, 300, addr);
		}

		req.respond(rcode, false).unwrap();
		req.response().unwrap().to_vec()
	}

	fn deliver(core: &mut Stakker, ctx: &ActorOwn<Context>, from: Ipv4Addr, packet: Vec<u8>) {
		ctx.apply(core, move |c, cx| c.on_ns_datagram(cx, SocketAddr::V4(SocketAddrV4::new(from, 53)), packet));
		core.run(Instant::now(), false);
	}

	fn capture_callback() -> (Callback, std::rc::Rc<RefCell<Option<Result<Answer, Outcome>>>>) {
		let slot = std::rc::Rc::new(RefCell::new(None));
		let slot2 = slot.clone();

		(stakker::Ret::new(move |r| *slot2.borrow_mut() = Some(r)), slot)
	}

	#[test]
	fn happy_path_a_lookup_succeeds_on_first_reply() {
		let mut core = Stakker::new(Instant::now());
		let ctx = spawn(&mut core, fast_config());

		ctx.apply(&mut core, |c, cx| c.nameserver_add(cx, Ipv4Addr::new(127, 0, 0, 1)).unwrap());
		core.run(Instant::now(), false);

		let (cb, slot) = capture_callback();
		ctx.apply(&mut core, move |c, cx| c.resolve_ipv4(cx, "example.com", Flags::NONE, cb).unwrap());
		core.run(Instant::now(), false);

		let (_, packet, qname, ns_addr) = ctx.apply(&mut core, |c, _| single_inflight(c));
		let reply = build_a_reply(&packet, &qname, Rcode::Ok, Some(Ipv4Addr::new(93, 184, 216, 34)));

		deliver(&mut core, &ctx, ns_addr, reply);

		match slot.borrow_mut().take().expect("callback fired") {
			Ok(Answer::A(addrs, count, _ttl)) => {
				assert_eq!(count, 1);
				assert_eq!(addrs[0], Ipv4Addr::new(93, 184, 216, 34));
			}
			other => panic!("expected a successful A answer, got {other:?}"),
		}
	}

	#[test]
	fn timeout_triggers_a_retransmit_then_succeeds() {
		let mut core = Stakker::new(Instant::now());
		let ctx = spawn(&mut core, fast_config());

		ctx.apply(&mut core, |c, cx| c.nameserver_add(cx, Ipv4Addr::new(127, 0, 0, 1)).unwrap());
		core.run(Instant::now(), false);

		let (cb, slot) = capture_callback();
		ctx.apply(&mut core, move |c, cx| c.resolve_ipv4(cx, "example.com", Flags::NONE, cb).unwrap());
		core.run(Instant::now(), false);

		let tx_before = ctx.apply(&mut core, |c, _| single_inflight(c).0);

		// Let the first attempt's timeout fire with no reply.
		core.run(Instant::now() + Duration::from_millis(200), false);

		let (id_after, packet, qname, ns_addr) = ctx.apply(&mut core, |c, _| single_inflight(c));
		assert_eq!(id_after, tx_before, "retransmit keeps the same transaction id");

		let reply = build_a_reply(&packet, &qname, Rcode::Ok, Some(Ipv4Addr::new(10, 0, 0, 1)));
		deliver(&mut core, &ctx, ns_addr, reply);

		assert!(matches!(slot.borrow_mut().take(), Some(Ok(Answer::A(_, 1, _)))));
	}

	#[test]
	fn server_failure_fails_over_to_the_other_nameserver() {
		let mut core = Stakker::new(Instant::now());
		let ctx = spawn(&mut core, fast_config());

		ctx.apply(&mut core, |c, cx| c.nameserver_add(cx, Ipv4Addr::new(127, 0, 0, 1)).unwrap());
		ctx.apply(&mut core, |c, cx| c.nameserver_add(cx, Ipv4Addr::new(127, 0, 0, 2)).unwrap());
		core.run(Instant::now(), false);

		let (cb, slot) = capture_callback();
		ctx.apply(&mut core, move |c, cx| c.resolve_ipv4(cx, "example.com", Flags::NONE, cb).unwrap());
		core.run(Instant::now(), false);

		let (_, packet, qname, first_addr) = ctx.apply(&mut core, |c, _| single_inflight(c));
		let failure = build_a_reply(&packet, &qname, Rcode::ServerFailure, None);
		deliver(&mut core, &ctx, first_addr, failure);

		let (_, packet2, qname2, second_addr) = ctx.apply(&mut core, |c, _| single_inflight(c));
		assert_ne!(second_addr, first_addr, "reissue must pick the other nameserver");

		let success = build_a_reply(&packet2, &qname2, Rcode::Ok, Some(Ipv4Addr::new(8, 8, 8, 8)));
		deliver(&mut core, &ctx, second_addr, success);

		assert!(matches!(slot.borrow_mut().take(), Some(Ok(Answer::A(_, 1, _)))));
	}

	#[test]
	fn search_suffix_is_tried_after_nxdomain_on_the_bare_name() {
		let mut core = Stakker::new(Instant::now());
		let ctx = spawn(&mut core, fast_config());

		ctx.apply(&mut core, |c, cx| c.nameserver_add(cx, Ipv4Addr::new(127, 0, 0, 1)).unwrap());
		ctx.apply(&mut core, |c, cx| c.search_add(cx, "corp.example"));
		core.run(Instant::now(), false);

		let (cb, slot) = capture_callback();
		ctx.apply(&mut core, move |c, cx| c.resolve_ipv4(cx, "host", Flags::NONE, cb).unwrap());
		core.run(Instant::now(), false);

		let (_, packet, qname, ns_addr) = ctx.apply(&mut core, |c, _| single_inflight(c));
		assert_eq!(qname, "host.corp.example", "suffix tried before the bare name below ndots");

		let nxdomain = build_a_reply(&packet, &qname, Rcode::NameErr, None);
		deliver(&mut core, &ctx, ns_addr, nxdomain);

		let (_, packet2, qname2, ns_addr2) = ctx.apply(&mut core, |c, _| single_inflight(c));
		assert_eq!(qname2, "host", "falls back to the bare name once suffixes are exhausted");

		let success = build_a_reply(&packet2, &qname2, Rcode::Ok, Some(Ipv4Addr::new(1, 2, 3, 4)));
		deliver(&mut core, &ctx, ns_addr2, success);

		assert!(matches!(slot.borrow_mut().take(), Some(Ok(Answer::A(_, 1, _)))));
	}

	#[test]
	fn inflight_cap_holds_the_second_request_on_the_waiting_list() {
		let mut core = Stakker::new(Instant::now());
		let ctx = spawn(&mut core, fast_config().cap(1));

		ctx.apply(&mut core, |c, cx| c.nameserver_add(cx, Ipv4Addr::new(127, 0, 0, 1)).unwrap());
		core.run(Instant::now(), false);

		let (cb_a, slot_a) = capture_callback();
		ctx.apply(&mut core, move |c, cx| c.resolve_ipv4(cx, "a.example.com", Flags::NONE, cb_a).unwrap());
		core.run(Instant::now(), false);

		let (cb_b, slot_b) = capture_callback();
		ctx.apply(&mut core, move |c, cx| c.resolve_ipv4(cx, "b.example.com", Flags::NONE, cb_b).unwrap());
		core.run(Instant::now(), false);

		let (inflight, waiting) = ctx.apply(&mut core, |c, _| (c.requests.inflight_len(), c.requests.waiting_len()));
		assert_eq!((inflight, waiting), (1, 1), "second request waits for capacity");

		let (_, packet, qname, ns_addr) = ctx.apply(&mut core, |c, _| single_inflight(c));
		let reply = build_a_reply(&packet, &qname, Rcode::Ok, Some(Ipv4Addr::new(1, 1, 1, 1)));
		deliver(&mut core, &ctx, ns_addr, reply);

		assert!(slot_a.borrow().is_some());

		let (inflight_after, _) = ctx.apply(&mut core, |c, _| (c.requests.inflight_len(), c.requests.waiting_len()));
		assert_eq!(inflight_after, 1, "the waiting request is promoted once capacity frees up");

		let (_, packet2, qname2, ns_addr2) = ctx.apply(&mut core, |c, _| single_inflight(c));
		let reply2 = build_a_reply(&packet2, &qname2, Rcode::Ok, Some(Ipv4Addr::new(2, 2, 2, 2)));
		deliver(&mut core, &ctx, ns_addr2, reply2);

		assert!(slot_b.borrow().is_some());
	}

	#[test]
	fn clear_and_suspend_requeues_inflight_ahead_of_waiting() {
		let mut core = Stakker::new(Instant::now());
		let ctx = spawn(&mut core, fast_config().cap(1));

		ctx.apply(&mut core, |c, cx| c.nameserver_add(cx, Ipv4Addr::new(127, 0, 0, 1)).unwrap());
		core.run(Instant::now(), false);

		let (cb_a, _slot_a) = capture_callback();
		ctx.apply(&mut core, move |c, cx| c.resolve_ipv4(cx, "a.example.com", Flags::NONE, cb_a).unwrap());
		core.run(Instant::now(), false);

		let (cb_b, _slot_b) = capture_callback();
		ctx.apply(&mut core, move |c, cx| c.resolve_ipv4(cx, "b.example.com", Flags::NONE, cb_b).unwrap());
		core.run(Instant::now(), false);

		ctx.apply(&mut core, |c, cx| c.clear_nameservers_and_suspend(cx));
		core.run(Instant::now(), false);

		let names = ctx.apply(&mut core, |c, _| c.requests.waiting_iter().map(|(_, r)| r.qname.clone()).collect::<Vec<_>>());
		assert_eq!(names, ["a.example.com", "b.example.com"], "inflight request is requeued ahead of the one already waiting");

		ctx.apply(&mut core, |c, cx| {
			c.nameserver_add(cx, Ipv4Addr::new(127, 0, 0, 3)).unwrap();
			c.resume(cx);
		});
		core.run(Instant::now(), false);

		let (inflight, waiting) = ctx.apply(&mut core, |c, _| (c.requests.inflight_len(), c.requests.waiting_len()));
		assert_eq!((inflight, waiting), (1, 1), "resume pumps one request back onto the wire");
	}
}
