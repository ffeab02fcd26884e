//! The request table: two lists (inflight, waiting), transaction-id allocation, and the
//! structural bookkeeping `pump_waiting`/`clear_and_suspend` need. The policy that drives these
//! lists (picking a nameserver, transmitting, arming timeouts) lives in `Context`, which is the
//! thing that actually has a `CX![]` to schedule with; grounded on the request/queue split in
//! spec.md §3–§4.3, which has no direct teacher counterpart (the teacher's `net::dns` tracks a
//! single `HashMap<u16, Entry>` with no queueing at all).

use std::collections::HashSet;
use std::net::Ipv4Addr;

use stakker::{FixedTimerKey, Ret};

use crate::nameserver::NsId;
use crate::slab;

/// Reserved as "no transaction id assigned yet" — a request on the waiting list always carries
/// this value.
pub const SENTINEL: u16 = 0xFFFF;

/// Above this inflight cap, trans-id uniqueness is additionally shadowed in a `HashSet` instead
/// of relying solely on the linear scan (spec.md §9).
pub const DEFAULT_CAP: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueryType {
	A,
	Ptr,
}

/// The callback-visible result of a lookup. Mirrors spec.md §6's callback contract; `Outcome`
/// carries every non-success code, `Answer` (below) the success payload.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
	Format,
	ServerFailed,
	NotExist,
	NotImpl,
	Refused,
	Truncated,
	Unknown,
	Timeout,
	Shutdown,
}

#[derive(Clone, Debug)]
pub enum Answer {
	A([Ipv4Addr; 4], u8, u32),
	Ptr(String),
}

pub type Callback = Ret<Result<Answer, Outcome>>;

/// User-supplied flags for `resolve_ipv4`/`resolve_reverse`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Flags(u32);

impl Flags {
	pub const NONE: Flags = Flags(0);
	pub const NO_SEARCH: Flags = Flags(1 << 0);

	pub fn contains(self, other: Flags) -> bool {
		self.0 & other.0 == other.0
	}
}

impl core::ops::BitOr for Flags {
	type Output = Flags;

	fn bitor(self, rhs: Flags) -> Flags {
		Flags(self.0 | rhs.0)
	}
}

/// Carried by a search-originated request so the next candidate can be built once this one
/// fails, and so the shared suffix list stays alive for the duration of the search.
pub struct SearchParams {
	pub origname: String,
	pub qtype: QueryType,
	pub suffix_idx: usize,
	pub search: std::rc::Rc<crate::search::SearchStateInner>,
	pub flags: Flags,
}

/// What a request is *for*: a user lookup (which owns the eventual callback, and may be one
/// attempt in a suffix search), or a synthetic down-nameserver probe (which isn't user-visible
/// at all). Modeled as an enum rather than a handful of "sometimes meaningless" fields on
/// `Request` itself, since the two never share behavior beyond the wire/timeout/retransmit
/// machinery.
pub enum Origin {
	User { callback: Callback, search: Option<SearchParams> },
	Probe { target: NsId },
}

pub struct Request {
	pub id: u16,
	pub packet: Vec<u8>,
	pub qtype: QueryType,
	pub qname: String,
	pub tx_count: u32,
	pub reissue_count: u32,
	pub transmit_me: bool,
	pub ns: Option<NsId>,
	pub timeout: Option<FixedTimerKey>,
	pub origin: Origin,
}

impl Request {
	/// Builds a request in its pre-queue state: no trans-id, no nameserver, not yet
	/// transmitted. `enqueue` decides whether it lands on `waiting` or is promoted straight to
	/// `inflight`.
	pub fn new(packet: Vec<u8>, qtype: QueryType, qname: String, origin: Origin) -> Self {
		Self { id: SENTINEL, packet, qtype, qname, tx_count: 0, reissue_count: 0, transmit_me: true, ns: None, timeout: None, origin }
	}
}

pub struct Table {
	inflight: slab::List<Request>,
	waiting: slab::List<Request>,
	cap: usize,
	shadow: Option<HashSet<u16>>,
}

impl Table {
	pub fn new(cap: usize) -> Self {
		Self { inflight: slab::List::default(), waiting: slab::List::default(), cap, shadow: (cap > DEFAULT_CAP).then(HashSet::new) }
	}

	pub fn cap(&self) -> usize {
		self.cap
	}

	pub fn inflight_len(&self) -> usize {
		self.inflight.len()
	}

	pub fn waiting_len(&self) -> usize {
		self.waiting.len()
	}

	pub fn has_capacity(&self) -> bool {
		self.inflight.len() < self.cap
	}

	pub fn inflight_get(&self, id: slab::Id) -> &Request {
		self.inflight.get(id)
	}

	pub fn inflight_get_mut(&mut self, id: slab::Id) -> &mut Request {
		self.inflight.get_mut(id)
	}

	pub fn inflight_iter(&self) -> impl Iterator<Item = (slab::Id, &Request)> {
		self.inflight.iter()
	}

	pub fn waiting_iter(&self) -> impl Iterator<Item = (slab::Id, &Request)> {
		self.waiting.iter()
	}

	/// Finds the inflight request carrying `trans_id`, if any.
	pub fn find_inflight(&self, trans_id: u16) -> Option<slab::Id> {
		self.inflight.iter().find(|(_, r)| r.id == trans_id).map(|(id, _)| id)
	}

	/// Queues a freshly built request. Returns its slab id on the waiting list; the caller
	/// (`Context::pump_waiting`) is responsible for promoting it when capacity allows.
	pub fn enqueue_waiting(&mut self, req: Request) -> slab::Id {
		debug_assert_eq!(req.id, SENTINEL);
		debug_assert!(req.ns.is_none());

		self.waiting.push_back(req)
	}

	/// Allocates a fresh, unique transaction id using `entropy` as the raw 16-bit source.
	pub fn pick_trans_id(&self, mut entropy: impl FnMut() -> u16) -> u16 {
		loop {
			let candidate = entropy();

			if candidate == SENTINEL {
				continue;
			}

			let collides = match &self.shadow {
				Some(set) => set.contains(&candidate),
				None => self.inflight.iter().any(|(_, r)| r.id == candidate),
			};

			if !collides {
				return candidate;
			}
		}
	}

	/// Moves a request from waiting to inflight, assigning it `trans_id` and `ns`. Returns the
	/// request's new inflight id for the caller to use when arming its timeout.
	pub fn promote(&mut self, waiting_id: slab::Id, trans_id: u16, ns: NsId) -> slab::Id {
		let mut req = self.waiting.remove(waiting_id);
		req.id = trans_id;
		req.ns = Some(ns);

		if let Some(shadow) = &mut self.shadow {
			shadow.insert(trans_id);
		}

		self.inflight.push_back(req)
	}

	/// Force-inserts an already-addressed request (used for nameserver probes) straight onto
	/// the inflight list.
	pub fn insert_inflight(&mut self, req: Request) -> slab::Id {
		debug_assert_ne!(req.id, SENTINEL);

		if let Some(shadow) = &mut self.shadow {
			shadow.insert(req.id);
		}

		self.inflight.push_back(req)
	}

	pub fn remove_inflight(&mut self, id: slab::Id) -> Request {
		let req = self.inflight.remove(id);

		if let Some(shadow) = &mut self.shadow {
			shadow.remove(&req.id);
		}

		req
	}

	/// `clear_and_suspend`: splices every inflight request back onto the head of waiting,
	/// preserving relative order (so `[a,b]` inflight + `[c,d]` waiting becomes `[a,b,c,d]`).
	/// Resets trans-id and nameserver on every spliced request; `dispose_timer` is handed any
	/// armed timeout key so the caller can cancel it with its `CX![]` before it's dropped.
	pub fn clear_and_suspend(&mut self, mut dispose_timer: impl FnMut(FixedTimerKey)) {
		self.inflight.drain_rev(|mut req| {
			if let Some(timer) = req.timeout.take() {
				dispose_timer(timer);
			}
			req.id = SENTINEL;
			req.ns = None;
			self.waiting.push_front(req);
		});

		if let Some(shadow) = &mut self.shadow {
			shadow.clear();
		}
	}

	/// Drains both lists, invoking `f` on every request — used by `shutdown`.
	pub fn drain_all(&mut self, mut f: impl FnMut(Request)) {
		self.inflight.drain_rev(&mut f);
		self.waiting.drain_rev(&mut f);

		if let Some(shadow) = &mut self.shadow {
			shadow.clear();
		}
	}

	#[cfg(any(test, debug_assertions))]
	pub fn check_invariants(&self) {
		let mut seen = HashSet::new();

		for (_, req) in self.inflight.iter() {
			assert_ne!(req.id, SENTINEL, "inflight request missing a transaction id");
			assert!(req.ns.is_some(), "inflight request missing an assigned nameserver");
			assert!(seen.insert(req.id), "duplicate transaction id {} on inflight list", req.id);
		}

		for (_, req) in self.waiting.iter() {
			assert_eq!(req.id, SENTINEL, "waiting request must carry the sentinel id");
			assert!(req.ns.is_none(), "waiting request must not have an assigned nameserver");
		}

		assert!(self.inflight.len() <= self.cap, "inflight count exceeds cap");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn probe_request(id: u16) -> Request {
		let mut req = Request::new(vec![], QueryType::A, "probe".into(), Origin::Probe { target: NsId::dummy() });
		req.id = id;
		req
	}

	#[test]
	fn promote_moves_waiting_to_inflight_with_assigned_fields() {
		let mut table = Table::new(4);
		let req = Request::new(vec![1, 2, 3], QueryType::A, "example.com".into(), Origin::Probe { target: NsId::dummy() });
		let waiting_id = table.enqueue_waiting(req);

		assert_eq!(table.waiting_len(), 1);
		assert_eq!(table.inflight_len(), 0);

		let ns: NsId = NsId::dummy();
		let inflight_id = table.promote(waiting_id, 42, ns);

		assert_eq!(table.waiting_len(), 0);
		assert_eq!(table.inflight_len(), 1);
		assert_eq!(table.inflight_get(inflight_id).id, 42);
	}

	#[test]
	fn trans_id_pick_avoids_collisions_and_sentinel() {
		let mut table = Table::new(4);
		table.insert_inflight(probe_request(7));

		let mut calls = [SENTINEL, 7, 7, 99].into_iter();
		let id = table.pick_trans_id(|| calls.next().unwrap());

		assert_eq!(id, 99);
	}

	#[test]
	fn clear_and_suspend_preserves_order() {
		let mut table = Table::new(4);
		table.insert_inflight(probe_request(1));
		table.insert_inflight(probe_request(2));

		let c = table.enqueue_waiting(Request::new(vec![], QueryType::A, "c".into(), Origin::Probe { target: NsId::dummy() }));
		let _ = c;
		table.enqueue_waiting(Request::new(vec![], QueryType::A, "d".into(), Origin::Probe { target: NsId::dummy() }));

		table.clear_and_suspend(|_| {});

		assert_eq!(table.inflight_len(), 0);
		assert_eq!(table.waiting_len(), 4);

		let names: Vec<&str> = table.waiting_iter().map(|(_, r)| r.qname.as_str()).collect();
		assert_eq!(names, ["probe", "probe", "c", "d"]);
	}
}
