//! The nameserver registry: a circular round-robin list of upstream recursive resolvers, each
//! tracked as up/down with exponential-backoff probing while down.
//!
//! Grounded on the state machine in `eventdns.c`'s `nameserver_pick`/`nameserver_failed`
//! (`examples/original_source/src/or/eventdns.c`) — the teacher's own `net::dns` module only
//! ever speaks to one fixed server and has no health tracking at all.

use core::net::Ipv4Addr;
use core::time::Duration;

use stakker::FixedTimerKey;

use crate::slab;
use crate::udp;

/// Consecutive-failed-probe count indexes this table (clamped to the last entry); matches
/// spec.md's 10s/60s/300s/900s/3600s schedule.
pub const BACKOFF: [Duration; 5] =
	[Duration::from_secs(10), Duration::from_secs(60), Duration::from_secs(300), Duration::from_secs(900), Duration::from_secs(3600)];

pub fn backoff_delay(failed_times: u32) -> Duration {
	BACKOFF[(failed_times as usize).min(BACKOFF.len() - 1)]
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
	Up,
	Down,
}

pub struct Nameserver {
	pub addr: Ipv4Addr,
	socket: udp::Socket,
	state: State,
	timedout: u32,
	failed_times: u32,
	generation: u32,
	probe_timer: Option<FixedTimerKey>,
}

impl Nameserver {
	pub fn is_up(&self) -> bool {
		self.state == State::Up
	}

	pub fn socket(&self) -> &udp::Socket {
		&self.socket
	}
}

/// A back-reference to a nameserver, validated against a generation counter at dereference so
/// a reference held past removal (and the slot's reuse by a later `add`) is detected rather than
/// silently aliasing the wrong server — see spec.md §9's remark on this exact hazard.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NsId {
	id: slab::Id,
	generation: u32,
}

impl NsId {
	/// A handle that will never resolve against a real registry — used by tests that need to
	/// populate a `Request::ns` / `Origin::Probe` field without a live `Registry`.
	#[cfg(test)]
	pub(crate) fn dummy() -> Self {
		Self { id: slab::Id::dummy(), generation: u32::MAX }
	}
}

#[derive(Debug)]
pub enum AddError {
	Duplicate,
	Io(std::io::Error),
}

impl From<std::io::Error> for AddError {
	fn from(e: std::io::Error) -> Self {
		Self::Io(e)
	}
}

#[derive(Default)]
pub struct Registry {
	list: slab::List<Nameserver>,
	cursor: Option<slab::Id>,
	next_generation: u32,
	good_count: u32,
}

impl Registry {
	pub fn add(&mut self, addr: Ipv4Addr, socket: udp::Socket) -> Result<NsId, AddError> {
		if self.list.iter().any(|(_, ns)| ns.addr == addr) {
			return Err(AddError::Duplicate);
		}

		let generation = self.next_generation;
		self.next_generation += 1;

		let id = self.list.push_back(Nameserver { addr, socket, state: State::Up, timedout: 0, failed_times: 0, generation, probe_timer: None });

		if self.cursor.is_none() {
			self.cursor = Some(id);
		}

		self.good_count += 1;

		Ok(NsId { id, generation })
	}

	pub fn count(&self) -> usize {
		self.list.len()
	}

	pub fn good_count(&self) -> u32 {
		self.good_count
	}

	pub fn iter(&self) -> impl Iterator<Item = (NsId, &Nameserver)> {
		self.list.iter().map(|(id, ns)| (NsId { id, generation: ns.generation }, ns))
	}

	/// Finds the nameserver whose configured address matches `addr` — used to identify which
	/// nameserver a reply came in on (mirrors the teacher's `udp::Connected` source-address
	/// check, since every nameserver socket only ever "talks" to its one configured peer).
	pub fn find_by_addr(&self, addr: Ipv4Addr) -> Option<NsId> {
		self.list.iter().find(|(_, ns)| ns.addr == addr).map(|(id, ns)| NsId { id, generation: ns.generation })
	}

	fn resolve(&self, ns_id: NsId) -> Option<slab::Id> {
		let ns = self.list.try_get(ns_id.id)?;
		(ns.generation == ns_id.generation).then_some(ns_id.id)
	}

	pub fn get(&self, ns_id: NsId) -> Option<&Nameserver> {
		self.resolve(ns_id).map(|id| self.list.get(id))
	}

	/// Rotates the cursor one step and returns the previous position if it was up. If not, it
	/// keeps rotating until it finds one that is, or until one full revolution completes — in
	/// which case it returns wherever the rotation landed regardless of state.
	///
	/// When every server is down (`good_count() == 0`), scanning for an "up" one is pointless —
	/// this takes the same one-step-per-call fast path as the original's
	/// `global_good_nameservers == 0` case, so repeated calls still cycle uniformly through every
	/// server instead of latching onto whichever one the scan happened to land on first.
	pub fn pick(&mut self) -> Option<NsId> {
		let start = self.cursor?;

		if self.good_count == 0 {
			let advanced = self.list.next(start).or_else(|| self.list.head()).unwrap();
			self.cursor = advanced;

			let ns = self.list.get(advanced);
			return Some(NsId { id: advanced, generation: ns.generation });
		}

		loop {
			let candidate = self.cursor.unwrap();
			let advanced = self.list.next(candidate).or_else(|| self.list.head()).unwrap();
			self.cursor = advanced;

			let ns = self.list.get(candidate);
			if ns.state == State::Up {
				return Some(NsId { id: candidate, generation: ns.generation });
			}

			if advanced == start {
				let ns = self.list.get(advanced);
				return Some(NsId { id: advanced, generation: ns.generation });
			}
		}
	}

	/// up -> down. Returns the probe delay to schedule if a transition actually happened.
	pub fn mark_failed(&mut self, ns_id: NsId) -> Option<Duration> {
		let id = self.resolve(ns_id)?;
		let ns = self.list.get_mut(id);

		if ns.state == State::Down {
			return None;
		}

		ns.state = State::Down;
		ns.failed_times = 1;
		ns.timedout = 0;
		self.good_count -= 1;

		Some(backoff_delay(ns.failed_times))
	}

	pub fn set_probe_timer(&mut self, ns_id: NsId, key: FixedTimerKey) {
		if let Some(id) = self.resolve(ns_id) {
			self.list.get_mut(id).probe_timer = Some(key);
		}
	}

	pub fn take_probe_timer(&mut self, ns_id: NsId) -> Option<FixedTimerKey> {
		self.resolve(ns_id).and_then(|id| self.list.get_mut(id).probe_timer.take())
	}

	/// probing -> up: the probe got a coherent answer (NONE or NXDOMAIN).
	pub fn mark_probe_succeeded(&mut self, ns_id: NsId) {
		let Some(id) = self.resolve(ns_id) else { return };
		let ns = self.list.get_mut(id);

		if ns.state == State::Down {
			self.good_count += 1;
		}

		ns.state = State::Up;
		ns.failed_times = 0;
		ns.timedout = 0;
		ns.probe_timer = None;
	}

	/// probing -> probing: any other probe outcome, rescheduled with a bigger backoff.
	pub fn mark_probe_failed(&mut self, ns_id: NsId) -> Option<Duration> {
		let id = self.resolve(ns_id)?;
		let ns = self.list.get_mut(id);
		ns.failed_times += 1;

		Some(backoff_delay(ns.failed_times))
	}

	/// Returns `true` if this timeout tips the server over the max-consecutive-timeouts limit
	/// (the caller is then responsible for calling `mark_failed`).
	pub fn record_timeout(&mut self, ns_id: NsId, max_timeouts: u32) -> bool {
		let Some(id) = self.resolve(ns_id) else { return false };
		let ns = self.list.get_mut(id);
		ns.timedout += 1;

		ns.timedout > max_timeouts
	}

	pub fn record_success(&mut self, ns_id: NsId) {
		let Some(id) = self.resolve(ns_id) else { return };
		let ns = self.list.get_mut(id);
		ns.timedout = 0;

		if ns.state == State::Down {
			ns.state = State::Up;
			self.good_count += 1;
		}
	}

	pub fn socket(&self, ns_id: NsId) -> Option<&udp::Socket> {
		self.get(ns_id).map(Nameserver::socket)
	}

	pub fn addr(&self, ns_id: NsId) -> Option<Ipv4Addr> {
		self.get(ns_id).map(|ns| ns.addr)
	}

	/// Drops every nameserver (closing its socket) and resets the rotation cursor.
	pub fn clear(&mut self) {
		self.list.drain_rev(|_| {});
		self.cursor = None;
		self.good_count = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn dummy_socket() -> udp::Socket {
		udp::Socket::bind_ephemeral(stakker::Fwd::new(|_| {})).expect("bind ephemeral socket")
	}

	#[test]
	fn pick_rotates_through_up_servers() {
		let mut reg = Registry::default();
		let a = reg.add(Ipv4Addr::new(1, 1, 1, 1), dummy_socket()).unwrap();
		let b = reg.add(Ipv4Addr::new(2, 2, 2, 2), dummy_socket()).unwrap();

		let first = reg.pick().unwrap();
		let second = reg.pick().unwrap();
		assert_ne!(first, second);
		assert!([a, b].contains(&first));
		assert!([a, b].contains(&second));
	}

	#[test]
	fn pick_with_all_down_lands_back_on_start() {
		let mut reg = Registry::default();
		let a = reg.add(Ipv4Addr::new(1, 1, 1, 1), dummy_socket()).unwrap();
		reg.mark_failed(a);

		let picked_once = reg.pick().unwrap();
		let picked_twice = reg.pick().unwrap();
		assert_eq!(picked_once, a);
		assert_eq!(picked_twice, a);
	}

	#[test]
	fn pick_with_multiple_all_down_cycles_uniformly() {
		let mut reg = Registry::default();
		let a = reg.add(Ipv4Addr::new(1, 1, 1, 1), dummy_socket()).unwrap();
		let b = reg.add(Ipv4Addr::new(2, 2, 2, 2), dummy_socket()).unwrap();
		let c = reg.add(Ipv4Addr::new(3, 3, 3, 3), dummy_socket()).unwrap();
		reg.mark_failed(a);
		reg.mark_failed(b);
		reg.mark_failed(c);

		let picks = [reg.pick().unwrap(), reg.pick().unwrap(), reg.pick().unwrap()];
		assert_ne!(picks[0], picks[1], "all-down pick must not get stuck returning the same server");
		assert_ne!(picks[1], picks[2]);
		assert!([a, b, c].contains(&picks[0]));
		assert!([a, b, c].contains(&picks[1]));
		assert!([a, b, c].contains(&picks[2]));
	}

	#[test]
	fn stale_handle_after_removal_resolves_to_none() {
		let mut reg = Registry::default();
		let a = reg.add(Ipv4Addr::new(1, 1, 1, 1), dummy_socket()).unwrap();
		reg.clear();

		assert!(reg.get(a).is_none());
	}
}
