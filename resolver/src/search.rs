//! The search-suffix policy: given a user-supplied name and `ndots`, decides the ordered
//! sequence of fully-qualified candidates to try.
//!
//! Has no teacher precedent (the teacher's `net::dns::Resolver::v4` takes an already-qualified
//! name); grounded directly on spec.md §4.5 and the `resolv.conf`(5) `ndots` semantics it
//! describes.

use crate::request::Flags;

/// A snapshot of the search configuration, shared by every request that started while it was
/// current. `resolv_conf_parse`/`search_add`/`search_clear`/`search_ndots_set` install a new
/// `Rc` in `Context` rather than mutating this one in place — so an in-progress search always
/// sees a stable suffix list, even if the user reconfigures search domains mid-lookup. The last
/// request holding an `Rc` to a superseded snapshot drops it, per spec.md §3's "released when
/// the last holding request finishes".
pub struct SearchStateInner {
	pub ndots: u32,
	pub suffixes: Vec<String>,
}

impl Default for SearchStateInner {
	fn default() -> Self {
		Self { ndots: 1, suffixes: Vec::new() }
	}
}

/// Returns the `idx`-th candidate FQDN for `name`, or `None` once the sequence is exhausted.
///
/// Policy (spec.md §4.5): if `name` already has at least `ndots` dots, the bare name is tried
/// first, then each suffix in list order; otherwise every suffix is tried first (in list order),
/// then the bare name.
pub fn candidate_at(name: &str, search: &SearchStateInner, flags: Flags, idx: usize) -> Option<String> {
	if flags.contains(Flags::NO_SEARCH) || search.suffixes.is_empty() {
		return (idx == 0).then(|| name.to_string());
	}

	let dots = name.chars().filter(|&c| c == '.').count() as u32;
	let bare_first = dots >= search.ndots;
	let total = search.suffixes.len() + 1;

	if idx >= total {
		return None;
	}

	if bare_first {
		if idx == 0 {
			Some(name.to_string())
		} else {
			Some(format!("{name}.{}", search.suffixes[idx - 1]))
		}
	} else if idx < search.suffixes.len() {
		Some(format!("{name}.{}", search.suffixes[idx]))
	} else {
		Some(name.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn suffixes_tried_before_bare_name_below_ndots() {
		let search = SearchStateInner { ndots: 2, suffixes: vec!["corp.example".into(), "example.com".into()] };

		let order: Vec<String> = (0..).map_while(|i| candidate_at("www", &search, Flags::NONE, i)).collect();

		assert_eq!(order, ["www.corp.example", "www.example.com", "www"]);
	}

	#[test]
	fn bare_name_tried_first_at_or_above_ndots() {
		let search = SearchStateInner { ndots: 1, suffixes: vec!["example.com".into()] };

		let order: Vec<String> = (0..).map_while(|i| candidate_at("host.sub", &search, Flags::NONE, i)).collect();

		assert_eq!(order, ["host.sub", "host.sub.example.com"]);
	}

	#[test]
	fn no_search_flag_short_circuits_to_bare_name() {
		let search = SearchStateInner { ndots: 1, suffixes: vec!["example.com".into()] };

		assert_eq!(candidate_at("www", &search, Flags::NO_SEARCH, 0).as_deref(), Some("www"));
		assert_eq!(candidate_at("www", &search, Flags::NO_SEARCH, 1), None);
	}
}
