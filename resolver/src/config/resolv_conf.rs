//! `resolv.conf`(5) line parser. No teacher precedent — grounded directly on spec.md §6's
//! directive list.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use super::{ConfigError, ParseFlags};

/// Everything a `resolv.conf` file contributed, before `Context::resolv_conf_parse` installs it
/// into the registry/search state. Fields the file didn't mention are left at their defaults
/// (`None` for scalar options, empty for lists) so the caller can decide what to leave alone.
#[derive(Default, Debug)]
pub struct ParsedConfig {
	pub nameservers: Vec<Ipv4Addr>,
	/// `domain`/`search` in encounter order, first-listed-first-tried — whichever directive
	/// appears last in the file wins outright, matching glibc's own "last one sticks" behavior.
	pub search: Option<Vec<String>>,
	pub ndots: Option<u32>,
	pub timeout: Option<Duration>,
	pub attempts: Option<u32>,
}

/// Parses `path` according to `flags`, skipping any directive category that isn't selected.
/// Unrecognised directives (and malformed values inside a recognised one) are silently ignored.
pub fn parse(path: &Path, flags: ParseFlags) -> Result<ParsedConfig, ConfigError> {
	let data = std::fs::read(path).map_err(|_| ConfigError::OpenFailed)?;

	if data.len() > 65535 {
		return Err(ConfigError::TooLarge);
	}

	let text = String::from_utf8_lossy(&data);
	let mut cfg = ParsedConfig::default();

	for line in text.lines() {
		let line = line.trim();

		if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
			continue;
		}

		let mut parts = line.split_whitespace();
		let Some(directive) = parts.next() else { continue };

		match directive {
			"nameserver" if flags.contains(ParseFlags::NAMESERVERS) => {
				if let Some(addr) = parts.next().and_then(|s| s.parse().ok()) {
					cfg.nameservers.push(addr);
				}
			}
			"domain" if flags.contains(ParseFlags::SEARCH) => {
				if let Some(dom) = parts.next() {
					cfg.search = Some(vec![dom.to_string()]);
				}
			}
			"search" if flags.contains(ParseFlags::SEARCH) => {
				let domains: Vec<String> = parts.map(String::from).collect();

				if !domains.is_empty() {
					cfg.search = Some(domains);
				}
			}
			"options" if flags.contains(ParseFlags::MISC) => {
				for opt in parts {
					if let Some(n) = opt.strip_prefix("ndots:") {
						cfg.ndots = n.parse().ok();
					} else if let Some(n) = opt.strip_prefix("timeout:") {
						cfg.timeout = n.parse().ok().map(Duration::from_secs);
					} else if let Some(n) = opt.strip_prefix("attempts:") {
						cfg.attempts = n.parse().ok();
					}
				}
			}
			_ => {}
		}
	}

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn write_temp(contents: &str) -> std::path::PathBuf {
		let mut path = std::env::temp_dir();
		path.push(format!("resolver-test-resolv-{:?}.conf", std::thread::current().id()));

		let mut f = std::fs::File::create(&path).unwrap();
		f.write_all(contents.as_bytes()).unwrap();

		path
	}

	#[test]
	fn parses_nameservers_search_and_options() {
		let path = write_temp(
			"nameserver 127.0.0.1\n# a comment\nnameserver 8.8.8.8\nsearch corp.example example.com\noptions ndots:2 timeout:3 attempts:4\n",
		);

		let cfg = parse(&path, ParseFlags::ALL).unwrap();

		assert_eq!(cfg.nameservers, [Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(8, 8, 8, 8)]);
		assert_eq!(cfg.search, Some(vec!["corp.example".to_string(), "example.com".to_string()]));
		assert_eq!(cfg.ndots, Some(2));
		assert_eq!(cfg.timeout, Some(Duration::from_secs(3)));
		assert_eq!(cfg.attempts, Some(4));

		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn later_search_directive_overrides_earlier_domain_directive() {
		let path = write_temp("domain example.com\nsearch corp.example\n");

		let cfg = parse(&path, ParseFlags::ALL).unwrap();
		assert_eq!(cfg.search, Some(vec!["corp.example".to_string()]));

		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn unselected_flag_skips_its_directive_category() {
		let path = write_temp("nameserver 127.0.0.1\nsearch example.com\n");

		let cfg = parse(&path, ParseFlags::SEARCH).unwrap();
		assert!(cfg.nameservers.is_empty());
		assert_eq!(cfg.search, Some(vec!["example.com".to_string()]));

		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn missing_file_reports_open_failed() {
		let err = parse(Path::new("/nonexistent/resolver-test-resolv.conf"), ParseFlags::ALL).unwrap_err();
		assert_eq!(err, ConfigError::OpenFailed);
	}
}
