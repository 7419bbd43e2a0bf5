use std::collections::HashSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use url::Url;

use crate::http::default_port;
use crate::*;

lazy_static! {
	static ref IPV4_WITH_PORT: Regex =
		Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})(?::(\d{1,5}))?$").unwrap();
	static ref EMBEDDED_URL: Regex = Regex::new(r#"https?://[^\s"'<>`)\]]+"#).unwrap();
}

const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
	/// Attempt to decode candidate strings as base64 and rescan the plaintext.
	/// A decoded string is never decoded again.
	pub base64_decode: bool,
	pub max_depth: usize,
}

impl Default for ExtractOptions {
	fn default() -> Self {
		ExtractOptions {
			base64_decode: false,
			max_depth: DEFAULT_MAX_DEPTH,
		}
	}
}

/// A URL or IP target discovered inside action arguments. `source` is the
/// dotted path of the argument that contained it, for audit output.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedUrl {
	pub raw_value: String,
	pub url: Strng,
	pub domain: Strng,
	pub ip: Option<IpAddr>,
	pub port: u16,
	pub scheme: Strng,
	pub path: Strng,
	pub source: String,
}

/// Walk the argument tree and collect every URL/IP target. Strings are
/// examined three ways: as a complete URL, as an IPv4 (with optional port),
/// and for embedded URLs. Results are deduplicated by URL in insertion order.
pub fn extract(args: &Map<String, Value>, options: &ExtractOptions) -> Vec<ExtractedUrl> {
	let mut out = Extraction {
		options,
		seen: HashSet::new(),
		results: Vec::new(),
	};
	for (key, value) in args {
		out.walk(value, key, 1);
	}
	out.results
}

struct Extraction<'a> {
	options: &'a ExtractOptions,
	seen: HashSet<Strng>,
	results: Vec<ExtractedUrl>,
}

impl Extraction<'_> {
	fn walk(&mut self, value: &Value, source: &str, depth: usize) {
		match value {
			Value::String(s) => self.handle_string(s, source, false),
			Value::Array(items) => {
				if depth >= self.options.max_depth {
					return;
				}
				for (i, item) in items.iter().enumerate() {
					self.walk(item, &format!("{source}[{i}]"), depth + 1);
				}
			},
			Value::Object(map) => {
				if depth >= self.options.max_depth {
					return;
				}
				for (key, item) in map {
					self.walk(item, &format!("{source}.{key}"), depth + 1);
				}
			},
			// Numbers, bools, and nulls cannot carry targets.
			_ => {},
		}
	}

	fn handle_string(&mut self, s: &str, source: &str, decoded: bool) {
		let trimmed = s.trim();
		if trimmed.is_empty() {
			return;
		}

		if self.try_complete_url(trimmed, source) {
			return;
		}
		if self.try_ipv4(trimmed, source) {
			return;
		}

		for m in EMBEDDED_URL.find_iter(trimmed) {
			let candidate = m.as_str().trim_end_matches(['.', ',', ';', ':']);
			self.try_complete_url(candidate, source);
		}

		if self.options.base64_decode && !decoded {
			if let Ok(bytes) = BASE64.decode(trimmed)
				&& let Ok(plain) = String::from_utf8(bytes)
			{
				self.handle_string(&plain, &format!("{source}.base64"), true);
			}
		}
	}

	fn try_complete_url(&mut self, s: &str, source: &str) -> bool {
		let Ok(parsed) = Url::parse(s) else {
			return false;
		};
		let scheme = parsed.scheme();
		if !matches!(scheme, "http" | "https" | "ws" | "wss") {
			return false;
		}
		let Some(host) = parsed.host() else {
			return false;
		};
		let port = match parsed.port() {
			Some(0) => return false,
			Some(p) => p,
			None => default_port(scheme),
		};
		let (domain, ip) = match host {
			url::Host::Domain(d) => (strng::new(d), None),
			url::Host::Ipv4(v4) => (strng::EMPTY, Some(IpAddr::V4(v4))),
			url::Host::Ipv6(v6) => (strng::EMPTY, Some(IpAddr::V6(v6))),
		};
		self.push(ExtractedUrl {
			raw_value: s.to_string(),
			url: strng::new(parsed.as_str()),
			domain,
			ip,
			port,
			scheme: strng::new(scheme),
			path: strng::new(parsed.path()),
			source: source.to_string(),
		});
		true
	}

	fn try_ipv4(&mut self, s: &str, source: &str) -> bool {
		let Some(caps) = IPV4_WITH_PORT.captures(s) else {
			return false;
		};
		let mut octets = [0u8; 4];
		for (i, octet) in octets.iter_mut().enumerate() {
			let Ok(v) = caps[i + 1].parse::<u8>() else {
				return false;
			};
			*octet = v;
		}
		let port = match caps.get(5) {
			Some(p) => match p.as_str().parse::<u32>() {
				Ok(v) if (1..=65535).contains(&v) => v as u16,
				_ => return false,
			},
			None => default_port("http"),
		};
		let ip = IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]));
		self.push(ExtractedUrl {
			raw_value: s.to_string(),
			url: strng::new(s),
			domain: strng::EMPTY,
			ip: Some(ip),
			port,
			scheme: strng::EMPTY,
			path: strng::EMPTY,
			source: source.to_string(),
		});
		true
	}

	fn push(&mut self, url: ExtractedUrl) {
		if self.seen.insert(url.url.clone()) {
			self.results.push(url);
		}
	}
}

#[cfg(test)]
#[path = "extract_tests.rs"]
mod tests;
