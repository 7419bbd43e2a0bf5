use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::*;

pub mod dns;
pub mod extract;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
	/// Matching rules deny (or report); everything else passes.
	Blocklist,
	/// Destinations must match some rule in the scope to pass.
	Allowlist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
	Block,
	Alert,
	Log,
}

/// One way a rule can name traffic. Values are kept as written by the
/// operator and parsed at match time; values that fail to parse match
/// nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Target {
	Domain(Strng),
	Ip(Strng),
	Cidr(Strng),
	DomainGlob(Strng),
	PortRange(Strng),
}

impl Target {
	pub fn matches(&self, domain: &str, ip: Option<IpAddr>, port: u16) -> bool {
		match self {
			Target::Domain(want) => !domain.is_empty() && want.eq_ignore_ascii_case(domain),
			Target::Ip(want) => match want.parse::<IpAddr>() {
				Ok(want) => ip == Some(want),
				Err(_) => false,
			},
			Target::Cidr(want) => match want.parse::<IpNet>() {
				Ok(net) => ip.is_some_and(|ip| net.contains(&ip)),
				Err(_) => false,
			},
			Target::DomainGlob(glob) => match_domain_glob(glob, domain),
			Target::PortRange(range) => match_port_range(range, port),
		}
	}
}

/// `*.suffix` matches `x.suffix` and deeper, never the bare `suffix`.
fn match_domain_glob(glob: &str, domain: &str) -> bool {
	let Some(suffix) = glob.strip_prefix("*.") else {
		return false;
	};
	if suffix.is_empty() || !suffix.is_ascii() || !domain.is_ascii() {
		return false;
	}
	if domain.len() <= suffix.len() + 1 {
		return false;
	}
	let tail = &domain[domain.len() - suffix.len()..];
	let dot = domain.as_bytes()[domain.len() - suffix.len() - 1];
	dot == b'.' && tail.eq_ignore_ascii_case(suffix)
}

fn match_port_range(range: &str, port: u16) -> bool {
	if let Some((lo, hi)) = range.split_once('-') {
		match (lo.trim().parse::<u16>(), hi.trim().parse::<u16>()) {
			(Ok(lo), Ok(hi)) => lo <= port && port <= hi,
			_ => false,
		}
	} else {
		range.trim().parse::<u16>() == Ok(port)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRule {
	pub id: Strng,
	pub name: Strng,
	pub mode: RuleMode,
	pub action: RuleAction,
	/// Empty scope is the global scope, always evaluated first.
	#[serde(default)]
	pub scope: Strng,
	/// Lower numbers evaluate first within a scope.
	#[serde(default)]
	pub priority: i32,
	#[serde(default = "default_true")]
	pub enabled: bool,
	/// Request base64 decoding during URL extraction.
	#[serde(default)]
	pub base64_scan: bool,
	pub targets: Vec<Target>,
	#[serde(default)]
	pub help_text: Strng,
	#[serde(default)]
	pub help_url: Strng,
	#[serde(default)]
	pub read_only: bool,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
	true
}

impl OutboundRule {
	pub fn matches(&self, domain: &str, ip: Option<IpAddr>, port: u16) -> bool {
		self.targets.iter().any(|t| t.matches(domain, ip, port))
	}
}

/// Structured denial carried up to the protocol layer.
#[derive(thiserror::Error, Debug, Clone)]
#[error("outbound blocked: {domain}{ip}:{port} ({reason}, rule {rule_name})", ip = fmt_ip(.ip))]
pub struct OutboundDeny {
	pub domain: Strng,
	pub ip: Option<IpAddr>,
	pub port: u16,
	pub rule_id: Strng,
	pub rule_name: Strng,
	pub help_text: Strng,
	pub help_url: Strng,
	pub reason: String,
}

fn fmt_ip(ip: &Option<IpAddr>) -> String {
	match ip {
		Some(ip) => format!(" [{ip}]"),
		None => String::new(),
	}
}

/// Evaluate one destination against a rule snapshot. Rules are grouped by
/// scope; the global (empty) scope always runs first, then remaining scopes
/// in order of appearance. Within a scope every rule shares the mode of the
/// first rule.
pub fn evaluate_destination(
	rules: &[OutboundRule],
	domain: &str,
	ip: Option<IpAddr>,
	port: u16,
) -> Result<(), OutboundDeny> {
	let mut scopes: IndexMap<&str, Vec<&OutboundRule>> = IndexMap::new();
	scopes.insert("", Vec::new());
	for rule in rules.iter().filter(|r| r.enabled) {
		scopes.entry(rule.scope.as_str()).or_default().push(rule);
	}

	for (scope, scoped) in &scopes {
		let Some(first) = scoped.first() else {
			continue;
		};
		match first.mode {
			RuleMode::Blocklist => {
				for rule in scoped {
					if !rule.matches(domain, ip, port) {
						continue;
					}
					match rule.action {
						RuleAction::Block => {
							return Err(deny(rule, domain, ip, port, "matched blocklist rule"));
						},
						RuleAction::Alert => {
							warn!(
								rule = rule.name.as_str(),
								scope = *scope,
								domain,
								port,
								"outbound destination alert"
							);
						},
						RuleAction::Log => {
							info!(
								rule = rule.name.as_str(),
								scope = *scope,
								domain,
								port,
								"outbound destination observed"
							);
						},
					}
				}
			},
			RuleMode::Allowlist => {
				if !scoped.iter().any(|r| r.matches(domain, ip, port)) {
					return Err(deny(first, domain, ip, port, "destination not in allowlist"));
				}
			},
		}
	}
	Ok(())
}

fn deny(rule: &OutboundRule, domain: &str, ip: Option<IpAddr>, port: u16, reason: &str) -> OutboundDeny {
	OutboundDeny {
		domain: domain.into(),
		ip,
		port,
		rule_id: rule.id.clone(),
		rule_name: rule.name.clone(),
		help_text: rule.help_text.clone(),
		help_url: rule.help_url.clone(),
		reason: reason.to_string(),
	}
}

/// Copy-on-write rule snapshot. Readers load the current `Arc` without
/// locking; writers replace the whole vector.
#[derive(Default)]
pub struct RuleSet {
	rules: ArcSwap<Vec<OutboundRule>>,
}

impl RuleSet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Replace the rule set. Rules are sorted by ascending priority so that,
	/// within a scope, lower-numbered rules evaluate first.
	pub fn set_rules(&self, mut rules: Vec<OutboundRule>) {
		rules.sort_by_key(|r| r.priority);
		self.rules.store(Arc::new(rules));
	}

	pub fn snapshot(&self) -> Arc<Vec<OutboundRule>> {
		self.rules.load_full()
	}
}

/// Whether any enabled rule in the snapshot asked for base64 scanning.
pub fn base64_scan_enabled(rules: &[OutboundRule]) -> bool {
	rules.iter().any(|r| r.enabled && r.base64_scan)
}

#[cfg(test)]
#[path = "rules_tests.rs"]
mod tests;
