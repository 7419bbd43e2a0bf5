use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::*;

const MAX_MATCH_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
	/// Log and forward.
	Monitor,
	/// Log and block.
	Enforce,
}

/// Runtime-settable scanner toggles, shared between the HTTP handler, the
/// WebSocket relay, and the MCP response-scan stage.
#[derive(Debug)]
pub struct ScannerState {
	enabled: AtomicBool,
	mode: AtomicU8,
}

impl ScannerState {
	pub fn new(enabled: bool, mode: ScanMode) -> Self {
		let s = ScannerState {
			enabled: AtomicBool::new(enabled),
			mode: AtomicU8::new(0),
		};
		s.set_mode(mode);
		s
	}

	pub fn enabled(&self) -> bool {
		self.enabled.load(Ordering::Relaxed)
	}

	pub fn set_enabled(&self, enabled: bool) {
		self.enabled.store(enabled, Ordering::Relaxed);
	}

	pub fn mode(&self) -> ScanMode {
		match self.mode.load(Ordering::Relaxed) {
			1 => ScanMode::Enforce,
			_ => ScanMode::Monitor,
		}
	}

	pub fn set_mode(&self, mode: ScanMode) {
		let v = match mode {
			ScanMode::Monitor => 0,
			ScanMode::Enforce => 1,
		};
		self.mode.store(v, Ordering::Relaxed);
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFinding {
	pub pattern_name: Strng,
	pub pattern_category: Strng,
	pub matched_text: String,
	pub position: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
	pub detected: bool,
	pub findings: Vec<ScanFinding>,
	pub scan_duration_ns: u128,
}

impl ScanResult {
	pub fn pattern_names(&self) -> Vec<&str> {
		self
			.findings
			.iter()
			.map(|f| f.pattern_name.as_str())
			.collect()
	}
}

struct Pattern {
	name: &'static str,
	category: &'static str,
	regex: Regex,
}

/// Pattern-based prompt-injection detector. Compiled once at construction;
/// shared read-only across tasks.
pub struct InjectionScanner {
	patterns: Vec<Pattern>,
}

// (name, category, regex)
const PATTERNS: &[(&str, &str, &str)] = &[
	(
		"ignore_previous_instructions",
		"system_prompt_override",
		r"(?i)ignore\s+(?:all\s+)?(?:previous|prior|above|earlier)\s+instructions",
	),
	(
		"disregard_instructions",
		"system_prompt_override",
		r"(?i)disregard\s+(?:all\s+)?(?:previous|prior|your)\s+(?:instructions|rules|guidelines)",
	),
	(
		"forget_instructions",
		"system_prompt_override",
		r"(?i)forget\s+(?:all\s+)?(?:previous|prior|your)\s+(?:instructions|training|rules)",
	),
	(
		"you_are_now",
		"role_hijack",
		r"(?i)\byou\s+are\s+now\s+(?:a|an|the)\b",
	),
	(
		"act_as",
		"role_hijack",
		r"(?i)\bact\s+as\s+(?:if\s+you\s+(?:are|were)|a|an)\b",
	),
	(
		"pretend_to_be",
		"role_hijack",
		r"(?i)\bpretend\s+(?:to\s+be|you\s+are)\b",
	),
	(
		"new_instructions",
		"instruction_injection",
		r"(?i)\bnew\s+instructions?\s*:",
	),
	(
		"system_message_injection",
		"instruction_injection",
		r"(?i)\bsystem\s+(?:message|note|update|override)\s*:",
	),
	(
		"from_now_on",
		"instruction_injection",
		r"(?i)\bfrom\s+now\s+on[,\s]+(?:you|ignore|respond)",
	),
	(
		"system_tag",
		"system_tag_injection",
		r"(?i)<\s*/?\s*system\s*>",
	),
	(
		"inst_sys_bracket",
		"system_tag_injection",
		r"(?i)\[\s*/?\s*(?:INST|SYSTEM)\s*\]",
	),
	(
		"llama_sys_marker",
		"system_tag_injection",
		r"(?i)<<\s*/?\s*SYS\s*>>",
	),
	(
		"end_of_prompt",
		"delimiter_escape",
		r"(?i)\bend\s+of\s+(?:system\s+)?(?:prompt|instructions)\b",
	),
	(
		"fenced_system_block",
		"delimiter_escape",
		"(?i)```\\s*system",
	),
	("dan_mode", "do_anything_now", r"(?i)\bDAN\s+mode\b"),
	(
		"do_anything_now",
		"do_anything_now",
		r"(?i)\bdo\s+anything\s+now\b",
	),
];

impl Default for InjectionScanner {
	fn default() -> Self {
		Self::new()
	}
}

impl InjectionScanner {
	pub fn new() -> Self {
		let patterns = PATTERNS
			.iter()
			.map(|(name, category, re)| Pattern {
				name,
				category,
				regex: Regex::new(re).expect("static scanner pattern must compile"),
			})
			.collect();
		InjectionScanner { patterns }
	}

	pub fn scan(&self, text: &str) -> ScanResult {
		let start = Instant::now();
		let mut findings = Vec::new();
		if !text.is_empty() {
			self.scan_into(text, &mut findings);
		}
		ScanResult {
			detected: !findings.is_empty(),
			findings,
			scan_duration_ns: start.elapsed().as_nanos(),
		}
	}

	/// Recursively scan every string in a JSON value, concatenating findings.
	pub fn scan_json(&self, value: &Value) -> ScanResult {
		let start = Instant::now();
		let mut findings = Vec::new();
		self.scan_value(value, &mut findings);
		ScanResult {
			detected: !findings.is_empty(),
			findings,
			scan_duration_ns: start.elapsed().as_nanos(),
		}
	}

	fn scan_value(&self, value: &Value, findings: &mut Vec<ScanFinding>) {
		match value {
			Value::String(s) => self.scan_into(s, findings),
			Value::Array(items) => {
				for item in items {
					self.scan_value(item, findings);
				}
			},
			Value::Object(map) => {
				for v in map.values() {
					self.scan_value(v, findings);
				}
			},
			_ => {},
		}
	}

	fn scan_into(&self, text: &str, findings: &mut Vec<ScanFinding>) {
		for pattern in &self.patterns {
			for m in pattern.regex.find_iter(text) {
				findings.push(ScanFinding {
					pattern_name: pattern.name.into(),
					pattern_category: pattern.category.into(),
					matched_text: truncate_match(m.as_str()),
					position: m.start(),
				});
			}
		}
	}
}

fn truncate_match(matched: &str) -> String {
	if matched.len() <= MAX_MATCH_LEN {
		return matched.to_string();
	}
	let mut end = MAX_MATCH_LEN;
	while !matched.is_char_boundary(end) {
		end -= 1;
	}
	matched[..end].to_string()
}

#[cfg(test)]
#[path = "scan_tests.rs"]
mod tests;
