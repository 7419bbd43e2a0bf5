use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::*;

/// One reverse-proxied upstream. Requests whose path starts with
/// `path_prefix` are rewritten onto `upstream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTarget {
	pub id: Strng,
	pub name: Strng,
	pub path_prefix: Strng,
	/// Base URL, e.g. `http://tools.internal:8080`.
	pub upstream: Strng,
	#[serde(default)]
	pub strip_prefix: bool,
	/// Injected into the upstream request, overwriting existing values.
	#[serde(default)]
	pub headers: HashMap<Strng, Strng>,
	#[serde(default = "default_true")]
	pub enabled: bool,
}

fn default_true() -> bool {
	true
}

impl UpstreamTarget {
	/// Path to request from the upstream for an inbound `path`.
	pub fn upstream_path(&self, path: &str) -> String {
		if !self.strip_prefix {
			return path.to_string();
		}
		let stripped = path.strip_prefix(self.path_prefix.as_str()).unwrap_or(path);
		if stripped.starts_with('/') {
			stripped.to_string()
		} else {
			format!("/{stripped}")
		}
	}
}

/// Longest-prefix router over the configured targets. Runtime-settable.
#[derive(Default)]
pub struct ReverseRouter {
	targets: RwLock<Vec<Arc<UpstreamTarget>>>,
}

impl ReverseRouter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Replace the target list. Targets are kept sorted by descending prefix
	/// length so the most specific target wins.
	pub fn set_targets(&self, targets: Vec<UpstreamTarget>) {
		let mut targets: Vec<Arc<UpstreamTarget>> = targets.into_iter().map(Arc::new).collect();
		targets.sort_by_key(|t| std::cmp::Reverse(t.path_prefix.len()));
		*self.targets.write() = targets;
	}

	pub fn match_path(&self, path: &str) -> Option<Arc<UpstreamTarget>> {
		self
			.targets
			.read()
			.iter()
			.find(|t| t.enabled && path.starts_with(t.path_prefix.as_str()))
			.cloned()
	}
}

#[cfg(test)]
#[path = "reverse_tests.rs"]
mod tests;
