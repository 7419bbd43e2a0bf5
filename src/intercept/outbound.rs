use async_trait::async_trait;

use crate::intercept::{InterceptContext, InterceptError, Interceptor};
use crate::outbound::dns::PinnedResolver;
use crate::outbound::extract::{ExtractOptions, extract};
use crate::outbound::{RuleSet, base64_scan_enabled, evaluate_destination};
use crate::types::action::CanonicalAction;
use crate::*;

/// Chain stage enforcing the outbound network rules: extract targets from
/// the action, resolve and pin them, and evaluate every one against the
/// current rule snapshot.
pub struct OutboundInterceptor {
	rules: Arc<RuleSet>,
	resolver: Arc<PinnedResolver>,
}

impl OutboundInterceptor {
	pub fn new(rules: Arc<RuleSet>, resolver: Arc<PinnedResolver>) -> Self {
		OutboundInterceptor { rules, resolver }
	}

	async fn resolve_pinned(&self, request_id: &Strng, domain: &Strng) -> Option<IpAddr> {
		match self.resolver.resolve(request_id, domain).await {
			Ok(dest) => Some(dest.pinned_ip),
			Err(err) => {
				// Unresolvable targets are evaluated by name only.
				warn!(domain = domain.as_str(), %err, "destination did not resolve");
				None
			},
		}
	}
}

#[async_trait]
impl Interceptor for OutboundInterceptor {
	fn name(&self) -> &'static str {
		"outbound"
	}

	async fn intercept(
		&self,
		cx: &mut InterceptContext,
		action: &mut CanonicalAction,
	) -> Result<(), InterceptError> {
		if action.skip_outbound_check() {
			debug!(request = action.request_id.as_str(), "outbound check skipped");
			return Ok(());
		}

		let rules = self.rules.snapshot();
		let opts = ExtractOptions {
			base64_decode: base64_scan_enabled(&rules),
			..Default::default()
		};
		let found = extract(&action.arguments, &opts);
		let request_id = action.request_id.clone();
		let mut pinned = false;

		if found.is_empty() {
			// No targets in the arguments; a pre-populated destination
			// (CONNECT, reverse dispatch) is still evaluated.
			if !action.destination.is_empty() {
				let domain = action.destination.domain.clone();
				let mut ip = action.destination.ip;
				if ip.is_none() && !domain.is_empty() {
					ip = self.resolve_pinned(&request_id, &domain).await;
					pinned = ip.is_some();
					action.destination.ip = ip;
				}
				if let Err(deny) =
					evaluate_destination(&rules, &domain, ip, action.destination.port)
				{
					self.resolver.release_request(&request_id);
					return Err(InterceptError::OutboundBlocked(deny));
				}
			}
		} else {
			for (i, url) in found.iter().enumerate() {
				let mut ip = url.ip;
				if ip.is_none() && !url.domain.is_empty() {
					let resolved = self.resolve_pinned(&request_id, &url.domain).await;
					pinned |= resolved.is_some();
					ip = resolved;
				}
				if i == 0 {
					action.destination.url = url.url.clone();
					action.destination.domain = url.domain.clone();
					action.destination.ip = ip;
					action.destination.port = url.port;
					action.destination.scheme = url.scheme.clone();
					action.destination.path = url.path.clone();
				}
				if let Err(deny) = evaluate_destination(&rules, &url.domain, ip, url.port) {
					debug!(
						source = url.source.as_str(),
						url = url.url.as_str(),
						rule = deny.rule_name.as_str(),
						"outbound target denied"
					);
					self.resolver.release_request(&request_id);
					return Err(InterceptError::OutboundBlocked(deny));
				}
			}
		}

		if pinned {
			let resolver = self.resolver.clone();
			cx.defer(move || resolver.release_request(&request_id));
		}
		Ok(())
	}
}

#[cfg(test)]
#[path = "outbound_tests.rs"]
mod tests;
