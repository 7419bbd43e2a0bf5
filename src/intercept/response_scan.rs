use async_trait::async_trait;
use serde_json::Value;

use crate::intercept::{InterceptContext, InterceptError, Interceptor};
use crate::jsonrpc::McpMessage;
use crate::scan::{InjectionScanner, ScanMode, ScanResult, ScannerState};
use crate::types::action::CanonicalAction;
use crate::*;

/// Post-upstream stage for the MCP path: scan server-to-client results for
/// prompt-injection payloads before they reach the agent.
pub struct ResponseScanInterceptor {
	scanner: Arc<InjectionScanner>,
	state: Arc<ScannerState>,
}

impl ResponseScanInterceptor {
	pub fn new(scanner: Arc<InjectionScanner>, state: Arc<ScannerState>) -> Self {
		ResponseScanInterceptor { scanner, state }
	}

	fn scan_result_value(&self, result: &Value) -> ScanResult {
		// MCP tool results put human-readable text in content[].text; scan
		// those fields when present, otherwise fall back to the whole value.
		if let Some(content) = result.get("content").and_then(Value::as_array) {
			let mut merged = ScanResult::default();
			for item in content {
				if item.get("type").and_then(Value::as_str) != Some("text") {
					continue;
				}
				if let Some(text) = item.get("text").and_then(Value::as_str) {
					let res = self.scanner.scan(text);
					merged.scan_duration_ns += res.scan_duration_ns;
					merged.findings.extend(res.findings);
				}
			}
			merged.detected = !merged.findings.is_empty();
			return merged;
		}
		if let Some(text) = result.as_str() {
			return self.scanner.scan(text);
		}
		self.scanner.scan_json(result)
	}
}

#[async_trait]
impl Interceptor for ResponseScanInterceptor {
	fn name(&self) -> &'static str {
		"response_scan"
	}

	async fn intercept(
		&self,
		_cx: &mut InterceptContext,
		_action: &mut CanonicalAction,
	) -> Result<(), InterceptError> {
		Ok(())
	}

	async fn on_response(
		&self,
		cx: &mut InterceptContext,
		action: &CanonicalAction,
		response: &mut McpMessage,
	) -> Result<(), InterceptError> {
		if !self.state.enabled() {
			return Ok(());
		}
		let McpMessage::Response(resp) = response else {
			return Ok(());
		};

		let result = self.scan_result_value(&resp.result);
		if !result.detected {
			return Ok(());
		}

		warn!(
			request = action.request_id.as_str(),
			tool = action.name.as_str(),
			patterns = ?result.pattern_names(),
			mode = ?self.state.mode(),
			"prompt injection detected in response"
		);
		cx.scan = Some(result.clone());
		match self.state.mode() {
			ScanMode::Monitor => Ok(()),
			ScanMode::Enforce => Err(InterceptError::ResponseBlocked(result)),
		}
	}
}

#[cfg(test)]
#[path = "response_scan_tests.rs"]
mod tests;
