use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::intercept::InterceptError;
use crate::jsonrpc::{McpMessage, RequestId};
use crate::types::action::{ActionType, CanonicalAction, Identity, OriginalMessage};
use crate::*;

/// An MCP wire message plus the session identity the transport attached.
#[derive(Debug, Clone)]
pub struct McpEnvelope {
	pub message: McpMessage,
	pub identity: Option<Identity>,
}

pub struct McpNormalizer {
	gateway: Strng,
}

impl McpNormalizer {
	pub fn new(gateway: Strng) -> Self {
		McpNormalizer { gateway }
	}

	pub fn normalize(&self, envelope: McpEnvelope) -> CanonicalAction {
		let McpEnvelope { message, identity } = envelope;
		let request_id = message
			.id()
			.map(RequestId::as_strng)
			.unwrap_or_else(|| strng::new(Uuid::new_v4().to_string()));

		let (action_type, name, arguments) = match &message {
			McpMessage::Request(req) => {
				let params = message.params_object();
				match req.method.as_str() {
					"tools/call" => {
						let name = params
							.and_then(|p| p.get("name"))
							.and_then(Value::as_str)
							.unwrap_or_default();
						let arguments = params
							.and_then(|p| p.get("arguments"))
							.and_then(Value::as_object)
							.cloned()
							.unwrap_or_default();
						(ActionType::ToolCall, strng::new(name), arguments)
					},
					"sampling/createMessage" => (
						ActionType::Sampling,
						req.method.clone(),
						params.cloned().unwrap_or_default(),
					),
					"elicitation/create" => (
						ActionType::Elicitation,
						req.method.clone(),
						params.cloned().unwrap_or_default(),
					),
					other => (
						ActionType::ToolCall,
						strng::new(other),
						params.cloned().unwrap_or_default(),
					),
				}
			},
			// Responses and notifications pass through the chain untyped.
			_ => (ActionType::ToolCall, strng::EMPTY, Map::new()),
		};

		let mut action = CanonicalAction::new(action_type, name, request_id);
		action.arguments = arguments;
		action.identity = identity.unwrap_or_default();
		action.protocol = strng::literal!("mcp");
		action.gateway = self.gateway.clone();
		action.original = OriginalMessage::Mcp(message);
		action
	}

	/// On allow, hand back the original message untouched. On deny, build a
	/// JSON-RPC error response carrying the denial reason and help.
	pub fn denormalize(
		&self,
		action: &CanonicalAction,
		outcome: Result<(), &InterceptError>,
	) -> anyhow::Result<McpMessage> {
		let OriginalMessage::Mcp(original) = &action.original else {
			anyhow::bail!("action {} has no MCP original", action.request_id);
		};
		let err = match outcome {
			Ok(()) => return Ok(original.clone()),
			Err(err) => err,
		};

		let id = original
			.id()
			.cloned()
			.unwrap_or(RequestId::String(action.request_id.clone()));
		let (message, data) = denial_detail(err);
		Ok(McpMessage::denial(id, message, data))
	}
}

fn denial_detail(err: &InterceptError) -> (String, Option<Value>) {
	match err {
		InterceptError::PolicyDenied(deny) => {
			let mut message = deny.reason.clone();
			if !deny.help_text.is_empty() {
				message = format!("{message} ({})", deny.help_text);
			}
			let data = json!({
				"error": "policy_denied",
				"rule": deny.rule_name,
				"reason": deny.reason,
				"help_url": deny.help_url,
				"help_text": deny.help_text,
			});
			(message, Some(data))
		},
		InterceptError::OutboundBlocked(deny) => {
			let mut message = format!("destination blocked: {}", deny.reason);
			if !deny.help_text.is_empty() {
				message = format!("{message} ({})", deny.help_text);
			}
			let data = json!({
				"error": "outbound_blocked",
				"rule": deny.rule_name,
				"reason": deny.reason,
				"domain": deny.domain,
				"port": deny.port,
				"help_url": deny.help_url,
				"help_text": deny.help_text,
			});
			(message, Some(data))
		},
		InterceptError::ResponseBlocked(scan) => (
			"response blocked: prompt injection detected".to_string(),
			Some(json!({
				"error": "response_blocked",
				"patterns": scan.pattern_names(),
			})),
		),
		other => (other.to_string(), None),
	}
}

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod tests;
