use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jsonrpc::McpMessage;
use crate::*;

/// Metadata flag set by the reverse-proxy path: the destination was chosen by
/// operator configuration, so the outbound stage must not re-evaluate it.
pub const META_SKIP_OUTBOUND_CHECK: &str = "skip_outbound_check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
	ToolCall,
	HttpRequest,
	WebsocketMessage,
	CommandExec,
	FileAccess,
	NetworkConnect,
	Sampling,
	Elicitation,
}

impl ActionType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ActionType::ToolCall => "tool_call",
			ActionType::HttpRequest => "http_request",
			ActionType::WebsocketMessage => "websocket_message",
			ActionType::CommandExec => "command_exec",
			ActionType::FileAccess => "file_access",
			ActionType::NetworkConnect => "network_connect",
			ActionType::Sampling => "sampling",
			ActionType::Elicitation => "elicitation",
		}
	}
}

/// Who issued the action. Zero-valued (not absent) when unauthenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
	pub id: Strng,
	pub name: Strng,
	pub roles: Vec<Strng>,
	pub session_id: Strng,
}

/// Where the action is going, as far as the normalizer could tell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
	pub url: Strng,
	pub domain: Strng,
	pub ip: Option<IpAddr>,
	pub port: u16,
	pub scheme: Strng,
	pub path: Strng,
	pub command: Strng,
	pub cmd_args: Vec<Strng>,
}

impl Destination {
	pub fn is_empty(&self) -> bool {
		self.domain.is_empty() && self.ip.is_none()
	}
}

/// The original protocol message, carried through the chain so the normalizer
/// can rebuild a response without loss.
#[derive(Debug, Clone, Default)]
pub enum OriginalMessage {
	#[default]
	None,
	Mcp(McpMessage),
}

/// Protocol-neutral representation of a single agent action. Built by a
/// normalizer, mutated in place by interceptors under single-task ownership,
/// released when the terminal stage returns.
#[derive(Debug, Clone)]
pub struct CanonicalAction {
	pub identity: Identity,
	pub action_type: ActionType,
	pub name: Strng,
	pub arguments: Map<String, Value>,
	pub destination: Destination,
	pub protocol: Strng,
	pub framework: Strng,
	pub gateway: Strng,
	pub request_time: DateTime<Utc>,
	pub request_id: Strng,
	pub metadata: Map<String, Value>,
	pub original: OriginalMessage,
}

impl CanonicalAction {
	pub fn new(action_type: ActionType, name: Strng, request_id: Strng) -> Self {
		CanonicalAction {
			identity: Identity::default(),
			action_type,
			name,
			arguments: Map::new(),
			destination: Destination::default(),
			protocol: strng::EMPTY,
			framework: strng::EMPTY,
			gateway: strng::EMPTY,
			request_time: Utc::now(),
			request_id,
			metadata: Map::new(),
			original: OriginalMessage::None,
		}
	}

	pub fn skip_outbound_check(&self) -> bool {
		self
			.metadata
			.get(META_SKIP_OUTBOUND_CHECK)
			.and_then(Value::as_bool)
			.unwrap_or(false)
	}

	pub fn set_skip_outbound_check(&mut self) {
		self
			.metadata
			.insert(META_SKIP_OUTBOUND_CHECK.to_string(), Value::Bool(true));
	}
}
