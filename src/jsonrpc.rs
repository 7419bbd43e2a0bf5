use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::*;

/// The `"jsonrpc": "2.0"` marker field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version2;

impl Serialize for Version2 {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		"2.0".serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for Version2 {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Version2, D::Error> {
		let s: String = Deserialize::deserialize(deserializer)?;
		if s == "2.0" {
			Ok(Version2)
		} else {
			Err(serde::de::Error::custom("expect jsonrpc version \"2.0\""))
		}
	}
}

/// JSON-RPC request identifier. Serialized deterministically as a string for
/// request correlation (`42` and `"42"` render the same way, which is what a
/// per-request key needs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	Number(i64),
	String(Strng),
}

impl Display for RequestId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RequestId::Number(n) => Display::fmt(n, f),
			RequestId::String(s) => Display::fmt(s, f),
		}
	}
}

impl RequestId {
	pub fn as_strng(&self) -> Strng {
		match self {
			RequestId::Number(n) => strng::format!("{n}"),
			RequestId::String(s) => s.clone(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
	pub jsonrpc: Version2,
	pub id: RequestId,
	pub method: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
	pub jsonrpc: Version2,
	pub method: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
	pub jsonrpc: Version2,
	pub id: RequestId,
	pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorDetail {
	pub code: i32,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
	pub jsonrpc: Version2,
	pub id: RequestId,
	pub error: JsonRpcErrorDetail,
}

/// Implementation-defined server error used for gateway denials.
pub const ERROR_CODE_DENIED: i32 = -32000;

/// Any message on an MCP wire. Order matters for untagged deserialization:
/// requests carry both `id` and `method`, responses carry `result` or
/// `error`, notifications only `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpMessage {
	Request(JsonRpcRequest),
	Error(JsonRpcError),
	Response(JsonRpcResponse),
	Notification(JsonRpcNotification),
}

impl McpMessage {
	pub fn method(&self) -> Option<&str> {
		match self {
			McpMessage::Request(r) => Some(&r.method),
			McpMessage::Notification(n) => Some(&n.method),
			_ => None,
		}
	}

	pub fn id(&self) -> Option<&RequestId> {
		match self {
			McpMessage::Request(r) => Some(&r.id),
			McpMessage::Response(r) => Some(&r.id),
			McpMessage::Error(e) => Some(&e.id),
			McpMessage::Notification(_) => None,
		}
	}

	pub fn params_object(&self) -> Option<&Map<String, Value>> {
		let params = match self {
			McpMessage::Request(r) => r.params.as_ref(),
			McpMessage::Notification(n) => n.params.as_ref(),
			_ => None,
		}?;
		params.as_object()
	}

	pub fn denial(id: RequestId, message: String, data: Option<Value>) -> McpMessage {
		McpMessage::Error(JsonRpcError {
			jsonrpc: Version2,
			id,
			error: JsonRpcErrorDetail {
				code: ERROR_CODE_DENIED,
				message,
				data,
			},
		})
	}
}
