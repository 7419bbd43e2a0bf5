use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::intercept::{InterceptContext, InterceptError, Interceptor, PolicyDeny};
use crate::types::action::{ActionType, CanonicalAction};
use crate::*;

/// Everything a policy expression may reference, copied out of the canonical
/// action so the engine never holds the action itself.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
	pub identity_id: Strng,
	pub identity_name: Strng,
	pub roles: Vec<Strng>,
	pub session_id: Strng,
	pub action_type: Strng,
	pub action_name: Strng,
	pub arguments: Map<String, Value>,
	pub destination_url: Strng,
	pub destination_domain: Strng,
	pub destination_ip: Option<IpAddr>,
	pub destination_port: u16,
	pub destination_scheme: Strng,
	pub destination_path: Strng,
	pub protocol: Strng,
	pub framework: Strng,
	pub gateway: Strng,
	pub request_id: Strng,
	pub request_time: DateTime<Utc>,
}

impl EvaluationContext {
	pub fn from_action(action: &CanonicalAction) -> Self {
		EvaluationContext {
			identity_id: action.identity.id.clone(),
			identity_name: action.identity.name.clone(),
			roles: action.identity.roles.clone(),
			session_id: action.identity.session_id.clone(),
			action_type: action.action_type.as_str().into(),
			action_name: action.name.clone(),
			arguments: action.arguments.clone(),
			destination_url: action.destination.url.clone(),
			destination_domain: action.destination.domain.clone(),
			destination_ip: action.destination.ip,
			destination_port: action.destination.port,
			destination_scheme: action.destination.scheme.clone(),
			destination_path: action.destination.path.clone(),
			protocol: action.protocol.clone(),
			framework: action.framework.clone(),
			gateway: action.gateway.clone(),
			request_id: action.request_id.clone(),
			request_time: action.request_time,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
	Allow,
	Deny,
}

/// Verdict returned by the external policy engine. The gateway carries these
/// fields but never interprets rule expressions itself.
#[derive(Debug, Clone, Default)]
pub struct Decision {
	pub allowed: bool,
	pub requires_approval: bool,
	pub approval_timeout: Option<Duration>,
	pub approval_timeout_action: Option<TimeoutAction>,
	pub rule_id: Strng,
	pub rule_name: Strng,
	pub reason: String,
	pub help_url: Strng,
	pub help_text: Strng,
}

impl Decision {
	pub fn allow() -> Self {
		Decision {
			allowed: true,
			..Default::default()
		}
	}

	pub fn deny(reason: impl Into<String>) -> Self {
		Decision {
			allowed: false,
			reason: reason.into(),
			..Default::default()
		}
	}

	pub(crate) fn to_deny(&self) -> PolicyDeny {
		PolicyDeny {
			rule_id: self.rule_id.clone(),
			rule_name: self.rule_name.clone(),
			reason: self.reason.clone(),
			help_url: self.help_url.clone(),
			help_text: self.help_text.clone(),
		}
	}
}

/// Opaque policy evaluation capability.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
	async fn evaluate(&self, cx: &EvaluationContext) -> anyhow::Result<Decision>;
}

/// Chain stage that consults the policy engine. Only tool calls and HTTP
/// requests are evaluated; every other action type passes through.
pub struct PolicyInterceptor {
	engine: Arc<dyn PolicyEngine>,
}

impl PolicyInterceptor {
	pub fn new(engine: Arc<dyn PolicyEngine>) -> Self {
		PolicyInterceptor { engine }
	}
}

#[async_trait]
impl Interceptor for PolicyInterceptor {
	fn name(&self) -> &'static str {
		"policy"
	}

	async fn intercept(
		&self,
		cx: &mut InterceptContext,
		action: &mut CanonicalAction,
	) -> Result<(), InterceptError> {
		if !matches!(action.action_type, ActionType::ToolCall | ActionType::HttpRequest) {
			return Ok(());
		}
		if action.identity.session_id.is_empty() {
			return Err(InterceptError::MissingSession);
		}

		let eval_cx = EvaluationContext::from_action(action);
		let decision = tokio::select! {
			r = self.engine.evaluate(&eval_cx) => r?,
			_ = cx.cancel.cancelled() => return Err(InterceptError::Cancelled),
		};

		if decision.requires_approval {
			debug!(
				action = action.name.as_str(),
				rule = decision.rule_name.as_str(),
				"policy requires approval"
			);
			cx.pending_decision = Some(decision);
			return Ok(());
		}
		if decision.allowed {
			debug!(
				action = action.name.as_str(),
				session = action.identity.session_id.as_str(),
				"policy allowed"
			);
			return Ok(());
		}
		Err(InterceptError::PolicyDenied(decision.to_deny()))
	}
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
