use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::jsonrpc::McpMessage;
use crate::outbound::OutboundDeny;
use crate::scan::ScanResult;
use crate::types::action::CanonicalAction;
use crate::*;

pub mod approval;
pub mod outbound;
pub mod policy;
pub mod response_scan;

pub use policy::{Decision, EvaluationContext, PolicyEngine};

/// Structured policy denial detail.
#[derive(thiserror::Error, Debug, Clone, Default)]
#[error("{reason}")]
pub struct PolicyDeny {
	pub rule_id: Strng,
	pub rule_name: Strng,
	pub reason: String,
	pub help_url: Strng,
	pub help_text: Strng,
}

#[derive(thiserror::Error, Debug)]
pub enum InterceptError {
	#[error("session identity missing")]
	MissingSession,
	#[error("policy denied: {0}")]
	PolicyDenied(#[source] PolicyDeny),
	#[error("outbound blocked: {0}")]
	OutboundBlocked(#[source] OutboundDeny),
	#[error("response blocked by scanner")]
	ResponseBlocked(ScanResult),
	#[error("approval timed out")]
	ApprovalTimeout,
	#[error("request cancelled")]
	Cancelled,
	#[error("gateway error: {0}")]
	Gateway(anyhow::Error),
}

impl From<anyhow::Error> for InterceptError {
	fn from(err: anyhow::Error) -> Self {
		InterceptError::Gateway(err)
	}
}

/// Per-action state threaded through the chain. Deferred cleanups (DNS pin
/// release) run when the context drops, which covers every exit path.
pub struct InterceptContext {
	pub cancel: CancellationToken,
	/// Set by the policy stage when the decision requires human approval;
	/// consumed by the approval stage.
	pub pending_decision: Option<Decision>,
	/// Populated by the response-scan stage for audit surfaces.
	pub scan: Option<ScanResult>,
	deferred: Vec<Box<dyn FnOnce() + Send>>,
}

impl Default for InterceptContext {
	fn default() -> Self {
		Self::new(CancellationToken::new())
	}
}

impl InterceptContext {
	pub fn new(cancel: CancellationToken) -> Self {
		InterceptContext {
			cancel,
			pending_decision: None,
			scan: None,
			deferred: Vec::new(),
		}
	}

	/// Register cleanup to run when the chain finishes with this action.
	pub fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
		self.deferred.push(Box::new(f));
	}

	pub fn finish(&mut self) {
		for f in self.deferred.drain(..).rev() {
			f();
		}
	}
}

impl Drop for InterceptContext {
	fn drop(&mut self) {
		self.finish();
	}
}

/// One stage of the interception pipeline. Stages run in a fixed order on the
/// request path; stages with post-upstream behavior also see the response.
#[async_trait]
pub trait Interceptor: Send + Sync {
	fn name(&self) -> &'static str;

	async fn intercept(
		&self,
		cx: &mut InterceptContext,
		action: &mut CanonicalAction,
	) -> Result<(), InterceptError>;

	async fn on_response(
		&self,
		_cx: &mut InterceptContext,
		_action: &CanonicalAction,
		_response: &mut McpMessage,
	) -> Result<(), InterceptError> {
		Ok(())
	}
}

/// Terminal stage: delivers the action to its real destination.
#[async_trait]
pub trait UpstreamHandler: Send + Sync {
	async fn call(&self, action: &CanonicalAction) -> Result<McpMessage, InterceptError>;
}

/// Ordered interceptor pipeline. The order is fixed at construction
/// (auth and quarantine run as middleware/stages before policy, then
/// approval, outbound, response-scan).
pub struct Chain {
	stages: Vec<Arc<dyn Interceptor>>,
}

impl Chain {
	pub fn new(stages: Vec<Arc<dyn Interceptor>>) -> Self {
		Chain { stages }
	}

	/// Run the request-path stages in order. The caller owns forwarding and,
	/// for protocols that need it, the response pass.
	pub async fn intercept_request(
		&self,
		cx: &mut InterceptContext,
		action: &mut CanonicalAction,
	) -> Result<(), InterceptError> {
		for stage in &self.stages {
			trace!(stage = stage.name(), request = action.request_id.as_str(), "intercept");
			stage.intercept(cx, action).await?;
		}
		Ok(())
	}

	/// Full pipeline for message-oriented protocols: request stages, the
	/// upstream terminal, then response stages in the same order.
	pub async fn execute(
		&self,
		cx: &mut InterceptContext,
		action: &mut CanonicalAction,
		upstream: &dyn UpstreamHandler,
	) -> Result<McpMessage, InterceptError> {
		self.intercept_request(cx, action).await?;
		let mut response = upstream.call(action).await?;
		for stage in &self.stages {
			stage.on_response(cx, action, &mut response).await?;
		}
		cx.finish();
		Ok(response)
	}
}
