use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::intercept::policy::{Decision, TimeoutAction};
use crate::intercept::{InterceptContext, InterceptError, Interceptor};
use crate::types::action::{CanonicalAction, Identity};
use crate::*;

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const EVICTION_REASON: &str = "evicted: store at capacity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
	Pending,
	Approved,
	Denied,
	TimedOut,
}

/// Snapshot of one approval waiting on a human.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
	pub id: Uuid,
	pub tool_name: Strng,
	pub arguments: Map<String, Value>,
	pub identity: Identity,
	pub status: ApprovalStatus,
	pub created_at: DateTime<Utc>,
	#[serde(skip)]
	pub timeout: Duration,
	pub timeout_action: TimeoutAction,
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
	Approved,
	Denied(String),
}

struct Entry {
	info: PendingApproval,
	tx: Option<oneshot::Sender<Outcome>>,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ApprovalStoreError {
	#[error("approval {0} not found")]
	NotFound(Uuid),
	#[error("approval {0} already resolved")]
	AlreadyResolved(Uuid),
}

#[derive(Default)]
struct Inner {
	entries: HashMap<Uuid, Entry>,
	order: VecDeque<Uuid>,
}

/// Bounded pending-approval queue. At capacity the oldest entry is evicted
/// as a denial so a stalled reviewer can never wedge new requests.
pub struct ApprovalStore {
	max_pending: usize,
	inner: Mutex<Inner>,
}

impl ApprovalStore {
	pub fn new(max_pending: usize) -> Self {
		ApprovalStore {
			max_pending: max_pending.max(1),
			inner: Mutex::new(Inner::default()),
		}
	}

	fn add(&self, info: PendingApproval, tx: oneshot::Sender<Outcome>) {
		let mut inner = self.inner.lock();
		while inner.entries.len() >= self.max_pending {
			let Some(oldest) = inner.order.pop_front() else {
				break;
			};
			if let Some(mut evicted) = inner.entries.remove(&oldest) {
				evicted.info.status = ApprovalStatus::Denied;
				warn!(id = %oldest, tool = evicted.info.tool_name.as_str(), "approval evicted");
				if let Some(tx) = evicted.tx.take() {
					let _ = tx.send(Outcome::Denied(EVICTION_REASON.to_string()));
				}
			}
		}
		let id = info.id;
		inner.entries.insert(
			id,
			Entry {
				info,
				tx: Some(tx),
			},
		);
		inner.order.push_back(id);
	}

	/// Entries still waiting, in insertion order.
	pub fn list(&self) -> Vec<PendingApproval> {
		let inner = self.inner.lock();
		inner
			.order
			.iter()
			.filter_map(|id| inner.entries.get(id))
			.filter(|e| e.info.status == ApprovalStatus::Pending)
			.map(|e| e.info.clone())
			.collect()
	}

	pub fn approve(&self, id: Uuid) -> Result<(), ApprovalStoreError> {
		self.resolve(id, ApprovalStatus::Approved, Outcome::Approved)
	}

	pub fn deny(&self, id: Uuid, reason: impl Into<String>) -> Result<(), ApprovalStoreError> {
		let reason = reason.into();
		self.resolve(id, ApprovalStatus::Denied, Outcome::Denied(reason))
	}

	fn resolve(
		&self,
		id: Uuid,
		status: ApprovalStatus,
		outcome: Outcome,
	) -> Result<(), ApprovalStoreError> {
		let mut inner = self.inner.lock();
		let entry = inner
			.entries
			.get_mut(&id)
			.ok_or(ApprovalStoreError::NotFound(id))?;
		let tx = entry
			.tx
			.take()
			.ok_or(ApprovalStoreError::AlreadyResolved(id))?;
		entry.info.status = status;
		let _ = tx.send(outcome);
		Ok(())
	}

	fn mark_timed_out(&self, id: Uuid) {
		let mut inner = self.inner.lock();
		if let Some(entry) = inner.entries.get_mut(&id) {
			entry.info.status = ApprovalStatus::TimedOut;
			entry.tx.take();
		}
	}

	fn remove(&self, id: Uuid) {
		let mut inner = self.inner.lock();
		inner.entries.remove(&id);
		inner.order.retain(|o| *o != id);
	}

	pub fn len(&self) -> usize {
		self.inner.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Chain stage that blocks an action until a human resolves it, the timeout
/// fires, or the request is cancelled.
pub struct ApprovalInterceptor {
	store: Arc<ApprovalStore>,
}

impl ApprovalInterceptor {
	pub fn new(store: Arc<ApprovalStore>) -> Self {
		ApprovalInterceptor { store }
	}
}

#[async_trait]
impl Interceptor for ApprovalInterceptor {
	fn name(&self) -> &'static str {
		"approval"
	}

	async fn intercept(
		&self,
		cx: &mut InterceptContext,
		action: &mut CanonicalAction,
	) -> Result<(), InterceptError> {
		let Some(decision) = cx.pending_decision.take() else {
			return Ok(());
		};
		if !decision.requires_approval {
			return Ok(());
		}

		let timeout = decision.approval_timeout.unwrap_or(DEFAULT_APPROVAL_TIMEOUT);
		let timeout_action = decision
			.approval_timeout_action
			.unwrap_or(TimeoutAction::Deny);
		let id = Uuid::new_v4();
		let (tx, rx) = oneshot::channel();
		self.store.add(
			PendingApproval {
				id,
				tool_name: action.name.clone(),
				arguments: action.arguments.clone(),
				identity: action.identity.clone(),
				status: ApprovalStatus::Pending,
				created_at: Utc::now(),
				timeout,
				timeout_action,
			},
			tx,
		);
		info!(
			id = %id,
			tool = action.name.as_str(),
			session = action.identity.session_id.as_str(),
			"awaiting approval"
		);

		let result = tokio::select! {
			outcome = rx => match outcome {
				Ok(Outcome::Approved) => Ok(()),
				Ok(Outcome::Denied(reason)) => {
					let mut deny = decision.to_deny();
					deny.reason = reason;
					Err(InterceptError::PolicyDenied(deny))
				},
				Err(_) => Err(InterceptError::Gateway(anyhow::anyhow!(
					"approval channel closed"
				))),
			},
			_ = tokio::time::sleep(timeout) => {
				self.store.mark_timed_out(id);
				match timeout_action {
					TimeoutAction::Allow => Ok(()),
					TimeoutAction::Deny => Err(InterceptError::ApprovalTimeout),
				}
			},
			_ = cx.cancel.cancelled() => Err(InterceptError::Cancelled),
		};
		self.store.remove(id);
		result
	}
}

#[cfg(test)]
#[path = "approval_tests.rs"]
mod tests;
