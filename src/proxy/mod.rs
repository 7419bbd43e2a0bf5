use std::convert::Infallible;

use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::http::{Body, Response, StatusCode, header};
use crate::intercept::InterceptError;
use crate::*;

pub mod handler;
pub mod reverse;
pub mod tlsinspect;
pub mod websocket;

pub use handler::{Handler, HandlerConfig};
pub use tlsinspect::TlsInspector;

/// Peer address of the downstream connection, attached to every request.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

pub fn json_response(status: StatusCode, body: Value) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.expect("static response must build")
}

/// Map chain errors onto gateway responses: denials are 403 with a typed
/// JSON body, everything else is a 502.
pub fn error_response(err: &InterceptError) -> Response {
	match err {
		InterceptError::PolicyDenied(deny) => json_response(
			StatusCode::FORBIDDEN,
			json!({
				"error": "policy_denied",
				"rule": deny.rule_name,
				"reason": deny.reason,
				"help_url": deny.help_url,
				"help_text": deny.help_text,
			}),
		),
		InterceptError::MissingSession => json_response(
			StatusCode::FORBIDDEN,
			json!({"error": "policy_denied", "reason": "session identity missing"}),
		),
		InterceptError::ApprovalTimeout => json_response(
			StatusCode::FORBIDDEN,
			json!({"error": "policy_denied", "reason": "approval timed out"}),
		),
		InterceptError::OutboundBlocked(deny) => json_response(
			StatusCode::FORBIDDEN,
			json!({
				"error": "outbound_blocked",
				"rule": deny.rule_name,
				"reason": deny.reason,
				"domain": deny.domain,
				"port": deny.port,
				"help_url": deny.help_url,
				"help_text": deny.help_text,
			}),
		),
		InterceptError::ResponseBlocked(scan) => json_response(
			StatusCode::FORBIDDEN,
			json!({
				"error": "response_blocked",
				"reason": "prompt injection detected in response",
				"patterns": scan.pattern_names(),
			}),
		),
		other => json_response(
			StatusCode::BAD_GATEWAY,
			json!({"error": "gateway_error", "message": other.to_string()}),
		),
	}
}

/// Accept loop: one task per connection, dispatching every request through
/// the auth middleware and the TLS inspector (which wraps the handler).
pub struct Gateway {
	auth: Option<Arc<Authenticator>>,
	inspector: Arc<TlsInspector>,
}

impl Gateway {
	pub fn new(inspector: Arc<TlsInspector>) -> Self {
		Gateway {
			auth: None,
			inspector,
		}
	}

	pub fn with_auth(mut self, auth: Arc<Authenticator>) -> Self {
		self.auth = Some(auth);
		self
	}

	pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
		let local = listener.local_addr()?;
		info!(addr = %local, "gateway listening");
		loop {
			let accepted = tokio::select! {
				_ = shutdown.cancelled() => {
					info!(addr = %local, "gateway stopping");
					return Ok(());
				},
				accepted = listener.accept() => accepted,
			};
			let (stream, peer) = match accepted {
				Ok(a) => a,
				Err(e) => {
					warn!("accept failed: {e}");
					continue;
				},
			};
			let inspector = self.inspector.clone();
			let auth = self.auth.clone();
			tokio::spawn(async move {
				let service = hyper::service::service_fn(move |req: ::http::Request<Incoming>| {
					let inspector = inspector.clone();
					let auth = auth.clone();
					async move {
						let mut req = req.map(Body::new);
						req.extensions_mut().insert(ClientAddr(peer));
						if let Some(auth) = &auth
							&& let Err(resp) = auth.authenticate(&mut req)
						{
							return Ok::<_, Infallible>(*resp);
						}
						Ok(inspector.handle(req).await)
					}
				});
				let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
				let conn = builder
					.serve_connection_with_upgrades(TokioIo::new(stream), service);
				if let Err(e) = conn.await {
					debug!(peer = %peer, "connection closed with error: {e}");
				}
			});
		}
	}
}
