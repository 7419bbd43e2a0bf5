use std::collections::HashSet;
use std::convert::Infallible;

use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::http::{Body, Method, Request, Response, Scheme, StatusCode, Uri};
use crate::intercept::InterceptError;
use crate::normalize::http::split_host_port;
use crate::outbound::{RuleSet, evaluate_destination};
use crate::proxy::handler::Handler;
use crate::proxy::{ClientAddr, error_response, json_response};
use crate::tls::CertCache;
use crate::types::action::Identity;
use crate::*;

const TUNNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct InspectorState {
	enabled: bool,
	bypass_exact: HashSet<Strng>,
	bypass_globs: Vec<Strng>,
}

/// CONNECT front door: evaluates the connect filter, then either tunnels
/// bytes opaquely or terminates TLS with a minted leaf and feeds the inner
/// requests back through the HTTP handler.
pub struct TlsInspector {
	handler: Arc<Handler>,
	certs: Option<Arc<CertCache>>,
	connect_rules: Option<Arc<RuleSet>>,
	state: RwLock<InspectorState>,
}

impl TlsInspector {
	pub fn new(handler: Arc<Handler>) -> Self {
		TlsInspector {
			handler,
			certs: None,
			connect_rules: None,
			state: RwLock::new(InspectorState::default()),
		}
	}

	pub fn with_cert_cache(mut self, certs: Arc<CertCache>) -> Self {
		self.certs = Some(certs);
		self.state.get_mut().enabled = true;
		self
	}

	pub fn with_connect_rules(mut self, rules: Arc<RuleSet>) -> Self {
		self.connect_rules = Some(rules);
		self
	}

	pub fn set_enabled(&self, enabled: bool) {
		self.state.write().enabled = enabled;
	}

	/// Replace the bypass list. `*.suffix` entries match the bare suffix and
	/// every level beneath it.
	pub fn set_bypass_list(&self, domains: Vec<Strng>) {
		let mut state = self.state.write();
		state.bypass_exact.clear();
		state.bypass_globs.clear();
		for domain in domains {
			if domain.starts_with("*.") {
				state.bypass_globs.push(strng::new(&domain[2..]));
			} else {
				state.bypass_exact.insert(domain);
			}
		}
	}

	fn should_intercept(&self, domain: &str) -> bool {
		let state = self.state.read();
		if !state.enabled || self.certs.is_none() {
			return false;
		}
		if state.bypass_exact.contains(domain) {
			return false;
		}
		let bypassed = domain.is_ascii()
			&& state.bypass_globs.iter().any(|suffix| {
				domain.eq_ignore_ascii_case(suffix)
					|| (domain.len() > suffix.len() + 1
						&& domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
						&& domain[domain.len() - suffix.len()..].eq_ignore_ascii_case(suffix))
			});
		!bypassed
	}

	pub async fn handle(&self, mut req: Request) -> Response {
		if req.method() != Method::CONNECT {
			return self.handler.handle(req).await;
		}

		let Some((domain, port)) = connect_target(&req) else {
			return json_response(
				StatusCode::BAD_REQUEST,
				serde_json::json!({"error": "gateway_error", "message": "malformed CONNECT target"}),
			);
		};

		if let Some(rules) = &self.connect_rules
			&& let Err(deny) = evaluate_destination(&rules.snapshot(), &domain, None, port)
		{
			info!(domain = domain.as_str(), port, rule = deny.rule_name.as_str(), "CONNECT denied");
			return error_response(&InterceptError::OutboundBlocked(deny));
		}

		let intercept = self.should_intercept(&domain);
		let on_upgrade = hyper::upgrade::on(&mut req);
		let handler = self.handler.clone();
		let certs = self.certs.clone();
		let identity = req.extensions().get::<Identity>().cloned();
		let client_addr = req.extensions().get::<ClientAddr>().copied();

		tokio::spawn(async move {
			let upgraded = match on_upgrade.await {
				Ok(upgraded) => upgraded,
				Err(e) => {
					debug!("CONNECT upgrade failed: {e}");
					return;
				},
			};
			let client = TokioIo::new(upgraded);
			if intercept {
				let Some(certs) = certs else { return };
				if let Err(e) =
					intercept_tls(client, handler, certs, domain.clone(), port, identity, client_addr).await
				{
					debug!(domain = domain.as_str(), "TLS intercept ended: {e:#}");
				}
			} else if let Err(e) = tunnel(client, &domain, port).await {
				debug!(domain = domain.as_str(), "tunnel ended: {e:#}");
			}
		});

		// hyper turns this into `200 Connection Established` semantics and
		// resolves the upgrade once it is flushed.
		::http::Response::builder()
			.status(StatusCode::OK)
			.body(Body::empty())
			.expect("static response must build")
	}
}

fn connect_target(req: &Request) -> Option<(Strng, u16)> {
	let authority = req
		.uri()
		.authority()
		.map(|a| a.as_str().to_string())
		.or_else(|| {
			req
				.headers()
				.get(::http::header::HOST)
				.and_then(|v| v.to_str().ok())
				.map(str::to_string)
		})?;
	let (host, port) = split_host_port(&authority);
	if host.is_empty() {
		return None;
	}
	Some((strng::new(host), port.unwrap_or(443)))
}

/// Opaque byte relay. EOF on either side propagates a write shutdown to the
/// other; both halves are closed when the copy finishes.
async fn tunnel<IO>(mut client: IO, domain: &str, port: u16) -> anyhow::Result<()>
where
	IO: AsyncRead + AsyncWrite + Unpin,
{
	let mut upstream = tokio::time::timeout(
		TUNNEL_DIAL_TIMEOUT,
		TcpStream::connect((domain, port)),
	)
	.await
	.map_err(|_| anyhow::anyhow!("dial {domain}:{port} timed out"))??;
	let (from_client, from_upstream) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
	debug!(domain, port, from_client, from_upstream, "tunnel closed");
	Ok(())
}

async fn intercept_tls<IO>(
	client: IO,
	handler: Arc<Handler>,
	certs: Arc<CertCache>,
	domain: Strng,
	port: u16,
	identity: Option<Identity>,
	client_addr: Option<ClientAddr>,
) -> anyhow::Result<()>
where
	IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	// Certificate problems abort before any proxying; the client just sees
	// a closed connection.
	let tls_config = certs.get_cert(&domain)?;
	let tls = TlsAcceptor::from(tls_config).accept(client).await?;

	let authority: Strng = if port == 443 {
		domain.clone()
	} else {
		strng::format!("{domain}:{port}")
	};
	let service = hyper::service::service_fn(move |inner: ::http::Request<Incoming>| {
		let handler = handler.clone();
		let authority = authority.clone();
		let identity = identity.clone();
		async move {
			let mut inner = inner.map(Body::new);
			// Inner requests arrive origin-form; rebuild the absolute URI so
			// downstream stages see the real destination.
			match absolute_uri(inner.uri(), &authority) {
				Ok(uri) => *inner.uri_mut() = uri,
				Err(e) => {
					debug!("rejecting inner request: {e}");
					return Ok::<_, Infallible>(json_response(
						StatusCode::BAD_REQUEST,
						serde_json::json!({"error": "gateway_error", "message": "malformed request"}),
					));
				},
			}
			if let Some(identity) = identity {
				inner.extensions_mut().insert(identity);
			}
			if let Some(addr) = client_addr {
				inner.extensions_mut().insert(addr);
			}
			Ok::<_, Infallible>(handler.handle(inner).await)
		}
	});

	hyper::server::conn::http1::Builder::new()
		.serve_connection(TokioIo::new(tls), service)
		.with_upgrades()
		.await?;
	Ok(())
}

fn absolute_uri(orig: &Uri, authority: &str) -> anyhow::Result<Uri> {
	let path_and_query = orig
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	Ok(
		Uri::builder()
			.scheme(Scheme::HTTPS)
			.authority(authority)
			.path_and_query(path_and_query)
			.build()?,
	)
}

#[cfg(test)]
#[path = "tlsinspect_tests.rs"]
mod tests;
