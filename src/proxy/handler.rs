use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::http::{
	Body, HeaderName, HeaderValue, Request, Response, StatusCode, buffer_body_prefix, default_port,
	header, is_text_content_type, is_websocket_upgrade, strip_hop_by_hop_headers,
};
use crate::intercept::{Chain, InterceptContext, InterceptError};
use crate::normalize::http::{HttpNormalizer, X_REQUEST_ID, split_host_port};
use crate::outbound::dns::PinnedResolver;
use crate::proxy::reverse::{ReverseRouter, UpstreamTarget};
use crate::proxy::websocket::WebSocketRelay;
use crate::proxy::{ClientAddr, error_response, json_response};
use crate::scan::{InjectionScanner, ScanMode, ScannerState};
use crate::types::action::{CanonicalAction, Identity};
use crate::*;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Largest response prefix buffered for scanning.
const SCAN_BODY_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HandlerConfig {
	pub gateway: Strng,
	/// Permit dialing private, loopback, and link-local destinations on the
	/// forward path. Only for dev/test rigs.
	pub allow_private_destinations: bool,
	pub upstream_timeout: Duration,
}

impl Default for HandlerConfig {
	fn default() -> Self {
		HandlerConfig {
			gateway: strng::literal!("sentinelgate"),
			allow_private_destinations: false,
			upstream_timeout: Duration::from_secs(30),
		}
	}
}

/// The HTTP data plane: dispatches WebSocket upgrades, routes reverse-proxy
/// prefixes, runs the interceptor chain, forwards with rebinding-safe
/// dialing, and optionally scans response bodies.
pub struct Handler {
	chain: Arc<Chain>,
	normalizer: HttpNormalizer,
	resolver: Arc<PinnedResolver>,
	reverse: Arc<ReverseRouter>,
	relay: Option<Arc<WebSocketRelay>>,
	scanner: Option<(Arc<InjectionScanner>, Arc<ScannerState>)>,
	tls: TlsConnector,
	config: HandlerConfig,
}

impl Handler {
	pub fn new(
		chain: Arc<Chain>,
		resolver: Arc<PinnedResolver>,
		reverse: Arc<ReverseRouter>,
		config: HandlerConfig,
	) -> Self {
		Handler {
			chain,
			normalizer: HttpNormalizer::new(config.gateway.clone()),
			resolver,
			reverse,
			relay: None,
			scanner: None,
			tls: TlsConnector::from(Arc::new(upstream_tls_config())),
			config,
		}
	}

	pub fn with_relay(mut self, relay: Arc<WebSocketRelay>) -> Self {
		self.relay = Some(relay);
		self
	}

	pub fn with_scanner(mut self, scanner: Arc<InjectionScanner>, state: Arc<ScannerState>) -> Self {
		self.scanner = Some((scanner, state));
		self
	}

	pub async fn handle(&self, req: Request) -> Response {
		match self.handle_inner(req).await {
			Ok(resp) => resp,
			Err(err) => {
				debug!("request failed: {err:#}");
				json_response(
					StatusCode::BAD_GATEWAY,
					serde_json::json!({"error": "gateway_error", "message": err.to_string()}),
				)
			},
		}
	}

	async fn handle_inner(&self, mut req: Request) -> anyhow::Result<Response> {
		let reverse = self.reverse.match_path(req.uri().path());

		let mut action = self.normalizer.normalize(&mut req).await?;
		action.identity = req
			.extensions()
			.get::<Identity>()
			.cloned()
			.unwrap_or_default();

		if let Some(target) = &reverse {
			override_destination(&mut action, target)?;
		}

		if is_websocket_upgrade(req.headers()) {
			if let Some(relay) = &self.relay {
				let mut cx = InterceptContext::new(CancellationToken::new());
				if let Err(err) = self.chain.intercept_request(&mut cx, &mut action).await {
					return Ok(error_response(&err));
				}
				return relay.proxy(req, &action.destination).await;
			}
		}

		let mut cx = InterceptContext::new(CancellationToken::new());
		if let Err(err) = self.chain.intercept_request(&mut cx, &mut action).await {
			return Ok(error_response(&err));
		}

		let resp = self.forward(req, &action, reverse).await;
		cx.finish();
		self.resolver.release_request(&action.request_id);
		let mut resp = match resp {
			Ok(resp) => resp,
			Err(err) => {
				warn!(
					destination = action.destination.url.as_str(),
					"upstream dial failed: {err:#}"
				);
				return Ok(json_response(
					StatusCode::BAD_GATEWAY,
					serde_json::json!({"error": "gateway_error", "message": err.to_string()}),
				));
			},
		};

		if let Some(blocked) = self.scan_response(&mut resp, &action).await? {
			return Ok(blocked);
		}
		Ok(resp)
	}

	/// Forward the (allowed) request to its destination over a dialer that
	/// uses the pinned resolution and refuses non-public addresses.
	async fn forward(
		&self,
		req: Request,
		action: &CanonicalAction,
		reverse: Option<Arc<UpstreamTarget>>,
	) -> anyhow::Result<Response> {
		let dest = &action.destination;
		let (scheme, host, port) = (dest.scheme.clone(), dest.domain.clone(), dest.port);
		let use_tls = matches!(scheme.as_str(), "https" | "wss");

		let ip = match dest.ip {
			Some(ip) => ip,
			None if !host.is_empty() => {
				self
					.resolver
					.resolve(&action.request_id, &host)
					.await?
					.pinned_ip
			},
			None => anyhow::bail!("request has no destination"),
		};
		if reverse.is_none() && !self.config.allow_private_destinations && !is_public_ip(ip) {
			anyhow::bail!("refusing to dial non-public address {ip}");
		}

		let (parts, body) = req.into_parts();
		let path_and_query = match reverse.as_deref() {
			Some(target) => {
				let path = target.upstream_path(parts.uri.path());
				match parts.uri.query() {
					Some(q) => format!("{path}?{q}"),
					None => path,
				}
			},
			None => parts
				.uri
				.path_and_query()
				.map(|pq| pq.as_str().to_string())
				.unwrap_or_else(|| "/".to_string()),
		};

		let mut out = ::http::Request::builder()
			.method(parts.method.clone())
			.uri(path_and_query)
			.body(body)?;
		*out.headers_mut() = parts.headers.clone();
		strip_hop_by_hop_headers(out.headers_mut());

		let host_part = if host.is_empty() {
			ip.to_string()
		} else {
			host.to_string()
		};
		let authority = if port == default_port(&scheme) {
			host_part
		} else {
			format!("{host_part}:{port}")
		};
		out
			.headers_mut()
			.insert(header::HOST, HeaderValue::from_str(&authority)?);

		append_forwarded_for(out.headers_mut(), parts.extensions.get::<ClientAddr>());
		let orig_proto = if parts.uri.scheme_str() == Some("https") {
			"https"
		} else {
			"http"
		};
		out
			.headers_mut()
			.insert(X_FORWARDED_PROTO, HeaderValue::from_static(orig_proto));
		if let Some(orig_host) = parts
			.uri
			.host()
			.map(str::to_string)
			.or_else(|| {
				parts
					.headers
					.get(header::HOST)
					.and_then(|v| v.to_str().ok())
					.map(|h| split_host_port(h).0.to_string())
			}) && let Ok(v) = HeaderValue::from_str(&orig_host)
		{
			out.headers_mut().insert(X_FORWARDED_HOST, v);
		}
		out
			.headers_mut()
			.insert(X_REQUEST_ID, HeaderValue::from_str(&action.request_id)?);
		if let Some(target) = reverse.as_deref() {
			for (name, value) in &target.headers {
				out.headers_mut().insert(
					HeaderName::try_from(name.as_str())?,
					HeaderValue::from_str(value)?,
				);
			}
		}

		let resp = tokio::time::timeout(
			self.config.upstream_timeout,
			self.send_upstream(out, ip, port, use_tls, &host),
		)
		.await
		.map_err(|_| anyhow::anyhow!("upstream timed out"))??;
		Ok(resp)
	}

	async fn send_upstream(
		&self,
		out: Request,
		ip: IpAddr,
		port: u16,
		use_tls: bool,
		host: &str,
	) -> anyhow::Result<Response> {
		let stream = TcpStream::connect(SocketAddr::new(ip, port)).await?;
		let resp = if use_tls {
			let server_name = if host.is_empty() {
				ServerName::from(ip)
			} else {
				ServerName::try_from(host.to_string())?
			};
			let tls = self.tls.connect(server_name, stream).await?;
			let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
			tokio::spawn(async move {
				if let Err(e) = conn.await {
					debug!("upstream connection error: {e}");
				}
			});
			sender.send_request(out).await?
		} else {
			let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
			tokio::spawn(async move {
				if let Err(e) = conn.await {
					debug!("upstream connection error: {e}");
				}
			});
			sender.send_request(out).await?
		};
		Ok(resp.map(Body::new))
	}

	/// Buffer and scan textual response bodies. Enforce mode replaces the
	/// response; monitor mode logs and streams the body verbatim.
	async fn scan_response(
		&self,
		resp: &mut Response,
		action: &CanonicalAction,
	) -> anyhow::Result<Option<Response>> {
		let Some((scanner, state)) = &self.scanner else {
			return Ok(None);
		};
		if !state.enabled() {
			return Ok(None);
		}
		let content_type = resp
			.headers()
			.get(header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default()
			.to_string();
		if !is_text_content_type(&content_type) {
			return Ok(None);
		}

		let prefix = buffer_body_prefix(resp.body_mut(), SCAN_BODY_LIMIT).await?;
		let text = String::from_utf8_lossy(&prefix);
		let result = scanner.scan(&text);
		if !result.detected {
			return Ok(None);
		}
		warn!(
			request = action.request_id.as_str(),
			destination = action.destination.url.as_str(),
			patterns = ?result.pattern_names(),
			mode = ?state.mode(),
			"prompt injection detected in response body"
		);
		match state.mode() {
			ScanMode::Monitor => Ok(None),
			ScanMode::Enforce => Ok(Some(error_response(&InterceptError::ResponseBlocked(result)))),
		}
	}
}

fn override_destination(action: &mut CanonicalAction, target: &UpstreamTarget) -> anyhow::Result<()> {
	let upstream = url::Url::parse(&target.upstream)?;
	let scheme = upstream.scheme();
	let host = upstream
		.host_str()
		.ok_or_else(|| anyhow::anyhow!("reverse target {} has no host", target.name))?;
	action.destination.url = target.upstream.clone();
	action.destination.scheme = strng::new(scheme);
	action.destination.port = upstream.port().unwrap_or_else(|| default_port(scheme));
	match host.parse::<IpAddr>() {
		Ok(ip) => {
			action.destination.ip = Some(ip);
			action.destination.domain = strng::EMPTY;
		},
		Err(_) => {
			action.destination.ip = None;
			action.destination.domain = strng::new(host);
		},
	}
	action.set_skip_outbound_check();
	Ok(())
}

fn append_forwarded_for(headers: &mut http::HeaderMap, peer: Option<&ClientAddr>) {
	let Some(ClientAddr(peer)) = peer else {
		return;
	};
	let prior = headers
		.get(&X_FORWARDED_FOR)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	let chain = match prior {
		Some(prior) if !prior.is_empty() => format!("{prior}, {}", peer.ip()),
		_ => peer.ip().to_string(),
	};
	if let Ok(v) = HeaderValue::from_str(&chain) {
		headers.insert(X_FORWARDED_FOR, v);
	}
}

/// Public-address check for the forward path: refuse loopback, RFC 1918,
/// link-local, CGNAT, unique-local, unspecified, and multicast space.
pub fn is_public_ip(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => {
			!(v4.is_loopback()
				|| v4.is_private()
				|| v4.is_link_local()
				|| v4.is_unspecified()
				|| v4.is_broadcast()
				|| v4.is_multicast()
				|| in_cgnat(v4))
		},
		IpAddr::V6(v6) => {
			!(v6.is_loopback()
				|| v6.is_unspecified()
				|| v6.is_multicast()
				|| is_unique_local(v6)
				|| is_link_local_v6(v6)
				|| v6.to_ipv4_mapped().is_some_and(|v4| !is_public_ip(IpAddr::V4(v4))))
		},
	}
}

fn in_cgnat(v4: Ipv4Addr) -> bool {
	let o = v4.octets();
	o[0] == 100 && (64..128).contains(&o[1])
}

fn is_unique_local(v6: Ipv6Addr) -> bool {
	(v6.segments()[0] & 0xfe00) == 0xfc00
}

fn is_link_local_v6(v6: Ipv6Addr) -> bool {
	(v6.segments()[0] & 0xffc0) == 0xfe80
}

pub(crate) fn upstream_tls_config() -> ClientConfig {
	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_native_certs::load_native_certs().certs {
		let _ = roots.add(cert);
	}
	ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth()
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
