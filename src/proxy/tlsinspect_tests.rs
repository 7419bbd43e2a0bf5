use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::intercept::Chain;
use crate::outbound::dns::PinnedResolver;
use crate::outbound::{OutboundRule, RuleAction, RuleMode, Target};
use crate::proxy::Gateway;
use crate::proxy::handler::HandlerConfig;
use crate::proxy::reverse::{ReverseRouter, UpstreamTarget};
use crate::tls::{CaConfig, CertificateAuthority};

fn bare_handler() -> Arc<Handler> {
	let (resolver, _) = PinnedResolver::mocked(&[], Duration::from_secs(60));
	Arc::new(Handler::new(
		Arc::new(Chain::new(vec![])),
		Arc::new(resolver),
		Arc::new(ReverseRouter::new()),
		HandlerConfig {
			allow_private_destinations: true,
			..Default::default()
		},
	))
}

fn setup_test_logging() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

async fn serve(inspector: TlsInspector) -> SocketAddr {
	setup_test_logging();
	let gateway = Gateway::new(Arc::new(inspector));
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let _ = gateway.serve(listener, CancellationToken::new()).await;
	});
	addr
}

async fn read_head<IO: AsyncRead + Unpin>(stream: &mut IO) -> String {
	let mut head = Vec::new();
	let mut byte = [0u8; 1];
	while !head.ends_with(b"\r\n\r\n") {
		stream.read_exact(&mut byte).await.unwrap();
		head.push(byte[0]);
	}
	String::from_utf8_lossy(&head).into_owned()
}

async fn read_body<IO: AsyncRead + Unpin>(stream: &mut IO, head: &str) -> Vec<u8> {
	let len = head
		.lines()
		.find_map(|l| {
			let (name, value) = l.split_once(':')?;
			name.trim()
				.eq_ignore_ascii_case("content-length")
				.then(|| value.trim().parse::<usize>().ok())?
		})
		.unwrap_or(0);
	let mut body = vec![0u8; len];
	stream.read_exact(&mut body).await.unwrap();
	body
}

async fn connect_through(addr: SocketAddr, target: &str) -> (TcpStream, String) {
	let mut stream = TcpStream::connect(addr).await.unwrap();
	stream
		.write_all(format!("CONNECT {target} HTTP/1.1\r\nhost: {target}\r\n\r\n").as_bytes())
		.await
		.unwrap();
	let head = read_head(&mut stream).await;
	(stream, head)
}

#[test]
fn bypass_globs_match_the_bare_suffix_too() {
	let inspector = TlsInspector::new(bare_handler()).with_cert_cache(test_cert_cache());
	inspector.set_bypass_list(vec!["*.bank.example".into(), "exact.example".into()]);

	assert!(!inspector.should_intercept("bank.example"), "glob must cover the bare suffix");
	assert!(!inspector.should_intercept("login.bank.example"));
	assert!(!inspector.should_intercept("a.b.bank.example"));
	assert!(!inspector.should_intercept("exact.example"));
	assert!(inspector.should_intercept("otherbank.example"));
	assert!(inspector.should_intercept("anything.else"));
}

#[test]
fn runtime_toggles() {
	let inspector = TlsInspector::new(bare_handler()).with_cert_cache(test_cert_cache());
	assert!(inspector.should_intercept("x.example"));
	inspector.set_enabled(false);
	assert!(!inspector.should_intercept("x.example"));
	inspector.set_enabled(true);
	assert!(inspector.should_intercept("x.example"));
}

#[test]
fn no_cert_cache_means_no_interception() {
	let inspector = TlsInspector::new(bare_handler());
	inspector.set_enabled(true);
	assert!(!inspector.should_intercept("x.example"));
}

fn test_cert_cache() -> Arc<CertCache> {
	let ca = CertificateAuthority::generate(&CaConfig::default()).unwrap();
	Arc::new(CertCache::new(Arc::new(ca), Duration::from_secs(300)))
}

#[tokio::test]
async fn connect_filter_denies_with_structured_json() {
	let rules = Arc::new(RuleSet::new());
	rules.set_rules(vec![OutboundRule {
		id: "r-ngrok".into(),
		name: "Block ngrok CONNECT".into(),
		mode: RuleMode::Blocklist,
		action: RuleAction::Block,
		scope: strng::EMPTY,
		priority: 0,
		enabled: true,
		base64_scan: false,
		targets: vec![Target::DomainGlob("*.ngrok.io".into())],
		help_text: strng::EMPTY,
		help_url: "https://docs.example.com/connect".into(),
		read_only: false,
		created_at: Utc::now(),
		updated_at: Utc::now(),
	}]);
	let inspector = TlsInspector::new(bare_handler()).with_connect_rules(rules);
	let addr = serve(inspector).await;

	let (mut stream, head) = connect_through(addr, "evil.ngrok.io:443").await;
	assert!(head.starts_with("HTTP/1.1 403"), "got: {head}");
	let body = read_body(&mut stream, &head).await;
	let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
	assert_eq!(json["error"], "outbound_blocked");
	assert_eq!(json["rule"], "Block ngrok CONNECT");
	assert_eq!(json["help_url"], "https://docs.example.com/connect");
}

async fn spawn_tcp_echo() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(async move {
				let mut buf = [0u8; 1024];
				loop {
					match stream.read(&mut buf).await {
						Ok(0) | Err(_) => return,
						Ok(n) => {
							if stream.write_all(&buf[..n]).await.is_err() {
								return;
							}
						},
					}
				}
			});
		}
	});
	addr
}

#[tokio::test]
async fn disabled_inspection_tunnels_raw_bytes() {
	let echo = spawn_tcp_echo().await;
	let inspector = TlsInspector::new(bare_handler());
	let addr = serve(inspector).await;

	let (mut stream, head) = connect_through(addr, &echo.to_string()).await;
	assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

	stream.write_all(b"opaque bytes through the tunnel").await.unwrap();
	let mut buf = [0u8; 31];
	stream.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"opaque bytes through the tunnel");
}

#[tokio::test]
async fn bypassed_domains_are_tunnelled_even_when_enabled() {
	let echo = spawn_tcp_echo().await;
	let inspector = TlsInspector::new(bare_handler()).with_cert_cache(test_cert_cache());
	inspector.set_bypass_list(vec![strng::new(echo.ip().to_string())]);
	let addr = serve(inspector).await;

	let (mut stream, head) = connect_through(addr, &echo.to_string()).await;
	assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
	stream.write_all(b"ping").await.unwrap();
	let mut buf = [0u8; 4];
	stream.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"ping");
}

fn client_tls_for(ca_pem: &str) -> tokio_rustls::TlsConnector {
	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
		roots.add(cert.unwrap()).unwrap();
	}
	let config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn tls_intercept_serves_inner_requests_through_the_handler() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/api/data"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("x-inspected", "true")
				.set_body_string("inner payload"),
		)
		.mount(&upstream)
		.await;

	// Inner requests are reverse-dispatched to the plain-HTTP upstream so the
	// intercepted TLS leg terminates at the gateway.
	let reverse = Arc::new(ReverseRouter::new());
	reverse.set_targets(vec![UpstreamTarget {
		id: "t-inner".into(),
		name: "inner".into(),
		path_prefix: "/".into(),
		upstream: strng::format!("http://{}", upstream.address()),
		strip_prefix: false,
		headers: Default::default(),
		enabled: true,
	}]);
	let (resolver, _) = PinnedResolver::mocked(&[], Duration::from_secs(60));
	let handler = Arc::new(Handler::new(
		Arc::new(Chain::new(vec![])),
		Arc::new(resolver),
		reverse,
		HandlerConfig {
			allow_private_destinations: true,
			..Default::default()
		},
	));

	let ca = Arc::new(CertificateAuthority::generate(&CaConfig::default()).unwrap());
	let certs = Arc::new(CertCache::new(ca.clone(), Duration::from_secs(300)));
	let inspector = TlsInspector::new(handler).with_cert_cache(certs);
	let addr = serve(inspector).await;

	let (stream, head) = connect_through(addr, "secure.example.com:443").await;
	assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

	let connector = client_tls_for(ca.ca_pem());
	let name = rustls_pki_types::ServerName::try_from("secure.example.com").unwrap();
	let mut tls = connector.connect(name, stream).await.expect("client must trust the minted leaf");

	tls
		.write_all(b"GET /api/data HTTP/1.1\r\nhost: secure.example.com\r\n\r\n")
		.await
		.unwrap();
	let head = read_head(&mut tls).await;
	assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
	assert!(head.to_ascii_lowercase().contains("x-inspected: true"), "got: {head}");
	let body = read_body(&mut tls, &head).await;
	assert_eq!(body, b"inner payload");

	// The handler observed the reconstructed https request.
	let received = &upstream.received_requests().await.unwrap()[0];
	assert_eq!(received.headers.get("x-forwarded-proto").unwrap(), "https");
	assert_eq!(
		received.headers.get("x-forwarded-host").unwrap(),
		"secure.example.com"
	);
}

#[tokio::test]
async fn inner_keep_alive_serves_multiple_requests() {
	let upstream = MockServer::start().await;
	Mock::given(method("GET"))
		.respond_with(ResponseTemplate::new(200).set_body_string("ok"))
		.mount(&upstream)
		.await;

	let reverse = Arc::new(ReverseRouter::new());
	reverse.set_targets(vec![UpstreamTarget {
		id: "t-inner".into(),
		name: "inner".into(),
		path_prefix: "/".into(),
		upstream: strng::format!("http://{}", upstream.address()),
		strip_prefix: false,
		headers: Default::default(),
		enabled: true,
	}]);
	let (resolver, _) = PinnedResolver::mocked(&[], Duration::from_secs(60));
	let handler = Arc::new(Handler::new(
		Arc::new(Chain::new(vec![])),
		Arc::new(resolver),
		reverse,
		HandlerConfig {
			allow_private_destinations: true,
			..Default::default()
		},
	));
	let ca = Arc::new(CertificateAuthority::generate(&CaConfig::default()).unwrap());
	let inspector =
		TlsInspector::new(handler).with_cert_cache(Arc::new(CertCache::new(ca.clone(), Duration::from_secs(300))));
	let addr = serve(inspector).await;

	let (stream, _) = connect_through(addr, "secure.example.com:443").await;
	let connector = client_tls_for(ca.ca_pem());
	let name = rustls_pki_types::ServerName::try_from("secure.example.com").unwrap();
	let mut tls = connector.connect(name, stream).await.unwrap();

	for _ in 0..3 {
		tls
			.write_all(b"GET /x HTTP/1.1\r\nhost: secure.example.com\r\n\r\n")
			.await
			.unwrap();
		let head = read_head(&mut tls).await;
		assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
		let body = read_body(&mut tls, &head).await;
		assert_eq!(body, b"ok");
	}
	assert_eq!(upstream.received_requests().await.unwrap().len(), 3);
}
