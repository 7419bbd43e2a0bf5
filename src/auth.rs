use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use uuid::Uuid;

use crate::http::{Body, HeaderName, Request, Response, StatusCode, header};
use crate::types::action::Identity;
use crate::*;

pub const GATEWAY_KEY_HEADER: HeaderName = HeaderName::from_static("x-sentinelgate-key");

/// Query parameters that look like credentials. Keys are never accepted
/// there; a URL is too easy to log, cache, or share.
const REFUSED_QUERY_KEYS: &[&str] = &["key", "api_key", "apikey", "token", "access_token"];

/// Key metadata resolved by the external auth store.
#[derive(Debug, Clone)]
pub struct KeyRecord {
	pub id: Strng,
	pub name: Strng,
	pub roles: Vec<Strng>,
}

pub trait KeyStore: Send + Sync {
	fn validate(&self, key: &str) -> Option<KeyRecord>;
}

/// Raw API key for the request, kept out of the canonical action.
#[derive(Debug, Clone)]
pub struct AuthedKey(pub Strng);

pub struct Authenticator {
	store: Arc<dyn KeyStore>,
	dev_mode: bool,
}

impl Authenticator {
	pub fn new(store: Arc<dyn KeyStore>) -> Self {
		Authenticator {
			store,
			dev_mode: false,
		}
	}

	/// Dev mode skips validation and injects a synthetic identity. Never use
	/// outside local development.
	pub fn dev_mode(store: Arc<dyn KeyStore>) -> Self {
		Authenticator {
			store,
			dev_mode: true,
		}
	}

	/// Validate the request's credentials and attach the resulting identity
	/// (plus the raw key) to the request extensions.
	pub fn authenticate(&self, req: &mut Request) -> Result<Identity, Box<Response>> {
		if self.dev_mode {
			let identity = Identity {
				id: strng::literal!("dev"),
				name: strng::literal!("dev"),
				roles: vec![strng::literal!("dev")],
				session_id: session_id(),
			};
			req.extensions_mut().insert(identity.clone());
			return Ok(identity);
		}

		if let Some(query) = req.uri().query()
			&& url::form_urlencoded::parse(query.as_bytes())
				.any(|(k, _)| REFUSED_QUERY_KEYS.contains(&k.as_ref()))
		{
			warn!("credential-shaped query parameter refused");
			return Err(Box::new(auth_required()));
		}

		let Some(key) = extract_key(req) else {
			return Err(Box::new(auth_required()));
		};
		let Some(record) = self.store.validate(&key) else {
			debug!("api key rejected by store");
			return Err(Box::new(auth_required()));
		};

		let identity = Identity {
			id: record.id,
			name: record.name,
			roles: record.roles,
			session_id: session_id(),
		};
		req.extensions_mut().insert(identity.clone());
		req.extensions_mut().insert(AuthedKey(strng::new(&key)));
		Ok(identity)
	}
}

fn session_id() -> Strng {
	strng::new(Uuid::new_v4().to_string())
}

/// Extraction priority: proxy bearer, proxy basic (password field), plain
/// bearer, then the gateway's own header.
fn extract_key(req: &Request) -> Option<String> {
	let header_str = |name: &HeaderName| {
		req
			.headers()
			.get(name)
			.and_then(|v| v.to_str().ok())
			.map(str::trim)
	};

	if let Some(proxy) = header_str(&header::PROXY_AUTHORIZATION) {
		if let Some(token) = strip_scheme(proxy, "Bearer") {
			return Some(token.to_string());
		}
		if let Some(encoded) = strip_scheme(proxy, "Basic")
			&& let Ok(decoded) = BASE64.decode(encoded)
			&& let Ok(pair) = String::from_utf8(decoded)
			&& let Some((_, password)) = pair.split_once(':')
		{
			return Some(password.to_string());
		}
	}
	if let Some(auth) = header_str(&header::AUTHORIZATION)
		&& let Some(token) = strip_scheme(auth, "Bearer")
	{
		return Some(token.to_string());
	}
	header_str(&GATEWAY_KEY_HEADER).map(str::to_string)
}

fn strip_scheme<'a>(value: &'a str, scheme: &str) -> Option<&'a str> {
	let (found, rest) = value.split_once(' ')?;
	if found.eq_ignore_ascii_case(scheme) {
		Some(rest.trim())
	} else {
		None
	}
}

fn auth_required() -> Response {
	let body = json!({"error": "proxy_auth_required"}).to_string();
	::http::Response::builder()
		.status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
		.header(header::PROXY_AUTHENTICATE, "Bearer")
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body))
		.expect("static response must build")
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
