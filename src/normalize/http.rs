use indexmap::IndexMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::http::{Request, buffer_body_prefix, default_port, header};
use crate::types::action::{ActionType, CanonicalAction, Destination};
use crate::*;

/// Largest body prefix the normalizer will read into arguments.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Credentials never land in arguments; policy expressions must not see them.
const EXCLUDED_HEADERS: &[header::HeaderName] =
	&[header::AUTHORIZATION, header::PROXY_AUTHORIZATION];

pub const X_REQUEST_ID: header::HeaderName = header::HeaderName::from_static("x-request-id");

pub struct HttpNormalizer {
	gateway: Strng,
}

impl HttpNormalizer {
	pub fn new(gateway: Strng) -> Self {
		HttpNormalizer { gateway }
	}

	/// Build a canonical action from an HTTP request. The body is read up to
	/// `MAX_BODY_BYTES` and restored, so forwarding still sees the full
	/// stream.
	pub async fn normalize(&self, req: &mut Request) -> anyhow::Result<CanonicalAction> {
		let request_id = req
			.headers()
			.get(&X_REQUEST_ID)
			.and_then(|v| v.to_str().ok())
			.map(strng::new)
			.unwrap_or_else(|| strng::new(Uuid::new_v4().to_string()));

		let mut action = CanonicalAction::new(
			ActionType::HttpRequest,
			strng::new(req.method().as_str()),
			request_id,
		);
		action.protocol = strng::literal!("http");
		action.gateway = self.gateway.clone();
		action.destination = destination_of(req)?;

		if let Some(query) = req.uri().query() {
			merge_form_pairs(&mut action.arguments, query);
		}

		let mut headers = Map::new();
		for name in req.headers().keys() {
			if EXCLUDED_HEADERS.contains(name) {
				continue;
			}
			let joined = req
				.headers()
				.get_all(name)
				.iter()
				.filter_map(|v| v.to_str().ok())
				.collect::<Vec<_>>()
				.join(", ");
			headers.insert(name.as_str().to_string(), Value::String(joined));
		}
		action
			.arguments
			.insert("headers".to_string(), Value::Object(headers));

		let content_type = req
			.headers()
			.get(header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
			.unwrap_or_default();
		let body = buffer_body_prefix(req.body_mut(), MAX_BODY_BYTES).await?;
		if !body.is_empty() {
			match content_type.as_str() {
				"application/json" => {
					if let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(&body) {
						for (k, v) in fields {
							action.arguments.insert(k, v);
						}
					}
				},
				"application/x-www-form-urlencoded" => {
					if let Ok(text) = std::str::from_utf8(&body) {
						merge_form_pairs(&mut action.arguments, text);
					}
				},
				_ => {
					action.arguments.insert(
						"body".to_string(),
						Value::String(String::from_utf8_lossy(&body).into_owned()),
					);
				},
			}
		}

		Ok(action)
	}
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
pub(crate) fn split_host_port(h: &str) -> (&str, Option<u16>) {
	if let Some(rest) = h.strip_prefix('[') {
		if let Some(end) = rest.find(']') {
			let host = &rest[..end];
			let port = rest[end + 1..]
				.strip_prefix(':')
				.and_then(|p| p.parse().ok());
			return (host, port);
		}
		return (h, None);
	}
	match h.rsplit_once(':') {
		Some((host, port)) => (host, port.parse().ok()),
		None => (h, None),
	}
}

fn destination_of(req: &Request) -> anyhow::Result<Destination> {
	let uri = req.uri();
	let scheme = uri.scheme_str().unwrap_or("http");
	let header_host = req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(split_host_port);
	let host = uri
		.host()
		.map(str::to_string)
		.or_else(|| header_host.map(|(h, _)| h.to_string()))
		.unwrap_or_default();
	let host = host.trim_matches(['[', ']']).to_string();
	let port = uri
		.port_u16()
		.or_else(|| header_host.and_then(|(_, p)| p))
		.unwrap_or_else(|| default_port(scheme));
	let path = uri.path();

	let ip = host.parse::<IpAddr>().ok();
	let url = if uri.scheme().is_some() {
		strng::new(uri.to_string())
	} else {
		strng::format!("{scheme}://{host}:{port}{path}")
	};
	Ok(Destination {
		url,
		domain: if ip.is_none() { strng::new(&host) } else { strng::EMPTY },
		ip,
		port,
		scheme: strng::new(scheme),
		path: strng::new(path),
		command: strng::EMPTY,
		cmd_args: Vec::new(),
	})
}

/// Merge `k=v&k2=v2` pairs into arguments; repeated keys become lists.
fn merge_form_pairs(args: &mut Map<String, Value>, raw: &str) {
	let mut grouped: IndexMap<String, Vec<String>> = IndexMap::new();
	for (k, v) in url::form_urlencoded::parse(raw.as_bytes()) {
		grouped.entry(k.into_owned()).or_default().push(v.into_owned());
	}
	for (k, mut vs) in grouped {
		let value = if vs.len() == 1 {
			Value::String(vs.remove(0))
		} else {
			Value::Array(vs.into_iter().map(Value::String).collect())
		};
		args.insert(k, value);
	}
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
