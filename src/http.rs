use std::pin::Pin;
use std::task::{Context, Poll};

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};
use bytes::{Bytes, BytesMut};
use http_body::Frame;
use http_body_util::BodyExt;

lazy_static::lazy_static! {
	/// Headers that are connection-scoped and must never cross the proxy.
	pub static ref HOP_BY_HOP_HEADERS: [HeaderName; 7] = [
		header::CONNECTION,
		header::PROXY_AUTHORIZATION,
		HeaderName::from_static("proxy-connection"),
		header::TE,
		header::TRAILER,
		header::TRANSFER_ENCODING,
		header::UPGRADE,
	];
}

pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
	// Drop anything the Connection header nominates, then the fixed set.
	let nominated: Vec<HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|t| HeaderName::try_from(t.trim()).ok())
		.collect();
	for h in nominated {
		headers.remove(h);
	}
	for h in HOP_BY_HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

/// Case-insensitive on both headers; absence of either yields false.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
	let connection_upgrade = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
	let upgrade_websocket = headers
		.get(header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.trim().eq_ignore_ascii_case("websocket"))
		.unwrap_or(false);
	connection_upgrade && upgrade_websocket
}

/// Content types whose bodies are worth scanning as text. Parameters such as
/// `; charset=utf-8` are ignored.
pub fn is_text_content_type(content_type: &str) -> bool {
	let essence = content_type
		.split(';')
		.next()
		.unwrap_or_default()
		.trim()
		.to_ascii_lowercase();
	if essence.starts_with("text/") {
		return true;
	}
	matches!(
		essence.as_str(),
		"application/json"
			| "application/xml"
			| "application/xhtml+xml"
			| "application/javascript"
			| "application/x-javascript"
			| "application/x-www-form-urlencoded"
	)
}

pub fn default_port(scheme: &str) -> u16 {
	match scheme {
		"https" | "wss" => 443,
		_ => 80,
	}
}

/// Read up to `limit` bytes of the body, then restore the body so downstream
/// consumers still observe the full stream. Returns the buffered prefix.
pub async fn buffer_body_prefix(body: &mut Body, limit: usize) -> anyhow::Result<Bytes> {
	let mut inner = std::mem::replace(body, Body::empty());
	let mut buf = BytesMut::new();
	let mut done = false;
	while buf.len() < limit {
		match inner.frame().await {
			None => {
				done = true;
				break;
			},
			Some(Err(e)) => return Err(e.into()),
			Some(Ok(frame)) => {
				if let Ok(data) = frame.into_data() {
					buf.extend_from_slice(&data);
				}
			},
		}
	}
	let prefix = buf.freeze();
	if done {
		*body = Body::from(prefix.clone());
	} else {
		*body = Body::new(PrefixedBody {
			prefix: Some(prefix.clone()),
			inner,
		});
	}
	Ok(prefix)
}

pin_project_lite::pin_project! {
	/// Body that replays an already-consumed prefix before the remainder of
	/// the original stream.
	struct PrefixedBody {
		prefix: Option<Bytes>,
		#[pin]
		inner: Body,
	}
}

impl http_body::Body for PrefixedBody {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		if let Some(prefix) = this.prefix.take() {
			if !prefix.is_empty() {
				return Poll::Ready(Some(Ok(Frame::data(prefix))));
			}
		}
		this.inner.poll_frame(cx)
	}
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
