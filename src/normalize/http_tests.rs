use http_body_util::BodyExt;
use serde_json::json;

use super::*;
use crate::http::Body;

fn normalizer() -> HttpNormalizer {
	HttpNormalizer::new("edge-1".into())
}

fn request(uri: &str, method: &str, headers: &[(&str, &str)], body: &str) -> Request {
	let mut rb = ::http::Request::builder().uri(uri).method(method);
	for (name, value) in headers {
		rb = rb.header(*name, *value);
	}
	rb.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn absolute_form_get_with_query() {
	let mut req = request(
		"http://api.example.com/v1/items?tag=a&tag=b&limit=5",
		"GET",
		&[("x-request-id", "req-77"), ("accept", "application/json")],
		"",
	);
	let action = normalizer().normalize(&mut req).await.unwrap();

	assert_eq!(action.action_type, ActionType::HttpRequest);
	assert_eq!(action.name.as_str(), "GET");
	assert_eq!(action.request_id.as_str(), "req-77");
	assert_eq!(action.destination.domain.as_str(), "api.example.com");
	assert_eq!(action.destination.port, 80);
	assert_eq!(action.destination.scheme.as_str(), "http");
	assert_eq!(action.destination.path.as_str(), "/v1/items");

	assert_eq!(action.arguments.get("limit"), Some(&json!("5")));
	assert_eq!(action.arguments.get("tag"), Some(&json!(["a", "b"])));
	let headers = action.arguments.get("headers").unwrap();
	assert_eq!(headers.get("accept"), Some(&json!("application/json")));
}

#[tokio::test]
async fn https_default_port_is_443() {
	let mut req = request("https://secure.example.com/", "GET", &[], "");
	let action = normalizer().normalize(&mut req).await.unwrap();
	assert_eq!(action.destination.port, 443);
}

#[tokio::test]
async fn origin_form_uses_the_host_header() {
	let mut req = request("/health", "GET", &[("host", "internal.example.com:8081")], "");
	let action = normalizer().normalize(&mut req).await.unwrap();
	assert_eq!(action.destination.domain.as_str(), "internal.example.com");
	assert_eq!(action.destination.port, 8081);
	assert_eq!(action.destination.url.as_str(), "http://internal.example.com:8081/health");
}

#[tokio::test]
async fn credentials_never_reach_arguments() {
	let mut req = request(
		"http://api.example.com/",
		"GET",
		&[
			("authorization", "Bearer secret-token"),
			("proxy-authorization", "Basic dXNlcjpwdw=="),
			("user-agent", "agent/1.0"),
		],
		"",
	);
	let action = normalizer().normalize(&mut req).await.unwrap();
	let headers = action.arguments.get("headers").unwrap().as_object().unwrap();
	assert!(!headers.contains_key("authorization"));
	assert!(!headers.contains_key("proxy-authorization"));
	assert!(headers.contains_key("user-agent"));
}

#[tokio::test]
async fn json_bodies_merge_and_are_restored() {
	let payload = r#"{"target":"https://x.example.com","count":2}"#;
	let mut req = request(
		"http://api.example.com/run",
		"POST",
		&[("content-type", "application/json; charset=utf-8")],
		payload,
	);
	let action = normalizer().normalize(&mut req).await.unwrap();
	assert_eq!(action.arguments.get("target"), Some(&json!("https://x.example.com")));
	assert_eq!(action.arguments.get("count"), Some(&json!(2)));

	// The body must be rewound, never consumed.
	let rest = req.body_mut().collect().await.unwrap().to_bytes();
	assert_eq!(rest, payload.as_bytes());
}

#[tokio::test]
async fn form_bodies_merge_fields() {
	let mut req = request(
		"http://api.example.com/submit",
		"POST",
		&[("content-type", "application/x-www-form-urlencoded")],
		"a=1&b=two&b=three",
	);
	let action = normalizer().normalize(&mut req).await.unwrap();
	assert_eq!(action.arguments.get("a"), Some(&json!("1")));
	assert_eq!(action.arguments.get("b"), Some(&json!(["two", "three"])));
}

#[tokio::test]
async fn opaque_bodies_land_under_the_body_key() {
	let mut req = request(
		"http://api.example.com/upload",
		"POST",
		&[("content-type", "text/plain")],
		"hello world",
	);
	let action = normalizer().normalize(&mut req).await.unwrap();
	assert_eq!(action.arguments.get("body"), Some(&json!("hello world")));
}

#[tokio::test]
async fn missing_request_id_generates_one() {
	let mut a = request("http://x.example.com/", "GET", &[], "");
	let mut b = request("http://x.example.com/", "GET", &[], "");
	let first = normalizer().normalize(&mut a).await.unwrap();
	let second = normalizer().normalize(&mut b).await.unwrap();
	assert!(!first.request_id.is_empty());
	assert_ne!(first.request_id, second.request_id);
}

#[test]
fn host_port_splitting_handles_ipv6() {
	assert_eq!(split_host_port("example.com:8080"), ("example.com", Some(8080)));
	assert_eq!(split_host_port("example.com"), ("example.com", None));
	assert_eq!(split_host_port("[::1]:443"), ("::1", Some(443)));
	assert_eq!(split_host_port("[2001:db8::2]"), ("2001:db8::2", None));
}
