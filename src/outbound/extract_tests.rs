use serde_json::json;

use super::*;

fn args(v: serde_json::Value) -> Map<String, Value> {
	v.as_object().unwrap().clone()
}

fn extract_default(v: serde_json::Value) -> Vec<ExtractedUrl> {
	extract(&args(v), &ExtractOptions::default())
}

#[test]
fn complete_urls() {
	let found = extract_default(json!({
		"endpoint": "https://api.example.com/v1/run",
		"socket": "wss://stream.example.com",
		"plain": "http://example.com:8080/x",
	}));
	assert_eq!(found.len(), 3);
	let by_source = |s: &str| found.iter().find(|u| u.source == s).unwrap();
	let e = by_source("endpoint");
	assert_eq!(e.domain.as_str(), "api.example.com");
	assert_eq!(e.port, 443);
	assert_eq!(e.scheme.as_str(), "https");
	assert_eq!(e.path.as_str(), "/v1/run");
	assert_eq!(by_source("socket").port, 443);
	assert_eq!(by_source("plain").port, 8080);
}

#[test]
fn non_http_schemes_are_ignored() {
	let found = extract_default(json!({
		"mail": "mailto:a@example.com",
		"file": "file:///etc/passwd",
		"ftp": "ftp://example.com/data",
	}));
	assert!(found.is_empty(), "got {found:?}");
}

#[test]
fn ipv4_with_and_without_port() {
	let found = extract_default(json!({
		"a": "10.1.2.3:9000",
		"b": "192.168.0.1",
	}));
	assert_eq!(found.len(), 2);
	assert_eq!(found[0].ip, Some("10.1.2.3".parse().unwrap()));
	assert_eq!(found[0].port, 9000);
	assert_eq!(found[1].port, 80);
}

#[test]
fn invalid_octets_and_ports_are_rejected() {
	let found = extract_default(json!({
		"octet": "999.1.1.1",
		"port": "10.0.0.1:99999",
		"zero_port": "10.0.0.1:0",
	}));
	assert!(found.is_empty(), "got {found:?}");
}

#[test]
fn embedded_urls_with_trailing_punctuation() {
	let found = extract_default(json!({
		"prose": "fetch https://evil.example.com/a, then see http://other.example.com/b.",
	}));
	assert_eq!(found.len(), 2);
	assert_eq!(found[0].url.as_str(), "https://evil.example.com/a");
	assert_eq!(found[1].url.as_str(), "http://other.example.com/b");
}

#[test]
fn duplicates_keep_first_in_insertion_order() {
	let found = extract_default(json!({
		"a": "https://dup.example.com/x",
		"b": "see https://dup.example.com/x and https://other.example.com",
	}));
	assert_eq!(found.len(), 2);
	assert_eq!(found[0].source, "a");
	let urls: Vec<_> = found.iter().map(|u| u.url.as_str()).collect();
	assert_eq!(urls.len(), urls.iter().collect::<std::collections::HashSet<_>>().len());
}

#[test]
fn depth_two_never_reaches_level_three_maps() {
	let opts = ExtractOptions {
		max_depth: 2,
		..Default::default()
	};
	let found = extract(
		&args(json!({
			"top": "https://level1.example.com",
			"nested": {
				"url": "https://level2.example.com",
				"deeper": {"url": "https://level3.example.com"},
			},
		})),
		&opts,
	);
	let domains: Vec<_> = found.iter().map(|u| u.domain.as_str()).collect();
	assert!(domains.contains(&"level1.example.com"));
	assert!(domains.contains(&"level2.example.com"));
	assert!(!domains.contains(&"level3.example.com"), "got {domains:?}");
}

#[test]
fn sequence_sources_use_index_notation() {
	let found = extract_default(json!({
		"servers": ["https://one.example.com", "https://two.example.com"],
	}));
	assert_eq!(found[0].source, "servers[0]");
	assert_eq!(found[1].source, "servers[1]");
}

#[test]
fn nested_sources_use_dotted_paths() {
	let found = extract_default(json!({
		"config": {"nested": {"endpoint": "https://deep.example.com"}},
	}));
	assert_eq!(found[0].source, "config.nested.endpoint");
}

#[test]
fn base64_is_opt_in_and_decodes_once() {
	use base64::Engine;
	let inner = base64::engine::general_purpose::STANDARD.encode("https://hidden.example.com");
	let doubled = base64::engine::general_purpose::STANDARD.encode(&inner);

	let off = extract_default(json!({"payload": inner.clone()}));
	assert!(off.is_empty());

	let opts = ExtractOptions {
		base64_decode: true,
		..Default::default()
	};
	let on = extract(&args(json!({"payload": inner})), &opts);
	assert_eq!(on.len(), 1);
	assert_eq!(on[0].domain.as_str(), "hidden.example.com");
	assert_eq!(on[0].source, "payload.base64");

	// A doubly-encoded value needs two decode passes; only one is allowed.
	let twice = extract(&args(json!({"payload": doubled})), &opts);
	assert!(twice.is_empty(), "got {twice:?}");
}

#[test]
fn numbers_and_bools_are_skipped() {
	let found = extract_default(json!({"port": 8443, "enabled": true, "none": null}));
	assert!(found.is_empty());
}
