//! Registry publication and typed projection through the HTTP gateway.

mod common;

use common::{Client, TestServer, http_request};
use serde_json::Value as JsonValue;

const BUNDLE: &str = r#"{
    "registry_version": 1,
    "bundle_id": "test-v1",
    "types": {
        "cxdb.ConversationItem": {
            "versions": {
                "1": {
                    "fields": {
                        "1": { "name": "role", "type": "string" },
                        "2": { "name": "text", "type": "string" }
                    }
                }
            }
        }
    },
    "enums": {}
}"#;

fn msgpack_item(role: &str, text: &str) -> Vec<u8> {
    let value = rmpv_map(vec![
        (1, rmpv::Value::from(role)),
        (2, rmpv::Value::from(text)),
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).unwrap();
    buf
}

fn rmpv_map(entries: Vec<(u64, rmpv::Value)>) -> rmpv::Value {
    rmpv::Value::Map(
        entries
            .into_iter()
            .map(|(tag, value)| (rmpv::Value::from(tag), value))
            .collect(),
    )
}

fn body_json(body: &[u8]) -> JsonValue {
    serde_json::from_slice(body).expect("json body")
}

#[test]
fn typed_view_swaps_tags_for_names() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();

    let (status, _) = http_request(
        http,
        "PUT",
        "/v1/registry/bundles/test-v1",
        Some(BUNDLE.as_bytes()),
    );
    assert_eq!(status, 201);

    let mut client = Client::connect(server.addr);
    let (ctx, _, _) = client.ctx_create(0);
    client.append_turn(ctx, "cxdb.ConversationItem", &msgpack_item("user", "hello"), b"");

    let (status, body) = http_request(
        http,
        "GET",
        &format!("/v1/contexts/{ctx}/turns?view=typed"),
        None,
    );
    assert_eq!(status, 200);
    let view = body_json(&body);

    let turns = view["turns"].as_array().unwrap();
    assert_eq!(turns.len(), 1);
    let data = turns[0]["data"].as_object().unwrap();
    assert_eq!(data["role"], "user");
    assert_eq!(data["text"], "hello");
    assert!(!data.keys().any(|k| k.chars().all(|c| c.is_ascii_digit())));
    assert_eq!(turns[0]["decoded_as"]["type_id"], "cxdb.ConversationItem");
    assert_eq!(view["meta"]["registry_bundle_id"], "test-v1");
}

#[test]
fn bundle_put_is_idempotent_and_conflicts_are_409() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();

    let (status, _) = http_request(
        http,
        "PUT",
        "/v1/registry/bundles/test-v1",
        Some(BUNDLE.as_bytes()),
    );
    assert_eq!(status, 201);

    let (status, _) = http_request(
        http,
        "PUT",
        "/v1/registry/bundles/test-v1",
        Some(BUNDLE.as_bytes()),
    );
    assert_eq!(status, 204);

    // Same tag, incompatible type: registry evolution conflict.
    let conflicting = r#"{"bundle_id":"test-v2","types":{"cxdb.ConversationItem":{"versions":{"2":{"fields":{"1":{"name":"role","type":"u32"}}}}}},"enums":{}}"#;
    let (status, body) = http_request(
        http,
        "PUT",
        "/v1/registry/bundles/test-v2",
        Some(conflicting.as_bytes()),
    );
    assert_eq!(status, 409);
    let err = body_json(&body);
    assert_eq!(err["error"]["code"], 409);
}

#[test]
fn bundle_get_supports_etag() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();
    http_request(
        http,
        "PUT",
        "/v1/registry/bundles/test-v1",
        Some(BUNDLE.as_bytes()),
    );

    let (status, body) = http_request(http, "GET", "/v1/registry/bundles/test-v1", None);
    assert_eq!(status, 200);
    assert_eq!(body, BUNDLE.as_bytes());

    let (status, _) = http_request(http, "GET", "/v1/registry/bundles/missing", None);
    assert_eq!(status, 404);
}

#[test]
fn type_version_endpoint_serves_descriptor() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();
    http_request(
        http,
        "PUT",
        "/v1/registry/bundles/test-v1",
        Some(BUNDLE.as_bytes()),
    );

    let (status, body) = http_request(
        http,
        "GET",
        "/v1/registry/types/cxdb.ConversationItem/versions/1",
        None,
    );
    assert_eq!(status, 200);
    let desc = body_json(&body);
    assert_eq!(desc["fields"]["1"]["name"], "role");
    assert_eq!(desc["fields"]["2"]["type"], "string");
}

#[test]
fn typed_view_without_descriptor_is_failed_dependency() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();

    let mut client = Client::connect(server.addr);
    let (ctx, _, _) = client.ctx_create(0);
    client.append_turn(ctx, "t.Unregistered", &msgpack_item("user", "hi"), b"");

    let (status, body) = http_request(
        http,
        "GET",
        &format!("/v1/contexts/{ctx}/turns?view=typed"),
        None,
    );
    assert_eq!(status, 424);
    assert_eq!(body_json(&body)["error"]["code"], 424);

    // view=raw still works for the same turn.
    let (status, body) = http_request(
        http,
        "GET",
        &format!("/v1/contexts/{ctx}/turns?view=raw"),
        None,
    );
    assert_eq!(status, 200);
    let view = body_json(&body);
    assert!(view["turns"][0]["bytes_b64"].is_string());
}

#[test]
fn raw_view_respects_bytes_render() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();

    let mut client = Client::connect(server.addr);
    let (ctx, _, _) = client.ctx_create(0);
    let payload = msgpack_item("user", "hi");
    client.append_turn(ctx, "t.Any", &payload, b"");

    let (status, body) = http_request(
        http,
        "GET",
        &format!("/v1/contexts/{ctx}/turns?view=raw&bytes_render=hex"),
        None,
    );
    assert_eq!(status, 200);
    let view = body_json(&body);
    assert_eq!(
        view["turns"][0]["bytes_hex"].as_str().unwrap(),
        hex::encode(&payload)
    );
}

#[test]
fn paging_via_before_turn_id() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();
    http_request(
        http,
        "PUT",
        "/v1/registry/bundles/test-v1",
        Some(BUNDLE.as_bytes()),
    );

    let mut client = Client::connect(server.addr);
    let (ctx, _, _) = client.ctx_create(0);
    for i in 0..5 {
        client.append_turn(
            ctx,
            "cxdb.ConversationItem",
            &msgpack_item("user", &format!("m{i}")),
            b"",
        );
    }

    let (_, body) = http_request(
        http,
        "GET",
        &format!("/v1/contexts/{ctx}/turns?limit=2"),
        None,
    );
    let page1 = body_json(&body);
    assert_eq!(page1["turns"].as_array().unwrap().len(), 2);
    let cursor = page1["next_before_turn_id"].as_str().unwrap().to_string();

    let (_, body) = http_request(
        http,
        "GET",
        &format!("/v1/contexts/{ctx}/turns?limit=2&before_turn_id={cursor}"),
        None,
    );
    let page2 = body_json(&body);
    let page2_turns = page2["turns"].as_array().unwrap();
    assert_eq!(page2_turns.len(), 2);
    assert!(page2_turns[1]["data"]["text"].as_str().unwrap() < page1["turns"][0]["data"]["text"].as_str().unwrap());
}

#[test]
fn contexts_listing_shows_recent_heads() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();

    let mut client = Client::connect(server.addr);
    let (ctx1, _, _) = client.ctx_create(0);
    let (_, turn, _, _) = client.append_turn(ctx1, "t.Any", b"x", b"");
    let (ctx2, _, _) = client.ctx_fork(turn);

    let (status, body) = http_request(http, "GET", "/v1/contexts", None);
    assert_eq!(status, 200);
    let listing = body_json(&body);
    let ids: Vec<&str> = listing["contexts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["context_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&ctx1.to_string().as_str()));
    assert!(ids.contains(&ctx2.to_string().as_str()));
}

#[test]
fn fs_view_serves_attached_snapshot() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();

    let mut client = Client::connect(server.addr);
    let (ctx, _, _) = client.ctx_create(0);
    let (_, turn_id, _, _) = client.append_turn(ctx, "t.Any", b"turn", b"");

    // Upload file content and a single-directory tree, then attach.
    let content = b"hello from the snapshot";
    let (file_hash, _) = client.put_blob(content);
    let tree = rmpv::Value::Array(vec![rmpv::Value::Map(vec![
        (rmpv::Value::from(1), rmpv::Value::from("test.txt")),
        (rmpv::Value::from(2), rmpv::Value::from(0u8)),
        (rmpv::Value::from(3), rmpv::Value::from(0o644u32)),
        (rmpv::Value::from(4), rmpv::Value::from(content.len() as u64)),
        (rmpv::Value::from(5), rmpv::Value::Binary(file_hash.to_vec())),
    ])]);
    let mut tree_bytes = Vec::new();
    rmpv::encode::write_value(&mut tree_bytes, &tree).unwrap();
    let (tree_hash, _) = client.put_blob(&tree_bytes);
    client.attach_fs(turn_id, &tree_hash);

    let (status, body) = http_request(http, "GET", &format!("/v1/turns/{turn_id}/fs"), None);
    assert_eq!(status, 200);
    let listing = body_json(&body);
    assert_eq!(listing["entries"][0]["name"], "test.txt");
    assert_eq!(listing["fs_root_hash"], hex::encode(tree_hash));

    let (status, body) = http_request(
        http,
        "GET",
        &format!("/v1/turns/{turn_id}/fs/test.txt"),
        None,
    );
    assert_eq!(status, 200);
    assert_eq!(body, content);

    // Later turns inherit the snapshot from the ancestor.
    let (_, later_turn, _, _) = client.append_turn(ctx, "t.Any", b"later", b"");
    let (status, body) = http_request(
        http,
        "GET",
        &format!("/v1/turns/{later_turn}/fs/test.txt"),
        None,
    );
    assert_eq!(status, 200);
    assert_eq!(body, content);

    // A missing path 404s without voiding the turn.
    let (status, _) = http_request(
        http,
        "GET",
        &format!("/v1/turns/{turn_id}/fs/absent.txt"),
        None,
    );
    assert_eq!(status, 404);
}

#[test]
fn healthz_and_metrics_respond() {
    let server = TestServer::start_with(false, true);
    let http = server.http_addr();

    let (status, body) = http_request(http, "GET", "/healthz", None);
    assert_eq!(status, 200);
    assert_eq!(body, b"ok");

    let mut client = Client::connect(server.addr);
    let (ctx, _, _) = client.ctx_create(0);
    client.append_turn(ctx, "t.Any", b"x", b"");

    let (status, body) = http_request(http, "GET", "/v1/metrics", None);
    assert_eq!(status, 200);
    let snapshot = body_json(&body);
    assert_eq!(snapshot["appends"], 1);
    assert_eq!(snapshot["turn_count"], 1);
}
