//! HTTP read gateway.
//!
//! A JSON read-model over the turn store and projection engine, plus the
//! registry publication endpoint. Served with `tiny_http` on one thread;
//! every handler is a pure function from request to response over the
//! shared store.

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tiny_http::{Header, Method, Response, Server, StatusCode};

use crate::error::{Result, StoreError};
use crate::fs_tree::Located;
use crate::metrics::Metrics;
use crate::projection::{
    BytesRender, EnumRender, Projection, RenderOptions, TimeRender, U64Format, project_msgpack,
};
use crate::registry::{PutOutcome, Registry, RendererSpec, TypeVersionSpec};
use crate::store::{Store, TurnItem};

pub struct HttpHandle {
    pub local_addr: SocketAddr,
    thread: thread::JoinHandle<()>,
}

impl HttpHandle {
    pub fn join(self) {
        let _ = self.thread.join();
    }
}

pub fn start_http(
    bind_addr: &str,
    store: Arc<Store>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
) -> Result<HttpHandle> {
    let server = Server::http(bind_addr)
        .map_err(|e| StoreError::InvalidInput(format!("http bind {bind_addr}: {e}")))?;
    let local_addr = match server.server_addr() {
        tiny_http::ListenAddr::IP(addr) => addr,
        other => {
            return Err(StoreError::InvalidInput(format!(
                "unsupported http listen addr {other:?}"
            )));
        }
    };

    let thread = thread::spawn(move || {
        for request in server.incoming_requests() {
            if let Err(err) = handle_request(request, &store, &registry, &metrics) {
                tracing::warn!("http respond failed: {err}");
            }
        }
    });

    Ok(HttpHandle { local_addr, thread })
}

type HttpResponse = (u16, Response<Cursor<Vec<u8>>>);

fn handle_request(
    mut request: tiny_http::Request,
    store: &Arc<Store>,
    registry: &Arc<Registry>,
    metrics: &Arc<Metrics>,
) -> Result<()> {
    metrics.record_http();

    let url_str = format!("http://localhost{}", request.url());
    let result: Result<HttpResponse> = (|| {
        let url = url::Url::parse(&url_str)
            .map_err(|_| StoreError::InvalidInput("invalid url".into()))?;
        let segments: Vec<String> = url
            .path_segments()
            .map(|s| s.map(str::to_string).collect())
            .unwrap_or_default();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        let params = parse_query(url.query().unwrap_or(""));
        let method = request.method().clone();

        match (method, segments.as_slice()) {
            (Method::Get, ["healthz"]) => Ok(text_response(200, "ok")),
            (Method::Get, ["v1", "metrics"]) => {
                let mut snapshot = metrics.snapshot();
                snapshot["blob_count"] = json!(store.blobs.count());
                snapshot["turn_count"] = json!(store.turns.turn_count());
                snapshot["registry_types"] = json!(registry.type_count());
                json_response(200, &snapshot)
            }
            (Method::Put, ["v1", "registry", "bundles", bundle_id]) => {
                let mut body = Vec::new();
                request.as_reader().read_to_end(&mut body)?;
                match registry.put_bundle(bundle_id, &body)? {
                    PutOutcome::Unchanged => {
                        Ok((204, Response::from_data(Vec::new()).with_status_code(StatusCode(204))))
                    }
                    PutOutcome::Created => {
                        metrics.record_registry_ingest();
                        json_response(201, &json!({ "bundle_id": bundle_id }))
                    }
                }
            }
            (Method::Get, ["v1", "registry", "bundles", bundle_id]) => {
                let bundle = registry
                    .get_bundle(bundle_id)
                    .ok_or_else(|| StoreError::NotFound(format!("bundle {bundle_id}")))?;
                let etag = format!("\"{}\"", blake3::hash(&bundle).to_hex());
                let if_none_match = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("If-None-Match"))
                    .map(|h| h.value.as_str().to_string());
                if if_none_match.as_deref() == Some(etag.as_str()) {
                    return Ok((
                        304,
                        Response::from_data(Vec::new()).with_status_code(StatusCode(304)),
                    ));
                }
                let response = Response::from_data(bundle)
                    .with_status_code(StatusCode(200))
                    .with_header(json_content_type())
                    .with_header(
                        Header::from_bytes(&b"ETag"[..], etag.as_bytes())
                            .expect("static header"),
                    );
                Ok((200, response))
            }
            (Method::Get, ["v1", "registry", "types", type_id, "versions", version]) => {
                let version: u32 = version
                    .parse()
                    .map_err(|_| StoreError::InvalidInput("invalid version".into()))?;
                let spec = registry.get_type_version(type_id, version).ok_or_else(|| {
                    StoreError::NotFound(format!("type {type_id}@{version}"))
                })?;
                json_response(200, &type_version_to_json(&spec))
            }
            (Method::Get, ["v1", "registry", "renderers"]) => {
                let renderers: JsonMap<String, JsonValue> = registry
                    .get_all_renderers()
                    .into_iter()
                    .map(|(type_id, spec)| (type_id, renderer_to_json(&spec)))
                    .collect();
                json_response(200, &json!({ "renderers": renderers }))
            }
            (Method::Get, ["v1", "contexts"]) => {
                let limit = param_u32(&params, "limit").unwrap_or(20) as usize;
                let contexts: Vec<JsonValue> = store
                    .recent_contexts(limit)?
                    .iter()
                    .map(|head| {
                        json!({
                            "context_id": head.context_id.to_string(),
                            "head_turn_id": head.head_turn_id.to_string(),
                            "head_depth": head.head_depth,
                            "created_at_unix_ms": head.created_at_unix_ms,
                        })
                    })
                    .collect();
                json_response(200, &json!({ "count": contexts.len(), "contexts": contexts }))
            }
            (Method::Get, ["v1", "contexts", context_id, "turns"]) => {
                let context_id: u64 = context_id
                    .parse()
                    .map_err(|_| StoreError::InvalidInput("invalid context_id".into()))?;
                let view = turns_view(store, registry, context_id, &params)?;
                json_response(200, &view)
            }
            (Method::Get, ["v1", "turns", turn_id, "fs"]) => {
                let turn_id: u64 = turn_id
                    .parse()
                    .map_err(|_| StoreError::InvalidInput("invalid turn_id".into()))?;
                let path = params.get("path").map(String::as_str).unwrap_or("");
                fs_listing(store, turn_id, path)
            }
            (Method::Get, ["v1", "turns", turn_id, "fs", rest @ ..]) => {
                let turn_id: u64 = turn_id
                    .parse()
                    .map_err(|_| StoreError::InvalidInput("invalid turn_id".into()))?;
                let path = rest.join("/");
                let as_json = params.get("format").map(String::as_str) == Some("json");
                fs_path(store, turn_id, &path, as_json)
            }
            _ => Err(StoreError::NotFound("route".into())),
        }
    })();

    match result {
        Ok((_, response)) => request.respond(response).map_err(StoreError::Io),
        Err(err) => {
            metrics.record_error();
            let status = err.code();
            let body = json!({ "error": { "code": status, "message": err.to_string() } });
            let response = Response::from_data(serde_json::to_vec(&body)?)
                .with_status_code(StatusCode(status))
                .with_header(json_content_type());
            request.respond(response).map_err(StoreError::Io)
        }
    }
}

/// The `/v1/contexts/{id}/turns` read model.
fn turns_view(
    store: &Store,
    registry: &Registry,
    context_id: u64,
    params: &HashMap<String, String>,
) -> Result<JsonValue> {
    let limit = param_u32(params, "limit").unwrap_or(64);
    let before_turn_id = param_u64(params, "before_turn_id").unwrap_or(0);
    let view = params.get("view").map(String::as_str).unwrap_or("typed");
    if !matches!(view, "typed" | "raw" | "both") {
        return Err(StoreError::InvalidInput(format!("unknown view {view:?}")));
    }
    let hint_mode = params
        .get("type_hint_mode")
        .map(String::as_str)
        .unwrap_or("inherit");
    let options = render_options(params);

    let head = store.get_head(context_id)?;
    let items = if before_turn_id == 0 {
        store.get_last(context_id, limit, true)?
    } else {
        store.get_before(context_id, before_turn_id, limit, true)?
    };

    let mut turns = Vec::with_capacity(items.len());
    for item in &items {
        turns.push(turn_to_json(item, registry, view, hint_mode, params, &options)?);
    }

    let next_before = items.first().map(|item| item.record.turn_id.to_string());
    Ok(json!({
        "meta": {
            "context_id": context_id.to_string(),
            "head_turn_id": head.head_turn_id.to_string(),
            "head_depth": head.head_depth,
            "registry_bundle_id": registry.last_bundle_id(),
        },
        "turns": turns,
        "next_before_turn_id": next_before,
    }))
}

fn turn_to_json(
    item: &TurnItem,
    registry: &Registry,
    view: &str,
    hint_mode: &str,
    params: &HashMap<String, String>,
    options: &RenderOptions,
) -> Result<JsonValue> {
    let declared_type_id = item.meta.declared_type_id.clone();
    let declared_type_version = item.meta.declared_type_version;

    let mut obj = JsonMap::new();
    obj.insert("turn_id".into(), json!(item.record.turn_id.to_string()));
    obj.insert(
        "parent_turn_id".into(),
        json!(item.record.parent_turn_id.to_string()),
    );
    obj.insert("depth".into(), json!(item.record.depth));
    obj.insert(
        "declared_type".into(),
        json!({ "type_id": declared_type_id, "type_version": declared_type_version }),
    );
    if let Some(fs_root) = item.fs_root {
        obj.insert("fs_root_hash".into(), json!(hex::encode(fs_root)));
    }

    if view == "typed" || view == "both" {
        let (decoded_type_id, decoded_type_version) = match hint_mode {
            "inherit" => (declared_type_id.clone(), declared_type_version),
            "latest" => {
                let latest = registry.latest_version(&declared_type_id).ok_or_else(|| {
                    StoreError::MissingDependency(format!(
                        "no descriptor for type {declared_type_id}"
                    ))
                })?;
                (declared_type_id.clone(), latest)
            }
            "explicit" => {
                let as_type_id = params.get("as_type_id").cloned().ok_or_else(|| {
                    StoreError::InvalidInput("as_type_id required for explicit hint mode".into())
                })?;
                let as_type_version = param_u32(params, "as_type_version").ok_or_else(|| {
                    StoreError::InvalidInput(
                        "as_type_version required for explicit hint mode".into(),
                    )
                })?;
                if as_type_id != declared_type_id {
                    return Err(StoreError::InvalidInput(format!(
                        "explicit type {as_type_id} does not match declared {declared_type_id}"
                    )));
                }
                (as_type_id, as_type_version)
            }
            other => {
                return Err(StoreError::InvalidInput(format!(
                    "unknown type_hint_mode {other:?}"
                )));
            }
        };

        if declared_type_id.is_empty() {
            return Err(StoreError::InvalidInput(
                "turn has no declared type; use view=raw".into(),
            ));
        }
        let desc: TypeVersionSpec = registry
            .get_type_version(&decoded_type_id, decoded_type_version)
            .ok_or_else(|| {
                StoreError::MissingDependency(format!(
                    "no descriptor for {decoded_type_id}@{decoded_type_version}"
                ))
            })?;
        let payload = item
            .payload
            .as_deref()
            .ok_or_else(|| StoreError::InvalidInput("payload not loaded".into()))?;
        let Projection { data, unknown } = project_msgpack(payload, &desc, registry, options)?;
        obj.insert(
            "decoded_as".into(),
            json!({ "type_id": decoded_type_id, "type_version": decoded_type_version }),
        );
        obj.insert("data".into(), data);
        if let Some(unknown) = unknown {
            obj.insert("unknown".into(), unknown);
        }
    }

    if view == "raw" || view == "both" {
        let payload = item
            .payload
            .as_deref()
            .ok_or_else(|| StoreError::InvalidInput("payload not loaded".into()))?;
        obj.insert(
            "content_hash_b3".into(),
            json!(hex::encode(item.record.payload_hash)),
        );
        obj.insert("encoding".into(), json!(item.meta.encoding));
        obj.insert("compression".into(), json!(0));
        obj.insert("uncompressed_len".into(), json!(payload.len()));
        match options.bytes_render {
            BytesRender::Base64 => {
                use base64::Engine;
                obj.insert(
                    "bytes_b64".into(),
                    json!(base64::engine::general_purpose::STANDARD.encode(payload)),
                );
            }
            BytesRender::Hex => {
                obj.insert("bytes_hex".into(), json!(hex::encode(payload)));
            }
            BytesRender::LenOnly => {
                obj.insert("bytes_len".into(), json!(payload.len()));
            }
        }
    }

    Ok(JsonValue::Object(obj))
}

fn fs_listing(store: &Store, turn_id: u64, path: &str) -> Result<HttpResponse> {
    let root = store
        .effective_fs_root(turn_id)?
        .ok_or_else(|| StoreError::NotFound(format!("no fs snapshot for turn {turn_id}")))?;
    let entries = store.list_fs_entries(turn_id, path)?;
    json_response(
        200,
        &json!({
            "turn_id": turn_id.to_string(),
            "path": path,
            "fs_root_hash": hex::encode(root),
            "entries": entries_to_json(&entries),
        }),
    )
}

fn fs_path(store: &Store, turn_id: u64, path: &str, as_json: bool) -> Result<HttpResponse> {
    if path.is_empty() {
        return Err(StoreError::InvalidInput("empty fs path".into()));
    }
    match store.locate_fs(turn_id, path)? {
        Located::Directory(entries) => {
            let root = store
                .effective_fs_root(turn_id)?
                .ok_or_else(|| StoreError::NotFound(format!("no fs snapshot for turn {turn_id}")))?;
            json_response(
                200,
                &json!({
                    "turn_id": turn_id.to_string(),
                    "path": path,
                    "fs_root_hash": hex::encode(root),
                    "entries": entries_to_json(&entries),
                }),
            )
        }
        Located::File { entry, content } => {
            if as_json {
                use base64::Engine;
                json_response(
                    200,
                    &json!({
                        "turn_id": turn_id.to_string(),
                        "path": path,
                        "name": entry.name,
                        "kind": entry.kind.as_str(),
                        "mode": format!("{:o}", entry.mode),
                        "size": entry.size,
                        "hash": hex::encode(entry.hash),
                        "content_base64":
                            base64::engine::general_purpose::STANDARD.encode(&content),
                    }),
                )
            } else {
                let response = Response::from_data(content)
                    .with_status_code(StatusCode(200))
                    .with_header(
                        Header::from_bytes(
                            &b"Content-Type"[..],
                            guess_content_type(path).as_bytes(),
                        )
                        .expect("static header"),
                    )
                    .with_header(
                        Header::from_bytes(&b"X-Fs-Hash"[..], hex::encode(entry.hash).as_bytes())
                            .expect("static header"),
                    )
                    .with_header(
                        Header::from_bytes(
                            &b"X-Fs-Mode"[..],
                            format!("{:o}", entry.mode).as_bytes(),
                        )
                        .expect("static header"),
                    );
                Ok((200, response))
            }
        }
    }
}

fn entries_to_json(entries: &[crate::fs_tree::TreeEntry]) -> Vec<JsonValue> {
    entries
        .iter()
        .map(|e| {
            json!({
                "name": e.name,
                "kind": e.kind.as_str(),
                "mode": format!("{:o}", e.mode),
                "size": e.size,
                "hash": hex::encode(e.hash),
            })
        })
        .collect()
}

fn render_options(params: &HashMap<String, String>) -> RenderOptions {
    RenderOptions {
        bytes_render: match params.get("bytes_render").map(String::as_str) {
            Some("hex") => BytesRender::Hex,
            Some("len_only") => BytesRender::LenOnly,
            _ => BytesRender::Base64,
        },
        u64_format: match params.get("u64_format").map(String::as_str) {
            Some("number") => U64Format::Number,
            _ => U64Format::String,
        },
        enum_render: match params.get("enum_render").map(String::as_str) {
            Some("number") => EnumRender::Number,
            Some("both") => EnumRender::Both,
            _ => EnumRender::Label,
        },
        time_render: match params.get("time_render").map(String::as_str) {
            Some("unix_ms") => TimeRender::UnixMs,
            _ => TimeRender::Iso,
        },
        include_unknown: params.get("include_unknown").map(String::as_str) == Some("1"),
    }
}

fn renderer_to_json(spec: &RendererSpec) -> JsonValue {
    let mut obj = JsonMap::new();
    obj.insert("esm_url".into(), json!(spec.esm_url));
    if let Some(component) = &spec.component {
        obj.insert("component".into(), json!(component));
    }
    if let Some(integrity) = &spec.integrity {
        obj.insert("integrity".into(), json!(integrity));
    }
    JsonValue::Object(obj)
}

fn type_version_to_json(spec: &TypeVersionSpec) -> JsonValue {
    let mut fields = JsonMap::new();
    for (tag, field) in &spec.fields {
        let mut obj = JsonMap::new();
        obj.insert("name".into(), json!(field.name));
        obj.insert("type".into(), json!(field.field_type));
        if let Some(enum_ref) = &field.enum_ref {
            obj.insert("enum".into(), json!(enum_ref));
        }
        if let Some(type_ref) = &field.type_ref {
            obj.insert("ref".into(), json!(type_ref));
        }
        if let Some(items) = &field.items {
            match items {
                crate::registry::ItemsSpec::Simple(s) => {
                    obj.insert("items".into(), json!(s));
                }
                crate::registry::ItemsSpec::Ref { type_ref, .. } => {
                    obj.insert("items".into(), json!({ "type": "ref", "ref": type_ref }));
                }
            }
        }
        if field.optional {
            obj.insert("optional".into(), json!(true));
        }
        fields.insert(tag.to_string(), JsonValue::Object(obj));
    }
    let mut result = JsonMap::new();
    result.insert("fields".into(), JsonValue::Object(fields));
    if let Some(renderer) = &spec.renderer {
        result.insert("renderer".into(), renderer_to_json(renderer));
    }
    JsonValue::Object(result)
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn param_u32(params: &HashMap<String, String>, key: &str) -> Option<u32> {
    params.get(key).and_then(|v| v.parse().ok())
}

fn param_u64(params: &HashMap<String, String>, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.parse().ok())
}

fn json_content_type() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).expect("static header")
}

fn json_response(status: u16, body: &JsonValue) -> Result<HttpResponse> {
    let bytes = serde_json::to_vec(body)?;
    let response = Response::from_data(bytes)
        .with_status_code(StatusCode(status))
        .with_header(json_content_type());
    Ok((status, response))
}

fn text_response(status: u16, body: &str) -> HttpResponse {
    let response = Response::from_data(body.as_bytes().to_vec())
        .with_status_code(StatusCode(status))
        .with_header(
            Header::from_bytes(&b"Content-Type"[..], &b"text/plain"[..]).expect("static header"),
        );
    (status, response)
}

fn guess_content_type(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "rs" => "text/x-rust",
        "go" => "text/x-go",
        "py" => "text/x-python",
        "ts" => "text/typescript",
        "yaml" | "yml" => "text/yaml",
        "toml" => "text/toml",
        "sh" | "bash" => "text/x-shellscript",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
