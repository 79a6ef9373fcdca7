//! Projection: opaque msgpack payloads to typed JSON.
//!
//! A payload is a map keyed by numeric field tags (digit-string keys are
//! normalized). The descriptor chosen by the caller's hint mode supplies
//! field names and shapes; rendering options control how 64-bit integers,
//! bytes, enums, and timestamps come out. Projection is deterministic:
//! same bytes + descriptor + options yield byte-identical JSON.

use rmpv::Value;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{Result, StoreError};
use crate::fs_tree::numeric_tag;
use crate::registry::{FieldSpec, ItemsSpec, Registry, TypeVersionSpec};

/// Largest integer JSON readers hold exactly (2^53 - 1).
const SAFE_INTEGER_MAX: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BytesRender {
    #[default]
    Base64,
    Hex,
    LenOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum U64Format {
    #[default]
    String,
    Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnumRender {
    #[default]
    Label,
    Number,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeRender {
    #[default]
    Iso,
    UnixMs,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    pub bytes_render: BytesRender,
    pub u64_format: U64Format,
    pub enum_render: EnumRender,
    pub time_render: TimeRender,
    pub include_unknown: bool,
}

#[derive(Debug, Clone)]
pub struct Projection {
    pub data: JsonValue,
    /// Tags absent from the descriptor, keyed by decimal tag. Present only
    /// when the caller asked for unknowns and any exist.
    pub unknown: Option<JsonValue>,
}

pub fn project_msgpack(
    bytes: &[u8],
    desc: &TypeVersionSpec,
    registry: &Registry,
    options: &RenderOptions,
) -> Result<Projection> {
    let value = rmpv::decode::read_value(&mut &bytes[..])
        .map_err(|e| StoreError::Decode(format!("payload msgpack: {e}")))?;
    let Value::Map(pairs) = value else {
        return Err(StoreError::Decode("payload is not a map".into()));
    };

    let (data, unknown) = project_map(&pairs, desc, registry, options)?;
    Ok(Projection {
        data: JsonValue::Object(data),
        unknown: (options.include_unknown && !unknown.is_empty())
            .then_some(JsonValue::Object(unknown)),
    })
}

fn project_map(
    pairs: &[(Value, Value)],
    desc: &TypeVersionSpec,
    registry: &Registry,
    options: &RenderOptions,
) -> Result<(JsonMap<String, JsonValue>, JsonMap<String, JsonValue>)> {
    let mut data = JsonMap::new();
    let mut unknown = JsonMap::new();

    for (key, value) in pairs {
        let tag = numeric_tag(key)
            .ok_or_else(|| StoreError::Decode(format!("payload key {key} is not a numeric tag")))?;
        match u32::try_from(tag).ok().and_then(|t| desc.fields.get(&t)) {
            Some(field) => {
                data.insert(field.name.clone(), render_field(value, field, registry, options)?);
            }
            None => {
                unknown.insert(tag.to_string(), render_untyped(value, options));
            }
        }
    }
    Ok((data, unknown))
}

fn render_field(
    value: &Value,
    field: &FieldSpec,
    registry: &Registry,
    options: &RenderOptions,
) -> Result<JsonValue> {
    if let Some(enum_id) = &field.enum_ref
        && let Some(ordinal) = value.as_u64()
    {
        return Ok(render_enum(enum_id, ordinal, registry, options));
    }

    match field.field_type.as_str() {
        "ref" => {
            if let (Some(ref_id), Value::Map(pairs)) = (&field.type_ref, value) {
                return render_nested(pairs, ref_id, registry, options);
            }
            Ok(render_untyped(value, options))
        }
        "array" => {
            let Value::Array(items) = value else {
                return Ok(render_untyped(value, options));
            };
            let rendered: Result<Vec<JsonValue>> = items
                .iter()
                .map(|item| match (&field.items, item) {
                    (Some(ItemsSpec::Ref { type_ref, .. }), Value::Map(pairs)) => {
                        render_nested(pairs, type_ref, registry, options)
                    }
                    (Some(ItemsSpec::Simple(item_type)), item) => {
                        Ok(render_scalar(item, item_type, options))
                    }
                    (_, item) => Ok(render_untyped(item, options)),
                })
                .collect();
            Ok(JsonValue::Array(rendered?))
        }
        scalar => Ok(render_scalar(value, scalar, options)),
    }
}

/// Nested references project with the referenced type's latest known
/// version. A missing descriptor falls back to the untyped rendering
/// rather than failing the whole turn.
fn render_nested(
    pairs: &[(Value, Value)],
    type_id: &str,
    registry: &Registry,
    options: &RenderOptions,
) -> Result<JsonValue> {
    let Some(desc) = registry.get_latest(type_id) else {
        return Ok(render_untyped(&Value::Map(pairs.to_vec()), options));
    };
    let (mut data, unknown) = project_map(pairs, &desc, registry, options)?;
    if options.include_unknown {
        for (tag, value) in unknown {
            data.insert(tag, value);
        }
    }
    Ok(JsonValue::Object(data))
}

fn render_scalar(value: &Value, declared: &str, options: &RenderOptions) -> JsonValue {
    match declared {
        "u64" | "uint64" | "int64" | "i64" => match value.as_u64() {
            Some(n) => render_u64(n, options.u64_format),
            None => match value.as_i64() {
                Some(n) => render_i64(n, options.u64_format),
                None => render_untyped(value, options),
            },
        },
        "unix_ms" => match value.as_u64() {
            Some(ms) => render_time(ms, options.time_render),
            None => render_untyped(value, options),
        },
        "bytes" => match value {
            Value::Binary(bytes) => render_bytes(bytes, options.bytes_render),
            _ => render_untyped(value, options),
        },
        "bool" => match value.as_bool() {
            Some(b) => JsonValue::Bool(b),
            None => render_untyped(value, options),
        },
        "string" => match value.as_str() {
            Some(s) => JsonValue::String(s.to_string()),
            None => render_untyped(value, options),
        },
        "f32" | "f64" | "float" | "double" => match value.as_f64() {
            Some(f) => Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null),
            None => render_untyped(value, options),
        },
        // u8/u16/u32/int32 and anything else integer-shaped.
        _ => match value.as_i64() {
            Some(n) => JsonValue::Number(n.into()),
            None => render_untyped(value, options),
        },
    }
}

fn render_enum(
    enum_id: &str,
    ordinal: u64,
    registry: &Registry,
    options: &RenderOptions,
) -> JsonValue {
    let label = registry.enum_label(enum_id, ordinal);
    match options.enum_render {
        EnumRender::Label => label
            .map(JsonValue::String)
            .unwrap_or_else(|| JsonValue::Number(ordinal.into())),
        EnumRender::Number => JsonValue::Number(ordinal.into()),
        EnumRender::Both => {
            let mut obj = JsonMap::new();
            obj.insert("num".into(), JsonValue::Number(ordinal.into()));
            if let Some(label) = label {
                obj.insert("label".into(), JsonValue::String(label));
            }
            JsonValue::Object(obj)
        }
    }
}

fn render_u64(n: u64, format: U64Format) -> JsonValue {
    match format {
        U64Format::String => JsonValue::String(n.to_string()),
        U64Format::Number => JsonValue::Number(n.into()),
    }
}

fn render_i64(n: i64, format: U64Format) -> JsonValue {
    match format {
        U64Format::String => JsonValue::String(n.to_string()),
        U64Format::Number => JsonValue::Number(n.into()),
    }
}

fn render_time(unix_ms: u64, format: TimeRender) -> JsonValue {
    match format {
        TimeRender::UnixMs => JsonValue::Number(unix_ms.into()),
        TimeRender::Iso => {
            let nanos = i128::from(unix_ms) * 1_000_000;
            OffsetDateTime::from_unix_timestamp_nanos(nanos)
                .ok()
                .and_then(|dt| dt.format(&Rfc3339).ok())
                .map(JsonValue::String)
                .unwrap_or_else(|| JsonValue::Number(unix_ms.into()))
        }
    }
}

fn render_bytes(bytes: &[u8], format: BytesRender) -> JsonValue {
    use base64::Engine;
    match format {
        BytesRender::Base64 => {
            JsonValue::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        BytesRender::Hex => JsonValue::String(hex::encode(bytes)),
        BytesRender::LenOnly => {
            let mut obj = JsonMap::new();
            obj.insert("len".into(), JsonValue::Number((bytes.len() as u64).into()));
            JsonValue::Object(obj)
        }
    }
}

/// Rendering for values with no descriptor: unknown tags, nested maps
/// without a resolvable type, and mismatched shapes.
fn render_untyped(value: &Value, options: &RenderOptions) -> JsonValue {
    match value {
        Value::Nil => JsonValue::Null,
        Value::Boolean(b) => JsonValue::Bool(*b),
        Value::Integer(i) => {
            if let Some(n) = i.as_u64() {
                if n > SAFE_INTEGER_MAX && options.u64_format == U64Format::String {
                    JsonValue::String(n.to_string())
                } else {
                    JsonValue::Number(n.into())
                }
            } else if let Some(n) = i.as_i64() {
                JsonValue::Number(n.into())
            } else {
                JsonValue::Null
            }
        }
        Value::F32(f) => Number::from_f64(f64::from(*f))
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::F64(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::String(s) => JsonValue::String(s.as_str().unwrap_or_default().to_string()),
        Value::Binary(bytes) => render_bytes(bytes, options.bytes_render),
        Value::Array(items) => {
            JsonValue::Array(items.iter().map(|v| render_untyped(v, options)).collect())
        }
        Value::Map(pairs) => {
            let mut obj = JsonMap::new();
            for (key, val) in pairs {
                let key_str = match numeric_tag(key) {
                    Some(tag) => tag.to_string(),
                    None => key.as_str().map(str::to_string).unwrap_or_else(|| key.to_string()),
                };
                obj.insert(key_str, render_untyped(val, options));
            }
            JsonValue::Object(obj)
        }
        Value::Ext(_, bytes) => render_bytes(bytes, options.bytes_render),
    }
}
