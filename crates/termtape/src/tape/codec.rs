//! C2: encode/decode the tape model to the canonical JSON5 on-disk dialect.
//!
//! Decoding accepts JSON5 (comments, trailing commas, unquoted keys) since
//! hand-edited tapes are expected to carry comments; encoding always emits
//! canonical comment-free JSON5 (a strict JSON subset), since no invariant
//! requires round-tripping a human's comments back out.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::CoreError;
use crate::error::Result;

use super::model::Chunk;
use super::model::Exchange;
use super::model::ExchangePre;
use super::model::ExitInfo;
use super::model::Input;
use super::model::PtyGeometry;
use super::model::RangedValue;
use super::model::Tape;
use super::model::TapeMeta;
use super::model::TapeSession;

#[derive(Debug, Serialize, Deserialize)]
struct WireTape {
    meta: WireMeta,
    session: WireSession,
    exchanges: Vec<WireExchange>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMeta {
    #[serde(rename = "createdAt")]
    created_at: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pty: Option<WirePty>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    tag: Option<String>,
    #[serde(default = "default_ranged_json")]
    latency: Value,
    #[serde(rename = "errorRate", default = "default_ranged_json")]
    error_rate: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    seed: Option<u64>,
}

fn default_ranged_json() -> Value {
    Value::from(0)
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePty {
    rows: u16,
    cols: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSession {
    platform: String,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireExchange {
    #[serde(default)]
    pre: WirePre,
    input: WireInput,
    output: WireOutput,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    exit: Option<WireExit>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    dur_ms: Option<u64>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WirePre {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    prompt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireInput {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "dataText", skip_serializing_if = "Option::is_none", default)]
    data_text: Option<String>,
    #[serde(
        rename = "dataBytesB64",
        skip_serializing_if = "Option::is_none",
        default
    )]
    data_bytes_b64: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireOutput {
    chunks: Vec<WireChunk>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireChunk {
    delay_ms: u64,
    #[serde(rename = "dataB64")]
    data_b64: String,
    #[serde(rename = "isUtf8")]
    is_utf8: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireExit {
    code: Option<i32>,
    signal: Option<i32>,
}

fn ranged_to_json(value: &RangedValue) -> Value {
    match value {
        RangedValue::Fixed(v) => serde_json::json!(v),
        RangedValue::Range(lo, hi) => serde_json::json!([lo, hi]),
    }
}

fn ranged_from_json(value: &Value) -> RangedValue {
    match value {
        Value::Array(items) if items.len() == 2 => {
            let lo = items[0].as_f64().unwrap_or(0.0);
            let hi = items[1].as_f64().unwrap_or(0.0);
            RangedValue::Range(lo, hi)
        }
        Value::Number(n) => RangedValue::Fixed(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => RangedValue::Fixed(if *b { 1.0 } else { 0.0 }),
        _ => RangedValue::Fixed(0.0),
    }
}

/// Encode a tape into its canonical on-disk JSON5 text.
pub fn encode(tape: &Tape) -> Result<String> {
    let wire = WireTape {
        meta: WireMeta {
            created_at: tape.meta.created_at.to_rfc3339(),
            program: tape.meta.program.clone(),
            args: tape.meta.args.clone(),
            env: tape.meta.env.iter().cloned().collect(),
            cwd: tape.meta.cwd.clone(),
            pty: tape.meta.pty.map(|p| WirePty {
                rows: p.rows,
                cols: p.cols,
            }),
            tag: tape.meta.tag.clone(),
            latency: ranged_to_json(&tape.meta.latency),
            error_rate: ranged_to_json(&tape.meta.error_rate),
            seed: tape.meta.seed,
        },
        session: WireSession {
            platform: tape.session.platform.clone(),
            version: tape.session.version.clone(),
        },
        exchanges: tape.exchanges.iter().map(encode_exchange).collect(),
    };
    serde_json::to_string_pretty(&wire)
        .map_err(|e| CoreError::schema("<in-memory>", format!("encode failed: {e}")))
}

fn encode_exchange(exchange: &Exchange) -> WireExchange {
    let (data_text, data_bytes_b64) = match &exchange.input {
        Input::Line(text) => (Some(text.clone()), None),
        Input::Raw(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => (Some(text.to_string()), None),
            Err(_) => {
                use base64::Engine as _;
                (None, Some(base64::engine::general_purpose::STANDARD.encode(bytes)))
            }
        },
    };
    WireExchange {
        pre: WirePre {
            prompt: exchange.pre.prompt.clone(),
        },
        input: WireInput {
            kind: exchange.input.kind().to_string(),
            data_text,
            data_bytes_b64,
        },
        output: WireOutput {
            chunks: exchange
                .output
                .iter()
                .map(|c| WireChunk {
                    delay_ms: c.delay_ms,
                    data_b64: c.data_b64.clone(),
                    is_utf8: c.is_utf8,
                })
                .collect(),
        },
        exit: exchange.exit.map(|e| WireExit {
            code: e.code,
            signal: e.signal,
        }),
        dur_ms: exchange.dur_ms,
        annotations: exchange.annotations.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    }
}

/// Required top-level and meta keys for the lenient validation flavor.
const REQUIRED_TOP_LEVEL: &[&str] = &["meta", "session", "exchanges"];
const REQUIRED_META_FIELDS: &[&str] = &["program", "args", "env", "cwd"];

/// Lenient validation: required top-level keys and required meta fields are
/// present; `latency`/`errorRate` may be loosely typed.
pub fn validate_lenient(value: &Value) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| CoreError::schema("<value>", "top level is not an object"))?;
    for key in REQUIRED_TOP_LEVEL {
        if !obj.contains_key(*key) {
            return Err(CoreError::schema("<value>", format!("missing top-level key '{key}'")));
        }
    }
    let meta = obj
        .get("meta")
        .and_then(Value::as_object)
        .ok_or_else(|| CoreError::schema("<value>", "meta is not an object"))?;
    for key in REQUIRED_META_FIELDS {
        if !meta.contains_key(*key) {
            return Err(CoreError::schema("<value>", format!("missing meta field '{key}'")));
        }
    }
    Ok(())
}

/// Strict validation: lenient checks plus full per-exchange shape
/// (`pre`, `input{type,...}`, `output{chunks[...]}`).
pub fn validate_strict(value: &Value) -> Result<()> {
    validate_lenient(value)?;
    serde_json::from_value::<WireTape>(value.clone())
        .map(|_| ())
        .map_err(|e| CoreError::schema("<value>", format!("strict schema violation: {e}")))
}

/// Decode a JSON5 document into a [`Tape`], applying lenient validation
/// before the full structural conversion.
pub fn decode(text: &str) -> Result<Tape> {
    let value: Value = json5::from_str(text)
        .map_err(|e| CoreError::schema("<document>", format!("json5 parse error: {e}")))?;
    validate_lenient(&value)?;
    let wire: WireTape = serde_json::from_value(value)
        .map_err(|e| CoreError::schema("<document>", format!("schema violation: {e}")))?;
    wire_to_tape(wire)
}

fn wire_to_tape(wire: WireTape) -> Result<Tape> {
    let created_at: DateTime<Utc> = wire
        .meta
        .created_at
        .parse::<DateTime<Utc>>()
        .map_err(|e| CoreError::schema("<document>", format!("bad createdAt: {e}")))?;
    let meta = TapeMeta {
        created_at,
        program: wire.meta.program,
        args: wire.meta.args,
        env: wire.meta.env.into_iter().collect(),
        cwd: wire.meta.cwd,
        pty: wire.meta.pty.map(|p| PtyGeometry {
            rows: p.rows,
            cols: p.cols,
        }),
        tag: wire.meta.tag,
        latency: ranged_from_json(&wire.meta.latency),
        error_rate: ranged_from_json(&wire.meta.error_rate),
        seed: wire.meta.seed,
    };
    let session = TapeSession {
        platform: wire.session.platform,
        version: wire.session.version,
    };
    let exchanges = wire
        .exchanges
        .into_iter()
        .map(wire_to_exchange)
        .collect::<Result<Vec<_>>>()?;
    Ok(Tape {
        meta,
        session,
        exchanges,
    })
}

fn wire_to_exchange(wire: WireExchange) -> Result<Exchange> {
    let input = match (wire.input.data_text, wire.input.data_bytes_b64) {
        (Some(text), None) if wire.input.kind == "line" => Input::Line(text),
        (Some(text), None) => Input::Raw(text.into_bytes()),
        (None, Some(b64)) => {
            use base64::Engine as _;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| CoreError::schema("<document>", format!("bad dataBytesB64: {e}")))?;
            Input::Raw(bytes)
        }
        _ => {
            return Err(CoreError::schema(
                "<document>",
                "exchange input must set exactly one of dataText/dataBytesB64",
            ));
        }
    };
    Ok(Exchange {
        pre: ExchangePre {
            prompt: wire.pre.prompt,
        },
        input,
        output: wire
            .output
            .chunks
            .into_iter()
            .map(|c| Chunk {
                delay_ms: c.delay_ms,
                data_b64: c.data_b64,
                is_utf8: c.is_utf8,
            })
            .collect(),
        exit: wire.exit.map(|e| ExitInfo {
            code: e.code,
            signal: e.signal,
        }),
        dur_ms: wire.dur_ms,
        annotations: wire.annotations.into_iter().collect(),
    })
}
