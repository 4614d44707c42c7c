//! Wire format of the control and broadcast channels.
//!
//! Both channels carry length-delimited JSON frames (4-byte big-endian
//! length, then the UTF-8 object).
//!
//! | direction | shape |
//! |---|---|
//! | request | `{typ: "verb[/op]", …arguments}` |
//! | reply | `{err, desc?, ret?}`, `err` is `null` on success |
//! | notification | `{typ: "topic[/sub]", …fields, doc?: base64}` |

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use mamba_core::{Document, MambaError, MambaResult, MonitorDoc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest accepted frame; image notifications dominate.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

// =============================================================================
// Request / Reply
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub typ: String,
    #[serde(flatten)]
    pub args: Map<String, Json>,
}

impl Request {
    pub fn new(typ: &str) -> Self {
        Self {
            typ: typ.to_string(),
            args: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Json>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    /// Parse a raw frame, reporting a missing or non-string `typ` as a
    /// syntax error.
    pub fn from_json(value: Json) -> MambaResult<Self> {
        serde_json::from_value(value).map_err(|e| MambaError::Syntax(format!("bad request: {}", e)))
    }

    /// `"dev/read"` → `("dev", Some("read"))`.
    pub fn verb_op(&self) -> (&str, Option<&str>) {
        match self.typ.split_once('/') {
            Some((verb, op)) => (verb, Some(op)),
            None => (self.typ.as_str(), None),
        }
    }

    pub fn str_arg(&self, key: &str) -> MambaResult<&str> {
        match self.args.get(key) {
            Some(Json::String(s)) => Ok(s),
            Some(other) => Err(MambaError::Syntax(format!(
                "{}: '{}' must be a string, got {}",
                self.typ, key, other
            ))),
            None => Err(MambaError::Syntax(format!("{}: missing '{}'", self.typ, key))),
        }
    }

    pub fn opt_str(&self, key: &str) -> MambaResult<Option<&str>> {
        match self.args.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(_) => self.str_arg(key).map(Some),
        }
    }

    pub fn opt_bool(&self, key: &str, default: bool) -> MambaResult<bool> {
        match self.args.get(key) {
            None | Some(Json::Null) => Ok(default),
            Some(Json::Bool(b)) => Ok(*b),
            Some(other) => Err(MambaError::Syntax(format!(
                "{}: '{}' must be a boolean, got {}",
                self.typ, key, other
            ))),
        }
    }

    /// Deserialize the arguments into a typed payload.
    pub fn parse<T: DeserializeOwned>(&self) -> MambaResult<T> {
        serde_json::from_value(Json::Object(self.args.clone()))
            .map_err(|e| MambaError::Syntax(format!("{}: {}", self.typ, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<Json>,
}

impl Reply {
    pub fn ok(ret: Json) -> Self {
        Self {
            err: None,
            desc: None,
            ret: (!ret.is_null()).then_some(ret),
        }
    }

    pub fn error(err: &MambaError) -> Self {
        let kind = err.kind();
        let desc = if kind == mamba_core::ErrorKind::Exc {
            format!("{}: {}", err.type_name(), err)
        } else {
            err.to_string()
        };
        Self {
            err: Some(kind.as_str().to_string()),
            desc: Some(desc),
            ret: None,
        }
    }

    pub fn from_result(result: MambaResult<Json>) -> Self {
        match result {
            Ok(ret) => Self::ok(ret),
            Err(e) => Self::error(&e),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// A broadcast message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub body: Map<String, Json>,
    /// Binary payload, base64-encoded into `doc` on the wire.
    pub payload: Option<Vec<u8>>,
}

impl Notification {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            body: Map::new(),
            payload: None,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Json>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    /// `doc/<name>` carrying the serialized document.
    pub fn document(doc: &Document) -> MambaResult<Self> {
        let mut n = Self::new(&format!("doc/{}", doc.name()))
            .with("run_uid", doc.run_uid())
            .with("uid", doc.uid());
        n.payload = Some(serde_json::to_vec(doc)?);
        Ok(n)
    }

    /// Monitor documents keep their own topic (`monitor/position`,
    /// `scan/progress`, …).
    pub fn monitor(doc: &MonitorDoc) -> Self {
        let mut n = Self::new(&doc.topic);
        for (key, value) in &doc.data {
            n.body.insert(key.clone(), value.to_json());
        }
        if !doc.timestamps.is_empty() {
            n.body.insert(
                "timestamps".to_string(),
                serde_json::to_value(&doc.timestamps).unwrap_or(Json::Null),
            );
        }
        n.payload = doc.payload.clone();
        n
    }

    pub fn to_wire(&self) -> Json {
        let mut obj = self.body.clone();
        obj.insert("typ".to_string(), Json::String(self.topic.clone()));
        if let Some(payload) = &self.payload {
            obj.insert("doc".to_string(), Json::String(BASE64.encode(payload)));
        }
        Json::Object(obj)
    }

    pub fn from_wire(value: Json) -> MambaResult<Self> {
        let Json::Object(mut obj) = value else {
            return Err(MambaError::Syntax("notification must be an object".into()));
        };
        let topic = match obj.remove("typ") {
            Some(Json::String(t)) => t,
            _ => return Err(MambaError::Syntax("notification without typ".into())),
        };
        let payload = match obj.remove("doc") {
            Some(Json::String(b64)) => Some(
                BASE64
                    .decode(b64.as_bytes())
                    .map_err(|e| MambaError::Syntax(format!("bad doc payload: {}", e)))?,
            ),
            Some(_) => return Err(MambaError::Syntax("doc must be base64 text".into())),
            None => None,
        };
        Ok(Self {
            topic,
            body: obj,
            payload,
        })
    }

    /// Decode a `doc/<name>` payload.
    pub fn decode_document(&self) -> MambaResult<Document> {
        let payload = self
            .payload
            .as_deref()
            .ok_or_else(|| MambaError::Empty(format!("{} carries no document", self.topic)))?;
        Ok(serde_json::from_slice(payload)?)
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Length-delimited JSON: decodes `D`, encodes `E`.
pub struct JsonCodec<D, E> {
    inner: LengthDelimitedCodec,
    _types: PhantomData<fn(E) -> D>,
}

impl<D, E> JsonCodec<D, E> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME)
                .new_codec(),
            _types: PhantomData,
        }
    }
}

impl<D, E> Default for JsonCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for JsonCodec<D, E> {
    type Item = D;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<D>> {
        match self.inner.decode(src)? {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

impl<D, E: Serialize> Encoder<E> for JsonCodec<D, E> {
    type Error = io::Error;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> io::Result<()> {
        let bytes = serde_json::to_vec(&item)?;
        self.inner.encode(Bytes::from(bytes), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mamba_core::{StopDoc, Value};
    use serde_json::json;

    #[test]
    fn verbs_and_ops() {
        let req = Request::new("dev/read").with("path", "mx.velocity");
        assert_eq!(req.verb_op(), ("dev", Some("read")));
        assert_eq!(req.str_arg("path").unwrap(), "mx.velocity");
        assert!(req.str_arg("nope").is_err());
        assert_eq!(Request::new("cmd").verb_op(), ("cmd", None));
        assert!(Request::from_json(json!({"cmd": "1"})).is_err());
    }

    #[test]
    fn replies_carry_the_kind() {
        let reply = Reply::error(&MambaError::Key("mx".into()));
        assert_eq!(reply.err.as_deref(), Some("key"));
        let exc = Reply::error(&MambaError::Other(anyhow::anyhow!("boom")));
        assert_eq!(exc.err.as_deref(), Some("exc"));
        assert!(exc.desc.unwrap().starts_with("Exception"));
        let ok = serde_json::to_value(Reply::ok(json!(3))).unwrap();
        assert_eq!(ok, json!({"err": null, "ret": 3}));
    }

    #[test]
    fn image_payloads_travel_as_base64() {
        let mut doc = MonitorDoc::new("monitor/image").with_value("frame", Value::Int(2));
        doc.payload = Some(vec![0, 1, 2, 255]);
        let wire = Notification::monitor(&doc).to_wire();
        assert_eq!(wire["typ"], "monitor/image");
        assert_eq!(wire["doc"], "AAEC/w==");
        let back = Notification::from_wire(wire).unwrap();
        assert_eq!(back.payload, Some(vec![0, 1, 2, 255]));
        assert_eq!(back.body["frame"], json!(2));
    }

    #[test]
    fn documents_decode_from_their_payload() {
        let stop = Document::Stop(StopDoc::abort("run-1", "operator"));
        let n = Notification::document(&stop).unwrap();
        assert_eq!(n.topic, "doc/stop");
        assert_eq!(n.decode_document().unwrap(), stop);
    }

    #[test]
    fn codec_frames_json() {
        let mut codec: JsonCodec<Json, Json> = JsonCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(json!({"typ": "scan/pause"}), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 20]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, json!({"typ": "scan/pause"}));
        assert!(buf.is_empty());
    }
}
