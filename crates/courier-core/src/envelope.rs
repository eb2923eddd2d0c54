use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::ClientId;

/// Routing tag carried by every envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Register,
    Logout,
    Heartbeat,
    DirectMessage,
    Group,
    Channel,
    Broadcast,
    Echo,
    /// Any tag this node does not understand.
    #[serde(other)]
    Unknown,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Logout => "logout",
            Self::Heartbeat => "heartbeat",
            Self::DirectMessage => "direct_message",
            Self::Group => "group",
            Self::Channel => "channel",
            Self::Broadcast => "broadcast",
            Self::Echo => "echo",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit routed between clients, pipelines and instances.
///
/// The payload is opaque to the routing layer. On the wire it travels as a
/// base64 string inside a JSON object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(with = "payload_base64", default)]
    pub payload: Bytes,
    pub from: ClientId,
    pub to: ClientId,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: impl Into<Bytes>, from: ClientId, to: ClientId) -> Self {
        Self {
            kind,
            payload: payload.into(),
            from,
            to,
        }
    }

    /// A manager-generated reply addressed to `to`.
    pub fn reply(kind: EnvelopeKind, payload: &'static str, to: ClientId) -> Self {
        Self::new(kind, Bytes::from_static(payload.as_bytes()), ClientId::server(), to)
    }

    /// Same envelope, sent back to whoever sent it.
    pub fn redirect_to_sender(self) -> Self {
        Self {
            to: self.from.clone(),
            ..self
        }
    }

    /// Same envelope with a different sender.
    pub fn with_sender(self, from: ClientId) -> Self {
        Self { from, ..self }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn from_json_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD
            .decode(raw.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Short printable rendering of a payload for log lines. Binary payloads are
/// shown as base64.
pub fn payload_preview(payload: &Bytes, max: usize) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) if text.len() <= max => text.to_owned(),
        Ok(text) => {
            let mut end = max;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &text[..end])
        }
        Err(_) => base64::engine::general_purpose::STANDARD.encode(&payload[..payload.len().min(max)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_wire_shape() {
        let env = Envelope::new(
            EnvelopeKind::DirectMessage,
            "hi",
            ClientId::from_raw("a"),
            ClientId::from_raw("b"),
        );
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["kind"], "direct_message");
        assert_eq!(json["payload"], "aGk=");
        assert_eq!(json["from"], "a");
        assert_eq!(json["to"], "b");
    }

    #[test]
    fn unknown_kind_decodes_to_unknown() {
        let env = Envelope::from_json(r#"{"kind":"poke","payload":"","from":"a","to":"b"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Unknown);
    }

    #[test]
    fn missing_payload_defaults_to_empty() {
        let env = Envelope::from_json(r#"{"kind":"heartbeat","from":"a","to":"server"}"#).unwrap();
        assert!(env.payload.is_empty());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = Envelope::from_json(r#"{"kind":"echo","payload":"%%%","from":"a","to":"b"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn redirect_to_sender_keeps_payload() {
        let env = Envelope::new(EnvelopeKind::Echo, "ping", ClientId::from_raw("a"), ClientId::from_raw("x"));
        let back = env.redirect_to_sender();
        assert_eq!(back.to.as_str(), "a");
        assert_eq!(back.from.as_str(), "a");
        assert_eq!(&back.payload[..], b"ping");
    }

    #[test]
    fn reply_comes_from_server() {
        let env = Envelope::reply(EnvelopeKind::Heartbeat, "health", ClientId::from_raw("u"));
        assert_eq!(env.from, ClientId::server());
        assert_eq!(&env.payload[..], b"health");
    }

    #[test]
    fn preview_truncates_text_and_encodes_binary() {
        assert_eq!(payload_preview(&Bytes::from_static(b"hello world"), 5), "hello...");
        assert_eq!(payload_preview(&Bytes::from_static(b"ok"), 5), "ok");
        assert_eq!(payload_preview(&Bytes::from_static(&[0xff, 0xfe]), 5), "//4=");
    }
}
