//! Wire messages exchanged over the tunnel.
//!
//! Every WebSocket frame carries exactly one [`Frame`], encoded as JSON and
//! tagged by `kind`. Bodies travel as base64 so arbitrary bytes survive the
//! JSON encoding.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Correlation identifier shared by a request and its response
pub type CorrelationId = Uuid;

/// Generate a fresh correlation identifier.
pub fn new_correlation_id() -> CorrelationId {
    Uuid::new_v4()
}

/// One message on the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Relay → agent
    Request(ForwardedRequest),
    /// Agent → relay
    Response(TunnelResponse),
}

impl Frame {
    pub fn id(&self) -> CorrelationId {
        match self {
            Frame::Request(req) => req.id,
            Frame::Response(resp) => resp.id,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// An inbound public request, captured in full
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedRequest {
    pub id: CorrelationId,
    pub method: String,
    pub target: TargetUri,
    pub headers: HeaderMultimap,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

/// The local service's answer to a [`ForwardedRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub id: CorrelationId,
    pub status: u16,
    pub headers: HeaderMultimap,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

/// Absolute target of a forwarded request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetUri {
    pub scheme: String,
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
}

impl TargetUri {
    /// Point the target at another origin, keeping path and query.
    pub fn rewrite_origin(&mut self, scheme: &str, host: &str) {
        self.scheme = scheme.to_string();
        self.host = host.to_string();
    }

    pub fn path_and_query(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        match &self.query {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        }
    }
}

impl fmt::Display for TargetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host, self.path_and_query())
    }
}

/// Ordered header multimap with ASCII-case-insensitive names.
///
/// Names keep the spelling they were first inserted with. Values for one name
/// keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMultimap(Vec<(String, Vec<String>)>);

impl HeaderMultimap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, creating the entry if needed
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some((_, values)) => values.push(value),
            None => self.0.push((name, vec![value])),
        }
    }

    /// All values for `name`, empty if absent
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.get_all(name).is_empty()
    }

    /// Remove every value for `name`
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(idx) => self.0.remove(idx).1,
            None => Vec::new(),
        }
    }

    /// Iterate `(name, value)` pairs, one per value
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Number of distinct names
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for HeaderMultimap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = HeaderMultimap::new();
        for (k, v) in iter {
            headers.append(k, v);
        }
        headers
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
