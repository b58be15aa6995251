//! Work items and response records.
//!
//! # Design
//! `WorkItem` is read from the queue and never mutated. `ResponseRecord` is
//! the persisted outcome, written twice per id: an all-null placeholder at
//! dispatch time, then exactly one completion update. `None` fields mean
//! "unknown / not applicable" and must stay distinguishable from an empty
//! value, so every optional column is an `Option`.
//!
//! `ResponseHeaders` keeps header pairs in arrival order, duplicates
//! included. It serializes to a JSON object by writing the pairs as-is, so
//! `{"Set-Cookie":"a","Set-Cookie":"b"}` survives a round trip.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One queued outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub method: String,
    pub url: String,
    /// Raw `Key: Value` header lines.
    pub headers: Vec<String>,
    pub body: Option<String>,
}

/// Response header pairs in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders(Vec<(String, String)>);

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair. Repeated names are kept as separate entries.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// First value recorded for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Serialize as a JSON object text, preserving order and duplicates.
    pub fn to_json(&self) -> String {
        // Serializing string pairs into a String cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Serialize for ResponseHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResponseHeaders {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = ResponseHeaders;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object of header names to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    pairs.push((k, v));
                }
                Ok(ResponseHeaders(pairs))
            }
        }

        deserializer.deserialize_map(PairsVisitor)
    }
}

impl FromIterator<(String, String)> for ResponseHeaders {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The persisted result for one work item id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status_code: Option<u16>,
    pub content: Option<String>,
    pub headers: Option<ResponseHeaders>,
    pub content_type: Option<String>,
    pub timed_out: bool,
    pub error_msg: Option<String>,
}

impl ResponseRecord {
    /// The id-only row written at dispatch time.
    pub fn placeholder() -> Self {
        Self::default()
    }

    /// A completed transfer. An empty body is recorded as `None`.
    pub fn success(
        status_code: u16,
        body: &[u8],
        headers: ResponseHeaders,
        content_type: Option<String>,
    ) -> Self {
        let content = if body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(body).into_owned())
        };
        Self {
            status_code: Some(status_code),
            content,
            headers: Some(headers),
            content_type,
            timed_out: false,
            error_msg: None,
        }
    }

    /// A transport failure: only the error description is known.
    pub fn failure(error_msg: impl Into<String>) -> Self {
        Self {
            error_msg: Some(error_msg.into()),
            ..Self::default()
        }
    }

    /// True while the request is in flight (no completion written yet).
    pub fn is_placeholder(&self) -> bool {
        self.status_code.is_none() && self.error_msg.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_serialize_in_arrival_order_with_duplicates() {
        let mut headers = ResponseHeaders::new();
        headers.push("Set-Cookie", "a=1");
        headers.push("Content-Type", "text/plain");
        headers.push("Set-Cookie", "b=2");
        assert_eq!(
            headers.to_json(),
            r#"{"Set-Cookie":"a=1","Content-Type":"text/plain","Set-Cookie":"b=2"}"#
        );
    }

    #[test]
    fn headers_deserialize_keeps_duplicates() {
        let headers: ResponseHeaders =
            serde_json::from_str(r#"{"A":"1","B":"2","A":"3"}"#).unwrap();
        let pairs: Vec<_> = headers.iter().collect();
        assert_eq!(pairs, vec![("A", "1"), ("B", "2"), ("A", "3")]);
    }

    #[test]
    fn headers_get_is_case_insensitive() {
        let mut headers = ResponseHeaders::new();
        headers.push("Content-Type", "application/json");
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("date"), None);
    }

    #[test]
    fn empty_body_is_null_content() {
        let record = ResponseRecord::success(204, b"", ResponseHeaders::new(), None);
        assert_eq!(record.status_code, Some(204));
        assert!(record.content.is_none());
        assert!(!record.is_placeholder());
    }

    #[test]
    fn failure_sets_only_error_msg() {
        let record = ResponseRecord::failure("Couldn't connect to server");
        assert_eq!(record.error_msg.as_deref(), Some("Couldn't connect to server"));
        assert!(record.status_code.is_none());
        assert!(record.content.is_none());
        assert!(record.headers.is_none());
        assert!(!record.is_placeholder());
    }

    #[test]
    fn placeholder_is_all_null() {
        let record = ResponseRecord::placeholder();
        assert!(record.is_placeholder());
        assert!(!record.timed_out);
    }
}
