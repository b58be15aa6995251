//! Request plans and the method policy.
//!
//! # Design
//! A `RequestPlan` describes one outbound request as plain data: verb, URL,
//! raw `Key: Value` header lines and an optional payload. Building a plan is
//! where the method policy is enforced, so an unsupported verb is rejected
//! before anything is handed to the transfer engine. The engine turns the
//! plan into bytes on the wire; this module never touches the network.

use std::fmt;

use crate::error::SubmitError;
use crate::types::WorkItem;

/// Identifying user agent attached to every outbound request.
pub const USER_AGENT: &str = "netq/0.1";

/// HTTP verbs the dispatcher is willing to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Parse a verb case-insensitively.
    pub fn parse(raw: &str) -> Result<Self, SubmitError> {
        if raw.eq_ignore_ascii_case("GET") {
            Ok(Method::Get)
        } else if raw.eq_ignore_ascii_case("POST") {
            Ok(Method::Post)
        } else {
            Err(SubmitError::UnsupportedMethod(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound request described as plain data.
///
/// `body` is `Some` whenever a payload must be written, including a `GET`
/// that carries a body: the verb stays `GET` and the payload is still sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    pub method: Method,
    pub url: String,
    pub headers: Vec<String>,
    pub body: Option<String>,
}

impl RequestPlan {
    /// Build a plan, applying the method policy.
    ///
    /// - `GET` with a body keeps the `GET` verb and sends the body.
    /// - `POST` sends its body; a missing body becomes an empty payload.
    /// - Any other verb is rejected with `SubmitError::UnsupportedMethod`.
    ///
    /// Caller-supplied `User-Agent` lines are dropped and the fixed
    /// [`USER_AGENT`] is appended last.
    pub fn new(
        method: &str,
        url: &str,
        headers: &[String],
        body: Option<&str>,
    ) -> Result<Self, SubmitError> {
        let method = Method::parse(method)?;

        let mut lines: Vec<String> = headers
            .iter()
            .filter(|line| !is_user_agent(line))
            .cloned()
            .collect();
        lines.push(format!("User-Agent: {USER_AGENT}"));

        let body = match method {
            Method::Get => body.map(str::to_owned),
            Method::Post => Some(body.unwrap_or_default().to_owned()),
        };

        Ok(Self {
            method,
            url: url.to_string(),
            headers: lines,
            body,
        })
    }

    pub fn from_item(item: &WorkItem) -> Result<Self, SubmitError> {
        Self::new(&item.method, &item.url, &item.headers, item.body.as_deref())
    }

    /// Returns true if the header list already names `field`.
    pub fn has_header(&self, field: &str) -> bool {
        self.headers.iter().any(|line| {
            line.split_once(':')
                .is_some_and(|(name, _)| name.trim().eq_ignore_ascii_case(field))
        })
    }
}

fn is_user_agent(line: &str) -> bool {
    line.split_once(':')
        .is_some_and(|(name, _)| name.trim().eq_ignore_ascii_case("user-agent"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_is_case_insensitive() {
        assert_eq!(Method::parse("get").unwrap(), Method::Get);
        assert_eq!(Method::parse("Post").unwrap(), Method::Post);
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let err = RequestPlan::new("PUT", "http://localhost/", &[], None).unwrap_err();
        assert_eq!(err, SubmitError::UnsupportedMethod("PUT".to_string()));
        assert_eq!(err.to_string(), "Unsupported request method PUT");
    }

    #[test]
    fn get_with_body_keeps_get_verb() {
        let plan = RequestPlan::new("GET", "http://localhost/", &[], Some("{\"a\":1}")).unwrap();
        assert_eq!(plan.method, Method::Get);
        assert_eq!(plan.body.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn get_without_body_has_no_payload() {
        let plan = RequestPlan::new("GET", "http://localhost/", &[], None).unwrap();
        assert!(plan.body.is_none());
    }

    #[test]
    fn post_without_body_sends_empty_payload() {
        let plan = RequestPlan::new("POST", "http://localhost/", &[], None).unwrap();
        assert_eq!(plan.method, Method::Post);
        assert_eq!(plan.body.as_deref(), Some(""));
    }

    #[test]
    fn user_agent_is_fixed_and_last() {
        let headers = vec![
            "Accept: text/plain".to_string(),
            "user-agent: custom".to_string(),
        ];
        let plan = RequestPlan::new("GET", "http://localhost/", &headers, None).unwrap();
        assert_eq!(
            plan.headers,
            vec![
                "Accept: text/plain".to_string(),
                format!("User-Agent: {USER_AGENT}"),
            ]
        );
    }

    #[test]
    fn has_header_matches_field_names_only() {
        let headers = vec!["Content-Type: text/plain".to_string()];
        let plan = RequestPlan::new("POST", "http://localhost/", &headers, Some("x")).unwrap();
        assert!(plan.has_header("content-type"));
        assert!(!plan.has_header("text/plain"));
    }
}
