//! Request targets and HTTP/1.1 request serialization.

use std::fmt::Write as _;
use std::net::IpAddr;

use netq_core::RequestPlan;
use url::{Host, Url};

use super::TransferError;

/// Connection pool key: requests to the same origin may share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Origin {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HostAddr {
    Ip(IpAddr),
    Name(String),
}

/// Where a request goes and how its request line looks.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub origin: Origin,
    pub addr: HostAddr,
    /// `Host` header value.
    pub authority: String,
    pub path: String,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, TransferError> {
        let url = Url::parse(raw.trim()).map_err(|_| TransferError::UrlMalformat)?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            _ => return Err(TransferError::UnsupportedProtocol),
        };

        let (addr, host) = match url.host() {
            Some(Host::Domain(name)) if !name.is_empty() => {
                (HostAddr::Name(name.to_string()), name.to_string())
            }
            Some(Host::Ipv4(ip)) => (HostAddr::Ip(ip.into()), ip.to_string()),
            Some(Host::Ipv6(ip)) => (HostAddr::Ip(ip.into()), ip.to_string()),
            _ => return Err(TransferError::UrlMalformat),
        };
        let port = url
            .port_or_known_default()
            .ok_or(TransferError::UrlMalformat)?;

        let mut authority = url.host_str().unwrap_or_default().to_string();
        if let Some(explicit) = url.port() {
            let _ = write!(authority, ":{explicit}");
        }

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            origin: Origin { tls, host, port },
            addr,
            authority,
            path,
        })
    }
}

/// Serialize the request head and payload.
///
/// Framing headers (`Content-Length`, `Transfer-Encoding`) are always
/// computed here; caller-supplied copies are dropped. Lines without a colon
/// or with embedded line breaks are dropped too.
pub(crate) fn encode_request(plan: &RequestPlan, target: &Target) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", plan.method, target.path);

    if !plan.has_header("host") {
        let _ = write!(head, "Host: {}\r\n", target.authority);
    }
    if !plan.has_header("accept") {
        head.push_str("Accept: */*\r\n");
    }

    for line in &plan.headers {
        let Some((name, _)) = line.split_once(':') else {
            tracing::debug!(line = %line, "dropping request header without colon");
            continue;
        };
        if line.contains(['\r', '\n']) {
            tracing::warn!(name = %name.trim(), "dropping request header with embedded line break");
            continue;
        }
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        head.push_str(line);
        head.push_str("\r\n");
    }

    if let Some(body) = &plan.body {
        if !plan.has_header("content-type") {
            head.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
        }
        let _ = write!(head, "Content-Length: {}\r\n", body.len());
    }
    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    if let Some(body) = &plan.body {
        bytes.extend_from_slice(body.as_bytes());
    }
    bytes
}
