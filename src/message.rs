//! SSDP Message.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};
use crate::iface::InterfaceBinding;

const DEFAULT_MAX_AGE_SECS: u64 = 1800;

/// The start-line shape of a parsed SSDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Notify,
    MSearch,
    /// `HTTP/1.1 <code> <reason>` — a unicast M-SEARCH response.
    Response(u16),
}

/// Case-insensitive header map, preserving insertion-order-independent
/// lookup the way SSDP/HTTP headers are generally consumed.
#[derive(Debug, Clone, Default)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Headers(HashMap::new())
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_uppercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_uppercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An immutable, parsed SSDP message.
#[derive(Debug, Clone)]
pub struct SsdpMessage {
    pub start_line: StartLine,
    pub headers: Headers,
    pub source: SocketAddr,
    pub interface_address: IpAddr,
    pub receive_time: SystemTime,

    /// USN prefix up to `::`, e.g. `uuid:4d696e69-...`. Empty if `USN` is
    /// absent or doesn't start with `uuid:`.
    pub uuid: String,
    /// USN suffix after `::` (the NT/service-type), empty if there's no
    /// `::` separator or `USN` is absent/malformed.
    pub usn_type: String,
    pub nts: Option<String>,
    pub location: Option<String>,
    pub max_age: Duration,
    pub expiry: SystemTime,
    pub valid_segment: bool,
}

impl SsdpMessage {
    /// Parse a received UDP payload into a message. `interface` is the
    /// binding of the socket the datagram arrived on; it supplies both
    /// the `interface_address` field and the valid-segment computation.
    pub fn parse(
        buf: &[u8],
        source: SocketAddr,
        interface: &InterfaceBinding,
        receive_time: SystemTime,
    ) -> Result<Self> {
        let mut raw_headers = [httparse::EMPTY_HEADER; 32];

        let start_line = if buf.starts_with(b"HTTP/1.1") || buf.starts_with(b"HTTP/1.0") {
            let mut response = httparse::Response::new(&mut raw_headers);
            response
                .parse(buf)
                .map_err(|e| Error::InvalidMessage(format!("malformed response: {e}")))?;
            let code = response
                .code
                .ok_or_else(|| Error::InvalidMessage("missing status code".into()))?;
            let headers = collect_headers(response.headers);
            (StartLine::Response(code), headers)
        } else {
            let mut request = httparse::Request::new(&mut raw_headers);
            request
                .parse(buf)
                .map_err(|e| Error::InvalidMessage(format!("malformed request: {e}")))?;
            let method = request
                .method
                .ok_or_else(|| Error::InvalidMessage("missing method".into()))?;
            let start_line = match method {
                "NOTIFY" => StartLine::Notify,
                "M-SEARCH" => StartLine::MSearch,
                other => {
                    return Err(Error::InvalidMessage(format!("unsupported method: {other}")))
                }
            };
            let headers = collect_headers(request.headers);
            (start_line, headers)
        };

        let (start_line, headers) = start_line;

        let max_age = parse_max_age(headers.get("CACHE-CONTROL")).unwrap_or(DEFAULT_MAX_AGE_SECS);
        let max_age = Duration::from_secs(max_age);
        let expiry = receive_time + max_age;

        let (uuid, usn_type) = parse_usn(headers.get("USN"));

        let valid_segment = interface.shares_segment(&source.ip());

        Ok(SsdpMessage {
            start_line,
            nts: headers.get("NTS").map(str::to_string),
            location: headers.get("LOCATION").map(str::to_string),
            headers,
            source,
            interface_address: interface.address,
            receive_time,
            uuid,
            usn_type,
            max_age,
            expiry,
            valid_segment,
        })
    }

    /// Serialize an outbound M-SEARCH request: canonical `\r\n` line
    /// endings, no trailing body.
    pub fn write_m_search(host: &str, search_target: &str, mx: u8) -> Vec<u8> {
        format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: {host}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: {mx}\r\n\
             ST: {search_target}\r\n\
             \r\n"
        )
        .into_bytes()
    }

    /// Serialize an outbound NOTIFY (alive/byebye/update) message.
    pub fn write_notify(host: &str, nts: &str, nt: &str, usn: &str, extra: &Headers) -> Vec<u8> {
        let mut out = format!(
            "NOTIFY * HTTP/1.1\r\n\
             HOST: {host}\r\n\
             NT: {nt}\r\n\
             NTS: {nts}\r\n\
             USN: {usn}\r\n"
        );
        for (name, value) in extra.iter() {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn collect_headers(raw: &[httparse::Header]) -> Headers {
    let mut headers = Headers::new();
    for h in raw {
        if h.name.is_empty() {
            continue;
        }
        let value = String::from_utf8_lossy(h.value).into_owned();
        headers.insert(h.name, value);
    }
    headers
}

/// Scan `CACHE-CONTROL` for `max-age=<int>` (case-insensitive).
fn parse_max_age(cache_control: Option<&str>) -> Option<u64> {
    let cache_control = cache_control?;
    for token in cache_control.split(',') {
        let token = token.trim();
        let lower = token.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("max-age=") {
            return rest.trim().parse().ok();
        }
    }
    None
}

/// Split `USN` into `(uuid, type)` on `::`.
fn parse_usn(usn: Option<&str>) -> (String, String) {
    let Some(usn) = usn else {
        return (String::new(), String::new());
    };
    if !usn.starts_with("uuid:") {
        return (String::new(), String::new());
    }
    match usn.split_once("::") {
        Some((uuid, ty)) => (uuid.to_string(), ty.to_string()),
        None => (usn.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::AddressMode;

    fn binding() -> InterfaceBinding {
        InterfaceBinding {
            interface_name: "eth0".into(),
            address: "192.0.2.1".parse().unwrap(),
            mode: AddressMode::Ipv4,
            prefix_len: 24,
        }
    }

    #[test]
    fn parses_notify_alive() {
        let payload = b"NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
CACHE-CONTROL: max-age=1800\r\n\
LOCATION: http://192.0.2.2:8080/desc.xml\r\n\
NT: urn:schemas-upnp-org:device:MediaServer:1\r\n\
USN: uuid:abc-123::urn:schemas-upnp-org:device:MediaServer:1\r\n\
NTS: ssdp:alive\r\n\
\r\n";

        let source = "192.0.2.2:4000".parse().unwrap();
        let now = SystemTime::now();
        let msg = SsdpMessage::parse(payload, source, &binding(), now).unwrap();

        assert_eq!(msg.start_line, StartLine::Notify);
        assert_eq!(msg.uuid, "uuid:abc-123");
        assert_eq!(
            msg.usn_type,
            "urn:schemas-upnp-org:device:MediaServer:1"
        );
        assert_eq!(msg.nts.as_deref(), Some("ssdp:alive"));
        assert_eq!(msg.max_age, Duration::from_secs(1800));
        assert_eq!(
            msg.expiry.duration_since(now).unwrap(),
            Duration::from_secs(1800)
        );
        assert!(msg.valid_segment);
    }

    #[test]
    fn max_age_defaults_to_1800_when_absent() {
        let payload = b"NOTIFY * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nNTS: ssdp:alive\r\n\r\n";
        let source = "192.0.2.2:4000".parse().unwrap();
        let msg = SsdpMessage::parse(payload, source, &binding(), SystemTime::now()).unwrap();
        assert_eq!(msg.max_age, Duration::from_secs(DEFAULT_MAX_AGE_SECS));
    }

    #[test]
    fn usn_without_separator_is_whole_uuid() {
        let payload = b"NOTIFY * HTTP/1.1\r\nHOST: x\r\nUSN: uuid:solo\r\n\r\n";
        let source = "192.0.2.2:4000".parse().unwrap();
        let msg = SsdpMessage::parse(payload, source, &binding(), SystemTime::now()).unwrap();
        assert_eq!(msg.uuid, "uuid:solo");
        assert_eq!(msg.usn_type, "");
    }

    #[test]
    fn usn_not_uuid_prefixed_is_empty() {
        let payload = b"NOTIFY * HTTP/1.1\r\nHOST: x\r\nUSN: garbage::type\r\n\r\n";
        let source = "192.0.2.2:4000".parse().unwrap();
        let msg = SsdpMessage::parse(payload, source, &binding(), SystemTime::now()).unwrap();
        assert_eq!(msg.uuid, "");
        assert_eq!(msg.usn_type, "");
    }

    #[test]
    fn valid_segment_false_across_subnets() {
        let payload = b"NOTIFY * HTTP/1.1\r\nHOST: x\r\n\r\n";
        let source = "198.51.100.9:4000".parse().unwrap();
        let msg = SsdpMessage::parse(payload, source, &binding(), SystemTime::now()).unwrap();
        assert!(!msg.valid_segment);
    }

    #[test]
    fn rejects_unsupported_method() {
        let payload = b"DELETE * HTTP/1.1\r\nHOST: x\r\n\r\n";
        let source = "192.0.2.2:4000".parse().unwrap();
        let err = SsdpMessage::parse(payload, source, &binding(), SystemTime::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }

    #[test]
    fn write_m_search_uses_crlf_and_no_body() {
        let bytes = SsdpMessage::write_m_search("239.255.255.250:1900", "ssdp:all", 3);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(text.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(text.contains("ST: ssdp:all\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
