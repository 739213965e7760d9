//! Location Validator.
//!
//! Pure, no caching: must be called before a message is treated as
//! authoritative. Uses `reqwest::Url` for parsing.

use std::net::{IpAddr, SocketAddr};

use reqwest::Url;

use crate::message::SsdpMessage;

/// True iff the message's `LOCATION` is absent, not an `http://` URL, or
/// resolves to an address other than `source`.
pub async fn is_invalid_location(message: &SsdpMessage, source: SocketAddr) -> bool {
    match validate(message, source).await {
        Ok(()) => false,
        Err(_) => true,
    }
}

/// The validation logic as a `Result`, for callers that want the reason.
pub async fn validate(message: &SsdpMessage, source: SocketAddr) -> Result<(), &'static str> {
    let Some(location) = message.location.as_deref() else {
        return Err("missing LOCATION header");
    };

    let url = Url::parse(location).map_err(|_| "LOCATION is not a valid URL")?;

    if url.scheme() != "http" {
        return Err("LOCATION scheme is not http");
    }

    let host = url.host_str().ok_or("LOCATION has no host")?;
    let port = url.port_or_known_default().unwrap_or(80);

    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| "LOCATION host failed to resolve")?
        .next()
        .ok_or("LOCATION host resolved to no addresses")?;

    if resolved.ip() == source.ip() {
        Ok(())
    } else {
        Err("LOCATION host does not match datagram source")
    }
}

/// Synchronous variant for callers that already have the resolved IP (for
/// example a test harness substituting DNS with a literal address),
/// avoiding the async resolver entirely.
pub fn is_invalid_location_sync(message: &SsdpMessage, source: SocketAddr, resolved_ip: IpAddr) -> bool {
    let Some(location) = message.location.as_deref() else {
        return true;
    };
    let Ok(url) = Url::parse(location) else {
        return true;
    };
    if url.scheme() != "http" {
        return true;
    }
    resolved_ip != source.ip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::{AddressMode, InterfaceBinding};
    use std::time::SystemTime;

    fn binding() -> InterfaceBinding {
        InterfaceBinding {
            interface_name: "eth0".into(),
            address: "192.0.2.1".parse().unwrap(),
            mode: AddressMode::Ipv4,
            prefix_len: 24,
        }
    }

    fn msg_with_location(location: &str, source: SocketAddr) -> SsdpMessage {
        let payload = format!("NOTIFY * HTTP/1.1\r\nHOST: x\r\nLOCATION: {location}\r\n\r\n");
        SsdpMessage::parse(payload.as_bytes(), source, &binding(), SystemTime::now()).unwrap()
    }

    #[test]
    fn valid_http_location_matching_source() {
        let source: SocketAddr = "192.0.2.2:1900".parse().unwrap();
        let msg = msg_with_location("http://192.0.2.2:8080/desc.xml", source);
        let ip: IpAddr = "192.0.2.2".parse().unwrap();
        assert!(!is_invalid_location_sync(&msg, source, ip));
    }

    #[test]
    fn non_http_scheme_is_invalid() {
        let source: SocketAddr = "192.0.2.2:1900".parse().unwrap();
        let msg = msg_with_location("ftp://192.0.2.2/desc.xml", source);
        let ip: IpAddr = "192.0.2.2".parse().unwrap();
        assert!(is_invalid_location_sync(&msg, source, ip));
    }

    #[test]
    fn mismatched_host_is_invalid() {
        let source: SocketAddr = "192.0.2.2:1900".parse().unwrap();
        let msg = msg_with_location("http://198.51.100.1/desc.xml", source);
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        assert!(is_invalid_location_sync(&msg, source, ip));
    }

    #[test]
    fn missing_location_is_invalid() {
        let source: SocketAddr = "192.0.2.2:1900".parse().unwrap();
        let payload = b"NOTIFY * HTTP/1.1\r\nHOST: x\r\n\r\n";
        let msg = SsdpMessage::parse(payload, source, &binding(), SystemTime::now()).unwrap();
        let ip: IpAddr = "192.0.2.2".parse().unwrap();
        assert!(is_invalid_location_sync(&msg, source, ip));
    }

    #[tokio::test]
    async fn async_validate_matches_source() {
        let source: SocketAddr = "127.0.0.1:1900".parse().unwrap();
        let msg = msg_with_location("http://127.0.0.1:8080/desc.xml", source);
        assert!(!is_invalid_location(&msg, source).await);
    }
}
