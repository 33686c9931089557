//! PROXY protocol v1 preamble parsing.
//!
//! A single ASCII line terminated by `\n`, beginning with `PROXY `, consumed
//! before any SMTP bytes and never forwarded to the Frame Parser.

use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("PROXY preamble missing or malformed")]
    Malformed,
    #[error("unsupported PROXY protocol family: {0}")]
    UnsupportedFamily(String),
    #[error("invalid address or port in PROXY preamble")]
    InvalidEndpoint,
}

/// The endpoint override carried by a PROXY v1 line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source_addr: IpAddr,
    pub source_port: u16,
    pub dest_addr: IpAddr,
    pub dest_port: u16,
}

/// Parse one `PROXY TCP4|TCP6 <src> <dst> <sport> <dport>` line, without its
/// trailing `\r\n`/`\n`.
pub fn parse_proxy_line(line: &str) -> Result<ProxyHeader, ProxyError> {
    let mut fields = line.split_ascii_whitespace();

    match fields.next() {
        Some("PROXY") => {}
        _ => return Err(ProxyError::Malformed),
    }

    let family = fields.next().ok_or(ProxyError::Malformed)?;
    if family != "TCP4" && family != "TCP6" {
        return Err(ProxyError::UnsupportedFamily(family.to_string()));
    }

    let source_addr: IpAddr = fields.next().ok_or(ProxyError::Malformed)?.parse().map_err(|_| ProxyError::InvalidEndpoint)?;
    let dest_addr: IpAddr = fields.next().ok_or(ProxyError::Malformed)?.parse().map_err(|_| ProxyError::InvalidEndpoint)?;
    let source_port: u16 = fields.next().ok_or(ProxyError::Malformed)?.parse().map_err(|_| ProxyError::InvalidEndpoint)?;
    let dest_port: u16 = fields.next().ok_or(ProxyError::Malformed)?.parse().map_err(|_| ProxyError::InvalidEndpoint)?;

    Ok(ProxyHeader {
        source_addr,
        source_port,
        dest_addr,
        dest_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp4_header() {
        let header = parse_proxy_line("PROXY TCP4 198.51.100.22 203.0.113.7 35646 80").unwrap();
        assert_eq!(header.source_addr.to_string(), "198.51.100.22");
        assert_eq!(header.source_port, 35646);
        assert_eq!(header.dest_addr.to_string(), "203.0.113.7");
        assert_eq!(header.dest_port, 80);
    }

    #[test]
    fn rejects_wrong_first_token() {
        assert_eq!(parse_proxy_line("HELO x").unwrap_err(), ProxyError::Malformed);
    }

    #[test]
    fn rejects_unsupported_family() {
        assert!(matches!(
            parse_proxy_line("PROXY UNKNOWN 1.2.3.4 5.6.7.8 1 2"),
            Err(ProxyError::UnsupportedFamily(_))
        ));
    }
}
