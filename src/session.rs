//! The per-connection `Session` data model.

use std::collections::BTreeMap;
use std::net::IpAddr;

use data_encoding::BASE32_NOPAD;
use rand::RngCore;

use crate::address::ParsedAddress;
use crate::reply::Reply;

/// Which greeting the client issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpeningCommand {
    Helo,
    Ehlo,
    Lhlo,
}

/// Summary of the negotiated TLS cipher, captured after a handshake. The
/// core treats this as opaque text; it is produced by
/// whatever `rustls::ServerConnection` reports and is not interpreted
/// further.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub protocol_version: String,
    pub cipher_suite: String,
}

/// One envelope recipient or sender and its extension parameters.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeAddress {
    pub address: String,
    pub args: BTreeMap<String, crate::address::ParamValue>,
}

impl From<ParsedAddress> for EnvelopeAddress {
    fn from(p: ParsedAddress) -> Self {
        EnvelopeAddress {
            address: p.address,
            args: p.args,
        }
    }
}

/// DSN parameters lifted out of `MAIL FROM`'s argument map.
#[derive(Debug, Clone, Default)]
pub struct DsnParams {
    pub ret: Option<String>,
    pub envid: Option<String>,
}

/// The in-progress mail transaction.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub mail_from: Option<EnvelopeAddress>,
    pub rcpt_to: Vec<EnvelopeAddress>,
    pub body_type: Option<String>,
    pub smtp_utf8: bool,
    pub require_tls: bool,
    pub dsn: DsnParams,
}

impl Envelope {
    /// Insert or replace a recipient, de-duplicating by case-insensitive
    /// address, with the later entry superseding the earlier one in place.
    pub fn push_recipient(&mut self, addr: EnvelopeAddress) {
        let key = addr.address.to_ascii_lowercase();
        if let Some(existing) = self.rcpt_to.iter_mut().find(|r| r.address.to_ascii_lowercase() == key) {
            *existing = addr;
        } else {
            self.rcpt_to.push(addr);
        }
    }
}

/// Per-connection session state, outliving individual transactions.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,

    pub local_address: IpAddr,
    pub local_port: u16,
    pub remote_address: IpAddr,
    pub remote_port: u16,

    pub client_hostname: Option<String>,

    pub opening_command: Option<OpeningCommand>,
    pub host_name_appears_as: Option<String>,

    pub secure: bool,
    pub tls_info: Option<TlsInfo>,

    pub user: Option<String>,

    pub transaction: u64,
    pub envelope: Envelope,

    pub x_client: BTreeMap<String, String>,
    pub x_forward: BTreeMap<String, String>,
    /// Once the client has issued one `XCLIENT ADDR=` override it may not
    /// issue another.
    pub xclient_addr_locked: bool,

    pub lmtp: bool,

    pub error: Option<String>,
}

impl Session {
    pub fn new(local_address: IpAddr, local_port: u16, remote_address: IpAddr, remote_port: u16, lmtp: bool) -> Self {
        Session {
            id: generate_session_id(),
            local_address: normalize_ip(local_address),
            local_port,
            remote_address: normalize_ip(remote_address),
            remote_port,
            client_hostname: None,
            opening_command: None,
            host_name_appears_as: None,
            secure: false,
            tls_info: None,
            user: None,
            transaction: 0,
            envelope: Envelope::default(),
            x_client: BTreeMap::new(),
            x_forward: BTreeMap::new(),
            xclient_addr_locked: false,
            lmtp,
            error: None,
        }
    }

    /// Derived transmission-type string: base protocol plus E/S/A
    /// suffixes for extended/secure/authenticated.
    pub fn transmission_type(&self) -> String {
        let mut s = if self.lmtp { "LMTP".to_string() } else { "SMTP".to_string() };
        if matches!(self.opening_command, Some(OpeningCommand::Ehlo) | Some(OpeningCommand::Lhlo)) {
            s.insert(0, 'E');
            if self.lmtp {
                // LMTP has no "ELMTP" form in the wild; the E is folded away,
                // matching common MTA logging conventions.
                s = "LMTP".to_string();
            }
        }
        if self.secure {
            s.push('S');
        }
        if self.user.is_some() {
            s.push('A');
        }
        s
    }

    /// Reset the envelope (HELO/EHLO/LHLO, RSET, successful DATA
    /// completion, XCLIENT ADDR override). Does not touch `user`,
    /// `secure`, or `transaction`.
    pub fn reset_envelope(&mut self) {
        self.envelope = Envelope::default();
    }

    pub fn client_hostname_or_literal(&self) -> String {
        self.client_hostname
            .clone()
            .unwrap_or_else(|| format!("[{}]", self.remote_address))
    }

    /// Record the failure reply last sent, for logging.
    pub fn record_error(&mut self, reply: &Reply) {
        self.error = Some(reply.to_string());
    }
}

/// Strip an `::ffff:a.b.c.d` IPv4-mapped prefix and otherwise pass the
/// address through unchanged. Used by `Session::new` for the initial peer
/// address and by XCLIENT's `ADDR=` override, which bypasses `Session::new`.
pub(crate) fn normalize_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        other => other,
    }
}

/// Base32 (unpadded) of ~10 random bytes, lowercased for case-insensitive
/// comparison.
fn generate_session_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn session() -> Session {
        Session::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            25,
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
            5555,
            false,
        )
    }

    #[test]
    fn transmission_type_starts_smtp() {
        assert_eq!(session().transmission_type(), "SMTP");
    }

    #[test]
    fn transmission_type_adds_e_s_a() {
        let mut s = session();
        s.opening_command = Some(OpeningCommand::Ehlo);
        s.secure = true;
        s.user = Some("alice".into());
        assert_eq!(s.transmission_type(), "ESMTPSA");
    }

    #[test]
    fn ipv4_mapped_ipv6_is_stripped() {
        let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        let s = Session::new(mapped, 25, mapped, 10, false);
        assert_eq!(s.remote_address.to_string(), "192.0.2.1");
    }

    #[test]
    fn recipient_dedup_keeps_position_of_first_occurrence() {
        let mut env = Envelope::default();
        env.push_recipient(EnvelopeAddress {
            address: "a@x".into(),
            args: Default::default(),
        });
        env.push_recipient(EnvelopeAddress {
            address: "b@y".into(),
            args: Default::default(),
        });
        env.push_recipient(EnvelopeAddress {
            address: "A@X".into(),
            args: Default::default(),
        });
        assert_eq!(env.rcpt_to.len(), 2);
        assert_eq!(env.rcpt_to[0].address, "A@X");
        assert_eq!(env.rcpt_to[1].address, "b@y");
    }

    #[test]
    fn session_id_is_lowercase_base32() {
        let s = session();
        assert!(s.id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(!s.id.is_empty());
    }
}
