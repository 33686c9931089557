//! SASL sub-protocols used by `AUTH`: PLAIN, LOGIN, XOAUTH2, CRAM-MD5.
//!
//! Each mechanism is a short scripted exchange keyed by server-issued `334`
//! continuations. The state carried between lines of one exchange lives in
//! [`AuthExchange`], which the connection state machine stores as its
//! `NextAction::Authenticating` slot: the next command-mode line gets routed
//! back into `continue_exchange` instead of being parsed as a verb.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md_5::Md5;
use rand::RngCore;

type HmacMd5 = Hmac<Md5>;

/// A SASL mechanism this server can offer via `AUTH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaslMechanism {
    Plain,
    Login,
    XOauth2,
    CramMd5,
    /// Not a real SASL mechanism: tags an `AuthRequest` synthesized from an
    /// `XCLIENT LOGIN=` token, where the upstream MTA asserts an identity
    /// rather than the client proving one. Never returned by `from_name`, so
    /// a client cannot select it via `AUTH`, and never placed in
    /// `Config::auth_methods`, so it is never advertised on `EHLO`.
    XClient,
}

impl SaslMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::Login => "LOGIN",
            SaslMechanism::XOauth2 => "XOAUTH2",
            SaslMechanism::CramMd5 => "CRAM-MD5",
            SaslMechanism::XClient => "XCLIENT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "PLAIN" => Some(SaslMechanism::Plain),
            "LOGIN" => Some(SaslMechanism::Login),
            "XOAUTH2" => Some(SaslMechanism::XOauth2),
            "CRAM-MD5" => Some(SaslMechanism::CramMd5),
            _ => None,
        }
    }

    /// Whether this mechanism transmits the bare credential and therefore
    /// should not be offered (or accepted) outside TLS unless the embedder
    /// has explicitly opted in via `allow_insecure_auth`.
    pub fn requires_tls(&self) -> bool {
        !matches!(self, SaslMechanism::CramMd5 | SaslMechanism::XClient)
    }
}

impl std::fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything the core learned about one `AUTH` attempt, handed to
/// `Handler::on_auth` for credential verification. The core never holds a
/// user database; it only shapes this request and, for CRAM-MD5, offers
/// [`AuthRequest::verify_cram_md5`] since verifying that mechanism requires
/// the challenge text the core alone possesses.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub method: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
    pub access_token: Option<String>,
    pub challenge: Option<String>,
    pub challenge_response: Option<String>,
}

impl AuthRequest {
    /// For CRAM-MD5: compute `HMAC-MD5(password, challenge)` in lowercase hex
    /// and compare case-insensitively to the client's response. Meaningless
    /// (always `false`) for other mechanisms, which carry the credential
    /// directly instead of a challenge response.
    pub fn verify_cram_md5(&self, password: &str) -> bool {
        let (Some(challenge), Some(response)) = (&self.challenge, &self.challenge_response) else {
            return false;
        };
        let Ok(mut mac) = HmacMd5::new_from_slice(password.as_bytes()) else {
            return false;
        };
        mac.update(challenge.as_bytes());
        let expected = data_encoding::HEXLOWER.encode(&mac.finalize().into_bytes());
        expected.eq_ignore_ascii_case(response)
    }
}

/// Outcome of a successful or failed `on_auth` call.
#[derive(Debug, Clone, Default)]
pub struct AuthOutcome {
    /// Opaque identity to store as `Session::user` on success.
    pub user: Option<String>,
    /// Extra base64 payload to surface in a `334` continuation (used by the
    /// XOAUTH2 failure path, which must offer one more continuation before
    /// the final `535`).
    pub data: Option<String>,
    /// Replaces the default reply text.
    pub message: Option<String>,
    /// Replaces the default reply code (`235` success / `535` failure).
    pub response_code: Option<u16>,
}

impl AuthOutcome {
    pub fn accept(user: impl Into<String>) -> Self {
        AuthOutcome {
            user: Some(user.into()),
            ..Default::default()
        }
    }

    pub fn reject() -> Self {
        AuthOutcome::default()
    }
}

/// Result of feeding one more line into an in-progress exchange.
pub enum SaslStep {
    /// Send this `334` continuation and keep `AuthExchange` around for the
    /// next line.
    Continue(String, AuthExchange),
    /// The exchange is complete; dispatch `AuthRequest` to `on_auth`.
    Done(AuthRequest),
    /// The client aborted (`*`) or sent unparsable base64/structure.
    Abort { response_code: u16 },
}

/// Mid-exchange state for a multi-step SASL mechanism. Lives in the
/// connection's `NextAction` slot between command-mode lines.
#[derive(Debug, Clone)]
pub enum AuthExchange {
    /// PLAIN or XOAUTH2 with no initial response: the single token is still
    /// to come.
    PlainAwaitingToken,
    LoginAwaitingUsername,
    LoginAwaitingPassword { username: String },
    CramMd5 { challenge: String },
}

/// Generate the CRAM-MD5 challenge text `<nonce.timestamp@hostname>`,
/// base64-encoded for the `334` continuation. `nonce` is caller-supplied
/// randomness so the function itself never touches the clock or an RNG,
/// keeping it trivially testable.
pub fn cram_md5_challenge(hostname: &str, nonce: u64) -> (String, String) {
    let challenge = format!("<{nonce:016x}@{hostname}>");
    let encoded = BASE64.encode(challenge.as_bytes());
    (challenge, encoded)
}

/// Draw a fresh nonce for a CRAM-MD5 challenge.
pub fn random_nonce() -> u64 {
    rand::thread_rng().next_u64()
}

/// Begin a SASL exchange. `initial_response` is the optional
/// `AUTH <mech> <initial-response>` trailing token already present on the
/// command line (RFC 4954 §4).
pub fn start(mechanism: SaslMechanism, initial_response: Option<&str>, hostname: &str) -> Result<SaslStep, u16> {
    match mechanism {
        SaslMechanism::Plain => match initial_response {
            Some(token) => decode_plain(token).map(SaslStep::Done),
            None => Ok(SaslStep::Continue(String::new(), AuthExchange::PlainAwaitingToken)),
        },
        SaslMechanism::Login => match initial_response {
            Some(token) => {
                let username = decode_base64_utf8(token)?;
                Ok(SaslStep::Continue(
                    BASE64.encode("Password:"),
                    AuthExchange::LoginAwaitingPassword { username },
                ))
            }
            None => Ok(SaslStep::Continue(
                BASE64.encode("Username:"),
                AuthExchange::LoginAwaitingUsername,
            )),
        },
        SaslMechanism::XOauth2 => match initial_response {
            Some(token) => decode_xoauth2(token).map(SaslStep::Done),
            None => Ok(SaslStep::Continue(String::new(), AuthExchange::PlainAwaitingToken)),
        },
        SaslMechanism::CramMd5 => {
            if initial_response.is_some() {
                // CRAM-MD5 never takes an initial response.
                return Err(501);
            }
            let (challenge, encoded) = cram_md5_challenge(hostname, random_nonce());
            Ok(SaslStep::Continue(encoded, AuthExchange::CramMd5 { challenge }))
        }
    }
}

/// Feed the client's next line into an in-progress exchange.
pub fn continue_exchange(state: AuthExchange, line: &str, mechanism: SaslMechanism) -> SaslStep {
    if line.trim() == "*" {
        return SaslStep::Abort { response_code: 501 };
    }

    match (mechanism, state) {
        (SaslMechanism::Plain, AuthExchange::PlainAwaitingToken) => match decode_plain(line) {
            Ok(req) => SaslStep::Done(req),
            Err(code) => SaslStep::Abort { response_code: code },
        },
        (SaslMechanism::XOauth2, AuthExchange::PlainAwaitingToken) => match decode_xoauth2(line) {
            Ok(req) => SaslStep::Done(req),
            Err(code) => SaslStep::Abort { response_code: code },
        },
        (SaslMechanism::Login, AuthExchange::LoginAwaitingUsername) => match decode_base64_utf8(line) {
            Ok(username) => SaslStep::Continue(
                BASE64.encode("Password:"),
                AuthExchange::LoginAwaitingPassword { username },
            ),
            Err(code) => SaslStep::Abort { response_code: code },
        },
        (SaslMechanism::Login, AuthExchange::LoginAwaitingPassword { username }) => {
            match decode_base64_utf8(line) {
                Ok(password) => SaslStep::Done(AuthRequest {
                    method: SaslMechanism::Login,
                    username: Some(username),
                    password: Some(password),
                    access_token: None,
                    challenge: None,
                    challenge_response: None,
                }),
                Err(code) => SaslStep::Abort { response_code: code },
            }
        }
        (SaslMechanism::CramMd5, AuthExchange::CramMd5 { challenge }) => {
            let decoded = match decode_base64_utf8(line) {
                Ok(d) => d,
                Err(code) => return SaslStep::Abort { response_code: code },
            };
            let mut parts = decoded.splitn(2, ' ');
            let (Some(username), Some(response)) = (parts.next(), parts.next()) else {
                return SaslStep::Abort { response_code: 500 };
            };
            SaslStep::Done(AuthRequest {
                method: SaslMechanism::CramMd5,
                username: Some(username.to_string()),
                password: None,
                access_token: None,
                challenge: Some(challenge),
                challenge_response: Some(response.to_string()),
            })
        }
        _ => SaslStep::Abort { response_code: 500 },
    }
}

fn decode_base64_utf8(token: &str) -> Result<String, u16> {
    let bytes = BASE64.decode(token.trim()).map_err(|_| 500u16)?;
    String::from_utf8(bytes).map_err(|_| 500u16)
}

fn decode_plain(token: &str) -> Result<AuthRequest, u16> {
    let bytes = BASE64.decode(token.trim()).map_err(|_| 500u16)?;
    let mut fields = bytes.split(|b| *b == 0);
    let _authzid = fields.next().ok_or(500u16)?;
    let authcid = fields.next().ok_or(500u16)?;
    let passwd = fields.next().ok_or(500u16)?;
    if fields.next().is_some() {
        return Err(500);
    }
    Ok(AuthRequest {
        method: SaslMechanism::Plain,
        username: Some(String::from_utf8(authcid.to_vec()).map_err(|_| 500u16)?),
        password: Some(String::from_utf8(passwd.to_vec()).map_err(|_| 500u16)?),
        access_token: None,
        challenge: None,
        challenge_response: None,
    })
}

fn decode_xoauth2(token: &str) -> Result<AuthRequest, u16> {
    let decoded = decode_base64_utf8(token)?;
    let mut user = None;
    let mut bearer = None;
    for field in decoded.split('\x01') {
        if let Some(rest) = field.strip_prefix("user=") {
            user = Some(rest.to_string());
        } else if let Some(rest) = field.strip_prefix("auth=Bearer ") {
            bearer = Some(rest.to_string());
        }
    }
    Ok(AuthRequest {
        method: SaslMechanism::XOauth2,
        username: user,
        password: None,
        access_token: bearer,
        challenge: None,
        challenge_response: None,
    })
}

/// Build the base64 failure payload XOAUTH2 sends via one more `334` before
/// the mandatory client `*` and the final `535`.
pub fn xoauth2_failure_payload(status: &str) -> String {
    let json = format!(r#"{{"status":"401","schemes":"bearer","scope":"{status}"}}"#);
    BASE64.encode(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_initial_response_decodes() {
        let token = BASE64.encode(b"\0alice\0hunter2");
        let step = start(SaslMechanism::Plain, Some(&token), "mx.example").unwrap();
        match step {
            SaslStep::Done(req) => {
                assert_eq!(req.username.as_deref(), Some("alice"));
                assert_eq!(req.password.as_deref(), Some("hunter2"));
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn plain_star_aborts() {
        let step = continue_exchange(AuthExchange::PlainAwaitingToken, "*", SaslMechanism::Plain);
        assert!(matches!(step, SaslStep::Abort { response_code: 501 }));
    }

    #[test]
    fn login_two_step_prompts() {
        let step = start(SaslMechanism::Login, None, "mx.example").unwrap();
        let (prompt, state) = match step {
            SaslStep::Continue(p, s) => (p, s),
            _ => panic!("expected Continue"),
        };
        assert_eq!(prompt, BASE64.encode("Username:"));

        let user_token = BASE64.encode(b"bob");
        let step2 = continue_exchange(state, &user_token, SaslMechanism::Login);
        let (prompt2, state2) = match step2 {
            SaslStep::Continue(p, s) => (p, s),
            _ => panic!("expected Continue"),
        };
        assert_eq!(prompt2, BASE64.encode("Password:"));

        let pass_token = BASE64.encode(b"s3cret");
        let step3 = continue_exchange(state2, &pass_token, SaslMechanism::Login);
        match step3 {
            SaslStep::Done(req) => {
                assert_eq!(req.username.as_deref(), Some("bob"));
                assert_eq!(req.password.as_deref(), Some("s3cret"));
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn cram_md5_verifies_hmac() {
        let challenge = "<123.456@mx.example>".to_string();
        let mut mac = HmacMd5::new_from_slice(b"hunter2").unwrap();
        mac.update(challenge.as_bytes());
        let digest = data_encoding::HEXLOWER.encode(&mac.finalize().into_bytes());

        let req = AuthRequest {
            method: SaslMechanism::CramMd5,
            username: Some("alice".into()),
            password: None,
            access_token: None,
            challenge: Some(challenge),
            challenge_response: Some(digest.to_ascii_uppercase()),
        };

        assert!(req.verify_cram_md5("hunter2"));
        assert!(!req.verify_cram_md5("wrong"));
    }

    #[test]
    fn xoauth2_parses_user_and_bearer() {
        let token = BASE64.encode("user=alice@example.com\x01auth=Bearer abc123\x01\x01");
        let step = start(SaslMechanism::XOauth2, Some(&token), "mx.example").unwrap();
        match step {
            SaslStep::Done(req) => {
                assert_eq!(req.username.as_deref(), Some("alice@example.com"));
                assert_eq!(req.access_token.as_deref(), Some("abc123"));
            }
            _ => panic!("expected Done"),
        }
    }
}
