//! Address and extension-parameter parsing for `MAIL FROM:<addr> K=V …` and
//! `RCPT TO:<addr> K=V …`.
//!
//! A generic RFC 5321 grammar crate buys little here: its parse tree is
//! silent on extension-parameter semantics anyway, and xtext decoding, IDN,
//! and the specific DSN/SIZE/BODY/SMTPUTF8/REQUIRETLS vocabulary are policy
//! this crate owns outright. Rather than pull in a grammar dependency whose
//! surface we'd only partially use, this module (and the EHLO/HELO domain
//! argument in `server.rs`) works directly from the raw post-verb text.

use std::collections::BTreeMap;

use crate::error::AddressError;

/// One extension parameter's value: a bare flag (`SMTPUTF8`) or a decoded
/// `KEY=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Flag,
    Value(String),
}

impl ParamValue {
    pub fn as_value(&self) -> Option<&str> {
        match self {
            ParamValue::Value(v) => Some(v),
            ParamValue::Flag => None,
        }
    }
}

/// The parsed result of a `MAIL FROM` or `RCPT TO` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    /// Empty string represents `<>`, the null reverse path (MAIL FROM only).
    pub address: String,
    pub args: BTreeMap<String, ParamValue>,
}

impl ParsedAddress {
    /// Case-insensitive address used for RCPT TO de-duplication.
    pub fn dedup_key(&self) -> String {
        self.address.to_ascii_lowercase()
    }
}

/// Parse a `MAIL FROM:<path> [params...]` line (verb and colon already
/// known to be present by the caller's command-table lookup, but re-checked
/// here since this module owns the whole parsing algorithm).
pub fn parse_mail_from(line: &str) -> Result<ParsedAddress, AddressError> {
    parse(line, "MAIL FROM", true)
}

/// Parse a `RCPT TO:<path> [params...]` line. The empty path `<>` is
/// rejected here; it is only meaningful as a null reverse path on MAIL FROM.
pub fn parse_rcpt_to(line: &str) -> Result<ParsedAddress, AddressError> {
    parse(line, "RCPT TO", false)
}

fn parse(line: &str, verb: &str, allow_empty: bool) -> Result<ParsedAddress, AddressError> {
    let (prefix, rest) = line.split_once(':').ok_or(AddressError::VerbMismatch)?;
    if !prefix.trim().eq_ignore_ascii_case(verb) {
        return Err(AddressError::VerbMismatch);
    }

    let rest = rest.trim_start();
    let (raw_address, tail) = take_angle_address(rest)?;

    if raw_address.is_empty() && !allow_empty {
        return Err(AddressError::EmptyAddressNotAllowed);
    }

    let address = if raw_address.is_empty() {
        String::new()
    } else {
        apply_idn(&raw_address)
    };

    let args = parse_params(tail)?;

    Ok(ParsedAddress { address, args })
}

/// Consume a leading `<...>` token, returning its (unescaped) contents and
/// the remaining text.
fn take_angle_address(text: &str) -> Result<(String, &str), AddressError> {
    let text = text.trim_start();
    if !text.starts_with('<') {
        return Err(AddressError::MissingAddress);
    }
    let end = text.find('>').ok_or(AddressError::MissingAddress)?;
    let addr = &text[1..end];
    Ok((addr.to_string(), text[end + 1..].trim_start()))
}

/// Tokenize and xtext-decode the parameter tail (`KEY` / `KEY=VALUE` tokens
/// separated by whitespace).
fn parse_params(tail: &str) -> Result<BTreeMap<String, ParamValue>, AddressError> {
    let mut args = BTreeMap::new();
    for token in tail.split_ascii_whitespace() {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k.to_ascii_uppercase(), Some(xtext_decode(v)?)),
            None => (token.to_ascii_uppercase(), None),
        };
        args.insert(key, value.map_or(ParamValue::Flag, ParamValue::Value));
    }
    Ok(args)
}

/// Decode xtext: every `+HH` (hex pair) becomes the corresponding byte;
/// everything else is copied through literally.
pub fn xtext_decode(s: &str) -> Result<String, AddressError> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'+' {
            let hex = bytes.get(i + 1..i + 3).ok_or(AddressError::BadXtext)?;
            let hex_str = std::str::from_utf8(hex).map_err(|_| AddressError::BadXtext)?;
            let byte = u8::from_str_radix(hex_str, 16).map_err(|_| AddressError::BadXtext)?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| AddressError::BadXtext)
}

/// Apply IDN (punycode → Unicode) to the domain half of `addr@domain`
/// . Addresses without an `@` (rare but not our business to
/// reject here) pass through unchanged. Decoding is per-label (each
/// dot-separated domain label that carries an `xn--` ACE prefix is
/// Punycode-decoded on its own); a label that fails to decode degrades
/// gracefully by keeping its raw ASCII form.
fn apply_idn(address: &str) -> String {
    let Some(at) = address.rfind('@') else {
        return address.to_string();
    };
    let (local, domain) = address.split_at(at);
    let domain = &domain[1..];

    let labels: Vec<String> = domain
        .split('.')
        .map(|label| match label.strip_prefix("xn--") {
            Some(ace) => match idna::punycode::decode_to_string(ace) {
                Some(decoded) => decoded,
                None => {
                    tracing::debug!(label, "IDN label decode failed, keeping ASCII form");
                    label.to_string()
                }
            },
            None => label.to_string(),
        })
        .collect();

    format!("{local}@{}", labels.join("."))
}

/// Validate the DSN `NOTIFY` parameter value: a comma-separated
/// subset of `{NEVER, SUCCESS, FAILURE, DELAY}`, where `NEVER` must appear
/// alone.
pub fn validate_notify(value: &str) -> bool {
    let values: Vec<&str> = value.split(',').collect();
    if values.iter().any(|v| v.eq_ignore_ascii_case("NEVER")) {
        return values.len() == 1;
    }
    values
        .iter()
        .all(|v| matches!(v.to_ascii_uppercase().as_str(), "SUCCESS" | "FAILURE" | "DELAY"))
        && !values.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_mail_from() {
        let parsed = parse_mail_from("MAIL FROM:<a@x>").unwrap();
        assert_eq!(parsed.address, "a@x");
        assert!(parsed.args.is_empty());
    }

    #[test]
    fn null_reverse_path_allowed_for_mail_from() {
        let parsed = parse_mail_from("MAIL FROM:<>").unwrap();
        assert_eq!(parsed.address, "");
    }

    #[test]
    fn null_reverse_path_rejected_for_rcpt_to() {
        assert_eq!(parse_rcpt_to("RCPT TO:<>"), Err(AddressError::EmptyAddressNotAllowed));
    }

    #[test]
    fn parses_flags_and_kv_params() {
        let parsed = parse_mail_from("MAIL FROM:<a@x> BODY=8BITMIME SMTPUTF8 SIZE=12345").unwrap();
        assert_eq!(parsed.args.get("BODY"), Some(&ParamValue::Value("8BITMIME".into())));
        assert_eq!(parsed.args.get("SMTPUTF8"), Some(&ParamValue::Flag));
        assert_eq!(parsed.args.get("SIZE").and_then(ParamValue::as_value), Some("12345"));
    }

    #[test]
    fn verb_mismatch_is_rejected() {
        assert_eq!(parse_mail_from("RCPT TO:<a@x>"), Err(AddressError::VerbMismatch));
    }

    #[test]
    fn missing_address_is_rejected() {
        assert_eq!(parse_mail_from("MAIL FROM: BODY=8BITMIME"), Err(AddressError::MissingAddress));
    }

    #[test]
    fn xtext_decodes_hex_escapes() {
        assert_eq!(xtext_decode("foo+2Bbar").unwrap(), "foo+bar");
        assert_eq!(xtext_decode("plain").unwrap(), "plain");
        assert!(xtext_decode("bad+Z").is_err());
    }

    #[test]
    fn notify_never_must_be_alone() {
        assert!(validate_notify("NEVER"));
        assert!(!validate_notify("NEVER,SUCCESS"));
        assert!(validate_notify("SUCCESS,FAILURE"));
        assert!(!validate_notify("BOGUS"));
    }

    #[test]
    fn dedup_key_is_lowercased() {
        let parsed = parse_rcpt_to("RCPT TO:<Alice@Example.COM>").unwrap();
        assert_eq!(parsed.dedup_key(), "alice@example.com");
    }

    #[test]
    fn idn_domain_label_decodes_to_unicode() {
        let parsed = parse_mail_from("MAIL FROM:<user@xn--mnchen-3ya.de>").unwrap();
        assert_eq!(parsed.address, "user@münchen.de");
    }

    #[test]
    fn non_ace_domain_labels_pass_through_unchanged() {
        let parsed = parse_mail_from("MAIL FROM:<user@example.com>").unwrap();
        assert_eq!(parsed.address, "user@example.com");
    }
}
