use std::borrow::Cow;
use std::fmt::Display;

/// An SMTP response: a three-digit code, an optional enhanced status code
/// (RFC 3463), and free-form text. [`Display`] renders the RFC 5321
/// multi-line convention: every line but the last is `CODE-text`, the last is
/// `CODE text`.
#[derive(Debug, Clone)]
pub struct Reply {
    code: u16,
    ecode: Option<EnhancedCode>,
    text: Cow<'static, str>,
}

impl Reply {
    pub fn new_checked<S: Into<Cow<'static, str>>>(
        code: u16,
        ecode: Option<EnhancedCode>,
        text: S,
    ) -> Option<Self> {
        let text = text.into();
        if !(200..600).contains(&code) || text.contains('\r') {
            return None;
        }
        Some(Reply { code, ecode, text })
    }

    pub fn new<S: Into<Cow<'static, str>>>(code: u16, ecode: Option<EnhancedCode>, text: S) -> Self {
        Self::new_checked(code, ecode, text).expect("invalid code or CR in reply text")
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    // -- Generic successes ---------------------------------------------

    pub fn ok() -> Self {
        Self::new(250, None, "OK")
    }

    pub fn ok_with<S: Into<Cow<'static, str>>>(text: S) -> Self {
        Self::new(250, None, text)
    }

    pub fn help() -> Self {
        Self::new(214, None, "See RFC 5321")
    }

    pub fn goodbye() -> Self {
        Self::new(221, None, "Bye")
    }

    pub fn cannot_vrfy() -> Self {
        Self::new(252, None, "Cannot VRFY user, but will accept message and attempt delivery")
    }

    pub fn auth_succeeded() -> Self {
        Self::new(235, None, "Authentication succeeded")
    }

    pub fn start_mail_input() -> Self {
        Self::new(354, None, "Start mail input; end with <CRLF>.<CRLF>")
    }

    // -- Standard failure replies -----------------------------------------

    pub fn syntax_error() -> Self {
        Self::new(500, None, "Syntax error, command unrecognized")
    }

    pub fn param_syntax_error() -> Self {
        Self::new(501, None, "Syntax error in parameters or arguments")
    }

    pub fn not_implemented() -> Self {
        Self::new(502, None, "Command not implemented")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, None, "Bad sequence of commands")
    }

    pub fn no_mail_transaction() -> Self {
        Self::new(503, None, "No mail transaction in progress")
    }

    pub fn auth_mechanism_unknown() -> Self {
        Self::new(504, None, "Unrecognized authentication type")
    }

    pub fn auth_required() -> Self {
        Self::new(530, None, "Authentication required")
    }

    pub fn requiretls_without_tls() -> Self {
        Self::new(530, None, "REQUIRETLS not permitted on a non-TLS connection")
    }

    pub fn auth_failed() -> Self {
        Self::new(535, None, "Authentication credentials invalid")
    }

    pub fn starttls_required() -> Self {
        Self::new(538, None, "Must issue a STARTTLS command first")
    }

    pub fn policy_rejected<S: Into<Cow<'static, str>>>(text: S) -> Self {
        Self::new(550, None, text)
    }

    pub fn no_valid_recipients() -> Self {
        Self::new(554, None, "No valid recipients")
    }

    pub fn size_exceeded() -> Self {
        Self::new(552, None, "Message size exceeds fixed maximum message size")
    }

    pub fn connect_rejected<S: Into<Cow<'static, str>>>(text: S) -> Self {
        Self::new(554, None, text)
    }

    // -- Shutdown / admission --------------------------------------------

    pub fn shutting_down() -> Self {
        Self::new(421, None, "Server shutting down")
    }

    pub fn timed_out() -> Self {
        Self::new(421, None, "Timeout waiting for input")
    }

    pub fn too_many_clients() -> Self {
        Self::new(421, None, "Too many concurrent connections")
    }

    pub fn too_many_unrecognised() -> Self {
        Self::new(421, None, "Too many unrecognized commands")
    }

    pub fn too_many_unauthenticated() -> Self {
        Self::new(421, None, "Too many unauthenticated commands")
    }

    pub fn early_talker() -> Self {
        Self::new(421, None, "Protocol violation: client spoke before being spoken to")
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut lines_iter = self.text.lines().peekable();

        loop {
            let line = match (lines_iter.next(), lines_iter.peek()) {
                (Some(line), Some(_)) => {
                    write!(fmt, "{}-", self.code)?;
                    line
                }
                (Some(line), None) => {
                    write!(fmt, "{} ", self.code)?;
                    line
                }
                (None, _) => break,
            };

            if let Some(ecode) = &self.ecode {
                write!(fmt, "{} ", ecode)?;
            }

            writeln!(fmt, "{}\r", line)?;
        }

        Ok(())
    }
}

/// RFC 3463 enhanced status code (`class.subject.detail`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedCode(pub u8, pub u16, pub u16);

impl Display for EnhancedCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.0, self.1, self.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_reply_uses_space_separator() {
        let reply = Reply::ok();
        assert_eq!(reply.to_string(), "250 OK\r\n");
    }

    #[test]
    fn multiline_reply_uses_dash_then_space() {
        let reply = Reply::new(250, None, "hello\nPIPELINING\nSTARTTLS");
        assert_eq!(reply.to_string(), "250-hello\r\n250-PIPELINING\r\n250 STARTTLS\r\n");
    }

    #[test]
    fn rejects_cr_in_text() {
        assert!(Reply::new_checked(250, None, "bad\rtext").is_none());
    }

    #[test]
    fn rejects_out_of_range_code() {
        assert!(Reply::new_checked(199, None, "x").is_none());
        assert!(Reply::new_checked(600, None, "x").is_none());
    }

    #[test]
    fn enhanced_code_is_prefixed_per_line() {
        let reply = Reply::new(250, Some(EnhancedCode(2, 1, 0)), "OK");
        assert_eq!(reply.to_string(), "250 2.1.0 OK\r\n");
    }
}
