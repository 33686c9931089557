//! Connection State Machine: per-connection command dispatch, extension
//! advertisement, the MAIL/RCPT/DATA transaction lifecycle, SASL
//! continuation routing, STARTTLS, XCLIENT/XFORWARD, and the abuse counters.
//!
//! One `match` arm per verb over a small persistent state struct, with
//! stream-based DATA reception, dispatching to the full verb table and
//! handler surface below.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, Sleep};
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;

use crate::address::{self, ParamValue};
use crate::config::Config;
use crate::error::{AddressError, ServerError};
use crate::frame::{Frame, SmtpCodec};
use crate::reply::Reply;
use crate::sasl::{self, AuthExchange, AuthOutcome, AuthRequest, SaslMechanism, SaslStep};
use crate::session::{normalize_ip, EnvelopeAddress, OpeningCommand, Session, TlsInfo};

/// The shape every handler callback returns: `Ok` accepts (an optional reply
/// overriding the default success text), `Err` rejects (an optional reply
/// overriding the default failure text).
pub type HandlerResult = Result<Option<Reply>, Option<Reply>>;

/// Outcome of `Handler::on_data`: a single SMTP
/// response, or one outcome per recipient for LMTP. A `Single` outcome under
/// LMTP broadcasts to every recipient.
#[derive(Debug)]
pub enum DataOutcome {
    Single(HandlerResult),
    PerRecipient(Vec<HandlerResult>),
}

/// The DATA-phase body as the handler sees it: already dot-unstuffed,
/// exposing byte count and whether the configured size cap was exceeded
/// once fully drained.
pub trait BodyStream: Stream<Item = std::io::Result<Bytes>> + Unpin + Send {
    fn byte_length(&self) -> u64;
    fn size_exceeded(&self) -> bool;
}

struct DataChunks<'a, S> {
    framed: &'a mut Framed<S, SmtpCodec>,
    byte_length: u64,
    size_exceeded: bool,
    done: bool,
    /// Set once the idle timer (reset on every chunk) fires mid-DATA.
    timed_out: bool,
    idle_timeout: Duration,
    idle_timer: Pin<Box<Sleep>>,
}

impl<'a, S> DataChunks<'a, S> {
    fn new(framed: &'a mut Framed<S, SmtpCodec>, idle_timeout: Duration) -> Self {
        DataChunks {
            framed,
            byte_length: 0,
            size_exceeded: false,
            done: false,
            timed_out: false,
            idle_timeout,
            idle_timer: Box::pin(tokio::time::sleep(idle_timeout)),
        }
    }

    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<'a, S> BodyStream for DataChunks<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn byte_length(&self) -> u64 {
        self.byte_length
    }

    fn size_exceeded(&self) -> bool {
        self.size_exceeded
    }
}

impl<'a, S> Stream for DataChunks<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut *this.framed).poll_next(cx) {
            Poll::Ready(Some(Ok(Frame::DataChunk(bytes)))) => {
                this.byte_length += bytes.len() as u64;
                this.idle_timer.as_mut().reset(Instant::now() + this.idle_timeout);
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Ok(Frame::DataComplete(result)))) => {
                this.size_exceeded = result.size_exceeded;
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(Frame::Command(_)))) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => match this.idle_timer.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.done = true;
                    this.timed_out = true;
                    Poll::Ready(Some(Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout during DATA"))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// The collaborator surface an embedder implements, one instance per
/// connection.
#[async_trait]
pub trait Handler: Send {
    async fn on_connect(&mut self, session: &Session) -> HandlerResult;
    async fn on_auth(&mut self, request: AuthRequest, session: &Session) -> AuthOutcome;
    async fn on_mail_from(&mut self, address: &EnvelopeAddress, session: &Session) -> HandlerResult;
    async fn on_rcpt_to(&mut self, address: &EnvelopeAddress, session: &Session) -> HandlerResult;
    async fn on_data<S>(&mut self, body: &mut S, session: &Session) -> DataOutcome
    where
        S: BodyStream;
    async fn on_secure(&mut self, session: &Session);
    async fn on_close(&mut self, session: &Session);
    /// Whether to honour a `STARTTLS` request right now. The TLS context
    /// itself (certificate/SNI selection) lives on the supervisor, not the
    /// handler; this is purely a policy gate.
    async fn tls_request(&mut self, session: &Session) -> bool;

    /// Reverse-DNS lookup of the peer address, run during the greeting
    /// phase under a 1.5s cap. The default does no lookup, which
    /// leaves `Session::client_hostname` unset and greetings fall back to
    /// the bracketed literal.
    async fn reverse_lookup(&mut self, _addr: IpAddr) -> Vec<String> {
        Vec::new()
    }
}

/// A recognized (or not) command line, tokenized on the first whitespace run
/// . `MailFrom`/`RcptTo` carry the whole original line since the
/// Address-Command Parser re-validates the verb prefix itself.
#[derive(Debug, Clone)]
enum Command {
    Ehlo(String),
    Helo(String),
    Lhlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Bdat(u64, bool),
    Rset,
    Noop,
    Vrfy,
    Expn,
    Help,
    Quit,
    StartTls,
    Auth(String),
    XClient(String),
    XForward(String),
    Unknown(String),
}

impl Command {
    fn verb(&self) -> &'static str {
        match self {
            Command::Ehlo(_) => "EHLO",
            Command::Helo(_) => "HELO",
            Command::Lhlo(_) => "LHLO",
            Command::MailFrom(_) => "MAIL",
            Command::RcptTo(_) => "RCPT",
            Command::Data => "DATA",
            Command::Bdat(..) => "BDAT",
            Command::Rset => "RSET",
            Command::Noop => "NOOP",
            Command::Vrfy => "VRFY",
            Command::Expn => "EXPN",
            Command::Help => "HELP",
            Command::Quit => "QUIT",
            Command::StartTls => "STARTTLS",
            Command::Auth(_) => "AUTH",
            Command::XClient(_) => "XCLIENT",
            Command::XForward(_) => "XFORWARD",
            Command::Unknown(_) => "UNKNOWN",
        }
    }

    /// Gate 2: verbs that need `opening_command` to already be set.
    fn requires_greeting(&self) -> bool {
        matches!(
            self,
            Command::MailFrom(_) | Command::RcptTo(_) | Command::Data | Command::Auth(_) | Command::Bdat(..)
        )
    }

    /// Gate 3: verbs refused without a successful AUTH, unless
    /// `auth_optional`.
    fn requires_auth(&self) -> bool {
        matches!(self, Command::MailFrom(_) | Command::RcptTo(_) | Command::Data)
    }
}

fn parse_command(line: &str) -> Command {
    if line.is_empty() {
        return Command::Unknown(String::new());
    }
    let (verb, rest) = match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    };
    match verb.to_ascii_uppercase().as_str() {
        "EHLO" => Command::Ehlo(rest.to_string()),
        "HELO" => Command::Helo(rest.to_string()),
        "LHLO" => Command::Lhlo(rest.to_string()),
        "MAIL" => Command::MailFrom(line.to_string()),
        "RCPT" => Command::RcptTo(line.to_string()),
        "DATA" => Command::Data,
        "BDAT" => parse_bdat(rest),
        "RSET" => Command::Rset,
        "NOOP" => Command::Noop,
        "VRFY" => Command::Vrfy,
        "EXPN" => Command::Expn,
        "HELP" => Command::Help,
        "QUIT" => Command::Quit,
        "STARTTLS" => Command::StartTls,
        "AUTH" => Command::Auth(rest.to_string()),
        "XCLIENT" => Command::XClient(rest.to_string()),
        "XFORWARD" => Command::XForward(rest.to_string()),
        _ => Command::Unknown(line.to_string()),
    }
}

fn parse_bdat(rest: &str) -> Command {
    let mut parts = rest.split_ascii_whitespace();
    let size = parts.next().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
    let last = parts.next().is_some_and(|s| s.eq_ignore_ascii_case("LAST"));
    Command::Bdat(size, last)
}

fn address_error_reply(err: AddressError) -> Reply {
    match err {
        AddressError::EnvidTooLong => Reply::new(501, None, "ENVID exceeds configured maximum length"),
        AddressError::VerbMismatch
        | AddressError::MissingAddress
        | AddressError::EmptyAddressNotAllowed
        | AddressError::BadXtext
        | AddressError::BadParameter(_) => Reply::param_syntax_error(),
    }
}

/// Mid-exchange continuation state: the next command-mode line is routed
/// here instead of through [`parse_command`].
enum NextAction {
    None,
    Authenticating { mechanism: SaslMechanism, state: AuthExchange },
    /// XOAUTH2 failure path: one more `334` payload already sent, awaiting
    /// the client's mandatory `*` before the final `535`.
    AwaitingXoauth2Abort { response_code: u16, message: Option<String> },
}

/// What the connection loop decided after dispatching one command.
enum DispatchOutcome {
    Continue,
    Quit,
    StartTls,
}

/// Result of running a connection to completion or to a STARTTLS handoff
/// point. The supervisor performs the actual
/// handshake and re-invokes [`Connection::serve`] on the wrapped stream.
pub enum ConnectionExit<S> {
    Done,
    StartTls(S),
}

/// Per-connection state machine driver. One instance per accepted socket;
/// outlives STARTTLS upgrades (the supervisor keeps reusing it across calls
/// to [`Connection::serve`] with progressively wrapped stream types).
pub struct Connection<'a, H> {
    config: &'a Config,
    handler: &'a mut H,
    session: Session,
    next_action: NextAction,
    unrecognised_commands: u32,
    unauthenticated_commands: u32,
    /// Whether the greeting phase (reverse DNS, `on_connect`, the 220
    /// banner) has already run. `serve` may be called more than once on the
    /// same `Connection` across a STARTTLS handoff; the greeting must not
    /// repeat on the second call.
    greeted: bool,
    /// Cancelled by the supervisor's graceful-close deadline ; `None`
    /// when the connection is driven standalone, outside a `Server`.
    shutdown: Option<CancellationToken>,
}

impl<'a, H> Connection<'a, H>
where
    H: Handler,
{
    pub fn new(config: &'a Config, handler: &'a mut H, session: Session) -> Self {
        Connection {
            config,
            handler,
            session,
            next_action: NextAction::None,
            unrecognised_commands: 0,
            unauthenticated_commands: 0,
            greeted: false,
            shutdown: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Arm the token the supervisor cancels once its close deadline elapses
    /// . Re-armed by the supervisor after a STARTTLS handoff since
    /// `serve` is called again on the upgraded stream.
    pub fn set_shutdown(&mut self, token: CancellationToken) {
        self.shutdown = Some(token);
    }

    /// Record a completed TLS handshake.
    pub fn mark_secure(&mut self, tls_info: TlsInfo) {
        self.session.secure = true;
        self.session.tls_info = Some(tls_info);
    }

    /// Invoke `on_secure` after the supervisor completes a handshake,
    /// whether from implicit TLS at accept or a STARTTLS upgrade.
    pub async fn notify_secure(&mut self) {
        self.handler.on_secure(&self.session).await;
    }

    /// Wait on the supervisor's shutdown token, or forever if none is armed
    /// (a `Connection` driven standalone, without a `Server`).
    async fn wait_shutdown(token: &Option<CancellationToken>) {
        match token {
            Some(t) => t.cancelled().await,
            None => std::future::pending().await,
        }
    }

    /// Drive one socket (plain or already TLS-wrapped) until the peer
    /// closes, the idle timeout or supervisor shutdown fires, or a STARTTLS
    /// handoff is needed. May be called a second time, on the TLS-wrapped
    /// stream, after the caller performs a handshake in response to
    /// [`ConnectionExit::StartTls`]; the greeting does not repeat.
    pub async fn serve<S>(&mut self, socket: S) -> Result<ConnectionExit<S>, ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let span = tracing::info_span!("connection", session_id = %self.session.id);
        let _guard = span.enter();

        let mut framed = Framed::new(socket, SmtpCodec::new());

        if !self.greeted {
            if let Some(Some(Ok(_))) = framed.next().now_or_never() {
                tracing::warn!("client spoke before being spoken to");
                let _ = framed.send(Reply::early_talker()).await;
                self.handler.on_close(&self.session).await;
                return Ok(ConnectionExit::Done);
            }

            if !self.config.disable_reverse_lookup {
                let names = tokio::time::timeout(Duration::from_millis(1500), self.handler.reverse_lookup(self.session.remote_address))
                    .await
                    .unwrap_or_default();
                self.session.client_hostname = names.into_iter().next();
            }

            if let Err(reply) = self.handler.on_connect(&self.session).await {
                let reply = reply.unwrap_or_else(|| Reply::connect_rejected("Connection refused"));
                let _ = framed.send(reply).await;
                self.handler.on_close(&self.session).await;
                return Ok(ConnectionExit::Done);
            }

            let banner = match &self.config.banner {
                Some(extra) => format!("{} ESMTP ready\n{extra}", self.config.name),
                None => format!("{} ESMTP ready", self.config.name),
            };
            framed.send(Reply::new(220, None, banner)).await?;
            self.greeted = true;
        }

        let result = self.run_loop(framed).await;
        if !matches!(result, Ok(ConnectionExit::StartTls(_))) {
            self.handler.on_close(&self.session).await;
        }
        result
    }

    /// The command-dispatch loop proper, racing each next line against the
    /// idle timeout and the supervisor's shutdown signal.
    async fn run_loop<S>(&mut self, mut framed: Framed<S, SmtpCodec>) -> Result<ConnectionExit<S>, ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let line = tokio::select! {
                biased;
                _ = Self::wait_shutdown(&self.shutdown) => {
                    let _ = framed.send(Reply::shutting_down()).await;
                    return Ok(ConnectionExit::Done);
                }
                timed = tokio::time::timeout(self.config.socket_timeout, framed.next()) => {
                    match timed {
                        Err(_elapsed) => {
                            let _ = framed.send(Reply::timed_out()).await;
                            return Ok(ConnectionExit::Done);
                        }
                        Ok(Some(Ok(Frame::Command(bytes)))) => bytes,
                        Ok(Some(Ok(_))) => unreachable!("codec starts and remains in command mode between commands"),
                        Ok(Some(Err(e))) => return Err(ServerError::Io(e)),
                        Ok(None) => return Ok(ConnectionExit::Done),
                    }
                }
            };
            let text = String::from_utf8_lossy(&line).into_owned();

            match std::mem::replace(&mut self.next_action, NextAction::None) {
                NextAction::Authenticating { mechanism, state } => {
                    self.continue_auth(&mut framed, mechanism, state, &text).await?;
                    continue;
                }
                NextAction::AwaitingXoauth2Abort { response_code, message } => {
                    let text = message.unwrap_or_else(|| "Authentication credentials invalid".into());
                    framed.send(Reply::new(response_code, None, text)).await?;
                    continue;
                }
                NextAction::None => {}
            }

            if text.is_empty() && !self.config.count_empty_line_as_unrecognised {
                framed.send(Reply::syntax_error()).await?;
                continue;
            }

            let cmd = parse_command(&text);

            if matches!(cmd, Command::Unknown(_)) || self.config.command_disabled(cmd.verb()) {
                self.unrecognised_commands += 1;
                if self.unrecognised_commands > self.config.unrecognised_command_limit {
                    framed.send(Reply::too_many_unrecognised()).await?;
                    return Ok(ConnectionExit::Done);
                }
                framed.send(Reply::syntax_error()).await?;
                continue;
            }

            if cmd.requires_greeting() && self.session.opening_command.is_none() {
                framed.send(Reply::bad_sequence()).await?;
                continue;
            }

            // Every command but AUTH itself counts against the unauthenticated-command
            // budget while no user is set, independent of whether this particular verb
            // is gated by `auth_optional` below.
            if self.session.user.is_none() && !matches!(cmd, Command::Auth(_)) {
                self.unauthenticated_commands += 1;
                if self.unauthenticated_commands > self.config.unauthenticated_command_limit {
                    framed.send(Reply::too_many_unauthenticated()).await?;
                    return Ok(ConnectionExit::Done);
                }
            }

            if cmd.requires_auth() && self.session.user.is_none() && !self.config.auth_optional {
                framed.send(Reply::auth_required()).await?;
                continue;
            }

            match self.dispatch(&mut framed, cmd).await? {
                DispatchOutcome::Continue => {}
                DispatchOutcome::Quit => {
                    framed.flush().await?;
                    return Ok(ConnectionExit::Done);
                }
                DispatchOutcome::StartTls => {
                    framed.flush().await?;
                    let FramedParts { io, read_buf, .. } = framed.into_parts();
                    if !read_buf.is_empty() {
                        return Err(ServerError::Pipelining);
                    }
                    return Ok(ConnectionExit::StartTls(io));
                }
            }
        }
    }

    async fn dispatch<S>(&mut self, framed: &mut Framed<S, SmtpCodec>, cmd: Command) -> Result<DispatchOutcome, ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match cmd {
            Command::Ehlo(arg) => {
                let reply = self.do_hello(&arg, OpeningCommand::Ehlo, true);
                framed.send(reply).await?;
            }
            Command::Helo(arg) => {
                let reply = self.do_hello(&arg, OpeningCommand::Helo, false);
                framed.send(reply).await?;
            }
            Command::Lhlo(arg) => {
                let reply = if self.config.lmtp {
                    self.do_hello(&arg, OpeningCommand::Lhlo, true)
                } else {
                    Reply::syntax_error()
                };
                framed.send(reply).await?;
            }
            Command::MailFrom(line) => {
                let reply = self.do_mail_from(&line).await;
                framed.send(reply).await?;
            }
            Command::RcptTo(line) => {
                let reply = self.do_rcpt_to(&line).await;
                framed.send(reply).await?;
            }
            Command::Data => {
                self.do_data(framed).await?;
            }
            Command::Bdat(..) => {
                let reply = if self.config.lmtp {
                    Reply::new(503, None, "BDAT may not be used in LMTP mode")
                } else {
                    Reply::not_implemented()
                };
                framed.send(reply).await?;
            }
            Command::Rset => {
                self.session.reset_envelope();
                framed.send(Reply::ok()).await?;
            }
            Command::Noop => {
                framed.send(Reply::ok()).await?;
            }
            Command::Vrfy | Command::Expn => {
                framed.send(Reply::cannot_vrfy()).await?;
            }
            Command::Help => {
                framed.send(Reply::help()).await?;
            }
            Command::Quit => {
                framed.send(Reply::goodbye()).await?;
                return Ok(DispatchOutcome::Quit);
            }
            Command::StartTls => {
                return self.do_starttls(framed).await;
            }
            Command::Auth(args) => {
                self.do_auth(framed, &args).await?;
            }
            Command::XClient(args) => {
                let reply = self.do_xclient(&args).await;
                framed.send(reply).await?;
            }
            Command::XForward(args) => {
                let reply = self.do_xforward(&args);
                framed.send(reply).await?;
            }
            Command::Unknown(_) => unreachable!("filtered out before dispatch"),
        }
        Ok(DispatchOutcome::Continue)
    }

    fn do_hello(&mut self, arg: &str, kind: OpeningCommand, extended: bool) -> Reply {
        let host = arg.split_ascii_whitespace().next().unwrap_or("").to_ascii_lowercase();
        if host.is_empty() {
            return Reply::param_syntax_error();
        }

        self.session.host_name_appears_as = Some(host);
        self.session.opening_command = Some(kind);
        self.session.reset_envelope();
        self.unrecognised_commands = 0;

        if !extended {
            return Reply::new(
                250,
                None,
                format!("{} Hello {}", self.config.name, self.session.client_hostname_or_literal()),
            );
        }

        let mut lines = vec![format!(
            "{} Nice to meet you, {}",
            self.config.name,
            self.session.client_hostname_or_literal()
        )];
        if !self.config.hide_pipelining {
            lines.push("PIPELINING".into());
        }
        if !self.config.hide_8bitmime {
            lines.push("8BITMIME".into());
        }
        if !self.config.hide_smtputf8 {
            lines.push("SMTPUTF8".into());
        }
        if !self.config.auth_methods.is_empty() && self.session.user.is_none() {
            let methods = self.config.auth_methods.iter().map(SaslMechanism::name).collect::<Vec<_>>().join(" ");
            lines.push(format!("AUTH {methods}"));
        }
        if !self.session.secure && !self.config.hide_starttls {
            lines.push("STARTTLS".into());
        }
        if let Some(size) = self.config.size {
            lines.push(if self.config.hide_size { "SIZE".into() } else { format!("SIZE {size}") });
        }
        if self.config.use_xclient && !self.session.xclient_addr_locked {
            lines.push("XCLIENT NAME ADDR PORT PROTO HELO LOGIN".into());
        }
        if self.config.use_xforward && !self.session.xclient_addr_locked {
            lines.push("XFORWARD NAME ADDR PORT PROTO HELO IDENT SOURCE".into());
        }
        if !self.config.hide_dsn {
            lines.push("DSN".into());
        }
        if !self.config.hide_enhanced_status_codes {
            lines.push("ENHANCEDSTATUSCODES".into());
        }
        if self.config.requiretls_offered() {
            lines.push("REQUIRETLS".into());
        }

        Reply::new(250, None, lines.join("\n"))
    }

    async fn do_mail_from(&mut self, line: &str) -> Reply {
        if self.session.envelope.mail_from.is_some() {
            return Reply::bad_sequence();
        }

        let parsed = match address::parse_mail_from(line) {
            Ok(p) => p,
            Err(e) => return address_error_reply(e),
        };

        if let Some(size_str) = parsed.args.get("SIZE").and_then(ParamValue::as_value) {
            if let (Ok(requested), Some(limit)) = (size_str.parse::<u64>(), self.config.size) {
                if !self.config.hide_size && requested > limit {
                    return Reply::size_exceeded();
                }
            }
        }
        if let Some(body) = parsed.args.get("BODY").and_then(ParamValue::as_value) {
            if !matches!(body, "7BIT" | "8BITMIME") {
                return Reply::param_syntax_error();
            }
        }
        if let Some(v) = parsed.args.get("SMTPUTF8") {
            if !matches!(v, ParamValue::Flag) {
                return Reply::param_syntax_error();
            }
        }
        let require_tls = parsed.args.contains_key("REQUIRETLS");
        if require_tls {
            if self.config.hide_requiretls {
                return Reply::param_syntax_error();
            }
            if !self.session.secure {
                return Reply::requiretls_without_tls();
            }
        }
        if let Some(ret) = parsed.args.get("RET").and_then(ParamValue::as_value) {
            if !matches!(ret, "FULL" | "HDRS") {
                return Reply::param_syntax_error();
            }
        }
        if let Some(envid) = parsed.args.get("ENVID").and_then(ParamValue::as_value) {
            if let Some(limit) = self.config.envid_max_len {
                if envid.len() > limit {
                    return address_error_reply(AddressError::EnvidTooLong);
                }
            }
        }

        let address = EnvelopeAddress::from(parsed);
        match self.handler.on_mail_from(&address, &self.session).await {
            Ok(reply) => {
                let body_type = address.args.get("BODY").and_then(ParamValue::as_value).map(str::to_string);
                let smtp_utf8 = address.args.contains_key("SMTPUTF8");
                let ret = address.args.get("RET").and_then(ParamValue::as_value).map(str::to_string);
                let envid = address.args.get("ENVID").and_then(ParamValue::as_value).map(str::to_string);
                self.session.envelope.mail_from = Some(address);
                self.session.envelope.body_type = body_type;
                self.session.envelope.smtp_utf8 = smtp_utf8;
                self.session.envelope.require_tls = require_tls;
                self.session.envelope.dsn.ret = ret;
                self.session.envelope.dsn.envid = envid;
                reply.unwrap_or_else(Reply::ok)
            }
            Err(reply) => reply.unwrap_or_else(|| Reply::policy_rejected("Sender rejected")),
        }
    }

    async fn do_rcpt_to(&mut self, line: &str) -> Reply {
        if self.session.envelope.mail_from.is_none() {
            return Reply::no_mail_transaction();
        }

        let parsed = match address::parse_rcpt_to(line) {
            Ok(p) => p,
            Err(e) => return address_error_reply(e),
        };

        if let Some(notify) = parsed.args.get("NOTIFY").and_then(ParamValue::as_value) {
            if !address::validate_notify(notify) {
                return Reply::param_syntax_error();
            }
        }
        if let Some(orcpt) = parsed.args.get("ORCPT").and_then(ParamValue::as_value) {
            if !orcpt.contains(';') {
                return Reply::param_syntax_error();
            }
        }

        let address = EnvelopeAddress::from(parsed);
        match self.handler.on_rcpt_to(&address, &self.session).await {
            Ok(reply) => {
                self.session.envelope.push_recipient(address);
                reply.unwrap_or_else(Reply::ok)
            }
            Err(reply) => reply.unwrap_or_else(|| Reply::policy_rejected("Recipient rejected")),
        }
    }

    async fn do_data<S>(&mut self, framed: &mut Framed<S, SmtpCodec>) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.session.envelope.mail_from.is_none() {
            framed.send(Reply::no_mail_transaction()).await?;
            return Ok(());
        }
        if self.session.envelope.rcpt_to.is_empty() {
            framed.send(Reply::new(503, None, "No valid recipients")).await?;
            return Ok(());
        }

        framed.send(Reply::start_mail_input()).await?;
        framed.flush().await?;
        framed.codec_mut().start_data_mode(self.config.size);

        let recipient_count = self.session.envelope.rcpt_to.len();
        let (outcome, aborted, timed_out) = {
            let mut chunks = DataChunks::new(framed, self.config.socket_timeout);
            let outcome = self.handler.on_data(&mut chunks, &self.session).await;
            (outcome, !chunks.is_terminated(), chunks.timed_out)
        };

        framed.codec_mut().resume_command_mode();

        if timed_out {
            let _ = framed.send(Reply::timed_out()).await;
            return Err(ServerError::IdleTimeout);
        }

        if aborted {
            framed
                .send(Reply::new(450, None, "DATA handler did not consume the message body"))
                .await?;
            return Err(ServerError::DataAbort);
        }

        let mut any_success = false;
        let mut to_reply = |result: HandlerResult, any_success: &mut bool| -> Reply {
            match result {
                Ok(r) => {
                    *any_success = true;
                    r.unwrap_or_else(|| Reply::ok_with("OK: message queued"))
                }
                Err(r) => r.unwrap_or_else(|| Reply::new(450, None, "Requested action not taken")),
            }
        };

        match outcome {
            DataOutcome::Single(result) => {
                let reply = to_reply(result, &mut any_success);
                if self.config.lmtp {
                    for _ in 0..recipient_count {
                        framed.send(reply.clone()).await?;
                    }
                } else {
                    framed.send(reply).await?;
                }
            }
            DataOutcome::PerRecipient(results) => {
                if self.config.lmtp {
                    for result in results {
                        let reply = to_reply(result, &mut any_success);
                        framed.send(reply).await?;
                    }
                } else if let Some(result) = results.into_iter().next() {
                    let reply = to_reply(result, &mut any_success);
                    framed.send(reply).await?;
                }
            }
        }

        self.session.reset_envelope();
        if any_success {
            self.session.transaction += 1;
            self.unrecognised_commands = 0;
        }
        Ok(())
    }

    async fn do_starttls<S>(&mut self, framed: &mut Framed<S, SmtpCodec>) -> Result<DispatchOutcome, ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.session.secure {
            framed.send(Reply::bad_sequence()).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if self.config.hide_starttls {
            framed.send(Reply::not_implemented()).await?;
            return Ok(DispatchOutcome::Continue);
        }
        if !self.handler.tls_request(&self.session).await {
            framed.send(Reply::not_implemented()).await?;
            return Ok(DispatchOutcome::Continue);
        }

        framed.send(Reply::new(220, None, "Ready to start TLS")).await?;
        Ok(DispatchOutcome::StartTls)
    }

    async fn do_auth<S>(&mut self, framed: &mut Framed<S, SmtpCodec>, args: &str) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.session.user.is_some() {
            framed.send(Reply::bad_sequence()).await?;
            return Ok(());
        }

        let mut parts = args.splitn(2, char::is_whitespace);
        let mech_name = parts.next().unwrap_or("").trim();
        let initial = parts.next().map(str::trim).filter(|s| !s.is_empty());

        let Some(mechanism) = SaslMechanism::from_name(mech_name) else {
            framed.send(Reply::auth_mechanism_unknown()).await?;
            return Ok(());
        };
        if !self.config.auth_methods.contains(&mechanism) {
            framed.send(Reply::auth_mechanism_unknown()).await?;
            return Ok(());
        }
        if mechanism.requires_tls() && !self.session.secure && !self.config.allow_insecure_auth {
            framed.send(Reply::starttls_required()).await?;
            return Ok(());
        }

        match sasl::start(mechanism, initial, &self.config.name) {
            Ok(SaslStep::Continue(b64, state)) => {
                self.next_action = NextAction::Authenticating { mechanism, state };
                framed.send(Reply::new(334, None, b64)).await?;
            }
            Ok(SaslStep::Done(request)) => self.finish_auth(framed, request).await?,
            Ok(SaslStep::Abort { response_code }) => {
                framed.send(Reply::new(response_code, None, "Authentication aborted")).await?;
            }
            Err(code) => {
                framed.send(Reply::new(code, None, "Malformed authentication request")).await?;
            }
        }
        Ok(())
    }

    async fn continue_auth<S>(
        &mut self,
        framed: &mut Framed<S, SmtpCodec>,
        mechanism: SaslMechanism,
        state: AuthExchange,
        line: &str,
    ) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match sasl::continue_exchange(state, line, mechanism) {
            SaslStep::Continue(b64, next) => {
                self.next_action = NextAction::Authenticating { mechanism, state: next };
                framed.send(Reply::new(334, None, b64)).await?;
            }
            SaslStep::Done(request) => self.finish_auth(framed, request).await?,
            SaslStep::Abort { response_code } => {
                framed.send(Reply::new(response_code, None, "Authentication aborted")).await?;
            }
        }
        Ok(())
    }

    async fn finish_auth<S>(&mut self, framed: &mut Framed<S, SmtpCodec>, request: AuthRequest) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let method = request.method;
        let outcome: AuthOutcome = self.handler.on_auth(request, &self.session).await;

        match outcome.user {
            Some(user) => {
                tracing::info!(%user, mechanism = %method, "authentication succeeded");
                self.session.user = Some(user);
                let code = outcome.response_code.unwrap_or(235);
                let text = outcome.message.unwrap_or_else(|| "Authentication succeeded".into());
                framed.send(Reply::new(code, None, text)).await?;
            }
            None if method == SaslMechanism::XOauth2 => {
                let payload = outcome.data.unwrap_or_else(|| sasl::xoauth2_failure_payload("invalid_token"));
                self.next_action = NextAction::AwaitingXoauth2Abort {
                    response_code: outcome.response_code.unwrap_or(535),
                    message: outcome.message,
                };
                framed.send(Reply::new(334, None, payload)).await?;
            }
            None => {
                let code = outcome.response_code.unwrap_or(535);
                let text = outcome.message.unwrap_or_else(|| "Authentication credentials invalid".into());
                framed.send(Reply::new(code, None, text)).await?;
            }
        }
        Ok(())
    }

    /// `XCLIENT`/`XFORWARD`: whitespace-separated `KEY=VALUE` tokens;
    /// `[UNAVAILABLE]`/`[TEMPUNAVAIL]` clear a key. A non-empty `LOGIN=`
    /// queries `on_auth` with an XCLIENT-tagged request so the handler
    /// decides whether to honor the upstream MTA's asserted identity; an
    /// empty `LOGIN=` deauthenticates directly without asking.
    async fn do_xclient(&mut self, args: &str) -> Reply {
        if !self.config.use_xclient {
            return Reply::not_implemented();
        }
        if self.session.xclient_addr_locked && args.split_ascii_whitespace().any(|t| t.to_ascii_uppercase().starts_with("ADDR=")) {
            return Reply::bad_sequence();
        }

        let mut login_update = None;
        for token in args.split_ascii_whitespace() {
            let Some((key, value)) = token.split_once('=') else { continue };
            let key = key.to_ascii_uppercase();
            if matches!(value, "[UNAVAILABLE]" | "[TEMPUNAVAIL]") {
                self.session.x_client.remove(&key);
                continue;
            }
            if key == "ADDR" {
                if let Ok(addr) = value.parse::<IpAddr>() {
                    self.session.remote_address = normalize_ip(addr);
                    self.session.xclient_addr_locked = true;
                    self.session.reset_envelope();
                }
            } else if key == "LOGIN" {
                login_update = Some(value.to_string());
            }
            self.session.x_client.insert(key, value.to_string());
        }

        if let Some(login) = login_update {
            if login.is_empty() {
                self.session.user = None;
            } else {
                let request = AuthRequest {
                    method: SaslMechanism::XClient,
                    username: Some(login),
                    password: None,
                    access_token: None,
                    challenge: None,
                    challenge_response: None,
                };
                let outcome = self.handler.on_auth(request, &self.session).await;
                if let Some(ref user) = outcome.user {
                    tracing::info!(%user, mechanism = "XCLIENT", "authentication succeeded");
                }
                self.session.user = outcome.user;
            }
        }

        Reply::ok()
    }

    fn do_xforward(&mut self, args: &str) -> Reply {
        if !self.config.use_xforward {
            return Reply::not_implemented();
        }
        for token in args.split_ascii_whitespace() {
            let Some((key, value)) = token.split_once('=') else { continue };
            let key = key.to_ascii_uppercase();
            if matches!(value, "[UNAVAILABLE]" | "[TEMPUNAVAIL]") {
                self.session.x_forward.remove(&key);
            } else {
                self.session.x_forward.insert(key, value.to_string());
            }
        }
        Reply::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verbs_case_insensitively() {
        assert!(matches!(parse_command("ehlo client.example"), Command::Ehlo(ref a) if a == "client.example"));
        assert!(matches!(parse_command("QUIT"), Command::Quit));
        assert!(matches!(parse_command(""), Command::Unknown(ref a) if a.is_empty()));
        assert!(matches!(parse_command("ZOOP"), Command::Unknown(_)));
    }

    #[test]
    fn mail_from_carries_full_line_for_the_address_parser() {
        match parse_command("MAIL FROM:<a@b> SIZE=10") {
            Command::MailFrom(line) => assert_eq!(line, "MAIL FROM:<a@b> SIZE=10"),
            _ => panic!("expected MailFrom"),
        }
    }

    #[test]
    fn bdat_parses_size_and_last_flag() {
        assert!(matches!(parse_command("BDAT 100 LAST"), Command::Bdat(100, true)));
        assert!(matches!(parse_command("BDAT 100"), Command::Bdat(100, false)));
    }

    #[test]
    fn requires_greeting_and_auth_gates() {
        let mail = Command::MailFrom("MAIL FROM:<a>".into());
        assert!(mail.requires_greeting());
        assert!(mail.requires_auth());
        assert!(!Command::Noop.requires_greeting());
        assert!(!Command::Noop.requires_auth());
    }
}
