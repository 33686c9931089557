use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use crate::sasl::SaslMechanism;

/// Per-server configuration. Cheap to clone; `Server` holds one copy and
/// hands out `&Config` to every connection task.
///
/// Loading this from a file, environment, or CLI flags is explicitly outside
/// this crate's scope — the embedder constructs one directly or via
/// [`Config::default`] plus the setter methods below.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server name advertised in the banner and EHLO response.
    pub name: String,
    /// Extra text appended to the 220 greeting line.
    pub banner: Option<String>,

    /// Accept TLS immediately on connect, before any greeting.
    pub secure: bool,
    /// When `secure` is set, perform the handshake before the greeting is
    /// sent rather than wrapping the raw socket at accept time (used behind
    /// TLS-terminating proxies that still hand off a plaintext-looking
    /// connection that must be upgraded in place).
    pub needs_upgrade: bool,
    /// Disable the STARTTLS extension entirely.
    pub hide_starttls: bool,

    /// Maximum message body size in bytes. `None` disables the SIZE
    /// extension and the DATA-phase cap.
    pub size: Option<u64>,
    /// Advertise `SIZE` without a number.
    pub hide_size: bool,

    /// Mechanisms offered by `AUTH`, in advertisement order.
    pub auth_methods: Vec<SaslMechanism>,
    /// Allow MAIL/RCPT/DATA without a prior successful AUTH.
    pub auth_optional: bool,
    /// Allow PLAIN/LOGIN/XOAUTH2 (bare-credential mechanisms) without TLS.
    pub allow_insecure_auth: bool,

    /// Verbs entirely suppressed (treated as unknown commands).
    pub disabled_commands: HashSet<String>,

    pub hide_pipelining: bool,
    pub hide_8bitmime: bool,
    pub hide_smtputf8: bool,
    pub hide_dsn: bool,
    pub hide_enhanced_status_codes: bool,
    pub hide_requiretls: bool,

    /// Maximum number of simultaneously accepted connections.
    pub max_clients: usize,
    /// Idle-socket timeout: no complete line/chunk arrives within this
    /// window.
    pub socket_timeout: Duration,
    /// Grace period for [`crate::supervisor::Server::close`] before
    /// remaining connections are force-closed.
    pub close_timeout: Duration,

    /// Expect a PROXY v1 preamble on every connection.
    pub use_proxy: bool,
    /// Restrict PROXY v1 expectation to connections from these peer
    /// addresses; empty means "apply `use_proxy` globally".
    pub proxy_hosts: HashSet<IpAddr>,

    pub use_xclient: bool,
    pub use_xforward: bool,

    /// Run in LMTP mode: one response per recipient after DATA.
    pub lmtp: bool,

    /// Skip the reverse-DNS lookup before greeting.
    pub disable_reverse_lookup: bool,

    /// Connections from these addresses are accepted and immediately
    /// dropped without any reply (no 220, no close reply) — used to quietly
    /// absorb health-check probes.
    pub ignored_hosts: HashSet<IpAddr>,

    /// Abuse-counter thresholds.
    pub unrecognised_command_limit: u32,
    pub unauthenticated_command_limit: u32,

    /// Whether a bare empty command-mode line counts toward
    /// `unrecognised_commands`. Off by default: a stray CRLF is common
    /// client noise, not abuse.
    pub count_empty_line_as_unrecognised: bool,

    /// Cap on the `ENVID` parameter token, in octets (RFC 3461 advisory).
    /// `None` disables the cap.
    pub envid_max_len: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "localhost".into(),
            banner: None,

            secure: false,
            needs_upgrade: false,
            hide_starttls: false,

            size: None,
            hide_size: false,

            auth_methods: Vec::new(),
            auth_optional: true,
            allow_insecure_auth: false,

            disabled_commands: HashSet::new(),

            hide_pipelining: false,
            hide_8bitmime: false,
            hide_smtputf8: false,
            hide_dsn: false,
            hide_enhanced_status_codes: false,
            hide_requiretls: true,

            max_clients: 1000,
            socket_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(30),

            use_proxy: false,
            proxy_hosts: HashSet::new(),

            use_xclient: false,
            use_xforward: false,

            lmtp: false,

            disable_reverse_lookup: false,
            ignored_hosts: HashSet::new(),

            unrecognised_command_limit: 10,
            unauthenticated_command_limit: 10,

            count_empty_line_as_unrecognised: false,

            envid_max_len: Some(100),
        }
    }
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Config {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_auth_methods(mut self, methods: impl IntoIterator<Item = SaslMechanism>) -> Self {
        self.auth_methods = methods.into_iter().collect();
        self
    }

    pub fn disable_command(mut self, verb: impl Into<String>) -> Self {
        self.disabled_commands.insert(verb.into().to_ascii_uppercase());
        self
    }

    pub fn command_disabled(&self, verb: &str) -> bool {
        self.disabled_commands.contains(&verb.to_ascii_uppercase())
    }

    pub fn requiretls_offered(&self) -> bool {
        !self.hide_requiretls
    }

    /// Whether the PROXY v1 preamble should be expected from `peer`.
    pub fn expects_proxy(&self, peer: IpAddr) -> bool {
        self.use_proxy && (self.proxy_hosts.is_empty() || self.proxy_hosts.contains(&peer))
    }
}
