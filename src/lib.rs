//! Embeddable asynchronous ESMTP/LMTP service library.
//!
//! A host application supplies a [`Handler`] per connection and drives
//! either the low-level [`Connection`] state machine directly, or lets
//! [`Server`] own the accept loop, PROXY preamble, and TLS orchestration.
//! Message queueing, delivery, user databases, and DNS resolution are
//! explicitly the embedder's responsibility; this crate only speaks the
//! wire protocol.

pub mod address;
pub mod config;
pub mod error;
pub mod frame;
pub mod proxy;
pub mod reply;
pub mod sasl;
pub mod server;
pub mod session;
pub mod supervisor;

pub use address::{ParamValue, ParsedAddress};
pub use config::Config;
pub use error::{AddressError, ServerError};
pub use frame::{DataResult, Frame, SmtpCodec};
pub use proxy::{parse_proxy_line, ProxyError, ProxyHeader};
pub use reply::{EnhancedCode, Reply};
pub use sasl::{AuthExchange, AuthOutcome, AuthRequest, SaslMechanism, SaslStep};
pub use server::{BodyStream, Connection, ConnectionExit, DataOutcome, Handler, HandlerResult};
pub use session::{DsnParams, Envelope, EnvelopeAddress, OpeningCommand, Session, TlsInfo};
pub use supervisor::{HandlerFactory, Server, ServerHandle, TlsMaterial};
