//! End-to-end protocol tests driving [`esmtpd::Connection`] over an
//! in-memory duplex socket: plain transactions, dot-unstuffing, abuse
//! counters, REQUIRETLS enforcement, and per-recipient LMTP replies.
//! PROXY v1 rewriting is exercised separately below against a real
//! loopback `Server`, since PROXY consumption lives in the supervisor, not
//! `Connection`.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use esmtpd::{
    AuthOutcome, AuthRequest, BodyStream, Config, Connection, DataOutcome, EnvelopeAddress,
    Handler, HandlerResult, Server, Session,
};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;

struct RecordingHandler {
    bodies: std::sync::Arc<tokio::sync::Mutex<Vec<Vec<u8>>>>,
    per_recipient: Option<Vec<HandlerResult>>,
    observed_remote: Option<std::sync::Arc<tokio::sync::Mutex<Option<(IpAddr, u16)>>>>,
}

impl RecordingHandler {
    fn new() -> Self {
        RecordingHandler {
            bodies: Default::default(),
            per_recipient: None,
            observed_remote: None,
        }
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn on_connect(&mut self, session: &Session) -> HandlerResult {
        if let Some(slot) = &self.observed_remote {
            *slot.lock().await = Some((session.remote_address, session.remote_port));
        }
        Ok(None)
    }

    async fn on_auth(&mut self, _request: AuthRequest, _session: &Session) -> AuthOutcome {
        AuthOutcome::reject()
    }

    async fn on_mail_from(&mut self, _address: &EnvelopeAddress, _session: &Session) -> HandlerResult {
        Ok(None)
    }

    async fn on_rcpt_to(&mut self, _address: &EnvelopeAddress, _session: &Session) -> HandlerResult {
        Ok(None)
    }

    async fn on_data<S>(&mut self, body: &mut S, _session: &Session) -> DataOutcome
    where
        S: BodyStream,
    {
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk.unwrap());
        }
        self.bodies.lock().await.push(buf);

        match self.per_recipient.take() {
            Some(results) => DataOutcome::PerRecipient(results),
            None => DataOutcome::Single(Ok(None)),
        }
    }

    async fn on_secure(&mut self, _session: &Session) {}
    async fn on_close(&mut self, _session: &Session) {}

    async fn tls_request(&mut self, _session: &Session) -> bool {
        true
    }
}

fn test_session(lmtp: bool) -> Session {
    Session::new(
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        25,
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
        54321,
        lmtp,
    )
}

/// Spawn `Connection::serve` on one half of an in-memory duplex socket,
/// returning the other half after the 220 banner has been read (so the
/// early-talker check never fires against our own test traffic).
async fn spawn_connection(config: Config, handler: RecordingHandler, session: Session) -> DuplexStream {
    let (client, server_end) = tokio::io::duplex(64 * 1024);

    tokio::spawn(async move {
        let mut handler = handler;
        let mut conn = Connection::new(&config, &mut handler, session);
        let _ = conn.serve(server_end).await;
    });

    client
}

async fn read_reply(stream: &mut DuplexStream) -> String {
    let mut buf = vec![0u8; 8192];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("reply timed out")
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

async fn send(stream: &mut DuplexStream, line: &str) {
    stream.write_all(line.as_bytes()).await.unwrap();
}

#[tokio::test]
async fn s1_plain_transaction() {
    let config = Config::new("mx.example.org");
    let mut client = spawn_connection(config, RecordingHandler::new(), test_session(false)).await;

    let banner = read_reply(&mut client).await;
    assert!(banner.starts_with("220 "), "banner was: {banner}");

    send(&mut client, "EHLO client.example\r\n").await;
    let ehlo = read_reply(&mut client).await;
    assert!(ehlo.starts_with("250-mx.example.org Nice to meet you"), "ehlo was: {ehlo}");
    assert!(ehlo.lines().last().unwrap().starts_with("250 "), "last EHLO line must use space separator: {ehlo}");

    send(&mut client, "MAIL FROM:<a@x>\r\n").await;
    assert_eq!(read_reply(&mut client).await, "250 OK\r\n");

    send(&mut client, "RCPT TO:<b@y>\r\n").await;
    assert_eq!(read_reply(&mut client).await, "250 OK\r\n");

    send(&mut client, "DATA\r\n").await;
    let data_prompt = read_reply(&mut client).await;
    assert!(data_prompt.starts_with("354 "), "data prompt was: {data_prompt}");

    send(&mut client, "hi\r\n.\r\n").await;
    let queued = read_reply(&mut client).await;
    assert!(queued.starts_with("250 "), "queued reply was: {queued}");

    send(&mut client, "QUIT\r\n").await;
    assert_eq!(read_reply(&mut client).await, "221 Bye\r\n");
}

#[tokio::test]
async fn s2_dot_unstuffing_reaches_the_handler() {
    let config = Config::new("mx.example.org");
    let bodies = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let mut handler = RecordingHandler::new();
    handler.bodies = bodies.clone();
    let mut client = spawn_connection(config, handler, test_session(false)).await;

    let _ = read_reply(&mut client).await; // banner
    send(&mut client, "EHLO client.example\r\n").await;
    let _ = read_reply(&mut client).await;
    send(&mut client, "MAIL FROM:<a@x>\r\n").await;
    let _ = read_reply(&mut client).await;
    send(&mut client, "RCPT TO:<b@y>\r\n").await;
    let _ = read_reply(&mut client).await;
    send(&mut client, "DATA\r\n").await;
    let _ = read_reply(&mut client).await;

    send(&mut client, "..bar\r\n.baz\r\n.\r\n").await;
    let _ = read_reply(&mut client).await;

    let bodies = bodies.lock().await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(&bodies[0], b".bar\r\nbaz\r\n");
}

#[tokio::test]
async fn s3_unknown_verb_abuse_closes_after_limit() {
    let mut config = Config::new("mx.example.org");
    config.unrecognised_command_limit = 10;
    let mut client = spawn_connection(config, RecordingHandler::new(), test_session(false)).await;

    let _ = read_reply(&mut client).await; // banner

    for _ in 0..9 {
        send(&mut client, "ZOOP\r\n").await;
        let reply = read_reply(&mut client).await;
        assert!(reply.starts_with("500 "), "expected 500, got {reply}");
    }

    send(&mut client, "ZOOP\r\n").await;
    let final_reply = read_reply(&mut client).await;
    assert!(final_reply.starts_with("421 "), "expected 421, got {final_reply}");

    // The connection is now closed; a further read should hit EOF.
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn unauthenticated_commands_close_after_limit_even_when_auth_is_optional() {
    let mut config = Config::new("mx.example.org");
    config.unauthenticated_command_limit = 3;
    let mut client = spawn_connection(config, RecordingHandler::new(), test_session(false)).await;

    let _ = read_reply(&mut client).await; // banner

    for _ in 0..3 {
        send(&mut client, "NOOP\r\n").await;
        let reply = read_reply(&mut client).await;
        assert!(reply.starts_with("250 "), "expected 250, got {reply}");
    }

    send(&mut client, "NOOP\r\n").await;
    let final_reply = read_reply(&mut client).await;
    assert!(final_reply.starts_with("421 "), "expected 421, got {final_reply}");

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn s4_requiretls_on_cleartext_is_rejected() {
    let mut config = Config::new("mx.example.org");
    config.hide_requiretls = false;
    let mut client = spawn_connection(config, RecordingHandler::new(), test_session(false)).await;

    let _ = read_reply(&mut client).await; // banner
    send(&mut client, "EHLO client.example\r\n").await;
    let ehlo = read_reply(&mut client).await;
    assert!(ehlo.contains("REQUIRETLS"), "expected REQUIRETLS advertised: {ehlo}");

    send(&mut client, "MAIL FROM:<a@x> REQUIRETLS\r\n").await;
    let reply = read_reply(&mut client).await;
    assert!(reply.starts_with("530 "), "expected 530, got {reply}");
}

#[tokio::test]
async fn s5_lmtp_reports_one_response_per_recipient() {
    let mut config = Config::new("mx.example.org");
    config.lmtp = true;
    let mut handler = RecordingHandler::new();
    handler.per_recipient = Some(vec![
        Ok(Some(esmtpd::Reply::ok_with("OK r1"))),
        Err(Some(esmtpd::Reply::new(450, None, "no r2"))),
    ]);
    let mut client = spawn_connection(config, handler, test_session(true)).await;

    let _ = read_reply(&mut client).await; // banner
    send(&mut client, "LHLO client.example\r\n").await;
    let _ = read_reply(&mut client).await;
    send(&mut client, "MAIL FROM:<a@x>\r\n").await;
    let _ = read_reply(&mut client).await;
    send(&mut client, "RCPT TO:<r1@y>\r\n").await;
    let _ = read_reply(&mut client).await;
    send(&mut client, "RCPT TO:<r2@y>\r\n").await;
    let _ = read_reply(&mut client).await;
    send(&mut client, "DATA\r\n").await;
    let _ = read_reply(&mut client).await;

    send(&mut client, "hi\r\n.\r\n").await;
    let replies = read_reply(&mut client).await;
    let lines: Vec<&str> = replies.lines().collect();
    assert_eq!(lines.len(), 2, "expected one reply per recipient: {replies:?}");
    assert!(lines[0].starts_with("250 OK r1"), "first reply: {}", lines[0]);
    assert!(lines[1].starts_with("450 no r2"), "second reply: {}", lines[1]);
}

#[tokio::test]
async fn s6_proxy_v1_rewrites_remote_endpoint() {
    let mut config = Config::new("mx.example.org");
    config.use_proxy = true;

    let observed = std::sync::Arc::new(tokio::sync::Mutex::new(None));
    let handler_observed = observed.clone();
    let server = Server::new(config, move |_session: &Session| {
        let mut h = RecordingHandler::new();
        h.observed_remote = Some(handler_observed.clone());
        h
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = server.listen(listener);

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"PROXY TCP4 198.51.100.22 203.0.113.7 35646 80\r\n")
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await.unwrap().unwrap();
    let banner = String::from_utf8_lossy(&buf[..n]);
    assert!(banner.starts_with("220 "), "banner was: {banner}");
    assert!(!banner.contains("PROXY"), "PROXY header must not reach the client side view: {banner}");

    let (addr, port) = observed.lock().await.expect("on_connect should have observed a rewritten endpoint");
    assert_eq!(addr.to_string(), "198.51.100.22");
    assert_eq!(port, 35646);

    stream.write_all(b"QUIT\r\n").await.unwrap();
    let n = stream.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("221 "));

    drop(stream);
    handle.close().await;
}
