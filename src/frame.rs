//! Frame Parser: a single [`tokio_util::codec::Decoder`]/[`Encoder`]
//! pair that flips between command-line splitting and dot-unstuffed DATA
//! reception depending on what the connection state machine asked for.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::reply::Reply;

/// One decoded unit handed to the connection state machine.
#[derive(Debug)]
pub enum Frame {
    /// A complete command-mode line, terminator stripped.
    Command(Bytes),
    /// A chunk of DATA-mode body, already dot-unstuffed.
    DataChunk(Bytes),
    /// The `<CRLF>.<CRLF>` terminator was observed; data mode has ended and
    /// the codec is back in command mode.
    DataComplete(DataResult),
}

/// Outcome of a completed DATA reception.
#[derive(Debug, Clone, Copy)]
pub struct DataResult {
    pub size_exceeded: bool,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Command,
    Data { max_bytes: Option<u64>, seen_bytes: u64 },
}

/// Wrap a socket in `Framed::new(socket, SmtpCodec::default())`; drive mode
/// switches via [`SmtpCodec::start_data_mode`] and
/// [`SmtpCodec::resume_command_mode`].
pub struct SmtpCodec {
    mode: Mode,
}

impl Default for SmtpCodec {
    fn default() -> Self {
        SmtpCodec { mode: Mode::Command }
    }
}

impl SmtpCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to DATA mode. `max_bytes` is the configured `size` cap, if any.
    pub fn start_data_mode(&mut self, max_bytes: Option<u64>) {
        self.mode = Mode::Data {
            max_bytes,
            seen_bytes: 0,
        };
    }

    /// Force command mode, used after the state machine observes
    /// [`Frame::DataComplete`] and is ready to accept the next line.
    pub fn resume_command_mode(&mut self) {
        self.mode = Mode::Command;
    }

    pub fn in_data_mode(&self) -> bool {
        matches!(self.mode, Mode::Data { .. })
    }

    fn decode_command(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        let Some(nl) = find_newline(buf) else {
            return Ok(None);
        };
        let mut line = buf.split_to(nl + 1);
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Ok(Some(Frame::Command(line.freeze())))
    }

    fn decode_data(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        let Some(nl) = find_newline(buf) else {
            return Ok(None);
        };
        let mut line = buf.split_to(nl + 1);
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        if &line[..] == b"." {
            let (max_bytes, seen_bytes) = match self.mode {
                Mode::Data { max_bytes, seen_bytes } => (max_bytes, seen_bytes),
                Mode::Command => unreachable!("decode_data only runs in Mode::Data"),
            };
            self.mode = Mode::Command;
            let size_exceeded = max_bytes.is_some_and(|limit| seen_bytes > limit);
            return Ok(Some(Frame::DataComplete(DataResult { size_exceeded })));
        }

        if line.starts_with(b".") {
            line.advance(1);
        }
        line.extend_from_slice(b"\r\n");

        if let Mode::Data { seen_bytes, .. } = &mut self.mode {
            *seen_bytes += line.len() as u64;
        }

        Ok(Some(Frame::DataChunk(line.freeze())))
    }
}

fn find_newline(buf: &BytesMut) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

impl Decoder for SmtpCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.mode {
            Mode::Command => self.decode_command(buf),
            Mode::Data { .. } => self.decode_data(buf),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        match self.mode {
            Mode::Command => {
                let line = buf.split_to(buf.len());
                Ok(Some(Frame::Command(line.freeze())))
            }
            Mode::Data { .. } => Ok(None),
        }
    }
}

impl Encoder<Reply> for SmtpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(reply.to_string().as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_command_lines_on_crlf() {
        let mut codec = SmtpCodec::new();
        let mut buf = BytesMut::from(&b"EHLO foo\r\nMAIL FROM:<a>\r\n"[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Frame::Command(ref b) if &b[..] == b"EHLO foo"));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Frame::Command(ref b) if &b[..] == b"MAIL FROM:<a>"));

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn tolerates_bare_lf() {
        let mut codec = SmtpCodec::new();
        let mut buf = BytesMut::from(&b"NOOP\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::Command(ref b) if &b[..] == b"NOOP"));
    }

    #[test]
    fn incomplete_line_waits_for_more_bytes() {
        let mut codec = SmtpCodec::new();
        let mut buf = BytesMut::from(&b"EHLO fo"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"o\r\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::Command(ref b) if &b[..] == b"EHLO foo"));
    }

    #[test]
    fn dot_unstuffing_removes_one_leading_dot() {
        let mut codec = SmtpCodec::new();
        codec.start_data_mode(None);
        let mut buf = BytesMut::from(&b"..bar\r\n.baz\r\n.\r\n"[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Frame::DataChunk(ref b) if &b[..] == b".bar\r\n"));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Frame::DataChunk(ref b) if &b[..] == b"baz\r\n"));

        let third = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(third, Frame::DataComplete(DataResult { size_exceeded: false })));
        assert!(!codec.in_data_mode());
    }

    #[test]
    fn immediately_initial_dot_terminates_empty_body() {
        let mut codec = SmtpCodec::new();
        codec.start_data_mode(None);
        let mut buf = BytesMut::from(&b".\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::DataComplete(DataResult { size_exceeded: false })));
    }

    #[test]
    fn size_exceeded_is_reported_without_truncating() {
        let mut codec = SmtpCodec::new();
        codec.start_data_mode(Some(4));
        let mut buf = BytesMut::from(&b"hello world\r\n.\r\n"[..]);

        let chunk = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(chunk, Frame::DataChunk(ref b) if &b[..] == b"hello world\r\n"));

        let complete = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(complete, Frame::DataComplete(DataResult { size_exceeded: true })));
    }

    #[test]
    fn encodes_reply_with_crlf() {
        let mut codec = SmtpCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Reply::ok(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"250 OK\r\n");
    }
}
