#![doc = include_str!("../README.md")]

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use arrrg_derive::CommandLine;
use biometrics::{Counter, Moments};
use indicio::{clue, ERROR, INFO};
use utilz::stopwatch::Stopwatch;

mod server;

pub use server::{format_error, format_table, Invokable, Server, REQUEST_BUFFER_SIZE};

///////////////////////////////////////////// constants ////////////////////////////////////////////

/// The size of the length prefix that precedes every response payload.
pub const FRAME_HEADER_SIZE: usize = 4;

/// The default limit on the size of a response payload.
pub const DEFAULT_MAX_RESPONSE_SIZE: u32 = 1 << 26;

// Payload buffers grow by at most this much per read so that a bogus prefix cannot force a large
// allocation before the bytes actually arrive.
const READ_CHUNK_SIZE: usize = 1 << 16;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static CONNECT: Counter = Counter::new("frame_sock.client.connect");
static CLOSE: Counter = Counter::new("frame_sock.client.close");
static REQUESTS_SENT: Counter = Counter::new("frame_sock.client.requests_sent");
static REQUEST_BYTES: Counter = Counter::new("frame_sock.client.request_bytes");
static RESPONSES_RECV: Counter = Counter::new("frame_sock.client.responses_recv");
static RESPONSE_BYTES: Counter = Counter::new("frame_sock.client.response_bytes");
static READ_INTERRUPTED: Counter = Counter::new("frame_sock.read.interrupted");
static FRAMES_WRITTEN: Counter = Counter::new("frame_sock.frames_written");

static CONNECT_ERROR: Counter = Counter::new("frame_sock.error.connect");
static BIND_ERROR: Counter = Counter::new("frame_sock.error.bind");
static TRANSPORT_ERROR: Counter = Counter::new("frame_sock.error.transport");
static CONNECTION_LOST: Counter = Counter::new("frame_sock.error.connection_lost");
static CLOSED_ERROR: Counter = Counter::new("frame_sock.error.closed");
static INVALID_UTF8: Counter = Counter::new("frame_sock.error.invalid_utf8");
static FRAME_TOO_LARGE: Counter = Counter::new("frame_sock.error.frame_too_large");

static RECEIVE_LATENCY: Moments = Moments::new("frame_sock.client.receive_latency");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&CONNECT);
    collector.register_counter(&CLOSE);
    collector.register_counter(&REQUESTS_SENT);
    collector.register_counter(&REQUEST_BYTES);
    collector.register_counter(&RESPONSES_RECV);
    collector.register_counter(&RESPONSE_BYTES);
    collector.register_counter(&READ_INTERRUPTED);
    collector.register_counter(&FRAMES_WRITTEN);
    collector.register_counter(&CONNECT_ERROR);
    collector.register_counter(&BIND_ERROR);
    collector.register_counter(&TRANSPORT_ERROR);
    collector.register_counter(&CONNECTION_LOST);
    collector.register_counter(&CLOSED_ERROR);
    collector.register_counter(&INVALID_UTF8);
    collector.register_counter(&FRAME_TOO_LARGE);
    collector.register_moments(&RECEIVE_LATENCY);
    server::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Phase //////////////////////////////////////////////

/// The part of a frame being read when the peer went away.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// The four-byte length prefix.
    Header,
    /// The payload following the prefix.
    Payload,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Header => write!(f, "length prefix"),
            Phase::Payload => write!(f, "payload"),
        }
    }
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Debug)]
pub enum Error {
    /// The endpoint could not be reached at startup.
    Connect { addr: String, err: std::io::Error },
    /// A server could not listen on the requested address.
    Bind { addr: String, err: std::io::Error },
    /// The operating system reported a failure while reading or writing the stream.
    Transport { what: &'static str, err: std::io::Error },
    /// The peer closed the stream partway through a frame.
    ConnectionLost {
        phase: Phase,
        expected: usize,
        received: usize,
    },
    /// The connection was already closed.
    Closed,
    /// A complete payload arrived, but it is not UTF-8.
    InvalidUtf8 { err: std::string::FromUtf8Error },
    /// A frame exceeds the size the protocol or the caller permits.
    FrameTooLarge { size: u64, limit: u64 },
}

impl Error {
    pub fn connect(addr: impl Into<String>, err: std::io::Error) -> Self {
        CONNECT_ERROR.click();
        Self::Connect {
            addr: addr.into(),
            err,
        }
    }

    pub fn bind(addr: impl Into<String>, err: std::io::Error) -> Self {
        BIND_ERROR.click();
        Self::Bind {
            addr: addr.into(),
            err,
        }
    }

    pub fn transport(what: &'static str, err: std::io::Error) -> Self {
        TRANSPORT_ERROR.click();
        Self::Transport { what, err }
    }

    pub fn connection_lost(phase: Phase, expected: usize, received: usize) -> Self {
        CONNECTION_LOST.click();
        Self::ConnectionLost {
            phase,
            expected,
            received,
        }
    }

    pub fn closed() -> Self {
        CLOSED_ERROR.click();
        Self::Closed
    }

    pub fn frame_too_large(size: u64, limit: u64) -> Self {
        FRAME_TOO_LARGE.click();
        Self::FrameTooLarge { size, limit }
    }

    /// True when the byte stream itself failed:  the peer reset or closed the connection, or the
    /// connection was closed locally.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::ConnectionLost { .. } | Error::Closed
        )
    }

    /// True when the stream delivered bytes that do not form a valid response.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::InvalidUtf8 { .. } | Error::FrameTooLarge { .. })
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        INVALID_UTF8.click();
        Self::InvalidUtf8 { err }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Connect { addr, err } => write!(f, "could not connect to {}: {}", addr, err),
            Error::Bind { addr, err } => write!(f, "could not listen on {}: {}", addr, err),
            Error::Transport { what, err } => {
                write!(f, "connection lost during {}: {}", what, err)
            }
            Error::ConnectionLost {
                phase,
                expected,
                received,
            } => {
                write!(
                    f,
                    "connection lost: peer closed the stream after {} of {} {} bytes",
                    received, expected, phase
                )
            }
            Error::Closed => write!(f, "connection is closed"),
            Error::InvalidUtf8 { err } => {
                write!(f, "malformed response: payload is not valid utf8: {}", err)
            }
            Error::FrameTooLarge { size, limit } => {
                write!(
                    f,
                    "malformed response: frame of {} bytes exceeds the limit of {} bytes",
                    size, limit
                )
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect { err, .. } => Some(err),
            Error::Bind { err, .. } => Some(err),
            Error::Transport { err, .. } => Some(err),
            Error::InvalidUtf8 { err } => Some(err),
            _ => None,
        }
    }
}

////////////////////////////////////////////// frames //////////////////////////////////////////////

/// Read one frame from `reader`:  a four-byte little-endian length `N`, then exactly `N` bytes.
///
/// Short reads are expected and are accumulated until the frame is complete.  A stream that ends
/// before the frame is complete yields [Error::ConnectionLost] and never a partial frame.  A
/// declared length above `max_size` yields [Error::FrameTooLarge] before any payload is read.
pub fn read_frame<R: Read>(reader: &mut R, max_size: u32) -> Result<Vec<u8>, Error> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let got = fill(reader, &mut header)?;
    if got < FRAME_HEADER_SIZE {
        return Err(Error::connection_lost(
            Phase::Header,
            FRAME_HEADER_SIZE,
            got,
        ));
    }
    let size = u32::from_le_bytes(header);
    if size > max_size {
        return Err(Error::frame_too_large(size as u64, max_size as u64));
    }
    let size = size as usize;
    let mut payload = Vec::with_capacity(std::cmp::min(size, READ_CHUNK_SIZE));
    while payload.len() < size {
        let start = payload.len();
        let want = std::cmp::min(size - start, READ_CHUNK_SIZE);
        payload.resize(start + want, 0);
        let got = fill(reader, &mut payload[start..])?;
        if got < want {
            return Err(Error::connection_lost(Phase::Payload, size, start + got));
        }
    }
    Ok(payload)
}

/// Write `payload` to `writer` as one frame and flush it.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), Error> {
    let frame = encode_frame(payload)?;
    writer
        .write_all(&frame)
        .map_err(|err| Error::transport("write", err))?;
    writer.flush().map_err(|err| Error::transport("flush", err))?;
    FRAMES_WRITTEN.click();
    Ok(())
}

/// Encode `payload` as a frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, Error> {
    let size = u32::try_from(payload.len())
        .map_err(|_| Error::frame_too_large(payload.len() as u64, u32::MAX as u64))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

// Read until `buf` is full or the stream ends, returning the number of bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut idx = 0;
    while idx < buf.len() {
        match reader.read(&mut buf[idx..]) {
            Ok(0) => {
                break;
            }
            Ok(sz) => {
                idx += sz;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                READ_INTERRUPTED.click();
            }
            Err(err) => {
                return Err(Error::transport("read", err));
            }
        }
    }
    Ok(idx)
}

/////////////////////////////////////////// ClientOptions //////////////////////////////////////////

#[derive(Clone, CommandLine, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    #[arrrg(optional, "Largest response payload to accept, in bytes.", "BYTES")]
    pub max_response_size: u32,
}

impl ClientOptions {
    pub fn with_max_response_size(mut self, max_response_size: u32) -> Self {
        self.max_response_size = max_response_size;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }
}

////////////////////////////////////////////// Client //////////////////////////////////////////////

/// A [Client] owns one connection.  Requests go out as raw bytes; responses come back as frames.
///
/// Any failure while sending or receiving leaves the stream at an unknown position within the
/// protocol, so the client drops the connection and every later call returns [Error::Closed].
pub struct Client<S: Read + Write = TcpStream> {
    options: ClientOptions,
    stream: Option<S>,
}

impl Client<TcpStream> {
    /// Connect to `host:port`.
    pub fn connect(host: &str, port: u16, options: ClientOptions) -> Result<Self, Error> {
        CONNECT.click();
        let addr = format!("{}:{}", host, port);
        let stream = match TcpStream::connect((host, port)) {
            Ok(stream) => stream,
            Err(err) => {
                let err = Error::connect(addr, err);
                clue!(COLLECTOR, ERROR, {
                    connect_failed: err.to_string(),
                });
                return Err(err);
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|err| Error::connect(addr.clone(), err))?;
        clue!(COLLECTOR, INFO, {
            connect: addr,
        });
        Ok(Self::from_stream(stream, options))
    }
}

impl<S: Read + Write> Client<S> {
    /// Wrap an established stream.
    pub fn from_stream(stream: S, options: ClientOptions) -> Self {
        Self {
            options,
            stream: Some(stream),
        }
    }

    /// Write the UTF-8 bytes of `line` exactly as given.  No prefix and no delimiter is added.
    pub fn send(&mut self, line: &str) -> Result<(), Error> {
        let stream = self.stream.as_mut().ok_or_else(Error::closed)?;
        let result = stream
            .write_all(line.as_bytes())
            .map_err(|err| Error::transport("write", err))
            .and_then(|_| stream.flush().map_err(|err| Error::transport("flush", err)));
        if let Err(err) = result {
            return Err(self.fail(err));
        }
        REQUESTS_SENT.click();
        REQUEST_BYTES.count(line.len() as u64);
        Ok(())
    }

    /// Read one framed response and decode it as UTF-8.
    pub fn receive(&mut self) -> Result<String, Error> {
        let stream = self.stream.as_mut().ok_or_else(Error::closed)?;
        let sw = Stopwatch::default();
        let payload = match read_frame(stream, self.options.max_response_size) {
            Ok(payload) => payload,
            Err(err) => {
                return Err(self.fail(err));
            }
        };
        RECEIVE_LATENCY.add(sw.since());
        RESPONSES_RECV.click();
        RESPONSE_BYTES.count(payload.len() as u64);
        match String::from_utf8(payload) {
            Ok(response) => Ok(response),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    /// Send `line` and wait for its response.
    pub fn invoke(&mut self, line: &str) -> Result<String, Error> {
        self.send(line)?;
        self.receive()
    }

    /// Release the connection.  Calling close on a closed client does nothing.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            CLOSE.click();
            clue!(COLLECTOR, INFO, {
                close: true,
            });
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// The underlying stream, if the connection is still open.
    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn fail(&mut self, err: Error) -> Error {
        let kind = if err.is_protocol() { "protocol" } else { "transport" };
        clue!(COLLECTOR, ERROR, {
            error: err.to_string(),
            kind: kind,
        });
        self.close();
        err
    }
}

impl<S: Read + Write> Drop for Client<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    // A transport that hands out its input at most `chunk` bytes per read and records writes.
    #[derive(Debug, Default)]
    struct ChunkedStream {
        input: Vec<u8>,
        offset: usize,
        chunk: usize,
        interrupts: usize,
        output: Vec<u8>,
    }

    impl ChunkedStream {
        fn new(input: Vec<u8>, chunk: usize) -> Self {
            Self {
                input,
                chunk,
                ..Self::default()
            }
        }

        fn framed(payload: &[u8], chunk: usize) -> Self {
            Self::new(encode_frame(payload).unwrap(), chunk)
        }
    }

    impl Read for ChunkedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.interrupts > 0 {
                self.interrupts -= 1;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let remain = &self.input[self.offset..];
            let amt = std::cmp::min(std::cmp::min(self.chunk, buf.len()), remain.len());
            buf[..amt].copy_from_slice(&remain[..amt]);
            self.offset += amt;
            Ok(amt)
        }
    }

    impl Write for ChunkedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    // A transport whose peer has reset the connection.
    struct ResetStream;

    impl Read for ResetStream {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::ConnectionReset))
        }
    }

    impl Write for ResetStream {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::ConnectionReset))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn client(stream: ChunkedStream) -> Client<ChunkedStream> {
        Client::from_stream(stream, ClientOptions::default())
    }

    fn payload_of(size: usize) -> String {
        "framed payload with a \n newline, a \t tab, and a multi-byte é.\n"
            .chars()
            .cycle()
            .take(size)
            .collect()
    }

    #[test]
    fn hello() {
        let stream = ChunkedStream::new(b"\x05\x00\x00\x00hello".to_vec(), usize::MAX);
        let mut client = client(stream);
        assert_eq!("hello", client.receive().unwrap());
    }

    #[test]
    fn empty_payload() {
        let stream = ChunkedStream::new(b"\x00\x00\x00\x00".to_vec(), usize::MAX);
        let mut client = client(stream);
        assert_eq!("", client.receive().unwrap());
        assert!(!client.is_closed());
    }

    #[test]
    fn short_reads() {
        let payload = payload_of(20_000);
        for chunk in [1, 3, 8192, payload.len()] {
            let mut client = client(ChunkedStream::framed(payload.as_bytes(), chunk));
            assert_eq!(payload, client.receive().unwrap(), "chunk={chunk}");
        }
    }

    #[test]
    fn several_megabytes() {
        let payload = payload_of(5 << 20);
        let mut client = client(ChunkedStream::framed(payload.as_bytes(), 8192));
        assert_eq!(payload, client.receive().unwrap());
    }

    #[test]
    fn frames_arrive_in_order() {
        let mut input = Vec::new();
        for payload in ["first", "", "third"] {
            input.extend(encode_frame(payload.as_bytes()).unwrap());
        }
        let mut client = client(ChunkedStream::new(input, 2));
        assert_eq!("first", client.receive().unwrap());
        assert_eq!("", client.receive().unwrap());
        assert_eq!("third", client.receive().unwrap());
    }

    #[test]
    fn interrupted_reads_are_reissued() {
        let mut stream = ChunkedStream::framed(b"patience", 3);
        stream.interrupts = 2;
        let mut client = client(stream);
        assert_eq!("patience", client.receive().unwrap());
    }

    #[test]
    fn early_close_on_length() {
        for prefix in [&b""[..], &b"\x05"[..], &b"\x05\x00\x00"[..]] {
            let mut client = client(ChunkedStream::new(prefix.to_vec(), 1));
            let err = client.receive().unwrap_err();
            assert!(err.is_transport(), "err={err:?}");
            assert!(!err.is_protocol(), "err={err:?}");
            match err {
                Error::ConnectionLost {
                    phase,
                    expected,
                    received,
                } => {
                    assert_eq!(Phase::Header, phase);
                    assert_eq!(FRAME_HEADER_SIZE, expected);
                    assert_eq!(prefix.len(), received);
                }
                _ => panic!("unexpected error: {err:?}"),
            }
        }
    }

    #[test]
    fn early_close_on_payload() {
        let mut client = client(ChunkedStream::new(b"\x0a\x00\x00\x00hello".to_vec(), 3));
        let err = client.receive().unwrap_err();
        assert!(err.is_transport(), "err={err:?}");
        match err {
            Error::ConnectionLost {
                phase,
                expected,
                received,
            } => {
                assert_eq!(Phase::Payload, phase);
                assert_eq!(10, expected);
                assert_eq!(5, received);
            }
            _ => panic!("unexpected error: {err:?}"),
        }
        assert!(client.is_closed());
    }

    #[test]
    fn invalid_utf8() {
        let mut client = client(ChunkedStream::framed(b"\xff\xfe\xfd", 1));
        let err = client.receive().unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8 { .. }), "err={err:?}");
        assert!(err.is_protocol());
        assert!(!err.is_transport());
    }

    #[test]
    fn oversize_prefix_is_rejected() {
        let stream = ChunkedStream::new(b"\xff\xff\xff\xff".to_vec(), usize::MAX);
        let options = ClientOptions::default().with_max_response_size(1024);
        let mut client = Client::from_stream(stream, options);
        let err = client.receive().unwrap_err();
        match err {
            Error::FrameTooLarge { size, limit } => {
                assert_eq!(u32::MAX as u64, size);
                assert_eq!(1024, limit);
            }
            _ => panic!("unexpected error: {err:?}"),
        }
    }

    #[test]
    fn send_is_unframed() {
        let mut client = client(ChunkedStream::default());
        client.send("select 1").unwrap();
        assert_eq!(b"select 1", client.get_ref().unwrap().output.as_slice());
    }

    #[test]
    fn invoke_round_trip() {
        let mut client = client(ChunkedStream::framed(b"1\t\nDONE TOTAL 0 LINES\n", 4));
        let response = client.invoke("select 1").unwrap();
        assert_eq!("1\t\nDONE TOTAL 0 LINES\n", response);
        assert_eq!(b"select 1", client.get_ref().unwrap().output.as_slice());
    }

    #[test]
    fn reset_peer() {
        let mut client = Client::from_stream(ResetStream, ClientOptions::default());
        let err = client.send("select 1").unwrap_err();
        assert!(matches!(err, Error::Transport { what: "write", .. }), "err={err:?}");
        assert!(client.is_closed());
        let mut client = Client::from_stream(ResetStream, ClientOptions::default());
        let err = client.receive().unwrap_err();
        assert!(matches!(err, Error::Transport { what: "read", .. }), "err={err:?}");
    }

    #[test]
    fn close_is_idempotent() {
        let mut client = client(ChunkedStream::default());
        assert!(!client.is_closed());
        client.close();
        assert!(client.is_closed());
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.send("select 1"), Err(Error::Closed)));
        assert!(matches!(client.receive(), Err(Error::Closed)));
    }

    #[test]
    fn encode_frame_layout() {
        assert_eq!(b"\x05\x00\x00\x00hello".to_vec(), encode_frame(b"hello").unwrap());
        assert_eq!(b"\x00\x00\x00\x00".to_vec(), encode_frame(b"").unwrap());
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0u8; 258]).unwrap();
        assert_eq!(&[2u8, 1, 0, 0][..], &buf[..4]);
        assert_eq!(262, buf.len());
    }

    #[test]
    fn register() {
        let collector = biometrics::Collector::new();
        register_biometrics(&collector);
    }

    proptest::proptest! {
        #[test]
        fn framing_round_trip(payload in proptest::prelude::any::<String>(), chunk in 1usize..64) {
            let mut client = client(ChunkedStream::framed(payload.as_bytes(), chunk));
            let response = client.receive().unwrap();
            proptest::prop_assert_eq!(payload, response);
        }

        #[test]
        fn truncated_frames_never_decode(payload in "[a-z]{1,64}", cut in 0usize..64) {
            let frame = encode_frame(payload.as_bytes()).unwrap();
            let cut = cut % frame.len();
            let mut client = client(ChunkedStream::new(frame[..cut].to_vec(), 5));
            let err = client.receive().unwrap_err();
            proptest::prop_assert!(err.is_transport(), "err={:?}", err);
        }
    }
}
