use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use biometrics::Counter;
use indicio::{clue, ERROR, INFO};

use crate::{write_frame, Error, COLLECTOR};

/// The most bytes the server reads for a single request.  Each read is one request.
pub const REQUEST_BUFFER_SIZE: usize = 8192;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ACCEPT: Counter = Counter::new("frame_sock.server.accept");
static ACCEPT_ERROR: Counter = Counter::new("frame_sock.server.accept_error");
static REQUESTS: Counter = Counter::new("frame_sock.server.requests");
static REQUEST_NOT_UTF8: Counter = Counter::new("frame_sock.server.request_not_utf8");
static CONNECTION_ERROR: Counter = Counter::new("frame_sock.server.connection_error");

pub(crate) fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&ACCEPT);
    collector.register_counter(&ACCEPT_ERROR);
    collector.register_counter(&REQUESTS);
    collector.register_counter(&REQUEST_NOT_UTF8);
    collector.register_counter(&CONNECTION_ERROR);
}

////////////////////////////////////////////// tables //////////////////////////////////////////////

/// Render rows the way a query result travels over the wire.  Every cell is followed by a tab and
/// every row by a newline.  The trailer counts the rows after the first, which is the header.
pub fn format_table<S: AsRef<str>>(rows: &[Vec<S>]) -> String {
    let mut table = String::new();
    for row in rows.iter() {
        for cell in row.iter() {
            table += cell.as_ref();
            table.push('\t');
        }
        table.push('\n');
    }
    table += &format!("DONE TOTAL {} LINES\n", rows.len().saturating_sub(1));
    table
}

/// Render a failure as a table with a single one-cell row.
pub fn format_error(what: &str) -> String {
    format_table(&[vec![what]])
}

///////////////////////////////////////////// Invokable ////////////////////////////////////////////

/// An [Invokable] answers one request with one response.
pub trait Invokable: Send + Sync {
    fn invoke(&self, request: &str) -> String;
}

////////////////////////////////////////////// Server //////////////////////////////////////////////

/// A [Server] accepts connections and answers every request it reads with one frame.
pub struct Server {
    addr: String,
    listener: TcpListener,
    invokable: Arc<dyn Invokable>,
}

impl Server {
    pub fn bind<I: Invokable + 'static>(host: &str, port: u16, invokable: I) -> Result<Self, Error> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind((host, port)).map_err(|err| Error::bind(addr.clone(), err))?;
        let invokable = Arc::new(invokable);
        Ok(Server {
            addr,
            listener,
            invokable,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener
            .local_addr()
            .map_err(|err| Error::bind(self.addr.clone(), err))
    }

    /// Accept one connection and serve it until the peer hangs up.
    pub fn serve_one(&self) -> Result<(), Error> {
        let (stream, addr) = self.accept()?;
        serve_connection(self.invokable.as_ref(), stream, addr)
    }

    /// Accept connections forever, serving each on its own thread.
    pub fn serve(&self) -> Result<(), Error> {
        clue!(COLLECTOR, INFO, {
            listening: self.addr.as_str(),
        });
        loop {
            let (stream, addr) = self.accept()?;
            let invokable = Arc::clone(&self.invokable);
            let _handle = std::thread::spawn(move || {
                if let Err(err) = serve_connection(invokable.as_ref(), stream, addr) {
                    CONNECTION_ERROR.click();
                    clue!(COLLECTOR, ERROR, {
                        peer: addr.to_string(),
                        error: err.to_string(),
                    });
                }
            });
        }
    }

    fn accept(&self) -> Result<(TcpStream, SocketAddr), Error> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                ACCEPT.click();
                clue!(COLLECTOR, INFO, {
                    accept: addr.to_string(),
                });
                Ok((stream, addr))
            }
            Err(err) => {
                ACCEPT_ERROR.click();
                Err(Error::transport("accept", err))
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(fmt, "Server({:?})", self.addr)
    }
}

fn serve_connection(
    invokable: &dyn Invokable,
    mut stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Error> {
    let mut buf = vec![0u8; REQUEST_BUFFER_SIZE];
    loop {
        let amt = match stream.read(&mut buf) {
            Ok(amt) => amt,
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                continue;
            }
            Err(err) => {
                return Err(Error::transport("read", err));
            }
        };
        if amt == 0 {
            break;
        }
        REQUESTS.click();
        let response = match std::str::from_utf8(&buf[..amt]) {
            Ok(request) => {
                clue!(COLLECTOR, INFO, {
                    peer: addr.to_string(),
                    request: request,
                });
                invokable.invoke(request)
            }
            Err(err) => {
                REQUEST_NOT_UTF8.click();
                format_error(&format!("request is not valid utf8: {}", err))
            }
        };
        write_frame(&mut stream, response.as_bytes())?;
    }
    clue!(COLLECTOR, INFO, {
        hangup: addr.to_string(),
    });
    Ok(())
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
