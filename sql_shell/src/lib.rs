//! sql_shell reads one line at a time, sends it to a frame_sock server, and prints the response
//! along with how long the round trip took.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::Path;

use biometrics::{Counter, Moments};
use indicio::{clue, ERROR, INFO};
use rustyline::error::ReadlineError;
use rustyline::history::MemHistory;
use rustyline::{Config, Editor};
use utilz::stopwatch::Stopwatch;

use frame_sock::Client;

///////////////////////////////////////////// constants ////////////////////////////////////////////

pub const DEFAULT_PROMPT: &str = "(sql) ";
pub const INTRO: &str = "Welcome to the server.";

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static LINES_READ: Counter = Counter::new("sql_shell.lines_read");
static BLANK_LINES: Counter = Counter::new("sql_shell.blank_lines");
static INTERRUPTED: Counter = Counter::new("sql_shell.interrupted");
static SESSION_ERROR: Counter = Counter::new("sql_shell.session_error");

static ROUND_TRIP: Moments = Moments::new("sql_shell.round_trip");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&LINES_READ);
    collector.register_counter(&BLANK_LINES);
    collector.register_counter(&INTERRUPTED);
    collector.register_counter(&SESSION_ERROR);
    collector.register_moments(&ROUND_TRIP);
    frame_sock::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Debug)]
pub enum Error {
    Client(frame_sock::Error),
    Readline { what: String },
    Interrupted,
    Io(std::io::Error),
}

impl From<frame_sock::Error> for Error {
    fn from(err: frame_sock::Error) -> Self {
        Self::Client(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ReadlineError> for Error {
    fn from(err: ReadlineError) -> Self {
        match err {
            ReadlineError::Interrupted => {
                INTERRUPTED.click();
                Self::Interrupted
            }
            err => Self::Readline {
                what: err.to_string(),
            },
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Client(err) => write!(f, "{}", err),
            Error::Readline { what } => write!(f, "could not read line: {}", what),
            Error::Interrupted => write!(f, "interrupted"),
            Error::Io(err) => write!(f, "could not write output: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Client(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

//////////////////////////////////////////// LineSource ////////////////////////////////////////////

/// A [LineSource] produces the lines of a session.  `None` marks the end of input.
pub trait LineSource {
    fn next_line(&mut self) -> Result<Option<String>, Error>;
}

////////////////////////////////////////// ReadlineSource //////////////////////////////////////////

/// A [ReadlineSource] reads from the terminal with line editing and an in-memory history.
pub struct ReadlineSource {
    rl: Editor<(), MemHistory>,
    prompt: String,
}

impl ReadlineSource {
    pub fn new(prompt: impl Into<String>) -> Result<Self, Error> {
        let config = Config::builder()
            .max_history_size(1_000_000)?
            .history_ignore_dups(true)?
            .history_ignore_space(true)
            .build();
        let hist = MemHistory::new();
        let rl = Editor::with_history(config, hist)?;
        Ok(Self::with_editor(rl, prompt))
    }

    pub fn with_editor(rl: Editor<(), MemHistory>, prompt: impl Into<String>) -> Self {
        Self {
            rl,
            prompt: prompt.into(),
        }
    }
}

impl LineSource for ReadlineSource {
    fn next_line(&mut self) -> Result<Option<String>, Error> {
        match self.rl.readline(&self.prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    self.rl.add_history_entry(line.as_str())?;
                }
                Ok(Some(line))
            }
            Err(ReadlineError::Eof) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/////////////////////////////////////////// ScriptSource ///////////////////////////////////////////

/// A [ScriptSource] plays back a fixed list of lines.
#[derive(Clone, Debug, Default)]
pub struct ScriptSource {
    lines: VecDeque<String>,
}

impl ScriptSource {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(lines: I) -> Self {
        Self {
            lines: lines.into_iter().map(|s| s.into()).collect(),
        }
    }

    /// One line of the file per request.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let script = std::fs::read_to_string(path)?;
        Ok(Self::new(script.lines()))
    }
}

impl LineSource for ScriptSource {
    fn next_line(&mut self) -> Result<Option<String>, Error> {
        Ok(self.lines.pop_front())
    }
}

/////////////////////////////////////////////// Shell //////////////////////////////////////////////

/// A [Shell] owns the session:  it reads a line, sends it, waits for the response, and prints it.
pub struct Shell<L: LineSource, S: Read + Write, W: Write> {
    source: L,
    client: Client<S>,
    output: W,
    timing: bool,
}

impl<L: LineSource, S: Read + Write, W: Write> Shell<L, S, W> {
    pub fn new(source: L, client: Client<S>, output: W) -> Self {
        Self {
            source,
            client,
            output,
            timing: true,
        }
    }

    /// Print the elapsed time after every response.  On by default.
    pub fn with_timing(mut self, timing: bool) -> Self {
        self.timing = timing;
        self
    }

    /// Run until the line source is exhausted or the session fails.  The connection is closed
    /// either way.
    pub fn run(&mut self) -> Result<(), Error> {
        let result = self.repl();
        self.client.close();
        if let Err(err) = &result {
            SESSION_ERROR.click();
            clue!(COLLECTOR, ERROR, {
                session_error: err.to_string(),
            });
        }
        result
    }

    /// Send one line and print its response.
    pub fn execute(&mut self, line: &str) -> Result<(), Error> {
        let sw = Stopwatch::default();
        let response = self.client.invoke(line)?;
        let elapsed = sw.since();
        ROUND_TRIP.add(elapsed);
        writeln!(self.output, "{}", response)?;
        if self.timing {
            writeln!(self.output, "({:.3} sec)", elapsed)?;
        }
        self.output.flush()?;
        Ok(())
    }

    pub fn into_parts(self) -> (L, Client<S>, W) {
        (self.source, self.client, self.output)
    }

    fn repl(&mut self) -> Result<(), Error> {
        writeln!(self.output, "{}", INTRO)?;
        self.output.flush()?;
        while let Some(line) = self.source.next_line()? {
            LINES_READ.click();
            // An empty request puts nothing on the wire, so no response would ever arrive.
            if line.trim().is_empty() {
                BLANK_LINES.click();
                continue;
            }
            self.execute(&line)?;
        }
        clue!(COLLECTOR, INFO, {
            end_of_input: true,
        });
        Ok(())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
