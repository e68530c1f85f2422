use std::sync::Arc;

use arrrg::CommandLine;
use indicio::{clue, stdio::StdioEmitter, ALWAYS, INFO};

use frame_sock::{format_table, Invokable, Server};

#[derive(Clone, Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(optional, "Address to listen on.", "HOST")]
    host: String,
    #[arrrg(optional, "Port to listen on.", "PORT")]
    port: u16,
    #[arrrg(flag, "Print a clue for every connection and request.")]
    verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
            verbose: false,
        }
    }
}

/// Answers every request with a table describing the request.
struct Describe;

impl Invokable for Describe {
    fn invoke(&self, request: &str) -> String {
        let rows = vec![
            vec!["request".to_string(), "bytes".to_string()],
            vec![request.to_string(), request.len().to_string()],
        ];
        format_table(&rows)
    }
}

fn main() {
    let (options, free) =
        Options::from_command_line_relaxed("USAGE: frame-sock-server [--host HOST] [--port PORT]");
    if !free.is_empty() {
        eprintln!("command takes no positional arguments");
        std::process::exit(1);
    }
    if options.verbose {
        let emitter = Arc::new(StdioEmitter);
        frame_sock::COLLECTOR.register(emitter);
        frame_sock::COLLECTOR.set_verbosity(INFO);
        clue!(frame_sock::COLLECTOR, ALWAYS, {
            new_process: std::env::args().map(String::from).collect::<Vec<_>>(),
        });
    }
    let server = match Server::bind(&options.host, options.port, Describe) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    println!("Cli server started at {}:{}", options.host, options.port);
    if let Err(err) = server.serve() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
