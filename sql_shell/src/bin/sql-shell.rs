use std::io::{Read, Write};
use std::sync::Arc;

use arrrg::CommandLine;
use indicio::{clue, stdio::StdioEmitter, ALWAYS, INFO};

use frame_sock::{Client, ClientOptions};
use sql_shell::{Error, LineSource, ReadlineSource, ScriptSource, Shell, DEFAULT_PROMPT};

const USAGE: &str = "USAGE: sql-shell [OPTIONS] <host> <port>";

#[derive(Clone, Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(optional, "Prompt shown before each line.", "PROMPT")]
    prompt: String,
    #[arrrg(optional, "Read lines from this file instead of the terminal.", "PATH")]
    script: Option<String>,
    #[arrrg(flag, "Do not print the elapsed time of each request.")]
    no_timing: bool,
    #[arrrg(flag, "Print clues about the session to stdout.")]
    verbose: bool,
    #[arrrg(nested)]
    client: ClientOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            script: None,
            no_timing: false,
            verbose: false,
            client: ClientOptions::default(),
        }
    }
}

fn run<L: LineSource, S: Read + Write>(source: L, client: Client<S>, timing: bool) -> i32 {
    let mut shell = Shell::new(source, client, std::io::stdout()).with_timing(timing);
    match shell.run() {
        Ok(()) => 0,
        Err(Error::Interrupted) => 1,
        Err(err) => {
            eprintln!("{}", err);
            1
        }
    }
}

fn main() {
    let (options, free) = Options::from_command_line_relaxed(USAGE);
    if free.len() != 2 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }
    let host = free[0].as_str();
    let port = match free[1].parse::<u16>() {
        Ok(port) => port,
        Err(err) => {
            eprintln!("invalid port {:?}: {}", free[1], err);
            std::process::exit(1);
        }
    };
    if options.verbose {
        let emitter = Arc::new(StdioEmitter);
        frame_sock::COLLECTOR.register(Arc::clone(&emitter));
        frame_sock::COLLECTOR.set_verbosity(INFO);
        sql_shell::COLLECTOR.register(emitter);
        sql_shell::COLLECTOR.set_verbosity(INFO);
        clue!(sql_shell::COLLECTOR, ALWAYS, {
            new_process: std::env::args().map(String::from).collect::<Vec<_>>(),
        });
    }
    let client = match Client::connect(host, port, options.client.clone()) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };
    let timing = !options.no_timing;
    let status = match &options.script {
        Some(path) => match ScriptSource::from_path(path) {
            Ok(source) => run(source, client, timing),
            Err(err) => {
                eprintln!("could not load script {}: {}", path, err);
                1
            }
        },
        None => match ReadlineSource::new(options.prompt.as_str()) {
            Ok(source) => run(source, client, timing),
            Err(err) => {
                eprintln!("{}", err);
                1
            }
        },
    };
    std::process::exit(status);
}
