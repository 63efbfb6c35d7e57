//! Command-line front end for the rondo client.
//!
//! Sends one command to the server, optionally several times, and prints
//! every reply with its round-trip latency.
//!
//! # Usage
//!
//! ```sh
//! rondo-cli --port 6379 --threads 2 --repeat 10 SET greeting hello
//! ```

use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use rondo::{Client, ClientConfig, ClientError, Command};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{failed} of {total} request(s) failed")]
    Failed { failed: usize, total: usize },
}

struct Options {
    config: ClientConfig,
    repeat: usize,
    command: Command,
}

fn main() -> ExitCode {
    rondo::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rondo-cli: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<(), CliError> {
    let Some(options) = parse_args(args)? else {
        print_usage();
        return Ok(());
    };

    let client = Client::new();
    client.configure(options.config)?;
    client.start()?;

    let (tx, rx) = mpsc::channel::<(usize, Option<String>, Duration)>();
    for seq in 0..options.repeat {
        let tx = tx.clone();
        let sent = minstant::Instant::now();
        client.execute(options.command.clone(), move |reply| {
            // Copy out: the reply is only borrowed for this call.
            let _ = tx.send((seq, reply.map(ToString::to_string), sent.elapsed()));
        });
    }
    drop(tx);

    let mut failed = 0;
    for (seq, reply, latency) in rx.iter().take(options.repeat) {
        match reply {
            Some(reply) => println!("[{seq}] ({latency:?}) {reply}"),
            None => {
                failed += 1;
                println!("[{seq}] ({latency:?}) (failed)");
            }
        }
    }

    client.join()?;

    if failed > 0 {
        return Err(CliError::Failed {
            failed,
            total: options.repeat,
        });
    }
    Ok(())
}

/// Parses arguments. Returns `None` when help was requested.
fn parse_args(args: &[String]) -> Result<Option<Options>, CliError> {
    let mut config = ClientConfig::default();
    let mut repeat = 1;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-h" => config.host = value(args, &mut i)?.to_owned(),
            "--port" | "-p" => config.port = number(args, &mut i)?,
            "--threads" | "-t" => config.threads = number(args, &mut i)?,
            "--connections" | "-c" => config.connections_per_thread = number(args, &mut i)?,
            "--repeat" | "-r" => repeat = number(args, &mut i)?,
            "--help" => return Ok(None),
            arg if arg.starts_with('-') => {
                return Err(CliError::Usage(format!("unknown argument: {arg}")));
            }
            _ => break,
        }
        i += 1;
    }

    if i >= args.len() {
        return Err(CliError::Usage("missing command".into()));
    }
    let command: Command = args[i..].iter().collect();

    Ok(Some(Options {
        config,
        repeat,
        command,
    }))
}

/// Returns the value following the flag at `i`, advancing past it.
fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, CliError> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn number<T: std::str::FromStr>(args: &[String], i: &mut usize) -> Result<T, CliError>
where
    T::Err: std::fmt::Display,
{
    let flag = args[*i].clone();
    value(args, i)?
        .parse()
        .map_err(|e| CliError::Usage(format!("invalid value for {flag}: {e}")))
}

fn print_usage() {
    eprintln!(
        r"rondo-cli - send commands to a key-value server

USAGE:
    rondo-cli [OPTIONS] COMMAND [ARGS...]

OPTIONS:
    -h, --host <HOST>          Server host (default: 127.0.0.1)
    -p, --port <PORT>          Server port (default: 6379)
    -t, --threads <N>          Worker threads (default: 1)
    -c, --connections <N>      Connections per worker (default: 3)
    -r, --repeat <N>           Send the command N times (default: 1)
        --help                 Print this help message

EXAMPLE:
    rondo-cli PING
    rondo-cli --threads 2 --repeat 100 GET greeting
"
    );
}
