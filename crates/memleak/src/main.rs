//! Interactive client for the memleak-trace control socket.
//!
//! Connects to the unix socket served by a traced process, relays
//! commands typed on stdin, and prints the report text coming back.
//! The server ends every command response with a `PROMPT\n` trailer and
//! announces its own termination with `QUIT\n`.

use anyhow::Context;
use clap::Parser;
use std::io::{BufRead, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "memleak")]
#[command(about = "Control client for a process traced by memleak-trace")]
#[command(version)]
struct Cli {
    /// Path of the control socket (default: $LIBMEMLEAK_SOCKNAME, then "memleak_sock")
    #[arg(long, short = 's')]
    socket: Option<PathBuf>,
}

/// Protocol trailer the server appends to a chunk.
#[derive(Debug, PartialEq, Eq)]
enum Trailer {
    None,
    Prompt,
    Quit,
}

/// Strip the protocol trailer off a received chunk.
fn split_trailer(buf: &[u8]) -> (&[u8], Trailer) {
    if let Some(payload) = buf.strip_suffix(b"PROMPT\n") {
        (payload, Trailer::Prompt)
    } else if let Some(payload) = buf.strip_suffix(b"QUIT\n") {
        (payload, Trailer::Quit)
    } else {
        (buf, Trailer::None)
    }
}

fn socket_path(cli: &Cli) -> PathBuf {
    cli.socket.clone().unwrap_or_else(|| {
        std::env::var_os("LIBMEMLEAK_SOCKNAME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("memleak_sock"))
    })
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = socket_path(&cli);

    let mut stream = match UnixStream::connect(&path) {
        Ok(stream) => stream,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            anyhow::bail!(
                "connect: \"{}\": no such socket\n\
                 Set LIBMEMLEAK_SOCKNAME or pass --socket to pick a different path.",
                path.display()
            );
        }
        Err(e) => {
            return Err(e).with_context(|| format!("connecting to \"{}\"", path.display()));
        }
    };

    ctrlc::set_handler(|| std::process::exit(0)).context("setting the Ctrl-C handler")?;

    let stdin = std::io::stdin();
    let mut stdin = stdin.lock();
    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).context("reading from the socket")?;
        if n == 0 {
            println!("Application terminated.");
            return Ok(());
        }
        let (payload, trailer) = split_trailer(&buf[..n]);
        stdout.write_all(payload)?;
        stdout.flush()?;
        match trailer {
            Trailer::Quit => {
                println!("Application terminated.");
                return Ok(());
            }
            Trailer::Prompt => loop {
                print!("memleak> ");
                stdout.flush()?;
                let mut line = String::new();
                if stdin.read_line(&mut line)? == 0 {
                    return Ok(());
                }
                let line = line.trim();
                if !line.is_empty() {
                    stream
                        .write_all(line.as_bytes())
                        .context("writing to the socket")?;
                    break;
                }
            },
            Trailer::None => {}
        }
    }
}
