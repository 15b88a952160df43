//! Monitor thread: periodic reports, recording restarts, and the
//! interactive control socket.
//!
//! The thread multiplexes the accept socket, at most one client
//! connection, and a periodic timer that only runs while recording.
//! Every timer tick prints a report; every M-th tick restarts the
//! recording window. The newline protocol answers each command with the
//! response text followed by `PROMPT\n`, and writes `QUIT\n` when the
//! process terminates.

use crate::config::Config;
use crate::engine;
use crate::error::{Error, Result};
use crate::report;
use crate::symbols;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static QUIT: AtomicBool = AtomicBool::new(false);
static LISTENER_FD: AtomicI32 = AtomicI32::new(-1);
static CLIENT_FD: AtomicI32 = AtomicI32::new(-1);
static SOCK_PATH: OnceLock<String> = OnceLock::new();
static MONITOR: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

const HELP_TEXT: &[&str] = &[
    "help     : Print this help.\n",
    "start    : Erase all intervals and start recording the first interval.\n",
    "stop     : Stop recording.\n",
    "restart  : Start a new interval. Keep, and possibly combine, previous intervals.\n",
    "delete   : Delete the oldest interval.\n",
    "stats    : Print overview of backtrace with highest leak probability.\n",
    "stats N  : Automatically print stats every N seconds (use 0 to turn off).\n",
    "restart M: Automatically restart every N * M stats.\n",
    "list N   : When printing stats, print only the first N backtraces.\n",
    "dump N   : Print backtrace number N.\n",
];

/// Start the monitor thread. Called once, at the end of bootstrap.
pub fn spawn() {
    match std::thread::Builder::new()
        .name("memleak-monitor".into())
        .spawn(run)
    {
        Ok(handle) => {
            if let Ok(mut slot) = MONITOR.lock() {
                *slot = Some(handle);
            }
        }
        Err(e) => eprintln!("memleak: failed to start the monitor thread: {}", e),
    }
}

fn run() {
    unsafe {
        libc::atexit(terminate);
    }
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("memleak: {}", e);
            return;
        }
    };
    let listener = match bind_listener(&config.sockname) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("memleak: {}", e);
            return;
        }
    };
    println!("memleak: Listening on \"{}\".", config.sockname);
    println!("memleak: Restart multiplier set to {}", config.restart_multiplier);
    println!(
        "memleak: Printing memory statistics every {} seconds.",
        config.stats_interval
    );
    LISTENER_FD.store(listener.as_raw_fd(), Ordering::Release);
    let sockname = config.sockname.clone();
    serve(listener, config);
    let _ = std::fs::remove_file(&sockname);
}

/// Process-exit hook: wake the monitor, tell the client, and print one
/// final report.
extern "C" fn terminate() {
    QUIT.store(true, Ordering::Release);
    let client = CLIENT_FD.load(Ordering::Acquire);
    if client >= 0 {
        unsafe {
            libc::write(client, b"QUIT\n".as_ptr() as *const libc::c_void, 5);
            libc::shutdown(client, libc::SHUT_RDWR);
        }
    }
    let listener = LISTENER_FD.load(Ordering::Acquire);
    if listener >= 0 {
        unsafe {
            libc::shutdown(listener, libc::SHUT_RDWR);
        }
        // A blocked poll on the accept socket is not guaranteed to see
        // the shutdown; a throwaway connection wakes it for certain.
        if let Some(path) = SOCK_PATH.get() {
            let _ = UnixStream::connect(path);
        }
    }
    let handle = MONITOR.lock().ok().and_then(|mut slot| slot.take());
    if let Some(handle) = handle {
        let _ = handle.join();
    }
    if let Some(path) = SOCK_PATH.get() {
        let _ = std::fs::remove_file(path);
    }
    engine::stop_recording();
    println!("memleak: Final stats:");
    report::print_stats();
}

fn bind_listener(path: &str) -> Result<UnixListener> {
    let _ = SOCK_PATH.set(path.to_string());
    let mut attempts = 0;
    loop {
        match UnixListener::bind(path) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse && attempts < 2 => {
                attempts += 1;
                let _ = std::fs::remove_file(path);
            }
            Err(e) => {
                return Err(Error::Socket(format!("binding \"{}\": {}", path, e)));
            }
        }
    }
}

enum ClientAction {
    /// Command answered; keep waiting.
    Handled,
    /// Fall through to the report (and maybe to a recording restart).
    Stats { reset_count: bool },
    /// Connection closed or broken.
    Drop,
}

fn serve(listener: UnixListener, config: Config) {
    let mut stats_interval = Duration::from_secs(config.stats_interval);
    let mut restart_multiplier = config.restart_multiplier;
    let mut client: Option<UnixStream> = None;
    let mut count: i64 = 0;

    loop {
        let recording = engine::lock().recording;
        let deadline = recording.then(|| Instant::now() + stats_interval);

        'wait: loop {
            if QUIT.load(Ordering::Acquire) {
                return;
            }
            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let ms = remaining.as_millis().min(i32::MAX as u128) as i32;
                    PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
                }
                None => PollTimeout::NONE,
            };

            let (listener_ready, client_ready) = {
                let mut fds = Vec::with_capacity(2);
                fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
                if let Some(stream) = &client {
                    fds.push(PollFd::new(stream.as_fd(), PollFlags::POLLIN));
                }
                match poll(&mut fds, timeout) {
                    Ok(0) => break 'wait,
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue 'wait,
                    Err(e) => {
                        if QUIT.load(Ordering::Acquire) {
                            return;
                        }
                        eprintln!("memleak: poll: {}", e);
                        return;
                    }
                }
                let ready = |fd: &PollFd<'_>| fd.revents().is_some_and(|r| !r.is_empty());
                (ready(&fds[0]), fds.get(1).is_some_and(ready))
            };

            if listener_ready {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        println!(
                            "memleak: Accepted a connection on \"{}\".",
                            config.sockname
                        );
                        let _ = stream.write_all(b"PROMPT\n");
                        CLIENT_FD.store(stream.as_raw_fd(), Ordering::Release);
                        client = Some(stream);
                    }
                    Err(e) => {
                        if QUIT.load(Ordering::Acquire) {
                            return;
                        }
                        eprintln!("memleak: accept: {}", e);
                        return;
                    }
                }
            }

            if client_ready && let Some(stream) = &mut client {
                match handle_client(stream, &mut stats_interval, &mut restart_multiplier) {
                    ClientAction::Handled => {}
                    ClientAction::Stats { reset_count } => {
                        if reset_count {
                            count = -1;
                        }
                        break 'wait;
                    }
                    ClientAction::Drop => {
                        println!("memleak: Closing connection on \"{}\".", config.sockname);
                        CLIENT_FD.store(-1, Ordering::Release);
                        client = None;
                        break 'wait;
                    }
                }
            }
        }

        count += 1;
        if count % restart_multiplier == 0 {
            engine::restart_recording();
        }
        if QUIT.load(Ordering::Acquire) {
            return;
        }
        report::print_stats();
    }
}

/// Read one command from the client and answer it. Every answer ends
/// with `PROMPT\n`.
fn handle_client(
    stream: &mut UnixStream,
    stats_interval: &mut Duration,
    restart_multiplier: &mut i64,
) -> ClientAction {
    let mut buf = [0u8; 80];
    let len = match stream.read(&mut buf) {
        Ok(len) => len,
        Err(e) => {
            eprintln!("memleak: read: {}", e);
            return ClientAction::Drop;
        }
    };
    if len == 0 {
        return ClientAction::Drop;
    }
    let line = String::from_utf8_lossy(&buf[..len]);
    let command = parse_command(&line);

    match command {
        Command::Start | Command::Restart => {
            let recording = engine::lock().recording;
            let eligible = matches!(command, Command::Start) != recording;
            if eligible {
                let _ = write!(
                    stream,
                    "Auto restart interval is {} * {} seconds.\n",
                    restart_multiplier,
                    stats_interval.as_secs()
                );
                let _ = stream.write_all(b"PROMPT\n");
                return ClientAction::Stats { reset_count: true };
            }
            let _ = stream.write_all(b"Ignored.\n");
        }
        Command::Stats => {
            let _ = stream.write_all(b"PROMPT\n");
            return ClientAction::Stats { reset_count: false };
        }
        Command::Help => {
            for help_line in HELP_TEXT {
                let _ = stream.write_all(help_line.as_bytes());
            }
        }
        Command::Stop => {
            if engine::lock().recording {
                engine::stop_recording();
                let _ = stream.write_all(b"Stopped.\n");
            } else {
                let _ = stream.write_all(b"Ignored.\n");
            }
        }
        Command::Delete => {
            let bound = engine::lock().oldest_interval_end;
            let _ = write!(
                stream,
                "Deleting all intervals that end before {} seconds since application start.\n",
                bound
            );
            engine::delete_intervals_upto(bound);
        }
        Command::StatsEvery(seconds) => {
            if seconds >= 1 {
                *stats_interval = Duration::from_secs(seconds as u64);
                let _ = write!(
                    stream,
                    "Printing memory statistics every {} seconds.\n",
                    seconds
                );
            } else {
                let _ = stream
                    .write_all(b"Interval between printing of stats must be at least 1 second.\n");
            }
        }
        Command::RestartEvery(multiplier) => {
            if multiplier >= 2 {
                *restart_multiplier = multiplier;
                let _ = write!(stream, "Restart multiplier set to {}.\n", multiplier);
            } else {
                let _ = stream.write_all(b"Restart multiplier must be at least 2.\n");
            }
        }
        Command::List(limit) => {
            if limit >= 1 {
                engine::lock().max_backtraces = limit as usize;
                if limit == 1 {
                    let _ = stream.write_all(b"Now printing only the first backtrace.\n");
                } else {
                    let _ = write!(stream, "Now printing the first {} backtraces.\n", limit);
                }
            } else {
                let _ = stream.write_all(b"Argument of list must be at least 1.\n");
            }
        }
        Command::Dump(id) => dump_backtrace(stream, id),
        Command::Empty => {}
        Command::Unknown => {
            let _ = stream.write_all(b"Ignored.\n");
        }
    }
    let _ = stream.write_all(b"PROMPT\n");
    ClientAction::Handled
}

fn dump_backtrace(stream: &mut UnixStream, id: i64) {
    let frames = {
        let engine = engine::lock();
        let mut entry = engine.first_ranked;
        unsafe {
            while !entry.is_null() && (*entry).id as i64 != id {
                entry = (*entry).next_ranked;
            }
            (!entry.is_null()).then(|| (*entry).frames().to_vec())
        }
    };
    match frames {
        Some(pcs) => {
            // The resolver allocates heavily; keep that out of the
            // accounts.
            let _guard = engine::ReportGuard::enter();
            let mut resolver = match symbols::resolver().lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = resolver.resolve_and_print(stream, &pcs) {
                eprintln!("memleak: dump: {}", e);
            }
        }
        None => {
            let _ = write!(stream, "Backtrace {} doesn't exist.\n", id);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Start,
    Stop,
    Restart,
    Delete,
    Stats,
    StatsEvery(i64),
    RestartEvery(i64),
    List(i64),
    Dump(i64),
    Empty,
    Unknown,
}

fn parse_command(input: &str) -> Command {
    let line = input.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    // Arguments parse like atoi: garbage reads as zero and is caught by
    // the bounds checks.
    let arg = |rest: &str| rest.trim().parse::<i64>().unwrap_or(0);
    match line {
        "help" => Command::Help,
        "start" => Command::Start,
        "stop" => Command::Stop,
        "restart" => Command::Restart,
        "delete" => Command::Delete,
        "stats" => Command::Stats,
        _ => {
            if let Some(rest) = line.strip_prefix("stats ") {
                Command::StatsEvery(arg(rest))
            } else if let Some(rest) = line.strip_prefix("restart ") {
                Command::RestartEvery(arg(rest))
            } else if let Some(rest) = line.strip_prefix("list ") {
                Command::List(arg(rest))
            } else if let Some(rest) = line.strip_prefix("dump ") {
                Command::Dump(arg(rest))
            } else {
                Command::Unknown
            }
        }
    }
}
