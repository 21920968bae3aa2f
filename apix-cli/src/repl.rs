//! Interactive REPL.

use crate::commands::build_packet;
use crate::worker::{Reply, Request, Worker};
use apix_core::{Config, Descriptor, DescriptorInfo};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  tcp | unix                    Select a transport
  listen <addr>                 Open a server on the selected transport
  open <addr>                   Connect on the selected transport
  close [fd]                    Close a descriptor (default: current)
  fds, ll                       List open descriptors
  use <fd>                      Select the current descriptor
  print all|cur                 Show data of every descriptor, or the current one
  send <message>                Send raw bytes to the current descriptor
  srrp-mode <node>|off          Switch the current descriptor to SRRP packets
  srrp <category> <leader> <anchor> [payload]
                                Send a packet to the current descriptor
  exit                          Leave the transport, or quit
  quit                          Quit

Press Enter to show data received since the last command.
"#;

const NO_TRANSPORT: &str = "select a transport first: tcp or unix";

/// Transport selected for `listen` and `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    None,
    Tcp,
    Unix,
}

impl Mode {
    fn name(self) -> &'static str {
        match self {
            Mode::None => "apix",
            Mode::Tcp => "tcp",
            Mode::Unix => "unix",
        }
    }

    fn kinds(self) -> Option<(&'static str, &'static str)> {
        match self {
            Mode::None => None,
            Mode::Tcp => Some((apix_core::TCP_CLIENT, apix_core::TCP_SERVER)),
            Mode::Unix => Some((apix_core::UNIX_CLIENT, apix_core::UNIX_SERVER)),
        }
    }
}

/// A parsed REPL line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Empty,
    Help,
    Quit,
    Exit,
    Select(Mode),
    Print { all: bool },
    List,
    Use(Option<Descriptor>),
    Listen(String),
    Open(String),
    Close(Option<Descriptor>),
    Send(String),
    SrrpMode(Option<String>),
    Srrp {
        category: String,
        leader: String,
        anchor: String,
        payload: String,
    },
}

pub fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "apix CLI".bold().cyan());
    let worker = Worker::spawn(config)?;

    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(
        rustyline::Config::builder()
            .history_ignore_space(true)
            .auto_add_history(true)
            .build(),
    )?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".apix_history"))
        .unwrap_or_else(|_| ".apix_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    let mut mode = Mode::None;
    loop {
        flush_session(&worker);

        let prompt = prompt(&worker, mode);
        match rl.readline(&prompt) {
            Ok(line) => match parse_line(&line) {
                Ok(Command::Quit) => break,
                Ok(Command::Exit) if mode == Mode::None => break,
                Ok(cmd) => match execute(&worker, &mut mode, cmd) {
                    Ok(Some(output)) => println!("{}", output),
                    Ok(None) => {}
                    Err(e) => println!("{}: {}", "Error".red(), e),
                },
                Err(usage) => println!("{}", usage),
            },
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    drop(worker);
    println!("{}", "Bye.".dimmed());
    Ok(())
}

fn flush_session(worker: &Worker) {
    let output = worker.session().lock().take_output();
    for line in output {
        println!("{}", line);
    }
}

fn prompt(worker: &Worker, mode: Mode) -> String {
    let session = worker.session().lock();
    let current = session.cur.and_then(|d| session.get(d));
    match current {
        Some(fd) if mode != Mode::None => format!("{}>{}> ", mode.name(), fd.label())
            .cyan()
            .to_string(),
        _ => format!("{}> ", mode.name()).cyan().to_string(),
    }
}

fn parse_line(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let command = match cmd.to_lowercase().as_str() {
        "" => Command::Empty,
        "help" | "?" => Command::Help,
        "quit" | "q" => Command::Quit,
        "exit" => Command::Exit,
        "tcp" => Command::Select(Mode::Tcp),
        "unix" => Command::Select(Mode::Unix),
        "fds" | "ll" => Command::List,
        "print" => match args.first().copied() {
            Some("all") => Command::Print { all: true },
            Some("cur") => Command::Print { all: false },
            _ => return Err("Usage: print all|cur".to_string()),
        },
        "use" => Command::Use(match args.first() {
            Some(arg) => Some(parse_fd(arg)?),
            None => None,
        }),
        "listen" => match args.as_slice() {
            [addr] => Command::Listen(addr.to_string()),
            _ => return Err("Usage: listen <addr>".to_string()),
        },
        "open" => match args.as_slice() {
            [addr] => Command::Open(addr.to_string()),
            _ => return Err("Usage: open <addr>".to_string()),
        },
        "close" => Command::Close(match args.first() {
            Some(arg) => Some(parse_fd(arg)?),
            None => None,
        }),
        "send" => {
            if rest.is_empty() {
                return Err("Usage: send <message>".to_string());
            }
            Command::Send(rest.to_string())
        }
        "srrp-mode" => match args.as_slice() {
            ["off"] => Command::SrrpMode(None),
            [node] => Command::SrrpMode(Some(node.to_string())),
            _ => return Err("Usage: srrp-mode <node>|off".to_string()),
        },
        "srrp" => {
            let mut parts = rest.splitn(4, char::is_whitespace);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(category), Some(leader), Some(anchor)) if !category.is_empty() => {
                    Command::Srrp {
                        category: category.to_string(),
                        leader: leader.to_string(),
                        anchor: anchor.to_string(),
                        payload: parts.next().unwrap_or("").trim().to_string(),
                    }
                }
                _ => {
                    return Err("Usage: srrp <category> <leader> <anchor> [payload]".to_string())
                }
            }
        }
        other => return Err(format!("Unknown command: {}. Type 'help' for usage.", other)),
    };
    Ok(command)
}

/// Accepts `3` or `#3`.
fn parse_fd(arg: &str) -> Result<Descriptor, String> {
    arg.trim_start_matches('#')
        .parse::<u32>()
        .map(Descriptor::from_raw)
        .map_err(|_| format!("invalid descriptor: {}", arg))
}

fn execute(
    worker: &Worker,
    mode: &mut Mode,
    cmd: Command,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    match cmd {
        Command::Empty => Ok(None),
        Command::Help => Ok(Some(HELP_TEXT.to_string())),
        Command::Quit => Ok(None),

        Command::Exit => {
            *mode = Mode::None;
            worker.session().lock().cur = None;
            Ok(None)
        }

        Command::Select(selected) => {
            *mode = selected;
            Ok(None)
        }

        Command::Print { all } => {
            worker.session().lock().print_all = all;
            Ok(None)
        }

        Command::List => match worker.call(Request::List) {
            Reply::Listing(infos) => {
                let cur = worker.session().lock().cur;
                Ok(Some(format_listing(&infos, cur)))
            }
            reply => Err(failure(reply).into()),
        },

        Command::Use(None) => {
            let session = worker.session().lock();
            let lines: Vec<String> = session
                .fds()
                .map(|(d, fd)| format!("  {} {}", d, fd.label()))
                .collect();
            Ok(Some(if lines.is_empty() {
                "No descriptors".dimmed().to_string()
            } else {
                lines.join("\n")
            }))
        }

        Command::Use(Some(d)) => {
            let mut session = worker.session().lock();
            if session.get(d).is_none() {
                return Err(format!("unknown descriptor {}", d).into());
            }
            session.cur = Some(d);
            Ok(None)
        }

        Command::Listen(addr) => {
            let (_, server) = mode.kinds().ok_or(NO_TRANSPORT)?;
            open(worker, server, addr)
        }

        Command::Open(addr) => {
            let (client, _) = mode.kinds().ok_or(NO_TRANSPORT)?;
            open(worker, client, addr)
        }

        Command::Close(target) => {
            let d = match target {
                Some(d) => d,
                None => current(worker)?,
            };
            match worker.call(Request::Close(d)) {
                Reply::Done => Ok(Some(format!("{} {}", "closed".yellow(), d))),
                reply => Err(failure(reply).into()),
            }
        }

        Command::Send(message) => {
            let d = current(worker)?;
            done(worker.call(Request::Send(d, message.into_bytes())))
        }

        Command::SrrpMode(node) => {
            let d = current(worker)?;
            let node = match node {
                Some(s) => Some(
                    apix_core::config::parse_node_id(&s)
                        .ok_or_else(|| format!("invalid node id: {}", s))?,
                ),
                None => None,
            };
            done(worker.call(Request::SrrpMode(d, node)))
        }

        Command::Srrp {
            category,
            leader,
            anchor,
            payload,
        } => {
            let d = current(worker)?;
            let packet = build_packet(&category, &leader, &anchor, payload.as_bytes())?;
            done(worker.call(Request::SendPacket(d, packet)))
        }
    }
}

fn open(
    worker: &Worker,
    kind: &'static str,
    addr: String,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    match worker.call(Request::Open { kind, addr }) {
        Reply::Opened(d) => {
            let mut session = worker.session().lock();
            session.cur = Some(d);
            let label = session.get(d).map(|fd| fd.label()).unwrap_or_default();
            Ok(Some(format!("{} {}, {}", "opened".green(), d, label)))
        }
        reply => Err(failure(reply).into()),
    }
}

fn current(worker: &Worker) -> Result<Descriptor, String> {
    worker
        .session()
        .lock()
        .cur
        .ok_or_else(|| "no current descriptor; open one or 'use <fd>'".to_string())
}

fn done(reply: Reply) -> Result<Option<String>, Box<dyn std::error::Error>> {
    match reply {
        Reply::Done => Ok(None),
        reply => Err(failure(reply).into()),
    }
}

fn failure(reply: Reply) -> String {
    match reply {
        Reply::Failed(msg) => msg,
        other => format!("unexpected reply: {:?}", other),
    }
}

fn format_listing(infos: &[DescriptorInfo], cur: Option<Descriptor>) -> String {
    if infos.is_empty() {
        return "No descriptors".dimmed().to_string();
    }
    let mut lines = vec![format!(
        "  {:<5} {:<12} {:<4} {:<28} {:>8} {:>8} {:<6}",
        "fd", "kind", "role", "peer", "in", "out", "srrp"
    )
    .bold()
    .to_string()];
    for info in infos {
        let marker = if cur == Some(info.descriptor) { "*" } else { " " };
        let srrp = match (info.srrp, info.remote_node) {
            (true, Some(node)) => format!("{:#06x}", node),
            (true, None) => "on".to_string(),
            (false, _) => "-".to_string(),
        };
        lines.push(format!(
            "{} {:<5} {:<12} {:<4} {:<28} {:>8} {:>8} {:<6}",
            marker,
            info.descriptor.to_string(),
            info.kind,
            info.role.as_char(),
            info.peer,
            info.bytes_in,
            info.bytes_out,
            srrp
        ));
    }
    lines.join("\n")
}
