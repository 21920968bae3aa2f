//! One-shot command execution.

use crate::Commands;
use apix_core::config::parse_node_id;
use apix_core::{Config, Context, Descriptor, Event, TCP_CLIENT, TCP_SERVER};
use apix_srrp::{Category, Decoder, Packet};
use colored::Colorize;
use serde_json::Value;
use std::time::{Duration, Instant};

type CmdResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Executes a command and returns the formatted output.
pub fn execute(config: Config, cmd: Commands) -> CmdResult<String> {
    match cmd {
        Commands::Repl => Err("repl is interactive; run it without a subcommand".into()),

        Commands::Send {
            addr,
            message,
            unix,
            wait,
        } => {
            let mut ctx = context(config)?;
            let fd = ctx.open(client_kind(unix), &addr)?;
            ctx.send(fd, message.as_bytes())?;
            flush(&mut ctx, fd)?;

            // A peer that answers and hangs up leaves the answer in the
            // close event.
            let mut received = Vec::new();
            run_for(&mut ctx, Duration::from_millis(wait), |ctx| {
                while let Some(event) = ctx.next_event() {
                    match event {
                        Event::Readable { descriptor, .. } if descriptor == fd => {
                            received.extend_from_slice(&ctx.consume(fd, usize::MAX)?);
                        }
                        Event::Closed {
                            descriptor,
                            residual,
                            ..
                        } if descriptor == fd => {
                            received.extend_from_slice(&residual);
                            return Ok(true);
                        }
                        _ => {}
                    }
                }
                Ok(false)
            })?;
            ctx.destroy()?;

            if received.is_empty() {
                Ok(format!("{} {} bytes to {}", "Sent".green(), message.len(), addr.cyan()))
            } else {
                Ok(String::from_utf8_lossy(&received).into_owned())
            }
        }

        Commands::Srrp {
            addr,
            category,
            leader,
            anchor,
            payload,
            unix,
            wait,
        } => {
            let packet = build_packet(&category, &leader, &anchor, payload.as_bytes())?;
            let mut ctx = context(config)?;
            let fd = ctx.open(client_kind(unix), &addr)?;
            ctx.enable_srrp_mode(fd, packet.leader())?;
            ctx.send_packet(fd, &packet)?;

            let mut lines = Vec::new();
            run_for(&mut ctx, Duration::from_millis(wait), |ctx| {
                while let Some(event) = ctx.next_event() {
                    match event {
                        Event::Packet(d) if d == fd => {
                            while let Some(reply) = ctx.recv_packet(fd)? {
                                lines.push(describe_packet(&reply));
                            }
                        }
                        Event::Closed {
                            descriptor,
                            packets,
                            ..
                        } if descriptor == fd => {
                            lines.extend(packets.iter().map(describe_packet));
                            return Ok(true);
                        }
                        _ => {}
                    }
                }
                Ok(false)
            })?;
            ctx.destroy()?;

            if lines.is_empty() {
                Ok(format!("{} {}", "Sent".green(), describe_packet(&packet)))
            } else {
                Ok(lines.join("\n"))
            }
        }

        Commands::Listen {
            addr,
            unix,
            srrp,
            count,
        } => {
            let node = srrp
                .map(|s| parse_node_id(&s).ok_or_else(|| format!("invalid node id: {}", s)))
                .transpose()?;

            let mut ctx = context(config)?;
            let listener = ctx.open(server_kind(unix), &addr)?;
            if let Some(node) = node {
                ctx.enable_srrp_mode(listener, node)?;
            }
            let local = ctx.info(listener)?.peer;
            eprintln!("{} on {}", "Listening".green(), local.cyan());
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            let mut seen = 0;
            while count.map_or(true, |n| seen < n) {
                ctx.poll(-1)?;
                while let Some(event) = ctx.next_event() {
                    seen += print_event(&mut ctx, event);
                }
            }
            ctx.destroy()?;
            Ok(String::new())
        }

        Commands::Encode {
            category,
            leader,
            anchor,
            payload,
        } => {
            let packet = build_packet(&category, &leader, &anchor, payload.as_bytes())?;
            Ok(hex::encode(packet.raw()))
        }

        Commands::Decode { hex: input } => {
            let compact: String = input.split_whitespace().collect();
            let bytes = hex::decode(compact)?;

            let mut decoder = Decoder::new();
            decoder.extend(&bytes);
            let mut lines = Vec::new();
            loop {
                match decoder.decode() {
                    Ok(Some(packet)) => lines.push(describe_packet(&packet)),
                    Ok(None) => break,
                    Err(e) => lines.push(format!("{}: {}", "Malformed".red(), e)),
                }
            }
            if decoder.buffered() > 0 {
                lines.push(format!(
                    "{}: {} trailing bytes",
                    "Incomplete".yellow(),
                    decoder.buffered()
                ));
            }
            if decoder.dropped() > 0 {
                lines.push(format!("{} bytes skipped", decoder.dropped()).dimmed().to_string());
            }
            Ok(lines.join("\n"))
        }
    }
}

fn context(config: Config) -> CmdResult<Context> {
    let mut ctx = Context::with_config(config)?;
    ctx.enable_posix()?;
    Ok(ctx)
}

fn client_kind(unix: bool) -> &'static str {
    if unix {
        apix_core::UNIX_CLIENT
    } else {
        TCP_CLIENT
    }
}

fn server_kind(unix: bool) -> &'static str {
    if unix {
        apix_core::UNIX_SERVER
    } else {
        TCP_SERVER
    }
}

/// Polls for `duration`, stopping early when `done` returns true.
fn run_for(
    ctx: &mut Context,
    duration: Duration,
    mut done: impl FnMut(&mut Context) -> CmdResult<bool>,
) -> CmdResult<()> {
    let deadline = Instant::now() + duration;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Ok(());
        }
        ctx.poll_timeout(Some(left.min(Duration::from_millis(20))))?;
        if done(ctx)? {
            return Ok(());
        }
    }
}

/// Polls until the write queue of `fd` is empty, or the descriptor is gone.
/// Events stay queued for the caller.
fn flush(ctx: &mut Context, fd: Descriptor) -> CmdResult<()> {
    run_for(ctx, Duration::from_secs(2), |ctx| {
        Ok(ctx.pending_write(fd).map_or(true, |n| n == 0))
    })
}

/// Prints one event of the `listen` command. Returns the number of messages
/// it carried.
fn print_event(ctx: &mut Context, event: Event) -> usize {
    match event {
        Event::Accepted { descriptor, .. } => {
            let peer = ctx.info(descriptor).map(|i| i.peer).unwrap_or_default();
            println!("{} {}, {}", "accept".green(), descriptor, peer);
            0
        }
        Event::Readable { descriptor, .. } => {
            let bytes = ctx.consume(descriptor, usize::MAX).unwrap_or_default();
            println!("[{}]: {}", descriptor, String::from_utf8_lossy(&bytes));
            1
        }
        Event::Packet(d) => {
            let mut n = 0;
            while let Ok(Some(packet)) = ctx.recv_packet(d) {
                println!("[{}]: {}", d, describe_packet(&packet));
                n += 1;
            }
            n
        }
        Event::Closed {
            descriptor,
            residual,
            packets,
            ..
        } => {
            for packet in &packets {
                println!("[{}]: {}", descriptor, describe_packet(packet));
            }
            if !residual.is_empty() {
                println!("[{}]: {}", descriptor, String::from_utf8_lossy(&residual));
            }
            println!("{} {}", "close".yellow(), descriptor);
            packets.len() + usize::from(!residual.is_empty())
        }
        Event::Connected(_) => 0,
    }
}

/// Builds a packet from command-line strings.
pub fn build_packet(category: &str, leader: &str, anchor: &str, payload: &[u8]) -> CmdResult<Packet> {
    let category =
        Category::from_name(category).ok_or_else(|| format!("unknown category: {}", category))?;
    let leader = parse_node_id(leader).ok_or_else(|| format!("invalid leader: {}", leader))?;
    Ok(Packet::new(category, leader, anchor, payload.to_vec())?)
}

/// One-line, human-readable rendering of a packet.
pub fn describe_packet(packet: &Packet) -> String {
    let payload = match packet.payload_str() {
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(json) if json.is_object() || json.is_array() => json.to_string(),
            _ => text.to_string(),
        },
        None => format!("0x{}", hex::encode(packet.payload())),
    };
    format!(
        "{} {:#06x} {} {}",
        packet.category().name().cyan(),
        packet.leader(),
        if packet.anchor().is_empty() { "/" } else { packet.anchor() },
        payload
    )
}
