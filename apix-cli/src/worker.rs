//! Background thread owning the context while the REPL reads input.
//!
//! The REPL never touches the [`Context`] directly: it sends a [`Request`]
//! over a channel, wakes the poll loop and waits for the [`Reply`]. Received
//! data lands in the shared [`Session`], which the REPL prints between
//! commands.

use crate::commands::describe_packet;
use apix_core::{ApixError, Config, Context, Descriptor, DescriptorInfo, Event, Interrupter, Role};
use apix_srrp::Packet;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

const POLL_INTERVAL_MS: i64 = 50;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Received bytes kept per descriptor until printed; older data is dropped
/// when a new arrival would not fit.
pub const INBOX_LIMIT: usize = 1024;

/// Work for the poll thread.
#[derive(Debug)]
pub enum Request {
    Open { kind: &'static str, addr: String },
    Close(Descriptor),
    Send(Descriptor, Vec<u8>),
    SendPacket(Descriptor, Packet),
    SrrpMode(Descriptor, Option<u16>),
    List,
}

#[derive(Debug)]
pub enum Reply {
    Opened(Descriptor),
    Done,
    Listing(Vec<DescriptorInfo>),
    Failed(String),
}

/// Per-descriptor state known to the REPL.
#[derive(Debug)]
pub struct FdState {
    pub addr: String,
    pub role: Role,
    inbox: Vec<u8>,
}

impl FdState {
    pub fn label(&self) -> String {
        format!("{}({})", self.addr, self.role.as_char())
    }
}

/// State shared between the REPL and the poll thread.
#[derive(Debug, Default)]
pub struct Session {
    fds: BTreeMap<Descriptor, FdState>,
    pub cur: Option<Descriptor>,
    pub print_all: bool,
    notices: Vec<String>,
}

impl Session {
    pub fn track(&mut self, d: Descriptor, addr: String, role: Role) {
        self.fds.insert(
            d,
            FdState {
                addr,
                role,
                inbox: Vec::new(),
            },
        );
    }

    pub fn forget(&mut self, d: Descriptor) -> Option<FdState> {
        if self.cur == Some(d) {
            self.cur = None;
        }
        self.fds.remove(&d)
    }

    pub fn get(&self, d: Descriptor) -> Option<&FdState> {
        self.fds.get(&d)
    }

    pub fn fds(&self) -> impl Iterator<Item = (Descriptor, &FdState)> {
        self.fds.iter().map(|(d, fd)| (*d, fd))
    }

    pub fn record(&mut self, d: Descriptor, bytes: &[u8]) {
        let Some(fd) = self.fds.get_mut(&d) else {
            return;
        };
        if fd.inbox.len() + bytes.len() > INBOX_LIMIT {
            fd.inbox.clear();
        }
        let keep = bytes.len().min(INBOX_LIMIT);
        fd.inbox.extend_from_slice(&bytes[bytes.len() - keep..]);
    }

    pub fn notice(&mut self, msg: String) {
        self.notices.push(msg);
    }

    /// Drains notices and received data for display.
    ///
    /// Only the current descriptor's data is shown unless `print_all` is set;
    /// data of other descriptors keeps accumulating.
    pub fn take_output(&mut self) -> Vec<String> {
        let mut out: Vec<String> = self.notices.drain(..).collect();
        let print_all = self.print_all;
        let cur = self.cur;
        for (d, fd) in self.fds.iter_mut() {
            if fd.inbox.is_empty() || !(print_all || cur == Some(*d)) {
                continue;
            }
            out.push(format!(
                "[{}]:\n{}\n---------------------------",
                fd.label(),
                String::from_utf8_lossy(&fd.inbox).trim_end_matches('\n')
            ));
            fd.inbox.clear();
        }
        out
    }
}

/// Handle to the poll thread.
pub struct Worker {
    requests: Sender<Request>,
    replies: Receiver<Reply>,
    interrupter: Interrupter,
    session: Arc<Mutex<Session>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates a context with every POSIX transport and starts polling it.
    pub fn spawn(config: Config) -> Result<Self, ApixError> {
        let mut ctx = Context::with_config(config)?;
        ctx.enable_posix()?;

        let interrupter = ctx.interrupter()?;
        let (request_tx, request_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        let session = Arc::new(Mutex::new(Session::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let session = Arc::clone(&session);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("apix-poll".to_string())
                .spawn(move || run(ctx, request_rx, reply_tx, session, shutdown))?
        };

        Ok(Self {
            requests: request_tx,
            replies: reply_rx,
            interrupter,
            session,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Runs a request on the poll thread and waits for its reply.
    pub fn call(&self, request: Request) -> Reply {
        // A reply that arrived after its caller gave up must not answer this call.
        while self.replies.try_recv().is_ok() {}

        if self.requests.send(request).is_err() {
            return Reply::Failed("poll thread stopped".to_string());
        }
        if let Err(e) = self.interrupter.interrupt() {
            warn!("failed to wake poll thread: {}", e);
        }
        match self.replies.recv_timeout(REPLY_TIMEOUT) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Reply::Failed("timed out".to_string()),
            Err(RecvTimeoutError::Disconnected) => {
                Reply::Failed("poll thread stopped".to_string())
            }
        }
    }

    pub fn session(&self) -> &Arc<Mutex<Session>> {
        &self.session
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.interrupter.interrupt();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("poll thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    mut ctx: Context,
    requests: Receiver<Request>,
    replies: Sender<Reply>,
    session: Arc<Mutex<Session>>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        if let Err(e) = ctx.poll(POLL_INTERVAL_MS) {
            error!("poll failed: {}", e);
            break;
        }
        drain_events(&mut ctx, &session);

        while let Ok(request) = requests.try_recv() {
            let reply = handle(&mut ctx, request, &session);
            if replies.send(reply).is_err() {
                break;
            }
        }
    }

    if let Err(e) = ctx.destroy() {
        debug!("destroy: {}", e);
    }
}

fn drain_events(ctx: &mut Context, session: &Mutex<Session>) {
    while let Some(event) = ctx.next_event() {
        match event {
            Event::Readable { descriptor, .. } => {
                if let Ok(bytes) = ctx.consume(descriptor, usize::MAX) {
                    session.lock().record(descriptor, &bytes);
                }
            }
            Event::Packet(d) => {
                while let Ok(Some(packet)) = ctx.recv_packet(d) {
                    let line = describe_packet(&packet) + "\n";
                    session.lock().record(d, line.as_bytes());
                }
            }
            Event::Connected(d) => {
                let mut session = session.lock();
                if let Some(label) = session.get(d).map(FdState::label) {
                    session.notice(format!("connected {}, {}", d, label));
                }
            }
            Event::Accepted {
                listener,
                descriptor,
            } => {
                let mut session = session.lock();
                let addr = session
                    .get(listener)
                    .map(|fd| fd.addr.clone())
                    .unwrap_or_default();
                session.track(descriptor, addr, Role::Accept);
                if let Some(label) = session.get(descriptor).map(FdState::label) {
                    session.notice(format!("accept {}, {}", descriptor, label));
                }
            }
            Event::Closed {
                descriptor,
                residual,
                packets,
                ..
            } => {
                let mut session = session.lock();
                for packet in &packets {
                    let line = describe_packet(packet) + "\n";
                    session.record(descriptor, line.as_bytes());
                }
                session.record(descriptor, &residual);
                if let Some(fd) = session.forget(descriptor) {
                    let mut msg = format!("close {}, {}", descriptor, fd.label());
                    if !fd.inbox.is_empty() {
                        msg.push('\n');
                        msg.push_str(&String::from_utf8_lossy(&fd.inbox));
                    }
                    session.notice(msg);
                }
            }
        }
    }
}

fn handle(ctx: &mut Context, request: Request, session: &Mutex<Session>) -> Reply {
    let result = match request {
        Request::Open { kind, addr } => match ctx.open(kind, &addr) {
            Ok(d) => {
                let role = ctx.info(d).map(|info| info.role).unwrap_or(Role::Connect);
                session.lock().track(d, addr, role);
                return Reply::Opened(d);
            }
            Err(e) => Err(e),
        },
        Request::Close(d) => {
            let result = ctx.close(d);
            if result.is_ok() {
                session.lock().forget(d);
            }
            result
        }
        Request::Send(d, bytes) => ctx.send(d, &bytes),
        Request::SendPacket(d, packet) => ctx.send_packet(d, &packet),
        Request::SrrpMode(d, Some(node)) => ctx.enable_srrp_mode(d, node),
        Request::SrrpMode(d, None) => ctx.disable_srrp_mode(d),
        Request::List => match ctx.descriptors() {
            Ok(listing) => return Reply::Listing(listing),
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => Reply::Done,
        Err(e) => Reply::Failed(e.to_string()),
    }
}
