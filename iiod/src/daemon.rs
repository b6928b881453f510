//! Daemon accept loop and process control.
//!
//! One [`Control`] carries the process-level signals (SIGINT/SIGTERM for
//! shutdown, SIGUSR1 for a graceful restart) into the accept loop as a
//! pollable pipe, mirroring how each session's stop signal reaches its
//! blocking I/O. [`serve`] runs one daemon generation: it accepts TCP
//! sessions (and at most one serial session), and on exit stops every
//! session pool and joins the session threads before returning.

#![allow(unsafe_code)]

use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::unix::pipe;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use iiod_core::backend::IioContext;
use iiod_core::error::Result;
use iiod_proto::session::{Registries, Session, SessionOptions};

use crate::config::SerialParams;
use crate::transport::{serial_transport, tcp_transport};

const LISTENER: Token = Token(0);
const CONTROL: Token = Token(1);

/// How one daemon generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// SIGINT/SIGTERM: exit the process.
    Shutdown,
    /// SIGUSR1: tear everything down, then run a fresh generation.
    Restart,
}

/// Process-level control: signal flags plus a pipe that wakes the accept
/// loop's poll.
pub struct Control {
    term: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
    tx: Mutex<pipe::Sender>,
    rx: pipe::Receiver,
}

impl Control {
    pub fn new() -> Result<Arc<Self>> {
        let (tx, rx) = pipe::new()?;
        Ok(Arc::new(Self {
            term: Arc::new(AtomicBool::new(false)),
            restart: Arc::new(AtomicBool::new(false)),
            tx: Mutex::new(tx),
            rx,
        }))
    }

    /// Route SIGINT/SIGTERM/SIGUSR1 into this control block.
    pub fn install_signals(&self) -> Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1};

        signal_hook::flag::register(SIGINT, Arc::clone(&self.term))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&self.term))?;
        signal_hook::flag::register(SIGUSR1, Arc::clone(&self.restart))?;
        for sig in [SIGINT, SIGTERM, SIGUSR1] {
            use std::os::fd::AsFd;
            let owned = self.tx.lock().as_fd().try_clone_to_owned()?;
            let tx = pipe::Sender::from(owned);
            signal_hook::low_level::pipe::register(sig, tx)?;
        }
        Ok(())
    }

    /// Request shutdown programmatically (tests, embedding).
    pub fn trigger_shutdown(&self) {
        self.term.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Request a graceful restart programmatically.
    pub fn trigger_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
        self.wake();
    }

    /// Re-arm after a restart has been honored.
    pub fn clear_restart(&self) {
        self.restart.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.term.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    fn wake(&self) {
        use std::io::Write;
        let _ = self.tx.lock().write(&[1]);
    }

    fn poll_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// Consume queued wake-up bytes.
    fn drain(&self) {
        let mut scratch = [0u8; 16];
        loop {
            let n = unsafe {
                libc::read(
                    self.rx.as_raw_fd(),
                    scratch.as_mut_ptr().cast(),
                    scratch.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

struct Running {
    session: Arc<Session>,
    thread: JoinHandle<()>,
}

/// Run one daemon generation over `listener` until a control signal.
pub fn serve(
    listener: TcpListener,
    ctx: Arc<dyn IioContext>,
    registries: Arc<Registries>,
    options: SessionOptions,
    serial: Option<&SerialParams>,
    control: &Control,
) -> Result<Outcome> {
    listener.set_nonblocking(true)?;

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(16);
    poll.registry().register(
        &mut SourceFd(&listener.as_raw_fd()),
        LISTENER,
        Interest::READABLE,
    )?;
    poll.registry()
        .register(&mut SourceFd(&control.poll_fd()), CONTROL, Interest::READABLE)?;

    let mut sessions: Vec<Running> = Vec::new();

    if let Some(params) = serial {
        match serial_transport(params) {
            Ok(transport) => {
                spawn_session(&mut sessions, &ctx, &registries, transport, options, "serial")?;
            }
            Err(e) => warn!("serial carrier unavailable: {e}"),
        }
    }

    let outcome = loop {
        if control.shutdown_requested() {
            break Outcome::Shutdown;
        }
        if control.restart_requested() {
            break Outcome::Restart;
        }

        match poll.poll(&mut events, Some(Duration::from_millis(500))) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
        for event in events.iter() {
            if event.token() == CONTROL {
                control.drain();
            }
        }

        // Accept everything that is ready.
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let name = peer.to_string();
                    match tcp_transport(stream, &name) {
                        Ok(transport) => {
                            spawn_session(
                                &mut sessions,
                                &ctx,
                                &registries,
                                transport,
                                options,
                                &name,
                            )?;
                        }
                        Err(e) => warn!(peer = %name, "could not set up transport: {e}"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }

        // Reap finished sessions.
        let mut i = 0;
        while i < sessions.len() {
            if sessions[i].thread.is_finished() {
                let running = sessions.swap_remove(i);
                let _ = running.thread.join();
            } else {
                i += 1;
            }
        }
    };

    info!(?outcome, open_sessions = sessions.len(), "daemon generation ending");
    for running in &sessions {
        running.session.pool().stop();
    }
    for running in sessions {
        let _ = running.thread.join();
    }
    Ok(outcome)
}

fn spawn_session(
    sessions: &mut Vec<Running>,
    ctx: &Arc<dyn IioContext>,
    registries: &Arc<Registries>,
    transport: iiod_core::io::Transport,
    options: SessionOptions,
    name: &str,
) -> Result<()> {
    let session = Session::new(
        Arc::clone(ctx),
        Arc::clone(registries),
        transport,
        options,
    )?;
    debug!(session = session.id(), peer = name, "session accepted");

    let runner = Arc::clone(&session);
    let thread = std::thread::Builder::new()
        .name(format!("iiod-client-{}", session.id()))
        .spawn(move || runner.run())?;
    sessions.push(Running { session, thread });
    Ok(())
}
