//! Framed transport I/O with cooperative cancellation.
//!
//! A [`Transport`] is the pair of byte streams a carrier (TCP, serial,
//! USB-FunctionFS) hands to the session core, plus an `is_socket` bit.
//! It splits into a [`TransportReader`] and a [`TransportWriter`], each
//! owning a nonblocking descriptor and a private `mio::Poll` that watches
//! both the descriptor and the pool's stop pipe.
//!
//! `read_full` / `write_full` transfer exactly `buf.len()` bytes or
//! return `Ok(0)` when the peer closed or the stop signal was raised.
//! Cancellation is observed only at blocking points: no byte is written
//! after the signal has been seen.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use crate::error::Result;
use crate::pool::StopHandle;

const DATA: Token = Token(0);
const STOP: Token = Token(1);

/// A pair of byte streams handed over by a transport carrier.
pub struct Transport {
    read: OwnedFd,
    write: OwnedFd,
    is_socket: bool,
    name: String,
}

impl Transport {
    /// Wrap a raw descriptor pair.
    pub fn new(read: OwnedFd, write: OwnedFd, is_socket: bool, name: impl Into<String>) -> Self {
        Self {
            read,
            write,
            is_socket,
            name: name.into(),
        }
    }

    /// Build a transport from a connected TCP stream (descriptor duplicated
    /// for the independent read and write halves).
    pub fn from_tcp(stream: std::net::TcpStream, name: impl Into<String>) -> Result<Self> {
        let read: OwnedFd = stream.into();
        let write = read.try_clone()?;
        Ok(Self::new(read, write, true, name))
    }

    /// Build a transport from one half of a Unix socket pair (tests, local
    /// carriers).
    pub fn from_unix(stream: std::os::unix::net::UnixStream, name: impl Into<String>) -> Result<Self> {
        let read: OwnedFd = stream.into();
        let write = read.try_clone()?;
        Ok(Self::new(read, write, true, name))
    }

    /// Carrier-assigned name, used for worker thread names and logging.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split into the reader and writer halves, both waking on `stop`.
    pub fn split(self, stop: &StopHandle) -> Result<(TransportReader, TransportWriter)> {
        let reader = TransportReader::new(self.read, stop.clone())?;
        let writer = TransportWriter::new(self.write, self.is_socket, stop.clone())?;
        Ok((reader, writer))
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Carriers hand us plain blocking descriptors; readiness polling needs
    // O_NONBLOCK on both halves (they may share an open file description).
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sys_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn sys_write(fd: RawFd, buf: &[u8], is_socket: bool) -> io::Result<usize> {
    // MSG_NOSIGNAL keeps a disconnected peer from killing the daemon with
    // SIGPIPE; plain descriptors (serial, FunctionFS endpoints) take the
    // write(2) path.
    let n = if is_socket {
        unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) }
    } else {
        unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) }
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn register_pair(poll: &Poll, fd: RawFd, interest: Interest, stop: &StopHandle) -> io::Result<()> {
    poll.registry().register(&mut SourceFd(&fd), DATA, interest)?;
    poll.registry()
        .register(&mut SourceFd(&stop.poll_fd()), STOP, Interest::READABLE)?;
    Ok(())
}

/// Wait until the transport descriptor or the stop pipe is ready.
fn wait_ready(poll: &mut Poll, events: &mut Events) -> io::Result<()> {
    loop {
        match poll.poll(events, None) {
            Ok(()) => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Reading half of a transport.
pub struct TransportReader {
    fd: OwnedFd,
    stop: StopHandle,
    poll: Poll,
    events: Events,
}

impl TransportReader {
    fn new(fd: OwnedFd, stop: StopHandle) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        let poll = Poll::new()?;
        register_pair(&poll, fd.as_raw_fd(), Interest::READABLE, &stop)?;
        Ok(Self {
            fd,
            stop,
            poll,
            events: Events::with_capacity(4),
        })
    }

    /// Fill `buf` exactly, or return `Ok(0)` on EOF / cancellation.
    pub fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            if self.stop.is_raised() {
                trace!("read cancelled by stop signal");
                return Ok(0);
            }
            match sys_read(self.fd.as_raw_fd(), &mut buf[done..]) {
                Ok(0) => return Ok(0),
                Ok(n) => done += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_ready(&mut self.poll, &mut self.events)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    /// Consume and drop `n` bytes (keeps framing on error paths).
    pub fn discard(&mut self, mut n: usize) -> Result<usize> {
        let mut scratch = [0u8; 4096];
        let total = n;
        while n > 0 {
            let take = n.min(scratch.len());
            match self.read_full(&mut scratch[..take])? {
                0 => return Ok(0),
                read => n -= read,
            }
        }
        Ok(total)
    }

    /// Whether the stop signal has been raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.stop.is_raised()
    }
}

/// Writing half of a transport.
pub struct TransportWriter {
    fd: OwnedFd,
    is_socket: bool,
    stop: StopHandle,
    poll: Poll,
    events: Events,
}

impl TransportWriter {
    fn new(fd: OwnedFd, is_socket: bool, stop: StopHandle) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        let poll = Poll::new()?;
        register_pair(&poll, fd.as_raw_fd(), Interest::WRITABLE, &stop)?;
        Ok(Self {
            fd,
            is_socket,
            stop,
            poll,
            events: Events::with_capacity(4),
        })
    }

    /// Write all of `buf`, or return `Ok(0)` when the peer is gone or the
    /// stop signal was raised. Short writes are retried; a peer reset on a
    /// socket is reported as EOF, not as an error.
    pub fn write_full(&mut self, buf: &[u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            if self.stop.is_raised() {
                trace!("write cancelled by stop signal");
                return Ok(0);
            }
            match sys_write(self.fd.as_raw_fd(), &buf[done..], self.is_socket) {
                Ok(n) => done += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_ready(&mut self.poll, &mut self.events)?;
                }
                Err(ref e)
                    if self.is_socket
                        && matches!(
                            e.kind(),
                            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                        ) =>
                {
                    return Ok(0);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }
}
