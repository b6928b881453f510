//! Transport carriers.
//!
//! Each carrier only has to produce a [`Transport`] (a read/write
//! descriptor pair plus an `is_socket` bit); the session core is
//! identical across carriers.
//!
//! - TCP: accepted sockets get keep-alive probes (10 s interval, six
//!   probes) and `TCP_NODELAY`.
//! - Serial: a tty configured raw via termios, 57600 8N1 by default.
//!
//! The USB-FunctionFS carrier and DNS-SD advertisement live outside this
//! build.

#![allow(unsafe_code)]

use std::io;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tracing::debug;

use iiod_core::error::{IiodError, Result};
use iiod_core::io::Transport;

use crate::config::{FlowControl, Parity, SerialParams};

/// Keep-alive probe interval and count for accepted TCP sessions.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_PROBES: u32 = 6;

/// Apply the network carrier's socket options to an accepted stream.
pub fn configure_tcp(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_INTERVAL)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_PROBES);
    sock.set_tcp_keepalive(&keepalive)?;
    sock.set_nodelay(true)?;
    Ok(())
}

/// Accept-side wrapper: configure the socket and wrap it as a transport.
pub fn tcp_transport(stream: TcpStream, peer: &str) -> Result<Transport> {
    configure_tcp(&stream)?;
    Transport::from_tcp(stream, format!("tcp:{peer}"))
}

fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        921_600 => libc::B921600,
        _ => return None,
    })
}

/// Open and configure the serial carrier's tty.
pub fn serial_transport(params: &SerialParams) -> Result<Transport> {
    let speed = baud_constant(params.baud).ok_or(IiodError::InvalidArg)?;

    let path = std::ffi::CString::new(params.path.to_string_lossy().as_bytes())
        .map_err(|_| IiodError::InvalidArg)?;
    let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
    if raw < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // Raw 8N1-style discipline, then apply the requested framing.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd.as_raw_fd(), &mut tio) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    unsafe { libc::cfmakeraw(&mut tio) };

    tio.c_cflag &= !libc::CSIZE;
    tio.c_cflag |= match params.bits {
        5 => libc::CS5,
        6 => libc::CS6,
        7 => libc::CS7,
        _ => libc::CS8,
    };

    tio.c_cflag &= !(libc::PARENB | libc::PARODD | libc::CMSPAR);
    match params.parity {
        Parity::None => {}
        Parity::Even => tio.c_cflag |= libc::PARENB,
        Parity::Odd => tio.c_cflag |= libc::PARENB | libc::PARODD,
        Parity::Mark => tio.c_cflag |= libc::PARENB | libc::CMSPAR | libc::PARODD,
        Parity::Space => tio.c_cflag |= libc::PARENB | libc::CMSPAR,
    }

    if params.stop == 2 {
        tio.c_cflag |= libc::CSTOPB;
    } else {
        tio.c_cflag &= !libc::CSTOPB;
    }

    tio.c_iflag &= !(libc::IXON | libc::IXOFF);
    tio.c_cflag &= !libc::CRTSCTS;
    match params.flow {
        FlowControl::Disabled => {}
        FlowControl::XonXoff => tio.c_iflag |= libc::IXON | libc::IXOFF,
        FlowControl::RtsCts => tio.c_cflag |= libc::CRTSCTS,
        // No portable termios bit; DTR/DSR is driver-specific and left to
        // the line discipline.
        FlowControl::DtrDsr => {}
    }

    tio.c_cflag |= libc::CLOCAL | libc::CREAD;

    if unsafe { libc::cfsetispeed(&mut tio, speed) } < 0
        || unsafe { libc::cfsetospeed(&mut tio, speed) } < 0
        || unsafe { libc::tcsetattr(fd.as_raw_fd(), libc::TCSANOW, &tio) } < 0
    {
        return Err(io::Error::last_os_error().into());
    }

    debug!(path = %params.path.display(), baud = params.baud, "serial carrier ready");
    let read = fd;
    let write = read.try_clone()?;
    Ok(Transport::new(
        read,
        write,
        false,
        format!("serial:{}", params.path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_baud_rates_map() {
        assert!(baud_constant(57600).is_some());
        assert!(baud_constant(115_200).is_some());
        assert!(baud_constant(12345).is_none());
    }

    #[test]
    fn test_tcp_options_apply() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        configure_tcp(&accepted).unwrap();
        assert!(accepted.nodelay().unwrap());
        drop(client);
    }
}
