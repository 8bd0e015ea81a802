//! Create new TCP connections for TLS.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};
use tracing::trace;

/// Connects a TCP stream to `addr`.
///
/// The socket is marked with `mark` unless it is zero. Setting a mark
/// requires `CAP_NET_ADMIN` and failing to set it is an error, since the
/// traffic would otherwise take the wrong network. TCP fast open is
/// attempted where the platform has it; the TLS client hello then travels
/// in the SYN if a cookie is cached.
pub async fn connect_stream(
    addr: SocketAddr,
    mark: u32,
) -> io::Result<TcpStream> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    set_mark(&socket, mark)?;
    enable_fast_open(&socket);
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;

    let socket = TcpSocket::from_std_stream(socket.into());
    socket.connect(addr).await
}

/// Applies the routing mark.
#[cfg(any(target_os = "android", target_os = "linux"))]
fn set_mark(socket: &Socket, mark: u32) -> io::Result<()> {
    if mark != 0 {
        socket.set_mark(mark)?;
    }
    Ok(())
}

/// Applies the routing mark.
#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn set_mark(_socket: &Socket, mark: u32) -> io::Result<()> {
    if mark != 0 {
        trace!(mark, "socket marks not supported, ignoring");
    }
    Ok(())
}

/// Asks the kernel to use TCP fast open on connect.
///
/// Failure is fine: the connection simply uses a regular handshake.
#[cfg(any(target_os = "android", target_os = "linux"))]
fn enable_fast_open(socket: &Socket) {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    // SAFETY: The fd is valid for the lifetime of `socket` and the option
    // value points to a live c_int of the advertised size.
    let res = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN_CONNECT,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res != 0 {
        trace!(
            error = %io::Error::last_os_error(),
            "TCP fast open not available"
        );
    }
}

/// TCP fast open on connect is Linux only.
#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn enable_fast_open(_socket: &Socket) {}

//============ Tests =========================================================
