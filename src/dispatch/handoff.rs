//! Connection hand-off between processes.
//!
//! The queue is a Unix `SOCK_SEQPACKET` socket pair. Each record carries one
//! connection: the socket descriptor rides along as `SCM_RIGHTS` ancillary
//! data, the body holds a sequence number and the peer address:
//!
//! ```text
//! +----------------+---------------------------+
//! | seq (u64, BE)  | peer address (UTF-8 text) |
//! +----------------+---------------------------+
//! ```
//!
//! Records are delivered whole and each one to exactly one reader, so any
//! number of workers can share the receiving end.

use bytes::{Buf, BufMut, BytesMut};
use socket2::{Domain, Socket, Type};
use std::fmt;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

const FD_SIZE: usize = mem::size_of::<libc::c_int>();

/// Large enough for the sequence number and any textual socket address.
const MAX_BODY: usize = 128;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// Create a hand-off queue: (control end, worker end).
pub fn queue() -> io::Result<(Socket, Socket)> {
    Socket::pair(Domain::UNIX, Type::SEQPACKET, None)
}

/// One connection in transit to a worker.
#[derive(Debug)]
pub struct HandoffMessage {
    pub seq: u64,
    pub peer: SocketAddr,
    pub stream: TcpStream,
}

impl HandoffMessage {
    fn encode_body(&self) -> BytesMut {
        let peer = self.peer.to_string();
        let mut body = BytesMut::with_capacity(8 + peer.len());
        body.put_u64(self.seq);
        body.put_slice(peer.as_bytes());
        body
    }
}

fn decode_body(mut body: &[u8]) -> io::Result<(u64, SocketAddr)> {
    if body.len() < 8 {
        return Err(invalid("hand-off record too short"));
    }
    let seq = body.get_u64();
    let peer = std::str::from_utf8(body)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("hand-off record has no valid peer address"))?;
    Ok((seq, peer))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// A hand-off that did not make it onto the queue.
///
/// The message comes back untouched so the caller still owns the connection.
#[derive(Debug)]
pub struct SendError {
    pub message: HandoffMessage,
    pub error: io::Error,
}

impl SendError {
    /// The queue is at capacity; the workers are alive but behind.
    pub fn is_full(&self) -> bool {
        self.error.kind() == io::ErrorKind::WouldBlock
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hand-off {} failed: {}", self.message.seq, self.error)
    }
}

impl std::error::Error for SendError {}

/// Queue a connection without blocking.
///
/// On success the local descriptor is closed; the copy in the queue is now
/// the only one and belongs to whichever worker receives it.
pub fn send(queue: &Socket, message: HandoffMessage) -> Result<(), SendError> {
    let body = message.encode_body();
    match send_with_fd(queue.as_raw_fd(), &body, message.stream.as_raw_fd()) {
        Ok(()) => {
            drop(message);
            Ok(())
        }
        Err(error) => Err(SendError { message, error }),
    }
}

/// Receive the next connection, blocking until one arrives.
///
/// Returns `None` once the control end is closed and the queue is empty.
pub fn recv(queue: &Socket) -> io::Result<Option<HandoffMessage>> {
    let mut body = [0u8; MAX_BODY];
    // u64 storage keeps the control buffer aligned for cmsghdr
    let mut cmsg_buf = [0u64; 8];

    let mut iov = libc::iovec {
        iov_base: body.as_mut_ptr() as *mut libc::c_void,
        iov_len: body.len(),
    };
    // SAFETY: msghdr is plain data; zeroed covers platform padding fields.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = mem::size_of_val(&cmsg_buf) as _;

    // SAFETY: every buffer referenced by `msg` outlives the call.
    let n = unsafe { libc::recvmsg(queue.as_raw_fd(), &mut msg, RECV_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // Take ownership first so every descriptor is closed on the error paths.
    let fds = take_fds(&msg);
    if n == 0 && fds.is_empty() {
        return Ok(None);
    }
    if msg.msg_flags & (libc::MSG_CTRUNC | libc::MSG_TRUNC) != 0 {
        return Err(invalid("hand-off record truncated"));
    }

    let fd = fds
        .into_iter()
        .next()
        .ok_or_else(|| invalid("hand-off record without descriptor"))?;
    let (seq, peer) = decode_body(&body[..n as usize])?;

    Ok(Some(HandoffMessage {
        seq,
        peer,
        stream: TcpStream::from(fd),
    }))
}

/// Send `data` with `fd` attached via `sendmsg` + SCM_RIGHTS.
///
/// The kernel installs a duplicate of `fd` in the receiving process; the
/// sender's descriptor is unaffected.
fn send_with_fd(sock: RawFd, data: &[u8], fd: RawFd) -> io::Result<()> {
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(FD_SIZE as u32) } as usize;
    let mut cmsg_buf = [0u64; 8];
    debug_assert!(cmsg_space <= mem::size_of_val(&cmsg_buf));

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    // SAFETY: see `recv`.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    // Populate cmsghdr with SOL_SOCKET / SCM_RIGHTS and the FD value.
    // SAFETY: the control buffer holds at least CMSG_SPACE(FD_SIZE) bytes.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(FD_SIZE as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        ptr::write_unaligned(data_ptr, fd);
    }

    loop {
        // SAFETY: `msg` and the buffers it points to are live for the call.
        let n = unsafe { libc::sendmsg(sock, &msg, SEND_FLAGS) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Wrap every descriptor carried in `msg` as an `OwnedFd`.
fn take_fds(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();
    // SAFETY: `msg` was filled in by recvmsg; the CMSG_* macros walk only
    // within msg_controllen, and each SCM_RIGHTS descriptor is new to this
    // process and owned by nobody else.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / FD_SIZE;
                for i in 0..count {
                    let fd: libc::c_int =
                        ptr::read_unaligned(data.add(i * FD_SIZE) as *const libc::c_int);
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    fds
}
