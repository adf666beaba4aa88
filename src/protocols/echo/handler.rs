//! Single-shot echo handler shared by the control process and the workers.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use tracing::{debug, trace};

/// Largest frame a client may send.
pub const MAX_FRAME: usize = 32;

/// Read one frame of at most `max_frame` bytes and write it back.
///
/// Returns the number of bytes echoed; zero means the peer closed without
/// sending anything, which is a normal completion.
pub fn echo_once<S: Read + Write>(stream: &mut S, max_frame: usize) -> io::Result<usize> {
    let mut buf = vec![0u8; max_frame];

    let n = loop {
        match stream.read(&mut buf) {
            Ok(n) => break n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };

    if n > 0 {
        // write_all retries short writes until the whole frame is out
        stream.write_all(&buf[..n])?;
        stream.flush()?;
    }
    Ok(n)
}

/// Serve a connection and close it.
pub fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    max_frame: usize,
) -> io::Result<usize> {
    match echo_once(&mut stream, max_frame) {
        Ok(0) => {
            trace!(peer = %peer, "Peer closed without data");
            Ok(0)
        }
        Ok(n) => {
            trace!(peer = %peer, bytes = n, "Echoed frame");
            Ok(n)
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Echo failed");
            Err(e)
        }
    }
}
