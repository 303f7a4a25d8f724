//! Best-effort UDP socket tuning
//!
//! Failures are returned so callers can log them; none of these settings is
//! required for the tunnel to work.

use socket2::SockRef;
use std::io;
use tokio::net::UdpSocket;

/// Mark outgoing packets with a DSCP code point (the upper 6 bits of TOS)
pub fn set_dscp(socket: &UdpSocket, dscp: u32) -> io::Result<()> {
    SockRef::from(socket).set_tos(dscp << 2)
}

/// Set SO_RCVBUF
pub fn set_read_buffer(socket: &UdpSocket, bytes: usize) -> io::Result<()> {
    SockRef::from(socket).set_recv_buffer_size(bytes)
}

/// Set SO_SNDBUF
pub fn set_write_buffer(socket: &UdpSocket, bytes: usize) -> io::Result<()> {
    SockRef::from(socket).set_send_buffer_size(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tuning_loopback_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        set_read_buffer(&socket, 256 * 1024).unwrap();
        set_write_buffer(&socket, 256 * 1024).unwrap();
        // TOS may be refused in restricted sandboxes; it must not panic
        let _ = set_dscp(&socket, 46);
    }
}
