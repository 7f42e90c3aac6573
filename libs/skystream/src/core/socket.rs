// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

//! UDP socket setup for the real-time stream receiver.
//!
//! std's `UdpSocket` does not expose the knobs the receive path needs
//! (reuse-addr, receive-buffer sizing, multicast membership), so the socket
//! is built with socket2 and converted afterwards.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::core::error::Result;

/// Requested kernel receive-buffer size. The kernel will typically double
/// the requested value.
pub const RECV_BUFFER_TARGET: usize = 600 * 1024;

/// Upper bound on any single blocking receive, so the worker re-checks its
/// stop signal at least twice a second.
pub const RECV_POLL_BOUND: Duration = Duration::from_millis(500);

/// True when `addr` is an IPv4 multicast group (first octet 224..=239).
pub fn is_multicast(addr: Ipv4Addr) -> bool {
    (224..=239).contains(&addr.octets()[0])
}

/// Bind the receive socket.
///
/// A multicast `recv_addr` joins the group with `iface_addr` (or
/// `INADDR_ANY`) as the member interface and binds the port on all
/// interfaces; otherwise the bind is unicast on `iface_addr`, falling back
/// to `INADDR_ANY`. The socket's read timeout is the smaller of the
/// configured receive timeout and the 500 ms worker poll bound.
pub fn bind_recv_socket(
    recv_addr: Option<Ipv4Addr>,
    iface_addr: Option<Ipv4Addr>,
    port: u16,
    recv_timeout: Duration,
) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(RECV_BUFFER_TARGET)?;
    socket.set_read_timeout(Some(recv_timeout.min(RECV_POLL_BOUND)))?;

    match recv_addr {
        Some(group) if is_multicast(group) => {
            let iface = iface_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&group, &iface)?;
            socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
            tracing::debug!(%group, %iface, port, "joined multicast group");
        }
        _ => {
            let addr = iface_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.bind(&SocketAddrV4::new(addr, port).into())?;
            tracing::debug!(%addr, port, "bound unicast receive socket");
        }
    }

    Ok(socket.into())
}
