//! A virtual bus over IPv6 link-local multicast.
//!
//! Every node joins the same multicast group; a datagram sent to the group
//! reaches every other node on the link, which is what a multi-drop serial
//! line does. Frames are sent from a separate socket connected to the group, so
//! its local address is the exact source of our frames and a node can
//! recognise, and skip, its own frames looped back by the kernel. Other nodes
//! on the same host share the IP but not the port; nodes elsewhere may share
//! the port but not the IP.

use std::io::ErrorKind;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

use ezbus_core::config::PortConfig;
use ezbus_mac::{Port, PortError};

pub struct UdpBusPort {
    rx: UdpSocket,
    tx: UdpSocket,
    /// Source address of our own frames.
    own: SocketAddrV6,
    baud: u32,
    closed: bool,
}

impl UdpBusPort {
    pub fn open(config: &PortConfig) -> Result<Self> {
        let interface_index = if config.interface.is_empty() {
            0
        } else {
            if_index(&config.interface)?
        };
        let group_ip: Ipv6Addr = config
            .group
            .parse()
            .with_context(|| format!("bad multicast group {:?}", config.group))?;
        let group = SocketAddrV6::new(group_ip, config.group_port, 0, interface_index);

        let rx = make_listener_socket(group, interface_index)
            .context("failed to create bus listener socket")?;
        let tx = make_sender_socket(group, interface_index)
            .context("failed to create bus sender socket")?;
        let own = match tx.local_addr().context("sender local_addr")? {
            SocketAddr::V6(own) => own,
            SocketAddr::V4(own) => anyhow::bail!("sender bound to IPv4 address {own}"),
        };

        tracing::info!(group = %group, own = %own, "virtual bus open");

        Ok(Self {
            rx,
            tx,
            own,
            baud: config.speed,
            closed: false,
        })
    }
}

impl Port for UdpBusPort {
    fn send(&mut self, frame: &[u8]) -> Result<(), PortError> {
        if self.closed {
            return Err(PortError::Closed);
        }
        match self.tx.send(frame) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(PortError::NotReady),
            Err(e) => Err(e.into()),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, PortError> {
        if self.closed {
            return Err(PortError::Closed);
        }
        loop {
            match self.rx.recv_from(buf) {
                Ok((_, SocketAddr::V6(from))) if is_own_frame(&from, &self.own) => {
                    tracing::trace!("ignoring own frame");
                }
                Ok((n, _)) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(PortError::NotReady),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn flush(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    fn set_speed(&mut self, baud: u32) -> Result<(), PortError> {
        // Nothing to reprogram on a datagram link; the MAC's timing follows.
        self.baud = baud;
        Ok(())
    }

    fn speed(&self) -> u32 {
        self.baud
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Socket bound to the group port and joined to the group.
fn make_listener_socket(group: SocketAddrV6, interface_index: u32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, group.port(), 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;

    socket
        .join_multicast_v6(group.ip(), interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}

/// Ephemeral socket connected to the group. Loopback stays on so that
/// several nodes can share one host.
fn make_sender_socket(group: SocketAddrV6, interface_index: u32) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_nonblocking(true).context("set_nonblocking")?;
    if interface_index != 0 {
        socket
            .set_multicast_if_v6(interface_index)
            .context("IPV6_MULTICAST_IF")?;
    }
    // Link-local only, do not route beyond this link.
    socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
    socket.set_multicast_loop_v6(true).context("IPV6_MULTICAST_LOOP")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;
    // Fixes the source IP the kernel picks for the group.
    socket.connect(&group.into()).context("connect()")?;

    Ok(socket.into())
}

/// Scope ids are ignored; a looped-back frame may carry either.
fn is_own_frame(from: &SocketAddrV6, own: &SocketAddrV6) -> bool {
    from.ip() == own.ip() && from.port() == own.port()
}

/// Get the OS interface index for a named network interface.
/// Returns an error if the interface does not exist.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}
