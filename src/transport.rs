//! # Channel Transport Module
//!
//! Every channel moves raw PDUs through exactly one transport which is chosen when the engine
//! is created:
//!
//! - [BusTransport]: bounded in-process message queues, used to couple engines in the same
//!   process or to hand PDUs to a software bus.
//! - [UdpTransport]: a nonblocking UDP socket which exchanges one PDU per datagram with a
//!   single configured peer.
//!
//! Both implement [PduTransport]. Sending and receiving never block. A send which fails because
//! the queue or the socket buffer is full ([TransportError::is_busy]) leaves the PDU with its
//! transaction, which emits it again on a later wakeup. Other send failures are counted by the
//! channel and reported to the transaction as well, nothing counts as sent unless the
//! transport accepted it.
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::mpsc,
    vec::Vec,
};

use crate::config::UdpConfig;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("socket is not open")]
    SocketInvalid,
    #[error("socket send error: {0}")]
    SocketSend(io::Error),
    #[error("socket receive error: {0}")]
    SocketRecv(io::Error),
    #[error("datagram from unexpected source {0}")]
    InvalidSource(SocketAddr),
    #[error("invalid message length {0}")]
    InvalidMsgLen(usize),
    #[error("bus queue is full")]
    QueueFull,
    #[error("bus peer disconnected")]
    PeerDisconnected,
    #[error("transport is closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// The transport can not take the PDU right now but may later.
    pub fn is_busy(&self) -> bool {
        match self {
            TransportError::QueueFull => true,
            TransportError::SocketSend(e) => e.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

pub trait PduTransport {
    fn send_pdu(&mut self, raw_pdu: &[u8]) -> Result<(), TransportError>;

    /// Receive the next PDU into the buffer. Returns [None] if no PDU is available.
    fn receive_pdu(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;

    fn is_open(&self) -> bool {
        true
    }
}

/// Bounded message queue pair.
#[derive(Debug)]
pub struct BusTransport {
    tx: mpsc::SyncSender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl BusTransport {
    pub fn new(tx: mpsc::SyncSender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { tx, rx }
    }

    /// Two transports connected to each other. Each direction buffers up to `depth` PDUs.
    pub fn pair(depth: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::sync_channel(depth);
        let (b_tx, a_rx) = mpsc::sync_channel(depth);
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }
}

impl PduTransport for BusTransport {
    fn send_pdu(&mut self, raw_pdu: &[u8]) -> Result<(), TransportError> {
        self.tx.try_send(raw_pdu.to_vec()).map_err(|e| match e {
            mpsc::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::TrySendError::Disconnected(_) => TransportError::PeerDisconnected,
        })
    }

    fn receive_pdu(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        match self.rx.try_recv() {
            Ok(msg) => {
                if msg.len() > buf.len() {
                    return Err(TransportError::InvalidMsgLen(msg.len()));
                }
                buf[0..msg.len()].copy_from_slice(&msg);
                Ok(Some(msg.len()))
            }
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

/// UDP socket bound to the local address which exchanges PDUs with one peer.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    my_address: SocketAddr,
    the_other_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind the socket immediately.
    pub fn new(cfg: &UdpConfig) -> Result<Self, TransportError> {
        let mut transport = Self::new_closed(cfg);
        transport.open()?;
        Ok(transport)
    }

    pub fn new_closed(cfg: &UdpConfig) -> Self {
        Self {
            socket: None,
            my_address: cfg.my_address,
            the_other_addr: cfg.the_other_addr,
        }
    }

    pub fn open(&mut self) -> Result<(), TransportError> {
        let socket = UdpSocket::bind(self.my_address)?;
        socket.set_nonblocking(true)?;
        self.socket = Some(socket);
        Ok(())
    }

    pub fn close(&mut self) {
        self.socket = None;
    }

    pub fn peer(&self) -> SocketAddr {
        self.the_other_addr
    }

    pub fn switch_peer(&mut self, addr: SocketAddr) {
        self.the_other_addr = addr;
    }

    /// Address the socket is bound to. Differs from the configured address when binding to
    /// port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::SocketInvalid)?;
        Ok(socket.local_addr()?)
    }
}

impl PduTransport for UdpTransport {
    fn send_pdu(&mut self, raw_pdu: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::SocketInvalid)?;
        if raw_pdu.is_empty() {
            return Err(TransportError::InvalidMsgLen(0));
        }
        let sent = socket
            .send_to(raw_pdu, self.the_other_addr)
            .map_err(TransportError::SocketSend)?;
        if sent != raw_pdu.len() {
            return Err(TransportError::InvalidMsgLen(sent));
        }
        Ok(())
    }

    fn receive_pdu(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::SocketInvalid)?;
        match socket.recv_from(buf) {
            Ok((len, src)) => {
                if src != self.the_other_addr {
                    return Err(TransportError::InvalidSource(src));
                }
                Ok(Some(len))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(TransportError::SocketRecv(e)),
        }
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

/// Transport of one channel.
#[derive(Debug)]
pub enum ChannelTransport {
    Bus(BusTransport),
    Udp(UdpTransport),
}

impl ChannelTransport {
    pub fn as_udp_mut(&mut self) -> Option<&mut UdpTransport> {
        match self {
            ChannelTransport::Udp(udp) => Some(udp),
            ChannelTransport::Bus(_) => None,
        }
    }
}

impl PduTransport for ChannelTransport {
    fn send_pdu(&mut self, raw_pdu: &[u8]) -> Result<(), TransportError> {
        match self {
            ChannelTransport::Bus(bus) => bus.send_pdu(raw_pdu),
            ChannelTransport::Udp(udp) => udp.send_pdu(raw_pdu),
        }
    }

    fn receive_pdu(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        match self {
            ChannelTransport::Bus(bus) => bus.receive_pdu(buf),
            ChannelTransport::Udp(udp) => udp.receive_pdu(buf),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            ChannelTransport::Bus(bus) => bus.is_open(),
            ChannelTransport::Udp(udp) => udp.is_open(),
        }
    }
}

impl From<BusTransport> for ChannelTransport {
    fn from(bus: BusTransport) -> Self {
        ChannelTransport::Bus(bus)
    }
}

impl From<UdpTransport> for ChannelTransport {
    fn from(udp: UdpTransport) -> Self {
        ChannelTransport::Udp(udp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_bus_pair_roundtrip() {
        let (mut a, mut b) = BusTransport::pair(2);
        let mut buf = [0; 16];
        assert!(b.receive_pdu(&mut buf).unwrap().is_none());
        a.send_pdu(&[1, 2, 3]).unwrap();
        assert_eq!(b.receive_pdu(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[0..3], &[1, 2, 3]);
        b.send_pdu(&[4]).unwrap();
        assert_eq!(a.receive_pdu(&mut buf).unwrap(), Some(1));
    }

    #[test]
    fn test_bus_queue_full() {
        let (mut a, _b) = BusTransport::pair(1);
        a.send_pdu(&[1]).unwrap();
        assert!(matches!(
            a.send_pdu(&[2]),
            Err(TransportError::QueueFull)
        ));
    }

    #[test]
    fn test_busy_errors() {
        assert!(TransportError::QueueFull.is_busy());
        assert!(TransportError::SocketSend(io::ErrorKind::WouldBlock.into()).is_busy());
        assert!(!TransportError::SocketSend(io::ErrorKind::ConnectionRefused.into()).is_busy());
        assert!(!TransportError::PeerDisconnected.is_busy());
        assert!(!TransportError::SocketInvalid.is_busy());
    }

    #[test]
    fn test_bus_disconnected_peer() {
        let (mut a, b) = BusTransport::pair(1);
        drop(b);
        assert!(matches!(
            a.send_pdu(&[1]),
            Err(TransportError::PeerDisconnected)
        ));
        assert!(matches!(
            a.receive_pdu(&mut [0; 4]),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_bus_message_too_large() {
        let (mut a, mut b) = BusTransport::pair(1);
        a.send_pdu(&[0; 8]).unwrap();
        assert!(matches!(
            b.receive_pdu(&mut [0; 4]),
            Err(TransportError::InvalidMsgLen(8))
        ));
    }

    fn localhost_any_port() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn test_udp_exchange_and_source_check() {
        let mut a = UdpTransport::new(&UdpConfig::new(
            localhost_any_port(),
            localhost_any_port(),
        ))
        .unwrap();
        let mut b = UdpTransport::new(&UdpConfig::new(
            localhost_any_port(),
            localhost_any_port(),
        ))
        .unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        a.switch_peer(b_addr);
        b.switch_peer(a_addr);
        let mut buf = [0; 32];
        assert!(b.receive_pdu(&mut buf).unwrap().is_none());
        a.send_pdu(&[7, 8, 9]).unwrap();
        let mut received = None;
        for _ in 0..100 {
            received = b.receive_pdu(&mut buf).unwrap();
            if received.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(received, Some(3));
        assert_eq!(&buf[0..3], &[7, 8, 9]);

        // Datagrams from anyone but the configured peer are rejected.
        let stranger = UdpSocket::bind(localhost_any_port()).unwrap();
        stranger.send_to(&[1], b_addr).unwrap();
        let mut result = Ok(None);
        for _ in 0..100 {
            result = b.receive_pdu(&mut buf);
            if !matches!(result, Ok(None)) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(matches!(result, Err(TransportError::InvalidSource(_))));
    }

    #[test]
    fn test_udp_closed() {
        let mut udp = UdpTransport::new_closed(&UdpConfig::new(
            localhost_any_port(),
            localhost_any_port(),
        ));
        assert!(!udp.is_open());
        assert!(matches!(
            udp.send_pdu(&[1]),
            Err(TransportError::SocketInvalid)
        ));
        udp.open().unwrap();
        assert!(udp.is_open());
        udp.close();
        assert!(matches!(
            udp.receive_pdu(&mut [0; 4]),
            Err(TransportError::SocketInvalid)
        ));
    }
}
