//! # Datagram Transports
//!
//! The reliability layer needs only "send one datagram" and "receive one
//! datagram with a timeout". Delivery is best-effort: datagrams may be lost,
//! reordered or duplicated, but never corrupted.
//!
//! - [`UdpTransport`]: one UDP socket, opaque address `ip;port`
//! - [`MemoryNetwork`]: in-process switch with loss and duplication, for tests
//!   and simulation

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};

use crate::endpoint::EndPoint;

/// Naming-string protocol of [`UdpTransport`].
pub const UDP_PROTOCOL: &str = "udp-dgram";

/// Naming-string protocol of [`MemoryTransport`].
pub const MEMORY_PROTOCOL: &str = "mem-dgram";

/// Largest UDP payload that avoids IP fragmentation on a 1500-byte MTU.
pub const UDP_MAX_PAYLOAD: usize = 1472;

pub trait DatagramTransport: Send + Sync {
    /// Protocol prefix of endpoint strings this transport serves.
    fn protocol(&self) -> &str;

    /// Opaque address peers use to reach this transport.
    fn local_address(&self) -> String;

    /// Largest datagram `send_to` accepts.
    fn max_payload_size(&self) -> usize;

    fn send_to(&self, datagram: &[u8], to: &EndPoint) -> io::Result<usize>;

    /// Wait up to `timeout` for one datagram. Returns its length and the
    /// sender's opaque address, or `None` on timeout.
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, String)>>;
}

// ─── UDP ─────────────────────────────────────────────────────────────────────

pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddr,
    max_payload: usize,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let local = socket.local_addr()?;
        Ok(UdpTransport {
            socket,
            local,
            max_payload: UDP_MAX_PAYLOAD,
        })
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn format_address(addr: SocketAddr) -> String {
        format!("{};{}", addr.ip(), addr.port())
    }

    /// Parse an `ip;port` opaque address.
    pub fn parse_address(addr: &str) -> io::Result<SocketAddr> {
        let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("bad address {addr:?}"));
        let (ip, port) = addr.rsplit_once(';').ok_or_else(invalid)?;
        let ip = ip.parse().map_err(|_| invalid())?;
        let port = port.parse().map_err(|_| invalid())?;
        Ok(SocketAddr::new(ip, port))
    }
}

impl DatagramTransport for UdpTransport {
    fn protocol(&self) -> &str {
        UDP_PROTOCOL
    }

    fn local_address(&self) -> String {
        Self::format_address(self.local)
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn send_to(&self, datagram: &[u8], to: &EndPoint) -> io::Result<usize> {
        let addr = Self::parse_address(&to.address)?;
        self.socket.send_to(datagram, addr)
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, String)>> {
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.socket.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, Self::format_address(from)))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

// ─── In-Memory Network ───────────────────────────────────────────────────────

type Datagram = (Bytes, String);
type DropPredicate = Box<dyn Fn(&[u8]) -> bool + Send>;

/// Random impairment applied to every datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Impairment {
    /// Probability a datagram is dropped.
    pub loss: f64,
    /// Probability a delivered datagram is delivered twice.
    pub duplicate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

struct DropRule {
    remaining: usize,
    matches: DropPredicate,
}

struct NetworkInner {
    nodes: Mutex<HashMap<String, Sender<Datagram>>>,
    impairment: Mutex<Impairment>,
    rng: Mutex<StdRng>,
    drop_rules: Mutex<Vec<DropRule>>,
    stats: Mutex<NetworkStats>,
    max_payload: usize,
}

/// In-process datagram switch. Cloning yields another handle to the same
/// network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new(max_payload: usize) -> Self {
        Self::with_seed(max_payload, 0x5EED)
    }

    /// Network whose random impairment is reproducible from `seed`.
    pub fn with_seed(max_payload: usize, seed: u64) -> Self {
        MemoryNetwork {
            inner: Arc::new(NetworkInner {
                nodes: Mutex::new(HashMap::new()),
                impairment: Mutex::new(Impairment::default()),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                drop_rules: Mutex::new(Vec::new()),
                stats: Mutex::new(NetworkStats::default()),
                max_payload,
            }),
        }
    }

    /// Attach a node under `name`, its opaque address.
    pub fn attach(&self, name: &str) -> io::Result<Arc<MemoryTransport>> {
        let (tx, rx) = unbounded();
        let mut nodes = self.inner.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if nodes.contains_key(name) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("node {name:?} already attached"),
            ));
        }
        nodes.insert(name.to_string(), tx);
        Ok(Arc::new(MemoryTransport {
            name: name.to_string(),
            network: self.inner.clone(),
            rx,
        }))
    }

    pub fn set_impairment(&self, impairment: Impairment) {
        *self.inner.impairment.lock().unwrap_or_else(|e| e.into_inner()) = impairment;
    }

    /// Drop the next `times` datagrams for which `matches` returns true.
    pub fn drop_matching<F>(&self, times: usize, matches: F)
    where
        F: Fn(&[u8]) -> bool + Send + 'static,
    {
        self.inner
            .drop_rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DropRule {
                remaining: times,
                matches: Box::new(matches),
            });
    }

    pub fn stats(&self) -> NetworkStats {
        *self.inner.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NetworkInner {
    fn scripted_drop(&self, datagram: &[u8]) -> bool {
        let mut rules = self.drop_rules.lock().unwrap_or_else(|e| e.into_inner());
        let hit = rules
            .iter_mut()
            .find(|rule| rule.remaining > 0 && (rule.matches)(datagram));
        match hit {
            Some(rule) => {
                rule.remaining -= 1;
                true
            }
            None => false,
        }
    }

    /// Roll loss and duplication: `(drop, duplicate)`.
    fn roll(&self) -> (bool, bool) {
        let imp = *self.impairment.lock().unwrap_or_else(|e| e.into_inner());
        if imp.loss <= 0.0 && imp.duplicate <= 0.0 {
            return (false, false);
        }
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let drop = rng.random::<f64>() < imp.loss;
        let dup = rng.random::<f64>() < imp.duplicate;
        (drop, dup)
    }
}

pub struct MemoryTransport {
    name: String,
    network: Arc<NetworkInner>,
    rx: Receiver<Datagram>,
}

impl DatagramTransport for MemoryTransport {
    fn protocol(&self) -> &str {
        MEMORY_PROTOCOL
    }

    fn local_address(&self) -> String {
        self.name.clone()
    }

    fn max_payload_size(&self) -> usize {
        self.network.max_payload
    }

    fn send_to(&self, datagram: &[u8], to: &EndPoint) -> io::Result<usize> {
        if datagram.len() > self.network.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "datagram of {} bytes exceeds {}",
                    datagram.len(),
                    self.network.max_payload
                ),
            ));
        }

        let (lost, dup) = self.network.roll();
        if self.network.scripted_drop(datagram) || lost {
            self.network
                .stats
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .dropped += 1;
            return Ok(datagram.len());
        }

        let tx = {
            let nodes = self.network.nodes.lock().unwrap_or_else(|e| e.into_inner());
            nodes.get(&to.address).cloned().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no node {:?} on the network", to.address),
                )
            })?
        };

        let copies = if dup { 2 } else { 1 };
        let payload = Bytes::copy_from_slice(datagram);
        for _ in 0..copies {
            tx.send((payload.clone(), self.name.clone()))
                .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "node detached"))?;
        }

        let mut stats = self.network.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.delivered += 1;
        if dup {
            stats.duplicated += 1;
        }
        Ok(datagram.len())
    }

    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<(usize, String)>> {
        match self.rx.recv_timeout(timeout) {
            Ok((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Some((n, from)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "node detached",
            )),
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network
            .nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(address: &str) -> EndPoint {
        EndPoint::new(MEMORY_PROTOCOL, address, 4096, 0, 2)
    }

    #[test]
    fn memory_delivery_reports_sender() {
        let net = MemoryNetwork::new(1500);
        let a = net.attach("a").unwrap();
        let b = net.attach("b").unwrap();
        a.send_to(b"ping", &peer("b")).unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = b.recv(&mut buf, Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, "a");
        assert_eq!(b.recv(&mut buf, Duration::from_millis(1)).unwrap(), None);
        assert_eq!(net.stats().delivered, 1);
    }

    #[test]
    fn memory_rejects_oversize_and_unknown() {
        let net = MemoryNetwork::new(8);
        let a = net.attach("a").unwrap();
        let err = a.send_to(&[0u8; 9], &peer("a")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = a.send_to(b"x", &peer("nobody")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(net.attach("a").is_err());
    }

    #[test]
    fn node_detaches_on_drop() {
        let net = MemoryNetwork::new(64);
        let a = net.attach("a").unwrap();
        drop(net.attach("b").unwrap());
        assert!(a.send_to(b"x", &peer("b")).is_err());
        assert!(net.attach("b").is_ok());
    }

    #[test]
    fn scripted_drop_fires_once() {
        let net = MemoryNetwork::new(64);
        let a = net.attach("a").unwrap();
        let b = net.attach("b").unwrap();
        net.drop_matching(1, |d| d == b"two");
        for msg in [&b"one"[..], b"two", b"two"] {
            a.send_to(msg, &peer("b")).unwrap();
        }
        let mut buf = [0u8; 8];
        let mut got = Vec::new();
        while let Some((n, _)) = b.recv(&mut buf, Duration::from_millis(5)).unwrap() {
            got.push(buf[..n].to_vec());
        }
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(net.stats().dropped, 1);
    }

    #[test]
    fn full_loss_and_duplication() {
        let net = MemoryNetwork::new(64);
        let a = net.attach("a").unwrap();
        let b = net.attach("b").unwrap();
        let mut buf = [0u8; 8];

        net.set_impairment(Impairment {
            loss: 1.0,
            duplicate: 0.0,
        });
        a.send_to(b"x", &peer("b")).unwrap();
        assert_eq!(b.recv(&mut buf, Duration::from_millis(5)).unwrap(), None);

        net.set_impairment(Impairment {
            loss: 0.0,
            duplicate: 1.0,
        });
        a.send_to(b"y", &peer("b")).unwrap();
        assert!(b.recv(&mut buf, Duration::from_millis(5)).unwrap().is_some());
        assert!(b.recv(&mut buf, Duration::from_millis(5)).unwrap().is_some());
        assert_eq!(net.stats().duplicated, 1);
    }

    #[test]
    fn udp_address_format() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let text = UdpTransport::format_address(addr);
        assert_eq!(text, "127.0.0.1;5000");
        assert_eq!(UdpTransport::parse_address(&text).unwrap(), addr);
        assert!(UdpTransport::parse_address("127.0.0.1:5000").is_err());
    }

    #[test]
    fn udp_loopback() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let to = EndPoint::new(UDP_PROTOCOL, &b.local_address(), 4096, 0, 2);
        a.send_to(b"hello", &to).unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = b.recv(&mut buf, Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_address());
        assert_eq!(b.recv(&mut buf, Duration::from_millis(5)).unwrap(), None);
    }
}
