//! # Endpoints
//!
//! [`EndPoint`] is the naming string peers exchange out of band:
//!
//! ```text
//! <protocol>:<opaque address>;<memory size>.<mailbox>.<max mailbox>
//! udp-dgram:127.0.0.1;5000;65536.1.4
//! ```
//!
//! [`LocalEndpoint`] owns one transport, the endpoint's memory, the table of
//! connections indexed by remote mailbox, and two background threads:
//!
//! - **receiver**: blocking receive with timeout, decode, route by source
//!   mailbox, `process_frame`
//! - **ack/retransmit**: for every connection `check_acks` then `send_acks`,
//!   sleeping the poll interval between connections
//!
//! Both threads stop when the endpoint is shut down or dropped. A fatal
//! error on the receive path stops them too: the endpoint fails every
//! waiting request and refuses new ones rather than carry on with state it
//! can no longer trust.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use quanta::Clock;
use tracing::{debug, error, info, warn};

use crate::config::XferConfig;
use crate::error::XferError;
use crate::memory::SharedRegion;
use crate::request::XferRequest;
use crate::services::{PostedTransaction, XferServices};
use crate::stats::EndpointStats;
use crate::transport::DatagramTransport;
use crate::wire::Frame;

// ─── EndPoint ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndPoint {
    pub protocol: String,
    /// Transport-specific address, opaque to this layer.
    pub address: String,
    /// Memory size in bytes; 0 when unknown.
    pub size: u32,
    pub mailbox: u16,
    pub max_mailbox: u16,
}

impl EndPoint {
    pub fn new(protocol: &str, address: &str, size: u32, mailbox: u16, max_mailbox: u16) -> Self {
        EndPoint {
            protocol: protocol.to_string(),
            address: address.to_string(),
            size,
            mailbox,
            max_mailbox,
        }
    }

    pub fn parse(input: &str) -> Result<Self, XferError> {
        let invalid = |reason| XferError::InvalidEndpoint {
            input: input.to_string(),
            reason,
        };
        let (protocol, rest) = input.split_once(':').ok_or_else(|| invalid("missing protocol"))?;
        if protocol.is_empty() {
            return Err(invalid("empty protocol"));
        }
        let (address, triple) = rest
            .rsplit_once(';')
            .ok_or_else(|| invalid("missing size.mailbox.max"))?;
        if address.is_empty() {
            return Err(invalid("empty address"));
        }

        let mut parts = triple.split('.');
        let (Some(size), Some(mailbox), Some(max_mailbox), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected size.mailbox.max"));
        };
        let endpoint = EndPoint {
            protocol: protocol.to_string(),
            address: address.to_string(),
            size: size.parse().map_err(|_| invalid("bad size"))?,
            mailbox: mailbox.parse().map_err(|_| invalid("bad mailbox"))?,
            max_mailbox: max_mailbox.parse().map_err(|_| invalid("bad max mailbox"))?,
        };
        if endpoint.mailbox >= endpoint.max_mailbox {
            return Err(invalid("mailbox must be below max mailbox"));
        }
        Ok(endpoint)
    }

    pub fn validate(&self) -> Result<(), XferError> {
        if self.mailbox >= self.max_mailbox {
            return Err(XferError::MailboxOutOfRange {
                mailbox: self.mailbox,
                max: self.max_mailbox,
            });
        }
        Ok(())
    }
}

impl FromStr for EndPoint {
    type Err = XferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndPoint::parse(s)
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{};{}.{}.{}",
            self.protocol, self.address, self.size, self.mailbox, self.max_mailbox
        )
    }
}

// ─── LocalEndpoint ───────────────────────────────────────────────────────────

struct EndpointInner {
    endpoint: EndPoint,
    memory: Arc<SharedRegion>,
    transport: Arc<dyn DatagramTransport>,
    connections: RwLock<Vec<Option<Arc<XferServices>>>>,
    config: XferConfig,
    clock: Clock,
    stats: Mutex<EndpointStats>,
    running: Arc<AtomicBool>,
    /// Epoch for the next connection; consecutive from a random start so a
    /// reconnect never reuses the epoch it replaces.
    next_epoch: AtomicU16,
}

pub struct LocalEndpoint {
    inner: Arc<EndpointInner>,
    running: Arc<AtomicBool>,
    thread_handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl LocalEndpoint {
    /// Bring up an endpoint on `transport` and start its threads.
    ///
    /// The endpoint's address is replaced by the transport's, so a UDP
    /// endpoint bound to port 0 reports the port it actually got.
    pub fn start(
        endpoint: EndPoint,
        transport: Arc<dyn DatagramTransport>,
        config: XferConfig,
    ) -> Result<Self, XferError> {
        Self::start_with_clock(endpoint, transport, config, Clock::new())
    }

    pub fn start_with_clock(
        mut endpoint: EndPoint,
        transport: Arc<dyn DatagramTransport>,
        config: XferConfig,
        clock: Clock,
    ) -> Result<Self, XferError> {
        endpoint.validate()?;
        if endpoint.protocol != transport.protocol() {
            return Err(XferError::ProtocolMismatch {
                local: transport.protocol().to_string(),
                remote: endpoint.protocol,
            });
        }
        endpoint.address = transport.local_address();

        let running = Arc::new(AtomicBool::new(true));
        let inner = Arc::new(EndpointInner {
            memory: Arc::new(SharedRegion::new(endpoint.size as usize)),
            connections: RwLock::new(vec![None; endpoint.max_mailbox as usize]),
            endpoint,
            transport,
            config,
            clock,
            stats: Mutex::new(EndpointStats::default()),
            running: running.clone(),
            next_epoch: AtomicU16::new(rand::random::<u16>()),
        });
        let mailbox = inner.endpoint.mailbox;

        let rx_inner = inner.clone();
        let rx_running = running.clone();
        let rx_handle = thread::Builder::new()
            .name(format!("dgxfer-rx-{mailbox}"))
            .spawn(move || receiver_loop(rx_inner, rx_running))?;

        let ack_inner = inner.clone();
        let ack_running = running.clone();
        let ack_handle = match thread::Builder::new()
            .name(format!("dgxfer-ack-{mailbox}"))
            .spawn(move || ack_loop(ack_inner, ack_running))
        {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Relaxed);
                let _ = rx_handle.join();
                return Err(e.into());
            }
        };

        info!(endpoint = %inner.endpoint, "endpoint started");
        Ok(LocalEndpoint {
            inner,
            running,
            thread_handles: Mutex::new(vec![rx_handle, ack_handle]),
        })
    }

    pub fn endpoint(&self) -> &EndPoint {
        &self.inner.endpoint
    }

    pub fn memory(&self) -> &Arc<SharedRegion> {
        &self.inner.memory
    }

    pub fn config(&self) -> &XferConfig {
        &self.inner.config
    }

    /// Connection to `remote`, created on first use.
    pub fn connect(&self, remote: &EndPoint) -> Result<Arc<XferServices>, XferError> {
        if !self.is_running() {
            return Err(XferError::Shutdown);
        }
        if remote.protocol != self.inner.endpoint.protocol {
            return Err(XferError::ProtocolMismatch {
                local: self.inner.endpoint.protocol.clone(),
                remote: remote.protocol.clone(),
            });
        }
        self.inner.connect(remote.clone(), true)
    }

    pub fn services(&self, mailbox: u16) -> Option<Arc<XferServices>> {
        self.inner.services(mailbox)
    }

    pub fn connections(&self) -> Vec<Arc<XferServices>> {
        self.inner.connections()
    }

    /// New request against `remote`.
    pub fn request(&self, remote: &EndPoint) -> Result<XferRequest, XferError> {
        Ok(XferRequest::new(self.connect(remote)?))
    }

    /// Announce teardown to the peer and drop the connection.
    ///
    /// The connection stays up, retransmitting the notice, until the peer
    /// acknowledges it or the disconnect timeout passes. Whatever is still
    /// in flight after that is abandoned.
    pub fn disconnect(&self, mailbox: u16) -> Result<(), XferError> {
        if mailbox >= self.inner.endpoint.max_mailbox {
            return Err(XferError::MailboxOutOfRange {
                mailbox,
                max: self.inner.endpoint.max_mailbox,
            });
        }
        let Some(services) = self.inner.services(mailbox) else {
            return Ok(());
        };
        match services.post_disconnect() {
            Ok(notice) => self.await_notice(mailbox, &notice),
            Err(e) => warn!(mailbox, error = %e, "disconnect notice not sent"),
        }
        if let Some(services) = self.inner.remove(mailbox) {
            services.abandon_in_flight();
        }
        Ok(())
    }

    fn await_notice(&self, mailbox: u16, notice: &PostedTransaction) {
        let deadline = quanta::Instant::now() + self.inner.config.disconnect_timeout;
        while !notice.acks.is_complete() {
            if notice.acks.is_failed() || !self.is_running() || quanta::Instant::now() >= deadline {
                warn!(mailbox, "disconnect not acknowledged, closing anyway");
                return;
            }
            thread::sleep(self.inner.config.poll_interval);
        }
        debug!(mailbox, "disconnect acknowledged");
    }

    pub fn stats(&self) -> EndpointStats {
        self.inner.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop both threads and wait for them. Also reaps threads that stopped
    /// on their own after a fatal error.
    pub fn shutdown(&self) {
        let was_running = self.running.swap(false, Ordering::Relaxed);
        let handles: Vec<_> = self
            .thread_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        if was_running {
            info!(endpoint = %self.inner.endpoint, "endpoint stopped");
        }
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EndpointInner {
    fn services(&self, mailbox: u16) -> Option<Arc<XferServices>> {
        let conns = self.connections.read().unwrap_or_else(|e| e.into_inner());
        conns.get(mailbox as usize).and_then(|c| c.clone())
    }

    fn connections(&self) -> Vec<Arc<XferServices>> {
        let conns = self.connections.read().unwrap_or_else(|e| e.into_inner());
        conns.iter().flatten().cloned().collect()
    }

    /// Find or create the connection to `remote.mailbox`. An explicit connect
    /// fills in the endpoint of a connection first learned from traffic.
    fn connect(&self, remote: EndPoint, explicit: bool) -> Result<Arc<XferServices>, XferError> {
        let max = self.endpoint.max_mailbox;
        if remote.mailbox >= max {
            return Err(XferError::MailboxOutOfRange {
                mailbox: remote.mailbox,
                max,
            });
        }
        let mut conns = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let slot = &mut conns[remote.mailbox as usize];
        if let Some(existing) = slot {
            if explicit && existing.remote() != remote {
                existing.set_remote(remote);
            }
            return Ok(existing.clone());
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        info!(
            local = self.endpoint.mailbox,
            remote = %remote,
            explicit,
            epoch,
            "connection opened"
        );
        let services = Arc::new(
            XferServices::new(
                self.endpoint.mailbox,
                remote,
                self.transport.clone(),
                self.memory.clone(),
                &self.config,
                self.clock.clone(),
            )
            .with_epoch(epoch),
        );
        *slot = Some(services.clone());
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connections_opened += 1;
        Ok(services)
    }

    fn remove(&self, mailbox: u16) -> Option<Arc<XferServices>> {
        let removed = {
            let mut conns = self.connections.write().unwrap_or_else(|e| e.into_inner());
            conns.get_mut(mailbox as usize).and_then(Option::take)
        };
        if removed.is_some() {
            info!(local = self.endpoint.mailbox, remote = mailbox, "connection closed");
            self.stats
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .connections_closed += 1;
        }
        removed
    }

    /// Stop both threads and fail every request still waiting.
    fn fail_stop(&self) {
        for services in self.connections() {
            services.abandon_in_flight();
        }
        self.running.store(false, Ordering::Relaxed);
    }

    fn bump(&self, f: impl FnOnce(&mut EndpointStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn handle_datagram(&self, data: &[u8], from: &str) {
        self.bump(|s| s.datagrams_received += 1);
        let Some(frame) = Frame::decode(Bytes::copy_from_slice(data)) else {
            self.bump(|s| s.malformed += 1);
            warn!(from, len = data.len(), "dropping malformed datagram");
            return;
        };

        let header = frame.header;
        if header.dest_id != self.endpoint.mailbox || header.src_id >= self.endpoint.max_mailbox {
            self.bump(|s| s.unroutable += 1);
            debug!(
                from,
                src = header.src_id,
                dest = header.dest_id,
                "dropping frame for another mailbox"
            );
            return;
        }

        let services = match self.services(header.src_id) {
            Some(services) => services,
            None => {
                let learned = EndPoint::new(
                    &self.endpoint.protocol,
                    from,
                    0,
                    header.src_id,
                    self.endpoint.max_mailbox,
                );
                match self.connect(learned, false) {
                    Ok(services) => services,
                    Err(e) => {
                        warn!(from, error = %e, "cannot open connection");
                        return;
                    }
                }
            }
        };

        match services.process_frame(&frame) {
            Ok(outcome) if outcome.disconnect => {
                // The peer holds its connection open until this ACK arrives.
                services.flush_acks(self.clock.now());
                self.remove(header.src_id);
            }
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                error!(
                    mailbox = self.endpoint.mailbox,
                    src = header.src_id,
                    seq = header.frame_seq,
                    error = %e,
                    "unrecoverable transfer state, stopping endpoint"
                );
                self.bump(|s| s.fatal_errors += 1);
                self.fail_stop();
            }
            Err(e) => {
                self.bump(|s| s.rejected += 1);
                warn!(
                    src = header.src_id,
                    seq = header.frame_seq,
                    error = %e,
                    "frame rejected"
                );
            }
        }
    }
}

fn receiver_loop(inner: Arc<EndpointInner>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; 65536];
    let timeout = inner.config.receive_timeout;
    while running.load(Ordering::Relaxed) {
        match inner.transport.recv(&mut buf, timeout) {
            Ok(Some((0, _))) | Ok(None) => {}
            Ok(Some((n, from))) => inner.handle_datagram(&buf[..n], &from),
            Err(e) => {
                warn!(error = %e, "datagram receive failed");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn ack_loop(inner: Arc<EndpointInner>, running: Arc<AtomicBool>) {
    let retransmit_timeout = inner.config.retransmit_timeout;
    let ack_delay = inner.config.ack_delay;
    let poll = inner.config.poll_interval;
    while running.load(Ordering::Relaxed) {
        let conns = inner.connections();
        if conns.is_empty() {
            thread::sleep(poll);
            continue;
        }
        for services in conns {
            let now = inner.clock.now();
            services.check_acks(now, retransmit_timeout);
            services.send_acks(now, ack_delay);
            thread::sleep(poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CompletionStatus, CopyKind};
    use crate::transaction::TRANSACTION_TABLE_SIZE;
    use crate::transport::{MemoryNetwork, MEMORY_PROTOCOL, UDP_PROTOCOL};
    use crate::wire::{encode_frame, encode_message, FrameHeader, MsgHeader, MsgType, FLAG_HAS_MESSAGES};
    use bytes::BytesMut;

    #[test]
    fn parse_and_display() {
        let ep: EndPoint = "udp-dgram:127.0.0.1;5000;65536.1.4".parse().unwrap();
        assert_eq!(ep.protocol, UDP_PROTOCOL);
        assert_eq!(ep.address, "127.0.0.1;5000");
        assert_eq!((ep.size, ep.mailbox, ep.max_mailbox), (65536, 1, 4));
        assert_eq!(ep.to_string(), "udp-dgram:127.0.0.1;5000;65536.1.4");
    }

    #[test]
    fn parse_keeps_colons_in_address() {
        let ep = EndPoint::parse("udp-dgram:::1;5000;1024.0.2").unwrap();
        assert_eq!(ep.address, "::1;5000");
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in [
            "no-protocol",
            ":addr;1.0.2",
            "mem-dgram:;1.0.2",
            "mem-dgram:node",
            "mem-dgram:node;1.0",
            "mem-dgram:node;1.0.2.3",
            "mem-dgram:node;x.0.2",
            "mem-dgram:node;16.2.2",
        ] {
            assert!(
                matches!(EndPoint::parse(bad), Err(XferError::InvalidEndpoint { .. })),
                "{bad}"
            );
        }
    }

    fn local(net: &MemoryNetwork, name: &str, mailbox: u16) -> LocalEndpoint {
        let transport = net.attach(name).unwrap();
        let ep = EndPoint::new(MEMORY_PROTOCOL, name, 4096, mailbox, 4);
        LocalEndpoint::start(ep, transport, XferConfig::default()).unwrap()
    }

    #[test]
    fn start_checks_protocol_and_mailbox() {
        let net = MemoryNetwork::new(1500);
        let ep = EndPoint::new(UDP_PROTOCOL, "x", 4096, 0, 4);
        let err = LocalEndpoint::start(ep, net.attach("x").unwrap(), XferConfig::default());
        assert!(matches!(err, Err(XferError::ProtocolMismatch { .. })));

        let ep = EndPoint::new(MEMORY_PROTOCOL, "y", 4096, 4, 4);
        let err = LocalEndpoint::start(ep, net.attach("y").unwrap(), XferConfig::default());
        assert!(matches!(err, Err(XferError::MailboxOutOfRange { .. })));
    }

    #[test]
    fn connect_is_lazy_and_shared() {
        let net = MemoryNetwork::new(1500);
        let a = local(&net, "a", 0);
        let b = local(&net, "b", 1);
        assert!(a.services(1).is_none());
        let s1 = a.connect(b.endpoint()).unwrap();
        let s2 = a.connect(b.endpoint()).unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(a.connections().len(), 1);
        assert_eq!(a.stats().connections_opened, 1);

        let far = EndPoint::new(MEMORY_PROTOCOL, "c", 4096, 3, 8);
        assert!(a.connect(&far).is_ok());
        let out = EndPoint::new(MEMORY_PROTOCOL, "c", 4096, 5, 8);
        assert!(matches!(
            a.connect(&out),
            Err(XferError::MailboxOutOfRange { .. })
        ));
    }

    #[test]
    fn misrouted_and_garbage_dropped() {
        let net = MemoryNetwork::new(1500);
        let a = local(&net, "a", 0);
        let raw = net.attach("raw").unwrap();
        let to_a = a.endpoint().clone();

        raw.send_to(&[1, 2, 3], &to_a).unwrap();
        let wrong_dest = FrameHeader {
            dest_id: 2,
            src_id: 1,
            ..Default::default()
        };
        raw.send_to(&encode_frame(&wrong_dest, &[]), &to_a).unwrap();

        let deadline = quanta::Instant::now() + Duration::from_secs(2);
        while a.stats().datagrams_received < 2 && quanta::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = a.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unroutable, 1);
        assert!(a.connections().is_empty());
    }

    #[test]
    fn table_collision_stops_endpoint() {
        let net = MemoryNetwork::new(1500);
        let b = local(&net, "b", 1);
        let raw = net.attach("raw").unwrap();
        let to_b = b.endpoint().clone();

        // Nobody is attached as "ghost", so this request never gets an ACK.
        let ghost = EndPoint::new(MEMORY_PROTOCOL, "ghost", 4096, 2, 4);
        let mut waiting = b.request(&ghost).unwrap();
        waiting.copy(0, 0, 4, CopyKind::Flag).unwrap();
        waiting.post().unwrap();

        // Two-message transactions whose ids share a table slot; neither
        // finishes, so the second collides with the first.
        let partial = |seq: u16, tid: u16| {
            let mut body = BytesMut::new();
            encode_message(
                &mut body,
                &MsgHeader {
                    msg_type: MsgType::Data,
                    next_msg: false,
                    transaction_id: tid,
                    num_msgs: 2,
                    msg_sequence: 0,
                    data_addr: 0,
                    data_len: 4,
                    flag_addr: 100,
                    flag_value: 1,
                },
                &[7u8; 4],
            );
            let header = FrameHeader {
                epoch: 9,
                frame_seq: seq,
                dest_id: 1,
                src_id: 0,
                flags: FLAG_HAS_MESSAGES,
                ..Default::default()
            };
            encode_frame(&header, &body)
        };
        raw.send_to(&partial(1, 1), &to_b).unwrap();
        raw.send_to(&partial(2, 1 + TRANSACTION_TABLE_SIZE as u16), &to_b)
            .unwrap();

        let deadline = quanta::Instant::now() + Duration::from_secs(2);
        while b.is_running() && quanta::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!b.is_running());
        assert_eq!(b.stats().fatal_errors, 1);
        assert_eq!(waiting.status(), CompletionStatus::Failed);
        assert!(matches!(b.connect(&ghost), Err(XferError::Shutdown)));
        assert_eq!(b.memory().read_u32(100).unwrap(), 0);
        b.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let net = MemoryNetwork::new(1500);
        let a = local(&net, "a", 0);
        a.shutdown();
        assert!(!a.is_running());
        a.shutdown();
        let remote = EndPoint::new(MEMORY_PROTOCOL, "b", 4096, 1, 4);
        assert!(matches!(a.connect(&remote), Err(XferError::Shutdown)));
    }
}
