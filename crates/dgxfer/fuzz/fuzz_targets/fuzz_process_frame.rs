#![no_main]

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use dgxfer::memory::SharedRegion;
use dgxfer::transport::MEMORY_PROTOCOL;
use dgxfer::wire::Frame;
use dgxfer::{DatagramTransport, EndPoint, XferConfig, XferServices};

struct Sink;

impl DatagramTransport for Sink {
    fn protocol(&self) -> &str {
        MEMORY_PROTOCOL
    }

    fn local_address(&self) -> String {
        "sink".into()
    }

    fn max_payload_size(&self) -> usize {
        1472
    }

    fn send_to(&self, datagram: &[u8], _to: &EndPoint) -> io::Result<usize> {
        Ok(datagram.len())
    }

    fn recv(&self, _buf: &mut [u8], _timeout: Duration) -> io::Result<Option<(usize, String)>> {
        Ok(None)
    }
}

/// Feed arbitrary datagrams to one connection's receive path.
///
/// Input is split on 0xFF bytes so a single run exercises
/// duplicates, ACK runs and partial transactions across frames. Rejected
/// frames are fine; panics and out-of-bounds writes are not.
fuzz_target!(|data: &[u8]| {
    let (clock, mock) = quanta::Clock::mock();
    let svc = XferServices::new(
        1,
        EndPoint::new(MEMORY_PROTOCOL, "peer", 4096, 0, 4),
        Arc::new(Sink),
        Arc::new(SharedRegion::new(4096)),
        &XferConfig::default(),
        clock.clone(),
    );

    for chunk in data.split(|&b| b == 0xFF).filter(|c| !c.is_empty()) {
        if let Some(frame) = Frame::decode(Bytes::copy_from_slice(chunk)) {
            let _ = svc.process_frame(&frame);
        }
        mock.increment(Duration::from_millis(50));
        svc.check_acks(clock.now(), Duration::from_millis(20));
        svc.send_acks(clock.now(), Duration::from_millis(10));
    }
    assert_eq!(svc.memory().len(), 4096);
});
