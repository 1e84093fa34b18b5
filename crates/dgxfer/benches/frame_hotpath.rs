//! Hot-path benchmarks for dgxfer.
//!
//! - Frame encode/decode at UDP size
//! - `post_transaction` (plan, pack, stamp) followed by ACK release
//! - `process_frame` on fresh and duplicate frames
//!
//! Run with: cargo bench --package dgxfer

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use quanta::Clock;

use dgxfer::memory::SharedRegion;
use dgxfer::transaction::{FlagTarget, OutboundMessage, Transaction};
use dgxfer::transport::MEMORY_PROTOCOL;
use dgxfer::wire::{self, Frame, FrameHeader, MsgHeader, MsgType, FLAG_HAS_MESSAGES};
use dgxfer::{DatagramTransport, EndPoint, XferConfig, XferServices};

const MEM: usize = 256 * 1024;
const PAYLOAD: usize = 1472;

struct Capture {
    sent: Mutex<Vec<Bytes>>,
    keep: bool,
}

impl Capture {
    fn take(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl DatagramTransport for Capture {
    fn protocol(&self) -> &str {
        MEMORY_PROTOCOL
    }

    fn local_address(&self) -> String {
        "bench".into()
    }

    fn max_payload_size(&self) -> usize {
        PAYLOAD
    }

    fn send_to(&self, datagram: &[u8], _to: &EndPoint) -> io::Result<usize> {
        if self.keep {
            self.sent.lock().unwrap().push(Bytes::copy_from_slice(datagram));
        }
        Ok(datagram.len())
    }

    fn recv(&self, _buf: &mut [u8], _timeout: Duration) -> io::Result<Option<(usize, String)>> {
        Ok(None)
    }
}

fn services(local: u16, remote: u16, keep: bool, clock: &Clock) -> (XferServices, Arc<Capture>) {
    let wire = Arc::new(Capture {
        sent: Mutex::new(Vec::new()),
        keep,
    });
    let svc = XferServices::new(
        local,
        EndPoint::new(MEMORY_PROTOCOL, "peer", MEM as u32, remote, 2),
        wire.clone(),
        Arc::new(SharedRegion::new(MEM)),
        &XferConfig::default(),
        clock.clone(),
    );
    (svc, wire)
}

/// `count` full-size data messages followed by a flag.
fn transaction(count: u32) -> Transaction {
    let chunk = wire::max_message_payload(PAYLOAD) as u32;
    let mut txn = Transaction::new();
    for i in 0..count {
        txn.add(OutboundMessage {
            msg_type: MsgType::Data,
            src_offset: i * chunk,
            dst_offset: i * chunk,
            len: chunk as u16,
        })
        .unwrap();
    }
    txn.finalize(FlagTarget {
        src_offset: (MEM - 4) as u32,
        dst_offset: (MEM - 4) as u32,
    })
    .unwrap();
    txn
}

fn seq_of(datagram: &Bytes) -> u16 {
    FrameHeader::decode(&mut &datagram[..]).unwrap().frame_seq
}

// ─── Wire ───────────────────────────────────────────────────────────────

fn bench_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");
    let payload = vec![0xA5u8; wire::max_message_payload(PAYLOAD)];
    let header = FrameHeader {
        epoch: 0x2A,
        frame_seq: 7,
        dest_id: 1,
        src_id: 0,
        flags: FLAG_HAS_MESSAGES,
        ack_start: 100,
        ack_count: 5,
    };
    let msg = MsgHeader {
        msg_type: MsgType::Data,
        next_msg: false,
        transaction_id: 3,
        num_msgs: 8,
        msg_sequence: 2,
        data_addr: 4096,
        data_len: payload.len() as u16,
        flag_addr: 0,
        flag_value: 1,
    };
    let mut body = BytesMut::new();
    wire::encode_message(&mut body, &msg, &payload);
    let datagram = wire::encode_frame(&header, &body);
    group.throughput(Throughput::Bytes(datagram.len() as u64));

    group.bench_function("encode_full_frame", |b| {
        b.iter(|| {
            let mut body = BytesMut::with_capacity(PAYLOAD);
            wire::encode_message(&mut body, black_box(&msg), black_box(&payload));
            black_box(wire::encode_frame(black_box(&header), &body));
        });
    });

    group.bench_function("decode_full_frame", |b| {
        b.iter(|| black_box(Frame::decode(black_box(datagram.clone()))));
    });

    group.finish();
}

// ─── Sender ─────────────────────────────────────────────────────────────

fn bench_post(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_transaction");
    let (clock, _mock) = Clock::mock();

    for count in [1u32, 16, 64] {
        let (sender, wire) = services(0, 1, true, &clock);
        let txn = transaction(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("{count}_messages"), |b| {
            b.iter(|| {
                black_box(sender.post_transaction(black_box(&txn)).unwrap());
                for datagram in wire.take() {
                    sender.ack(1, seq_of(&datagram));
                }
            });
        });
    }

    group.finish();
}

// ─── Receiver ───────────────────────────────────────────────────────────

fn bench_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_frame");
    let (clock, mock) = Clock::mock();

    {
        let (sender, wire) = services(0, 1, true, &clock);
        let (receiver, _) = services(1, 0, false, &clock);
        let txn = transaction(16);
        group.throughput(Throughput::Elements(16));
        group.bench_function("fresh_16_messages", |b| {
            b.iter_batched(
                || {
                    sender.post_transaction(&txn).unwrap();
                    let frames: Vec<Frame> = wire
                        .take()
                        .into_iter()
                        .map(|d| {
                            sender.ack(1, seq_of(&d));
                            Frame::decode(d).unwrap()
                        })
                        .collect();
                    frames
                },
                |frames| {
                    for frame in &frames {
                        black_box(receiver.process_frame(frame).unwrap());
                    }
                    mock.increment(Duration::from_millis(1));
                    receiver.send_acks(clock.now(), Duration::ZERO);
                },
                BatchSize::SmallInput,
            );
        });
    }

    {
        let (sender, wire) = services(0, 1, true, &clock);
        let (receiver, _) = services(1, 0, false, &clock);
        sender.post_transaction(&transaction(1)).unwrap();
        let frame = Frame::decode(wire.take().remove(0)).unwrap();
        receiver.process_frame(&frame).unwrap();
        group.throughput(Throughput::Elements(1));
        group.bench_function("duplicate", |b| {
            b.iter(|| {
                black_box(receiver.process_frame(black_box(&frame)).unwrap());
                mock.increment(Duration::from_millis(1));
                receiver.send_acks(clock.now(), Duration::ZERO);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_wire, bench_post, bench_process);
criterion_main!(benches);
