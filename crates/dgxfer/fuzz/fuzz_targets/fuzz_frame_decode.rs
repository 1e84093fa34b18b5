#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use dgxfer::wire::{Frame, FrameHeader, MsgHeader};

/// Frame and header decoders must reject, never panic on, arbitrary bytes.
fuzz_target!(|data: &[u8]| {
    let _ = FrameHeader::decode(&mut &data[..]);
    let _ = MsgHeader::decode(&mut &data[..]);
    let _ = Frame::decode(Bytes::copy_from_slice(data));
});
