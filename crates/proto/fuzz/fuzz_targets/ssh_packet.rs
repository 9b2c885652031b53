//! Fuzzes the binary packet parser with arbitrary stream bytes, split
//! into irregular reads.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skiff_proto::ssh::packet::PacketCodec;

fuzz_target!(|data: &[u8]| {
    let mut codec = PacketCodec::new();
    // Feed in two uneven pieces to exercise the incremental parser.
    let split = data.len() / 3;
    let (head, tail) = data.split_at(split);
    if codec.feed(head).is_err() {
        return;
    }
    let _ = codec.feed(tail);
    while codec.next_payload().is_some() {}
});
