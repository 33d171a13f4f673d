//! Fuzz target for the counter frame decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_frame_decoder
//!
//! The first byte picks a chunk size; the rest is fed to a decoder in chunks
//! of that size and, separately, all at once. Both must yield the same
//! packets and stop at the same error.

#![no_main]

use ipacct_core::protocol::{FrameDecoder, Packet, ProtocolError};
use libfuzzer_sys::fuzz_target;

fn decode(chunks: impl Iterator<Item = Vec<u8>>) -> (Vec<Packet>, Option<ProtocolError>) {
    let mut decoder = FrameDecoder::new();
    let mut packets = Vec::new();
    for chunk in chunks {
        decoder.extend(&chunk);
        loop {
            match decoder.next_packet() {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => break,
                Err(e) => return (packets, Some(e)),
            }
        }
    }
    (packets, None)
}

fuzz_target!(|data: &[u8]| {
    let Some((&size, stream)) = data.split_first() else {
        return;
    };
    let size = usize::from(size).max(1);

    let whole = decode(std::iter::once(stream.to_vec()));
    let chunked = decode(stream.chunks(size).map(<[u8]>::to_vec));
    assert_eq!(whole, chunked);

    for packet in &whole.0 {
        if let Ok(frame) = packet.encode() {
            assert_eq!(decode(std::iter::once(frame)).0, vec![packet.clone()]);
        }
    }
});
