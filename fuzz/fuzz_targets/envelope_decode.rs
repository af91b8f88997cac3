#![no_main]
use std::time::SystemTime;

use arbitrary::Arbitrary;
use core_framing as framing;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    data: Vec<u8>,
    sender_gid: u64,
    text: bool,
}

fuzz_target!(|inp: Input| {
    // Decode must return Ok or a DecodeError, never panic.
    if let Ok(framing::Payload::StreamChunk(chunk)) = framing::Payload::decode(&inp.data) {
        let _ = framing::Reassembler::new().on_chunk(&chunk);
    }

    let data = if inp.text {
        framing::MeshData::Text(String::from_utf8_lossy(&inp.data).into_owned())
    } else {
        framing::MeshData::Binary(inp.data.into())
    };
    let packet = framing::MeshPacket {
        sender_gid: inp.sender_gid,
        receiver_gid: 0,
        sent_at: SystemTime::UNIX_EPOCH,
        data,
    };
    let _ = framing::Message::decode(&packet);
});
