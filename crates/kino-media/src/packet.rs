// crates/kino-media/src/packet.rs
//
// A demuxed packet tagged with the generation of the queue it was routed to.
// The serial is assigned once, when the packet leaves the grabber, and never
// changes; frames decoded from it inherit it.

use ffmpeg_the_third as ffmpeg;
use kino_core::Shared;

pub struct SourcePacket {
    pub packet: ffmpeg::Packet,
    pub serial: i32,
}

pub type PacketRef = Shared<SourcePacket>;

impl SourcePacket {
    pub fn new(packet: ffmpeg::Packet, serial: i32) -> PacketRef {
        Shared::new(Self { packet, serial })
    }
}
