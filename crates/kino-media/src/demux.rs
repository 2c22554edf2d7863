// crates/kino-media/src/demux.rs
//
// Packet grabber. One thread owns the input context, tags each packet with
// the destination queue's current serial and routes it. Seeks are performed
// here, between reads, so queue invalidation is atomic from the pipeline's
// point of view: by the time the flag clears, every queue has a new serial.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format;

use crate::helpers::seek::seek_input;
use crate::media::{MediaEvent, MediaShared, SeekRequest};
use crate::packet::SourcePacket;

/// Back-off while a packet queue is full.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);
/// Back-off after a transient read error.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(10);

enum Grabbed {
    Packet(usize, ffmpeg::Packet),
    Transient,
    Fatal(ffmpeg::Error),
    Eof,
}

pub(crate) fn run(shared: Arc<MediaShared>) {
    let mut ictx = match format::input(&shared.info.url) {
        Ok(ictx) => ictx,
        Err(e) => {
            eprintln!("[demux] cannot reopen {}: {e}", shared.info.url);
            finish(&shared);
            return;
        }
    };

    loop {
        if shared.flags.shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Some(request) = shared.take_seek() {
            perform_seek(&mut ictx, &shared, &request);
            shared.finish_seek();
        }

        match grab(&mut ictx) {
            Grabbed::Packet(stream_index, packet) => route(&shared, stream_index, packet),
            Grabbed::Transient => thread::sleep(READ_RETRY_BACKOFF),
            Grabbed::Eof => break,
            Grabbed::Fatal(e) => {
                eprintln!("[demux] read error: {e}");
                break;
            }
        }
    }
    finish(&shared);
}

fn grab(ictx: &mut format::context::Input) -> Grabbed {
    let mut packets = ictx.packets();
    match packets.next() {
        Some(Ok((stream, packet))) => Grabbed::Packet(stream.index(), packet),
        Some(Err(e)) => match e {
            ffmpeg::Error::Other { errno: ffmpeg::util::error::EAGAIN } => Grabbed::Transient,
            ffmpeg::Error::Eof => Grabbed::Eof,
            other => Grabbed::Fatal(other),
        },
        None => Grabbed::Eof,
    }
}

/// Route by stream index; packets for unselected streams are dropped. The
/// serial is read from the destination queue at tag time.
fn route(shared: &MediaShared, stream_index: usize, packet: ffmpeg::Packet) {
    let queue = if shared.info.video.as_ref().map(|v| v.index) == Some(stream_index) {
        &shared.vpackets
    } else if shared.has_audio()
        && shared.info.audio.as_ref().map(|a| a.index) == Some(stream_index)
    {
        &shared.apackets
    } else if shared.info.subtitle.as_ref().map(|s| s.index) == Some(stream_index) {
        &shared.spackets
    } else {
        return;
    };

    let mut handle = SourcePacket::new(packet, queue.serial());
    loop {
        match queue.push_tail(handle) {
            Ok(()) => return,
            Err(back) => {
                // Full. A pending seek is about to clear the queue anyway,
                // so drop rather than wait for room that a stale packet
                // would only waste.
                if shared.flags.shutdown.load(Ordering::Acquire) || shared.seek_pending() {
                    return;
                }
                handle = back;
                thread::sleep(QUEUE_FULL_BACKOFF);
            }
        }
    }
}

fn perform_seek(ictx: &mut format::context::Input, shared: &MediaShared, request: &SeekRequest) {
    if !seek_input(ictx, request.target_us, request.rel_us) {
        return;
    }
    if shared.has_video() {
        shared.vpackets.clear();
        shared.vframes.clear();
    }
    if shared.has_audio() {
        shared.apackets.clear();
        shared.aframes.clear();
    }
    if shared.has_subtitle() {
        shared.spackets.clear();
        shared.sframes.clear();
    }
    {
        let mut clocks = shared.clocks.write();
        if request.by_bytes {
            clocks.external.set(f64::NAN, 0);
        } else {
            clocks.external.set(request.target_us as f64 / 1e6, 0);
        }
    }
    eprintln!(
        "[demux] seek done, queue serials v:{} a:{} s:{}",
        shared.vpackets.serial(),
        shared.apackets.serial(),
        shared.spackets.serial()
    );
}

fn finish(shared: &MediaShared) {
    shared.flags.grabber_finished.store(true, Ordering::Release);
    shared.notify(MediaEvent::GrabberFinished);
    eprintln!("[demux] end of input");
}
