// crates/kino-media/src/decode.rs
//
// One decoder thread per enabled stream. Each drains its packet queue,
// feeds the codec, and pushes decoded frames (tagged with the packet's
// serial) into the matching frame queue. A serial change between packets
// means a seek happened; codec buffers are flushed so decoding restarts
// clean. Threads exit on fatal codec errors, on shutdown, or after draining
// the codec once the grabber is done.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format;
use ffmpeg::util::error::EAGAIN;
use ffmpeg::util::frame;

use kino_core::{BoundedQueue, Shared};

use crate::frame::{AudioSamples, SubtitleEvent, VideoPicture, VideoPictureRef};
use crate::media::{MediaEvent, MediaShared, StreamKind};
use crate::packet::PacketRef;

const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(10);
/// Frame queues are shallow and drained at presentation speed, so producers
/// throttle hard when they are full.
const FRAME_QUEUE_FULL_BACKOFF: Duration = Duration::from_secs(1);

enum Step {
    Packet(PacketRef),
    Drain,
    Wait,
    Stop,
}

fn next_step(shared: &MediaShared, queue: &BoundedQueue<PacketRef>) -> Step {
    if shared.flags.shutdown.load(Ordering::Acquire) {
        return Step::Stop;
    }
    match queue.pop_head() {
        Some(packet) => Step::Packet(packet),
        None => {
            if shared.flags.grabber_finished.load(Ordering::Acquire) {
                Step::Drain
            } else {
                Step::Wait
            }
        }
    }
}

/// Reopen the input and build a codec context for `stream_index`. Format
/// contexts never cross threads, so each decoder derives its own.
fn decoder_context(url: &str, stream_index: usize) -> anyhow::Result<codec::context::Context> {
    let ictx = format::input(&url)?;
    let stream = ictx
        .stream(stream_index)
        .ok_or_else(|| anyhow::anyhow!("stream {stream_index} disappeared"))?;
    let mut ctx = codec::context::Context::from_parameters(stream.parameters())?;
    let time_base = stream.time_base();
    // Codecs want the packet time base to resolve skipped-sample metadata.
    unsafe {
        (*ctx.as_mut_ptr()).pkt_timebase = ffmpeg::ffi::AVRational {
            num: time_base.numerator(),
            den: time_base.denominator(),
        };
    }
    Ok(ctx)
}

fn fail(shared: &MediaShared, kind: StreamKind, message: &str) {
    eprintln!("[decode] {kind} decoder error: {message}");
    shared.notify(MediaEvent::DecoderError {
        kind,
        message: message.to_string(),
    });
}

fn finish(shared: &MediaShared, kind: StreamKind) {
    let flag = match kind {
        StreamKind::Video => &shared.flags.video_decoder_finished,
        StreamKind::Audio => &shared.flags.audio_decoder_finished,
        StreamKind::Subtitle => &shared.flags.subtitle_decoder_finished,
    };
    flag.store(true, Ordering::Release);
    shared.notify(MediaEvent::DecoderFinished(kind));
    eprintln!("[decode] {kind} decoder finished");
}

// ── Video ─────────────────────────────────────────────────────────────────

pub(crate) fn run_video(shared: Arc<MediaShared>) {
    let Some(info) = shared.info.video.clone() else {
        return;
    };
    let mut decoder = match decoder_context(&shared.info.url, info.index)
        .and_then(|ctx| ctx.decoder().video().map_err(Into::into))
    {
        Ok(decoder) => decoder,
        Err(e) => {
            fail(&shared, StreamKind::Video, &e.to_string());
            finish(&shared, StreamKind::Video);
            return;
        }
    };

    let time_base = f64::from(info.time_base);
    let frame_duration = info
        .frame_rate
        .map(|rate| 1.0 / f64::from(rate))
        .unwrap_or(0.0);
    let mut last_serial = -1;

    loop {
        match next_step(&shared, &shared.vpackets) {
            Step::Wait => thread::sleep(EMPTY_QUEUE_BACKOFF),
            Step::Stop => break,
            Step::Drain => {
                let _ = decoder.send_eof();
                let _ = receive_video(&shared, &mut decoder, time_base, frame_duration, last_serial);
                break;
            }
            Step::Packet(handle) => {
                let Some(guard) = handle.payload() else {
                    continue;
                };
                if guard.serial != shared.vpackets.serial() {
                    continue; // pre-seek leftover, not worth decoding
                }
                if last_serial != -1 && guard.serial != last_serial {
                    decoder.flush();
                }
                last_serial = guard.serial;
                let result = submit_video(
                    &shared,
                    &mut decoder,
                    &guard.packet,
                    time_base,
                    frame_duration,
                    guard.serial,
                );
                if let Err(e) = result {
                    fail(&shared, StreamKind::Video, &e.to_string());
                    break;
                }
            }
        }
    }
    finish(&shared, StreamKind::Video);
}

fn submit_video(
    shared: &MediaShared,
    decoder: &mut ffmpeg::decoder::Video,
    packet: &ffmpeg::Packet,
    time_base: f64,
    frame_duration: f64,
    serial: i32,
) -> Result<(), ffmpeg::Error> {
    loop {
        match decoder.send_packet(packet) {
            Ok(()) => {
                receive_video(shared, decoder, time_base, frame_duration, serial)?;
                return Ok(());
            }
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => {
                // decoder is full: drain, then resend the same packet
                receive_video(shared, decoder, time_base, frame_duration, serial)?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn receive_video(
    shared: &MediaShared,
    decoder: &mut ffmpeg::decoder::Video,
    time_base: f64,
    frame_duration: f64,
    serial: i32,
) -> Result<(), ffmpeg::Error> {
    loop {
        let mut decoded = frame::Video::empty();
        match decoder.receive_frame(&mut decoded) {
            Ok(()) => {
                let pts = decoded
                    .timestamp()
                    .map(|ts| ts as f64 * time_base)
                    .unwrap_or(f64::NAN);
                push_video(
                    shared,
                    VideoPicture::new(decoded, pts, frame_duration, serial),
                );
            }
            Err(ffmpeg::Error::Other { errno: EAGAIN }) | Err(ffmpeg::Error::Eof) => {
                return Ok(())
            }
            Err(e) => return Err(e),
        }
    }
}

fn push_video(shared: &MediaShared, picture: VideoPictureRef) {
    let mut handle = picture;
    loop {
        if shared.flags.shutdown.load(Ordering::Acquire) {
            return;
        }
        let stale = handle
            .payload()
            .map(|p| p.serial != shared.vframes.serial())
            .unwrap_or(true);
        if stale {
            return; // a seek landed while we were decoding
        }
        match shared.vframes.push_tail(handle) {
            Ok(()) => return,
            Err(back) => {
                handle = back;
                thread::sleep(FRAME_QUEUE_FULL_BACKOFF);
            }
        }
    }
}

// ── Audio ─────────────────────────────────────────────────────────────────

pub(crate) fn run_audio(shared: Arc<MediaShared>) {
    let Some(info) = shared.info.audio.clone() else {
        return;
    };
    let mut decoder = match decoder_context(&shared.info.url, info.index)
        .and_then(|ctx| ctx.decoder().audio().map_err(Into::into))
    {
        Ok(decoder) => decoder,
        Err(e) => {
            fail(&shared, StreamKind::Audio, &e.to_string());
            finish(&shared, StreamKind::Audio);
            return;
        }
    };

    let time_base = f64::from(info.time_base);
    let mut last_serial = -1;

    loop {
        match next_step(&shared, &shared.apackets) {
            Step::Wait => thread::sleep(EMPTY_QUEUE_BACKOFF),
            Step::Stop => break,
            Step::Drain => {
                let _ = decoder.send_eof();
                let _ = receive_audio(&shared, &mut decoder, time_base, last_serial);
                break;
            }
            Step::Packet(handle) => {
                let Some(guard) = handle.payload() else {
                    continue;
                };
                if guard.serial != shared.apackets.serial() {
                    continue;
                }
                if last_serial != -1 && guard.serial != last_serial {
                    decoder.flush();
                }
                last_serial = guard.serial;
                let result =
                    submit_audio(&shared, &mut decoder, &guard.packet, time_base, guard.serial);
                if let Err(e) = result {
                    fail(&shared, StreamKind::Audio, &e.to_string());
                    break;
                }
            }
        }
    }
    finish(&shared, StreamKind::Audio);
}

fn submit_audio(
    shared: &MediaShared,
    decoder: &mut ffmpeg::decoder::Audio,
    packet: &ffmpeg::Packet,
    time_base: f64,
    serial: i32,
) -> Result<(), ffmpeg::Error> {
    loop {
        match decoder.send_packet(packet) {
            Ok(()) => {
                receive_audio(shared, decoder, time_base, serial)?;
                return Ok(());
            }
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => {
                receive_audio(shared, decoder, time_base, serial)?;
            }
            Err(e) => return Err(e),
        }
    }
}

fn receive_audio(
    shared: &MediaShared,
    decoder: &mut ffmpeg::decoder::Audio,
    time_base: f64,
    serial: i32,
) -> Result<(), ffmpeg::Error> {
    loop {
        let mut decoded = frame::Audio::empty();
        match decoder.receive_frame(&mut decoded) {
            Ok(()) => {
                let pts = decoded
                    .timestamp()
                    .map(|ts| ts as f64 * time_base)
                    .unwrap_or(f64::NAN);
                push_audio(shared, AudioSamples::new(decoded, pts, serial));
            }
            Err(ffmpeg::Error::Other { errno: EAGAIN }) | Err(ffmpeg::Error::Eof) => {
                return Ok(())
            }
            Err(e) => return Err(e),
        }
    }
}

fn push_audio(shared: &MediaShared, samples: crate::frame::AudioSamplesRef) {
    let mut handle = samples;
    loop {
        if shared.flags.shutdown.load(Ordering::Acquire) {
            return;
        }
        let stale = handle
            .payload()
            .map(|s| s.serial != shared.aframes.serial())
            .unwrap_or(true);
        if stale {
            return;
        }
        match shared.aframes.push_tail(handle) {
            Ok(()) => return,
            Err(back) => {
                handle = back;
                thread::sleep(FRAME_QUEUE_FULL_BACKOFF);
            }
        }
    }
}

// ── Subtitle ──────────────────────────────────────────────────────────────

pub(crate) fn run_subtitle(shared: Arc<MediaShared>) {
    let Some(info) = shared.info.subtitle.clone() else {
        return;
    };
    let mut decoder = match decoder_context(&shared.info.url, info.index)
        .and_then(|ctx| ctx.decoder().subtitle().map_err(Into::into))
    {
        Ok(decoder) => decoder,
        Err(e) => {
            fail(&shared, StreamKind::Subtitle, &e.to_string());
            finish(&shared, StreamKind::Subtitle);
            return;
        }
    };

    let time_base = f64::from(info.time_base);

    loop {
        match next_step(&shared, &shared.spackets) {
            Step::Wait => thread::sleep(EMPTY_QUEUE_BACKOFF),
            Step::Stop | Step::Drain => break,
            Step::Packet(handle) => {
                let Some(guard) = handle.payload() else {
                    continue;
                };
                if guard.serial != shared.spackets.serial() {
                    continue;
                }
                let mut subtitle = codec::subtitle::Subtitle::new();
                match decoder.decode(&guard.packet, &mut subtitle) {
                    Ok(true) => {
                        let pts = subtitle
                            .pts()
                            .map(|p| p as f64 / 1e6)
                            .or_else(|| guard.packet.pts().map(|p| p as f64 * time_base))
                            .unwrap_or(f64::NAN);
                        let lines: Vec<String> = subtitle
                            .rects()
                            .filter_map(|rect| match rect {
                                codec::subtitle::Rect::Text(text) => Some(text.get().to_string()),
                                codec::subtitle::Rect::Ass(ass) => Some(ass.get().to_string()),
                                _ => None,
                            })
                            .collect();
                        push_subtitle(
                            &shared,
                            Shared::new(SubtitleEvent {
                                pts,
                                start: subtitle.start() as f64 / 1000.0,
                                end: subtitle.end() as f64 / 1000.0,
                                lines,
                                serial: guard.serial,
                            }),
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        fail(&shared, StreamKind::Subtitle, &e.to_string());
                        break;
                    }
                }
            }
        }
    }
    finish(&shared, StreamKind::Subtitle);
}

fn push_subtitle(shared: &MediaShared, event: crate::frame::SubtitleEventRef) {
    let mut handle = event;
    loop {
        if shared.flags.shutdown.load(Ordering::Acquire) {
            return;
        }
        let stale = handle
            .payload()
            .map(|s| s.serial != shared.sframes.serial())
            .unwrap_or(true);
        if stale {
            return;
        }
        match shared.sframes.push_tail(handle) {
            Ok(()) => return,
            Err(back) => {
                handle = back;
                thread::sleep(FRAME_QUEUE_FULL_BACKOFF);
            }
        }
    }
}
