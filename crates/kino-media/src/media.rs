// crates/kino-media/src/media.rs
//
// Media controller. Owns the packet/frame queues, the three clocks, the
// pipeline flags and the worker threads. Workers get an immutable Arc of
// MediaShared; the only mutable access they have to controller state is the
// clock rwlock and the atomics.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context as _, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use kino_core::helpers::time;
use kino_core::sync::MIX_MAX_VOLUME;
use kino_core::{BoundedQueue, PlaybackClock, PlaybackState, SyncMode};

use crate::decode;
use crate::demux;
use crate::frame::{AudioSamplesRef, SubtitleEventRef, VideoPictureRef};
use crate::packet::PacketRef;
use crate::probe::{self, OpenFlags, SourceInfo};

pub const PACKET_QUEUE_SIZE: usize = 128;
pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub const AUDIO_SAMPLE_QUEUE_SIZE: usize = 64;
pub const SUBTITLE_QUEUE_SIZE: usize = 16;

/// Event-loop tick while nothing is due sooner, seconds.
pub const REFRESH_RATE: f64 = 0.010;
/// Arrow-key seek distance, seconds.
pub const SEEK_STEP_SECS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
            StreamKind::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// Worker -> event loop notifications. Best-effort: a full channel drops the
/// event rather than blocking a worker.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    GrabberFinished,
    DecoderFinished(StreamKind),
    DecoderError { kind: StreamKind, message: String },
}

#[derive(Debug, Clone, Copy)]
pub struct SeekRequest {
    pub target_us: i64,
    pub rel_us: i64,
    pub by_bytes: bool,
}

pub struct PipelineFlags {
    pub paused: AtomicBool,
    pub muted: AtomicBool,
    pub force_refresh: AtomicBool,
    pub shutdown: AtomicBool,
    pub audio_enabled: AtomicBool,
    pub grabber_finished: AtomicBool,
    pub video_decoder_finished: AtomicBool,
    pub audio_decoder_finished: AtomicBool,
    pub subtitle_decoder_finished: AtomicBool,
    pub volume: AtomicI32,
}

pub struct Clocks {
    pub video: PlaybackClock,
    pub audio: PlaybackClock,
    pub external: PlaybackClock,
}

impl Clocks {
    fn new() -> Self {
        Self {
            video: PlaybackClock::new(),
            audio: PlaybackClock::new(),
            external: PlaybackClock::new(),
        }
    }
}

pub struct MediaShared {
    pub info: SourceInfo,
    pub sync_mode: SyncMode,

    pub vpackets: BoundedQueue<PacketRef>,
    pub apackets: BoundedQueue<PacketRef>,
    pub spackets: BoundedQueue<PacketRef>,
    pub vframes: BoundedQueue<VideoPictureRef>,
    pub aframes: BoundedQueue<AudioSamplesRef>,
    pub sframes: BoundedQueue<SubtitleEventRef>,

    pub clocks: RwLock<Clocks>,
    pub flags: PipelineFlags,

    seek: Mutex<Option<SeekRequest>>,
    seek_requested: AtomicBool,
    events: Sender<MediaEvent>,
}

impl MediaShared {
    pub fn new(
        info: SourceInfo,
        sync_mode: SyncMode,
        volume: i32,
    ) -> (Arc<Self>, Receiver<MediaEvent>) {
        let (tx, rx) = bounded(64);
        let audio_present = info.audio.is_some();
        let shared = Arc::new(Self {
            info,
            sync_mode,
            vpackets: BoundedQueue::new(PACKET_QUEUE_SIZE),
            apackets: BoundedQueue::new(PACKET_QUEUE_SIZE),
            spackets: BoundedQueue::new(PACKET_QUEUE_SIZE),
            vframes: BoundedQueue::new(VIDEO_PICTURE_QUEUE_SIZE),
            aframes: BoundedQueue::new(AUDIO_SAMPLE_QUEUE_SIZE),
            sframes: BoundedQueue::new(SUBTITLE_QUEUE_SIZE),
            clocks: RwLock::new(Clocks::new()),
            flags: PipelineFlags {
                paused: AtomicBool::new(false),
                muted: AtomicBool::new(false),
                force_refresh: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                audio_enabled: AtomicBool::new(audio_present),
                grabber_finished: AtomicBool::new(false),
                video_decoder_finished: AtomicBool::new(false),
                audio_decoder_finished: AtomicBool::new(false),
                subtitle_decoder_finished: AtomicBool::new(false),
                volume: AtomicI32::new(volume.clamp(0, MIX_MAX_VOLUME)),
            },
            seek: Mutex::new(None),
            seek_requested: AtomicBool::new(false),
            events: tx,
        });
        (shared, rx)
    }

    pub fn has_video(&self) -> bool {
        self.info.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.info.audio.is_some() && self.flags.audio_enabled.load(Ordering::Acquire)
    }

    pub fn has_subtitle(&self) -> bool {
        self.info.subtitle.is_some()
    }

    /// The sync mode actually in effect, after stream-presence fallbacks.
    pub fn effective_sync(&self) -> SyncMode {
        self.sync_mode.effective(self.has_video(), self.has_audio())
    }

    pub fn master_clock_at(&self, now: f64) -> f64 {
        let clocks = self.clocks.read();
        match self.effective_sync() {
            SyncMode::Video => clocks.video.get_at(now),
            SyncMode::Audio => clocks.audio.get_at(now),
            SyncMode::External => clocks.external.get_at(now),
        }
    }

    pub fn master_clock(&self) -> f64 {
        self.master_clock_at(time::now())
    }

    pub fn request_seek(&self, req: SeekRequest) {
        *self.seek.lock() = Some(req);
        self.seek_requested.store(true, Ordering::Release);
    }

    pub fn seek_pending(&self) -> bool {
        self.seek_requested.load(Ordering::Acquire)
    }

    pub(crate) fn take_seek(&self) -> Option<SeekRequest> {
        if !self.seek_requested.load(Ordering::Acquire) {
            return None;
        }
        self.seek.lock().take()
    }

    pub(crate) fn finish_seek(&self) {
        self.seek_requested.store(false, Ordering::Release);
    }

    pub(crate) fn notify(&self, event: MediaEvent) {
        let _ = self.events.try_send(event);
    }

    /// Flip pause for all three clocks together. Returns the new state.
    pub fn toggle_pause(&self) -> bool {
        let now = time::now();
        let mut clocks = self.clocks.write();
        let was_paused = self.flags.paused.load(Ordering::Acquire);
        if was_paused {
            let pts = clocks.video.get_at(now);
            let serial = clocks.video.serial();
            clocks.video.set_at(pts, serial, now);
        }
        let pts = clocks.external.get_at(now);
        let serial = clocks.external.serial();
        clocks.external.set_at(pts, serial, now);

        let paused = !was_paused;
        self.flags.paused.store(paused, Ordering::Release);
        clocks.video.set_paused(paused);
        clocks.audio.set_paused(paused);
        clocks.external.set_paused(paused);
        paused
    }

    /// True once the grabber and every enabled decoder have exited.
    pub fn pipeline_finished(&self) -> bool {
        let f = &self.flags;
        f.grabber_finished.load(Ordering::Acquire)
            && (!self.has_video() || f.video_decoder_finished.load(Ordering::Acquire))
            && (!self.has_audio() || f.audio_decoder_finished.load(Ordering::Acquire))
            && (!self.has_subtitle() || f.subtitle_decoder_finished.load(Ordering::Acquire))
    }

    /// Finished and nothing left to present.
    pub fn at_end(&self) -> bool {
        self.pipeline_finished() && self.vframes.is_empty() && self.aframes.is_empty()
    }
}

pub struct Media {
    shared: Arc<MediaShared>,
    events: Receiver<MediaEvent>,
    threads: Vec<JoinHandle<()>>,
    state: PlaybackState,
}

impl Media {
    /// Open and probe `url`. Fails only on input-level errors; individual
    /// undecodable streams are disabled and reported.
    pub fn open(url: &str, flags: OpenFlags, sync_mode: SyncMode, volume: i32) -> Result<Self> {
        let info = probe::probe(url, flags)?;
        let (shared, events) = MediaShared::new(info, sync_mode, volume);
        Ok(Self {
            shared,
            events,
            threads: Vec::new(),
            state: PlaybackState::Opened,
        })
    }

    pub fn shared(&self) -> Arc<MediaShared> {
        Arc::clone(&self.shared)
    }

    pub fn events(&self) -> &Receiver<MediaEvent> {
        &self.events
    }

    pub fn has_decodable_stream(&self) -> bool {
        self.shared.has_video() || self.shared.has_audio()
    }

    /// Drop the audio stream for this session (device negotiation failed).
    /// Only meaningful before `start`.
    pub fn disable_audio(&self) {
        self.shared.flags.audio_enabled.store(false, Ordering::Release);
    }

    /// Start the grabber and one decoder per enabled stream.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PlaybackState::Opened {
            return Ok(());
        }
        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| -> Result<JoinHandle<()>> {
            thread::Builder::new()
                .name(name.to_string())
                .spawn(f)
                .with_context(|| format!("spawning {name} thread"))
        };

        let shared = Arc::clone(&self.shared);
        self.threads
            .push(spawn("demux", Box::new(move || demux::run(shared)))?);

        if self.shared.has_video() {
            let shared = Arc::clone(&self.shared);
            self.threads.push(spawn(
                "video-decode",
                Box::new(move || decode::run_video(shared)),
            )?);
        }
        if self.shared.has_audio() {
            let shared = Arc::clone(&self.shared);
            self.threads.push(spawn(
                "audio-decode",
                Box::new(move || decode::run_audio(shared)),
            )?);
        }
        if self.shared.has_subtitle() {
            let shared = Arc::clone(&self.shared);
            self.threads.push(spawn(
                "subtitle-decode",
                Box::new(move || decode::run_subtitle(shared)),
            )?);
        }
        self.state = PlaybackState::Playing;
        Ok(())
    }

    pub fn state(&self) -> PlaybackState {
        match self.state {
            PlaybackState::Playing | PlaybackState::Paused => {
                if self.shared.flags.paused.load(Ordering::Acquire) {
                    PlaybackState::Paused
                } else {
                    PlaybackState::Playing
                }
            }
            other => other,
        }
    }

    /// File a seek request for the demuxer; it invalidates all queues when
    /// it picks the request up. `by` is seconds, relative to the master
    /// clock unless `relative` is false.
    pub fn seek(&self, by: f64, relative: bool) {
        let position = if relative {
            let master = self.shared.master_clock();
            if master.is_nan() {
                0.0
            } else {
                master
            }
        } else {
            0.0
        };
        let target = (position + by).max(0.0);
        let rel = if relative { by } else { 0.0 };
        self.shared.request_seek(SeekRequest {
            target_us: (target * 1e6) as i64,
            rel_us: (rel * 1e6) as i64,
            by_bytes: false,
        });
        eprintln!("[seek] request -> {target:.3}s");
    }

    /// Cancel and join every worker, then drop whatever is still queued.
    pub fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shared.flags.shutdown.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.shared.vpackets.drain();
        self.shared.apackets.drain();
        self.shared.spackets.drain();
        self.shared.vframes.drain();
        self.shared.aframes.drain();
        self.shared.sframes.drain();
        self.state = PlaybackState::Stopped;
    }

    /// Idempotent.
    pub fn close(&mut self) {
        self.state = PlaybackState::Closing;
        self.stop();
    }
}

impl Drop for Media {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use ffmpeg_the_third::Rational;

    /// Shared state over a fabricated source, for presenter tests that never
    /// touch a real input.
    pub fn fabricated(
        video: bool,
        audio: bool,
        sync_mode: SyncMode,
    ) -> (Arc<MediaShared>, Receiver<MediaEvent>) {
        let info = SourceInfo {
            url: String::new(),
            duration: None,
            max_frame_duration: 3600.0,
            video: video.then(|| crate::probe::VideoStreamInfo {
                index: 0,
                time_base: Rational::new(1, 25),
                width: 64,
                height: 48,
                pixel_format: ffmpeg_the_third::util::format::Pixel::YUV420P,
                sample_aspect_ratio: Rational::new(1, 1),
                frame_rate: Some(Rational::new(25, 1)),
            }),
            audio: audio.then(|| crate::probe::AudioStreamInfo {
                index: 1,
                time_base: Rational::new(1, 48000),
                sample_rate: 48000,
                channels: 2,
                channel_layout: ffmpeg_the_third::util::channel_layout::ChannelLayout::STEREO,
            }),
            subtitle: None,
        };
        MediaShared::new(info, sync_mode, MIX_MAX_VOLUME)
    }
}
