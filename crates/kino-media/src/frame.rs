// crates/kino-media/src/frame.rs
//
// Decoded output units. Each carries its pts in seconds (NaN when the
// container gave none), an estimated duration, and the serial inherited from
// the packet it was decoded from, so presenters can discard anything decoded
// before the latest seek.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::frame;
use kino_core::Shared;

pub struct VideoPicture {
    pub frame: frame::Video,
    pub pts: f64,
    /// Nominal display time, `1 / frame_rate` when the stream advertises a
    /// rate, 0 otherwise.
    pub duration: f64,
    pub serial: i32,
}

pub type VideoPictureRef = Shared<VideoPicture>;

impl VideoPicture {
    pub fn new(frame: frame::Video, pts: f64, duration: f64, serial: i32) -> VideoPictureRef {
        Shared::new(Self {
            frame,
            pts,
            duration,
            serial,
        })
    }
}

pub struct AudioSamples {
    pub frame: frame::Audio,
    pub pts: f64,
    /// `nb_samples / sample_rate`.
    pub duration: f64,
    pub serial: i32,
}

pub type AudioSamplesRef = Shared<AudioSamples>;

impl AudioSamples {
    pub fn new(frame: frame::Audio, pts: f64, serial: i32) -> AudioSamplesRef {
        let duration = if frame.rate() > 0 {
            frame.samples() as f64 / frame.rate() as f64
        } else {
            0.0
        };
        Shared::new(Self {
            frame,
            pts,
            duration,
            serial,
        })
    }
}

/// Subtitle payload reduced to plain data before it crosses threads.
/// Presentation is left to a future subsystem; the video presenter only
/// needs enough to expire these.
pub struct SubtitleEvent {
    pub pts: f64,
    /// Display window, seconds relative to `pts`.
    pub start: f64,
    pub end: f64,
    pub lines: Vec<String>,
    pub serial: i32,
}

pub type SubtitleEventRef = Shared<SubtitleEvent>;
