// crates/kino-media/src/probe.rs
//
// Opens an input once to select streams and capture their static metadata.
// Worker threads reopen the input themselves (format contexts never cross
// threads), so everything they need at startup is collected here into plain
// owned data.

use anyhow::{Context as _, Result};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format;
use ffmpeg::media::Type;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::format::Pixel;
use ffmpeg::Rational;

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub no_video: bool,
    pub no_audio: bool,
    pub no_subtitle: bool,
}

#[derive(Debug, Clone)]
pub struct VideoStreamInfo {
    pub index: usize,
    pub time_base: Rational,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Pixel,
    pub sample_aspect_ratio: Rational,
    pub frame_rate: Option<Rational>,
}

#[derive(Debug, Clone)]
pub struct AudioStreamInfo {
    pub index: usize,
    pub time_base: Rational,
    pub sample_rate: u32,
    pub channels: u16,
    pub channel_layout: ChannelLayout,
}

#[derive(Debug, Clone)]
pub struct SubtitleStreamInfo {
    pub index: usize,
    pub time_base: Rational,
}

#[derive(Clone)]
pub struct SourceInfo {
    pub url: String,
    /// Container duration in seconds, when known.
    pub duration: Option<f64>,
    /// Pacing clamp: 10 s for containers with timestamp discontinuities,
    /// 3600 s otherwise.
    pub max_frame_duration: f64,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
    pub subtitle: Option<SubtitleStreamInfo>,
}

/// Open `url`, pick the best stream of each kind not excluded by `flags`,
/// and verify a decoder exists for it. A stream whose decoder cannot be
/// opened is reported and disabled for the session; only input-level
/// failures are errors.
pub fn probe(url: &str, flags: OpenFlags) -> Result<SourceInfo> {
    let ictx = format::input(&url).with_context(|| format!("cannot open input: {url}"))?;

    let discontinuous =
        unsafe { ((*(*ictx.as_ptr()).iformat).flags & ffmpeg::ffi::AVFMT_TS_DISCONT) != 0 };
    let max_frame_duration = if discontinuous { 10.0 } else { 3600.0 };

    let duration = match ictx.duration() {
        d if d > 0 => Some(d as f64 / ffmpeg::ffi::AV_TIME_BASE as f64),
        _ => None,
    };

    let video = if flags.no_video {
        None
    } else {
        ictx.streams().best(Type::Video).and_then(|stream| {
            let index = stream.index();
            let time_base = stream.time_base();
            let frame_rate = match stream.avg_frame_rate() {
                r if r.numerator() > 0 && r.denominator() > 0 => Some(r),
                _ => None,
            };
            match codec::context::Context::from_parameters(stream.parameters())
                .and_then(|ctx| ctx.decoder().video())
            {
                Ok(decoder) => Some(VideoStreamInfo {
                    index,
                    time_base,
                    width: decoder.width(),
                    height: decoder.height(),
                    pixel_format: decoder.format(),
                    sample_aspect_ratio: decoder.aspect_ratio(),
                    frame_rate,
                }),
                Err(e) => {
                    eprintln!("[media] no usable video decoder: {e}");
                    None
                }
            }
        })
    };

    let audio = if flags.no_audio {
        None
    } else {
        ictx.streams().best(Type::Audio).and_then(|stream| {
            let index = stream.index();
            let time_base = stream.time_base();
            match codec::context::Context::from_parameters(stream.parameters())
                .and_then(|ctx| ctx.decoder().audio())
            {
                Ok(decoder) => Some(AudioStreamInfo {
                    index,
                    time_base,
                    sample_rate: decoder.rate(),
                    channels: decoder.channels(),
                    channel_layout: decoder.channel_layout(),
                }),
                Err(e) => {
                    eprintln!("[media] no usable audio decoder: {e}");
                    None
                }
            }
        })
    };

    let subtitle = if flags.no_subtitle {
        None
    } else {
        ictx.streams().best(Type::Subtitle).map(|stream| SubtitleStreamInfo {
            index: stream.index(),
            time_base: stream.time_base(),
        })
    };

    Ok(SourceInfo {
        url: url.to_string(),
        duration,
        max_frame_duration,
        video,
        audio,
        subtitle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_rejects_missing_input() {
        assert!(probe("/nonexistent/kino-probe-test.mkv", OpenFlags::default()).is_err());
    }
}
