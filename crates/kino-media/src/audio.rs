// crates/kino-media/src/audio.rs
//
// Audio presenter. `fill` runs inside the device's pull callback: it pops
// decoded frames, resamples them to the device format when needed, applies
// volume, writes silence on starvation, and re-anchors the audio clock from
// the amount of data still sitting between us and the speaker. It must fill
// the whole buffer synchronously and never block on locks held elsewhere;
// the only waiting is a bounded poll for the next frame.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::resampling;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::format::sample::{Sample, Type};
use ffmpeg::util::frame;

use kino_core::helpers::time;
use kino_core::sync::{wanted_nb_samples, MIX_MAX_VOLUME};
use kino_core::SyncMode;

use crate::frame::AudioSamplesRef;
use crate::media::MediaShared;

/// Smallest silence block emitted on starvation, bytes (rounded to whole
/// device frames).
const MIN_FILL_BYTES: usize = 512;
/// The starvation timeout is the device buffer duration divided by this.
const CALLBACK_TIMEOUT_DIVISOR: f64 = 2.0;

#[derive(Debug, Clone, Copy)]
pub struct AudioParams {
    pub rate: u32,
    pub channels: u16,
    pub layout: ChannelLayout,
    pub format: Sample,
}

impl AudioParams {
    /// Interleaved native-endian S16, the only format the device path
    /// accepts.
    pub fn packed_s16(rate: u32, channels: u16) -> Option<Self> {
        Some(Self {
            rate,
            channels,
            layout: layout_for_channels(channels)?,
            format: Sample::I16(Type::Packed),
        })
    }

    /// Bytes per interleaved sample frame.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * 2
    }

    pub fn bytes_per_sec(&self) -> usize {
        self.rate as usize * self.frame_size()
    }
}

pub(crate) fn layout_for_channels(channels: u16) -> Option<ChannelLayout> {
    match channels {
        1 => Some(ChannelLayout::MONO),
        2 => Some(ChannelLayout::STEREO),
        4 => Some(ChannelLayout::QUAD),
        6 => Some(ChannelLayout::_5POINT1),
        _ => None,
    }
}

enum BufSource {
    Silence,
    /// Device-format frame used in place, no resampling.
    Hold,
    Resampled,
}

pub struct AudioPresenter {
    shared: Arc<MediaShared>,
    dst: AudioParams,

    // current resampler input shape; rebuilt when a frame deviates
    src_format: Sample,
    src_layout: ChannelLayout,
    src_rate: u32,
    swr: Option<resampling::Context>,
    resampled: Option<frame::Audio>,
    resampled_capacity: usize,

    /// Source frame backing the buffer on the no-resample path.
    holding: Option<AudioSamplesRef>,
    source: BufSource,
    buf_size: usize,
    buf_index: usize,
    buf_write_size: usize,

    hw_buffer_bytes: usize,
    clock_pts: f64,
    clock_serial: i32,
    callback_time: f64,
}

impl AudioPresenter {
    pub fn new(shared: Arc<MediaShared>, device: AudioParams, hw_buffer_bytes: usize) -> Self {
        Self {
            shared,
            dst: device,
            src_format: device.format,
            src_layout: device.layout,
            src_rate: device.rate,
            swr: None,
            resampled: None,
            resampled_capacity: 0,
            holding: None,
            source: BufSource::Silence,
            buf_size: 0,
            buf_index: 0,
            buf_write_size: 0,
            hw_buffer_bytes,
            clock_pts: f64::NAN,
            clock_serial: -1,
            callback_time: 0.0,
        }
    }

    /// Fill `out` completely. Invoked by the device callback with the raw
    /// byte view of the period buffer.
    pub fn fill(&mut self, out: &mut [u8]) {
        self.callback_time = time::now();
        self.hw_buffer_bytes = out.len();

        let muted = self.shared.flags.muted.load(Ordering::Acquire);
        let volume = self.shared.flags.volume.load(Ordering::Acquire);

        let mut offset = 0;
        while offset < out.len() {
            if self.buf_index >= self.buf_size {
                match self.decode_frame() {
                    Some(size) => self.buf_size = size,
                    None => {
                        self.holding = None;
                        self.source = BufSource::Silence;
                        let frame_size = self.dst.frame_size();
                        self.buf_size = (MIN_FILL_BYTES / frame_size).max(1) * frame_size;
                    }
                }
                self.buf_index = 0;
            }

            let len = (self.buf_size - self.buf_index).min(out.len() - offset);
            let dst = &mut out[offset..offset + len];
            if muted || volume <= 0 || !self.copy_source(dst, volume) {
                dst.fill(0);
            }
            offset += len;
            self.buf_index += len;
        }
        self.buf_write_size = self.buf_size - self.buf_index;

        if !self.clock_pts.is_nan() {
            // Assume two device periods are pending beyond what we still
            // hold, the usual double-buffered driver.
            let pending =
                (2 * self.hw_buffer_bytes + self.buf_write_size) as f64 / self.dst.bytes_per_sec() as f64;
            let mut clocks = self.shared.clocks.write();
            clocks
                .audio
                .set_at(self.clock_pts - pending, self.clock_serial, self.callback_time);
            let clocks = &mut *clocks;
            clocks.external.sync_to_slave(&clocks.audio);
        }
    }

    /// Copy the current buffer window into `dst`, scaling by `volume`.
    /// False means there was nothing to copy and the caller writes silence.
    fn copy_source(&self, dst: &mut [u8], volume: i32) -> bool {
        let range = self.buf_index..self.buf_index + dst.len();
        match self.source {
            BufSource::Silence => false,
            BufSource::Hold => {
                let Some(handle) = &self.holding else {
                    return false;
                };
                let Some(samples) = handle.payload() else {
                    return false;
                };
                match samples.frame.data(0).get(range) {
                    Some(src) => {
                        mix_s16(dst, src, volume);
                        true
                    }
                    None => false,
                }
            }
            BufSource::Resampled => {
                let Some(resampled) = &self.resampled else {
                    return false;
                };
                match resampled.data(0).get(range) {
                    Some(src) => {
                        mix_s16(dst, src, volume);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Produce the next buffer of device-format bytes. None means silence:
    /// paused, starved past the timeout, pipeline finished, or a resampler
    /// failure.
    fn decode_frame(&mut self) -> Option<usize> {
        if self.shared.flags.paused.load(Ordering::Acquire) {
            return None;
        }
        self.holding = None;

        let timeout = self.hw_buffer_bytes as f64
            / self.dst.bytes_per_sec() as f64
            / CALLBACK_TIMEOUT_DIVISOR;

        // Pop until a frame of the current generation turns up.
        let handle = loop {
            if self.shared.flags.shutdown.load(Ordering::Acquire) {
                return None;
            }
            match self.shared.aframes.pop_head() {
                Some(handle) => {
                    let fresh = handle
                        .payload()
                        .map(|f| f.serial == self.shared.aframes.serial())
                        .unwrap_or(false);
                    if fresh {
                        break handle;
                    }
                }
                None => {
                    let drained = self.shared.flags.grabber_finished.load(Ordering::Acquire)
                        && self.shared.flags.audio_decoder_finished.load(Ordering::Acquire);
                    if drained {
                        return None;
                    }
                    if time::now() - self.callback_time > timeout {
                        return None;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        };

        let size;
        {
            let samples = handle.payload()?;
            let nb = samples.frame.samples();
            let src_rate = samples.frame.rate();
            if src_rate == 0 || nb == 0 {
                return None;
            }
            let src_format = samples.frame.format();
            let mut src_layout = samples.frame.channel_layout();
            if src_layout.is_empty() {
                src_layout = layout_for_channels(samples.frame.channels())?;
            }

            // When audio is slaved to another clock, nudge the output sample
            // count to chase it.
            let wanted = {
                let diff = if self.shared.effective_sync() != SyncMode::Audio {
                    let now = time::now();
                    let clocks = self.shared.clocks.read();
                    let master = match self.shared.effective_sync() {
                        SyncMode::Video => clocks.video.get_at(now),
                        _ => clocks.external.get_at(now),
                    };
                    clocks.audio.get_at(now) - master
                } else {
                    0.0
                };
                wanted_nb_samples(nb, diff, src_rate)
            };

            if src_format != self.src_format
                || src_layout != self.src_layout
                || src_rate != self.src_rate
                || (wanted != nb && self.swr.is_none())
            {
                self.swr = None;
                match resampling::Context::get(
                    src_format,
                    src_layout,
                    src_rate,
                    self.dst.format,
                    self.dst.layout,
                    self.dst.rate,
                ) {
                    Ok(ctx) => self.swr = Some(ctx),
                    Err(e) => {
                        eprintln!(
                            "[audio] cannot build resampler {src_rate} Hz -> {} Hz: {e}",
                            self.dst.rate
                        );
                        return None;
                    }
                }
                self.src_format = src_format;
                self.src_layout = src_layout;
                self.src_rate = src_rate;
            }

            if let Some(swr) = self.swr.as_mut() {
                let out_count = wanted * self.dst.rate as usize / src_rate as usize + 256;
                if wanted != nb {
                    let delta =
                        (wanted as i64 - nb as i64) * self.dst.rate as i64 / src_rate as i64;
                    let distance = wanted as i64 * self.dst.rate as i64 / src_rate as i64;
                    let ret = unsafe {
                        ffmpeg::ffi::swr_set_compensation(
                            swr.as_mut_ptr(),
                            delta as i32,
                            distance as i32,
                        )
                    };
                    if ret < 0 {
                        eprintln!("[audio] sample compensation rejected");
                        return None;
                    }
                }
                if self.resampled.is_none() || self.resampled_capacity < out_count {
                    let mut out =
                        frame::Audio::new(self.dst.format, out_count, self.dst.layout);
                    out.set_rate(self.dst.rate);
                    self.resampled = Some(out);
                    self.resampled_capacity = out_count;
                }
                let out = self.resampled.as_mut()?;
                out.set_samples(out_count);
                if let Err(e) = swr.run(&samples.frame, out) {
                    eprintln!("[audio] resample failed: {e}");
                    return None;
                }
                size = out.samples() * self.dst.frame_size();
                self.source = BufSource::Resampled;
            } else {
                size = nb * self.dst.frame_size();
                self.source = BufSource::Hold;
            }

            self.clock_pts = if samples.pts.is_nan() {
                f64::NAN
            } else {
                samples.pts + samples.duration
            };
            self.clock_serial = samples.serial;
        }

        if matches!(self.source, BufSource::Hold) {
            self.holding = Some(handle);
        }
        Some(size)
    }
}

/// Scale interleaved S16 from `src` into `dst`. Full volume is a plain copy.
fn mix_s16(dst: &mut [u8], src: &[u8], volume: i32) {
    if volume >= MIX_MAX_VOLUME {
        dst.copy_from_slice(src);
        return;
    }
    for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        let sample = i16::from_ne_bytes([s[0], s[1]]) as i32;
        let scaled = (sample * volume / MIX_MAX_VOLUME) as i16;
        d.copy_from_slice(&scaled.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AudioSamples;
    use crate::media::test_support;

    fn device() -> AudioParams {
        AudioParams::packed_s16(48000, 2).unwrap()
    }

    fn s16_frame(samples: usize, fill: i16) -> frame::Audio {
        let mut f = frame::Audio::new(Sample::I16(Type::Packed), samples, ChannelLayout::STEREO);
        f.set_rate(48000);
        for chunk in f.data_mut(0).chunks_exact_mut(2) {
            chunk.copy_from_slice(&fill.to_ne_bytes());
        }
        f
    }

    #[test]
    fn starved_callback_writes_silence() {
        let (shared, _rx) = test_support::fabricated(false, true, SyncMode::Audio);
        // mark the pipeline drained so the starvation path returns at once
        shared.flags.grabber_finished.store(true, Ordering::Release);
        shared
            .flags
            .audio_decoder_finished
            .store(true, Ordering::Release);

        let mut presenter = AudioPresenter::new(shared, device(), 8192);
        let mut out = vec![0xAAu8; 4096];
        presenter.fill(&mut out);
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn full_volume_matching_format_is_byte_exact() {
        let (shared, _rx) = test_support::fabricated(false, true, SyncMode::Audio);
        let frame = s16_frame(1024, 0x1234);
        shared
            .aframes
            .push_tail(AudioSamples::new(frame, 0.0, 0))
            .ok()
            .unwrap();

        let mut presenter = AudioPresenter::new(shared, device(), 8192);
        let mut out = vec![0u8; 1024]; // one quarter of the frame
        presenter.fill(&mut out);
        let expected = 0x1234i16.to_ne_bytes();
        for chunk in out.chunks_exact(2) {
            assert_eq!(chunk, expected);
        }
    }

    #[test]
    fn half_volume_halves_samples() {
        let (shared, _rx) = test_support::fabricated(false, true, SyncMode::Audio);
        shared
            .flags
            .volume
            .store(MIX_MAX_VOLUME / 2, Ordering::Release);
        let frame = s16_frame(1024, 1000);
        shared
            .aframes
            .push_tail(AudioSamples::new(frame, 0.0, 0))
            .ok()
            .unwrap();

        let mut presenter = AudioPresenter::new(shared, device(), 8192);
        let mut out = vec![0u8; 512];
        presenter.fill(&mut out);
        for chunk in out.chunks_exact(2) {
            assert_eq!(i16::from_ne_bytes([chunk[0], chunk[1]]), 500);
        }
    }

    #[test]
    fn muted_output_is_silent_but_consumes_frames() {
        let (shared, _rx) = test_support::fabricated(false, true, SyncMode::Audio);
        shared.flags.muted.store(true, Ordering::Release);
        let frame = s16_frame(256, 0x7FFF);
        shared
            .aframes
            .push_tail(AudioSamples::new(frame, 0.0, 0))
            .ok()
            .unwrap();

        let mut presenter = AudioPresenter::new(Arc::clone(&shared), device(), 8192);
        let mut out = vec![0xFFu8; 256 * 4];
        presenter.fill(&mut out);
        assert!(out.iter().all(|b| *b == 0));
        assert!(shared.aframes.is_empty());
    }

    #[test]
    fn stale_frames_are_skipped() {
        let (shared, _rx) = test_support::fabricated(false, true, SyncMode::Audio);
        let stale = AudioSamples::new(s16_frame(256, 1), 0.0, 0);
        shared.aframes.clear(); // serial -> 1, the frame above is now stale
        shared.aframes.push_tail(stale).ok().unwrap();
        let fresh = AudioSamples::new(s16_frame(256, 2), 0.0, 1);
        shared.aframes.push_tail(fresh).ok().unwrap();

        let mut presenter = AudioPresenter::new(shared, device(), 8192);
        let mut out = vec![0u8; 64];
        presenter.fill(&mut out);
        assert_eq!(i16::from_ne_bytes([out[0], out[1]]), 2);
    }

    #[test]
    fn paused_presenter_emits_silence() {
        let (shared, _rx) = test_support::fabricated(false, true, SyncMode::Audio);
        shared.toggle_pause();
        shared
            .aframes
            .push_tail(AudioSamples::new(s16_frame(256, 99), 0.0, 0))
            .ok()
            .unwrap();

        let mut presenter = AudioPresenter::new(Arc::clone(&shared), device(), 8192);
        let mut out = vec![0x55u8; 512];
        presenter.fill(&mut out);
        assert!(out.iter().all(|b| *b == 0));
        // frame stays queued for when playback resumes
        assert_eq!(shared.aframes.len(), 1);
    }

    #[test]
    fn clock_follows_consumed_audio() {
        let (shared, _rx) = test_support::fabricated(false, true, SyncMode::Audio);
        let frame = s16_frame(4800, 0); // 100 ms at 48 kHz
        shared
            .aframes
            .push_tail(AudioSamples::new(frame, 1.0, 0))
            .ok()
            .unwrap();

        let mut presenter = AudioPresenter::new(Arc::clone(&shared), device(), 4800 * 4);
        let mut out = vec![0u8; 4800 * 4];
        presenter.fill(&mut out);
        let clock = shared.clocks.read().audio.get();
        // end-of-frame pts (1.1 s) minus two device periods pending
        assert!(!clock.is_nan());
        assert!(clock < 1.1);
        assert!(clock > 0.5);
    }
}
