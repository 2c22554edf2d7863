// crates/kino-player/src/audio_device.rs
//
// Audio device negotiation and callback host. The device only ever runs
// interleaved native-endian S16; when the preferred (rate, channels) pair is
// not available, channels walk a fallback ladder first, then the sample rate
// drops to the next standard rate and the ladder restarts. The data callback
// hands the presenter a byte view of the period buffer.

use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use kino_media::{AudioParams, AudioPresenter, MediaShared};

/// Channel-count fallback ladder, indexed by the count that just failed.
const NEXT_CHANNELS: [u16; 8] = [0, 0, 1, 6, 2, 6, 4, 6];
/// Standard rates tried below the preferred rate, in this order.
const FALLBACK_RATES: [u32; 4] = [192_000, 96_000, 48_000, 44_100];
/// Never fewer samples per period than this.
const MIN_PERIOD_SAMPLES: u32 = 512;
/// Cap on callback frequency; the period grows to stay under it.
const MAX_CALLBACKS_PER_SEC: u32 = 30;

pub struct AudioDevice {
    // Held for its lifetime: dropping the stream stops the callback.
    _stream: cpal::Stream,
    pub params: AudioParams,
    pub buffer_bytes: usize,
}

/// Every (rate, channels) pair to try, in order. Channels step through the
/// fallback ladder; when the ladder hits zero the rate falls to the next
/// standard rate below and the ladder restarts at the preferred count.
pub fn candidate_configs(wanted_rate: u32, wanted_channels: u16) -> Vec<(u32, u16)> {
    let mut rates: Vec<u32> = FALLBACK_RATES
        .iter()
        .copied()
        .filter(|rate| *rate < wanted_rate)
        .collect();
    let mut out = Vec::new();
    let mut rate = wanted_rate;
    let mut channels = wanted_channels;
    loop {
        out.push((rate, channels));
        let next = NEXT_CHANNELS[channels.min(7) as usize];
        if next != 0 {
            channels = next;
            continue;
        }
        if rates.is_empty() {
            break;
        }
        rate = rates.remove(0);
        channels = wanted_channels;
    }
    out
}

/// Period length in sample frames for `rate`.
pub fn period_samples(rate: u32) -> u32 {
    ((rate / MAX_CALLBACKS_PER_SEC) + 1)
        .next_power_of_two()
        .max(MIN_PERIOD_SAMPLES)
}

/// Open the default output device for the media's audio stream and start
/// pulling through `AudioPresenter::fill`.
pub fn open(shared: Arc<MediaShared>) -> Result<AudioDevice> {
    let info = shared
        .info
        .audio
        .clone()
        .ok_or_else(|| anyhow!("no audio stream"))?;

    let mut wanted_channels = info.channels;
    if let Ok(env) = std::env::var("SDL_AUDIO_CHANNELS") {
        match env.trim().parse::<u16>() {
            Ok(n) if n > 0 => wanted_channels = n,
            _ => eprintln!("[audio] ignoring SDL_AUDIO_CHANNELS={env}"),
        }
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))?;
    let supported: Vec<_> = device
        .supported_output_configs()
        .context("querying output configurations")?
        .collect();

    let (rate, channels) = candidate_configs(info.sample_rate, wanted_channels)
        .into_iter()
        .find(|(rate, channels)| {
            supported.iter().any(|range| {
                range.sample_format() == cpal::SampleFormat::I16
                    && range.channels() == *channels
                    && range.min_sample_rate().0 <= *rate
                    && *rate <= range.max_sample_rate().0
            })
        })
        .ok_or_else(|| anyhow!("device accepts no S16 configuration"))?;

    let params = AudioParams::packed_s16(rate, channels)
        .ok_or_else(|| anyhow!("unsupported channel count {channels}"))?;
    let buffer_bytes = period_samples(rate) as usize * params.frame_size();
    eprintln!("[audio] device open: {rate} Hz, {channels} ch, period {buffer_bytes} bytes");

    let mut presenter = AudioPresenter::new(shared, params, buffer_bytes);
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                // S16 view as bytes; the presenter contract is byte-based
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, data.len() * 2)
                };
                presenter.fill(bytes);
            },
            |e| eprintln!("[audio] stream error: {e}"),
            None,
        )
        .context("building output stream")?;
    stream.play().context("starting output stream")?;

    Ok(AudioDevice {
        _stream: stream,
        params,
        buffer_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_walks_channels_then_rates() {
        let configs = candidate_configs(48_000, 6);
        assert_eq!(
            configs,
            vec![
                (48_000, 6),
                (48_000, 4),
                (48_000, 2),
                (48_000, 1),
                (44_100, 6),
                (44_100, 4),
                (44_100, 2),
                (44_100, 1),
            ]
        );
    }

    #[test]
    fn lowest_standard_rate_has_no_fallback_rates() {
        let configs = candidate_configs(44_100, 2);
        assert_eq!(configs, vec![(44_100, 2), (44_100, 1)]);
    }

    #[test]
    fn high_rates_fall_all_the_way_down() {
        let configs = candidate_configs(192_000, 1);
        let rates: Vec<u32> = configs.iter().map(|(r, _)| *r).collect();
        assert_eq!(rates, vec![192_000, 96_000, 48_000, 44_100]);
    }

    #[test]
    fn odd_channel_counts_join_the_ladder() {
        let configs = candidate_configs(44_100, 8);
        let channels: Vec<u16> = configs.iter().map(|(_, c)| *c).collect();
        // 8 -> ladder entry 7 -> 6 -> 4 -> 2 -> 1 -> exhausted
        assert_eq!(channels, vec![8, 6, 4, 2, 1]);
    }

    #[test]
    fn period_respects_callback_cap() {
        assert_eq!(period_samples(48_000), 2048);
        assert_eq!(period_samples(44_100), 2048);
        assert_eq!(period_samples(8_000), 512);
        assert_eq!(period_samples(192_000), 8192);
    }
}
