// crates/kino-core/src/sync.rs
//
// Master-clock selection and the pacing corrections derived from it. These
// are pure functions over clock readings; the presenters feed them and act
// on the result.

/// No correction below this drift, regardless of frame duration.
pub const SYNC_THRESHOLD_MIN: f64 = 0.04;
/// Corrections always apply above this drift.
pub const SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are never duplicated to catch up.
pub const SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;
/// Past this drift the clocks are considered unrelated and no correction is
/// attempted; `sync_to_slave` adopts the slave outright instead.
pub const NOSYNC_THRESHOLD: f64 = 10.0;
/// Bound on audio sample-count correction, in percent of the frame.
pub const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;

/// Full-scale device volume.
pub const MIX_MAX_VOLUME: i32 = 128;
/// One volume key press, in dB.
pub const VOLUME_STEP_DB: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Audio,
    Video,
    External,
}

impl SyncMode {
    /// The mode actually in effect given which streams exist: video master
    /// without a video stream falls back to audio, audio master without an
    /// audio stream falls back to the external clock.
    pub fn effective(self, has_video: bool, has_audio: bool) -> SyncMode {
        match self {
            SyncMode::Video if has_video => SyncMode::Video,
            SyncMode::Video => SyncMode::Audio,
            SyncMode::Audio if has_audio => SyncMode::Audio,
            SyncMode::Audio => SyncMode::External,
            SyncMode::External => SyncMode::External,
        }
    }
}

/// Adjust the nominal delay before the next video frame by the drift between
/// the video clock and the master clock (`diff = video - master`).
///
/// Behind the master the delay shrinks toward zero; ahead of it the frame is
/// either let run (if it is long anyway) or duplicated. Drift beyond
/// `max_frame_duration`, or a non-finite drift, leaves the delay alone.
pub fn compute_target_delay(
    delay: f64,
    is_video_master: bool,
    diff: f64,
    max_frame_duration: f64,
) -> f64 {
    if is_video_master {
        return delay;
    }
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return delay;
    }
    let sync_threshold = delay.clamp(SYNC_THRESHOLD_MIN, SYNC_THRESHOLD_MAX);
    if diff <= -sync_threshold {
        (delay + diff).max(0.0)
    } else if diff >= sync_threshold && delay > SYNC_FRAMEDUP_THRESHOLD {
        delay + diff
    } else if diff >= sync_threshold {
        2.0 * delay
    } else {
        delay
    }
}

/// Sample count the resampler should produce for an audio frame of
/// `nb_samples`, nudged by the drift between the audio clock and the master
/// (`diff = audio - master`, seconds). Only meaningful when audio is not the
/// master; the caller passes `diff = 0.0` otherwise.
pub fn wanted_nb_samples(nb_samples: usize, diff: f64, src_rate: u32) -> usize {
    if diff.is_nan() || diff.abs() >= NOSYNC_THRESHOLD {
        return nb_samples;
    }
    let wanted = nb_samples as f64 + diff * src_rate as f64;
    let min = nb_samples * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100;
    let max = nb_samples * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100;
    (wanted as i64).clamp(min as i64, max as i64) as usize
}

/// One volume key press: 0.75 dB up or down on a `[0, MIX_MAX_VOLUME]`
/// scale, never getting stuck on a step too small to change the integer.
pub fn step_volume(volume: i32, sign: i32) -> i32 {
    let level = if volume > 0 {
        20.0 * (volume as f64 / MIX_MAX_VOLUME as f64).log10()
    } else {
        -1000.0
    };
    let stepped =
        (MIX_MAX_VOLUME as f64 * 10f64.powf((level + sign as f64 * VOLUME_STEP_DB) / 20.0)).round()
            as i32;
    let next = if stepped == volume { volume + sign } else { stepped };
    next.clamp(0, MIX_MAX_VOLUME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_master_leaves_delay_alone() {
        assert_eq!(compute_target_delay(0.04, true, -5.0, 3600.0), 0.04);
    }

    #[test]
    fn small_drift_is_ignored() {
        assert_eq!(compute_target_delay(0.04, false, 0.0, 3600.0), 0.04);
        assert_eq!(compute_target_delay(0.04, false, 0.02, 3600.0), 0.04);
    }

    #[test]
    fn behind_master_shrinks_delay() {
        let d = compute_target_delay(0.04, false, -0.05, 3600.0);
        assert!((d - 0.0).abs() < 1e-9);
        let d = compute_target_delay(0.08, false, -0.05, 3600.0);
        assert!((d - 0.03).abs() < 1e-9);
    }

    #[test]
    fn ahead_of_master_duplicates_short_frames() {
        let d = compute_target_delay(0.04, false, 0.06, 3600.0);
        assert!((d - 0.08).abs() < 1e-9);
    }

    #[test]
    fn ahead_of_master_lets_long_frames_run() {
        let d = compute_target_delay(0.2, false, 0.15, 3600.0);
        assert!((d - 0.35).abs() < 1e-9);
    }

    #[test]
    fn unrelated_clocks_apply_no_correction() {
        assert_eq!(compute_target_delay(0.04, false, 20.0, 10.0), 0.04);
        assert_eq!(compute_target_delay(0.04, false, f64::NAN, 3600.0), 0.04);
    }

    #[test]
    fn effective_mode_falls_back() {
        assert_eq!(SyncMode::Video.effective(true, true), SyncMode::Video);
        assert_eq!(SyncMode::Video.effective(false, true), SyncMode::Audio);
        assert_eq!(SyncMode::Audio.effective(true, true), SyncMode::Audio);
        assert_eq!(SyncMode::Audio.effective(true, false), SyncMode::External);
        assert_eq!(SyncMode::External.effective(true, true), SyncMode::External);
    }

    #[test]
    fn wanted_samples_tracks_small_drift() {
        assert_eq!(wanted_nb_samples(1024, 0.0, 48000), 1024);
        // 1 ms behind at 48 kHz is 48 samples, inside the 10 % bound
        assert_eq!(wanted_nb_samples(1024, 0.001, 48000), 1072);
    }

    #[test]
    fn wanted_samples_is_clipped_to_ten_percent() {
        assert_eq!(wanted_nb_samples(1000, 1.0, 48000), 1100);
        assert_eq!(wanted_nb_samples(1000, -1.0, 48000), 900);
    }

    #[test]
    fn wanted_samples_ignores_wild_drift() {
        assert_eq!(wanted_nb_samples(1000, 50.0, 48000), 1000);
        assert_eq!(wanted_nb_samples(1000, f64::NAN, 48000), 1000);
    }

    #[test]
    fn volume_steps_move_and_clamp() {
        let up = step_volume(64, 1);
        assert!(up > 64);
        let down = step_volume(up, -1);
        assert!(down <= 64 + 1 && down >= 62);
        assert_eq!(step_volume(MIX_MAX_VOLUME, 1), MIX_MAX_VOLUME);
        assert_eq!(step_volume(0, -1), 0);
    }

    #[test]
    fn volume_recovers_from_zero() {
        assert_eq!(step_volume(0, 1), 1);
    }

    #[test]
    fn volume_never_sticks() {
        // at low values the dB step rounds to the same integer; the +-1
        // fallback must still move
        let mut v = 1;
        for _ in 0..200 {
            v = step_volume(v, 1);
        }
        assert_eq!(v, MIX_MAX_VOLUME);
    }
}
