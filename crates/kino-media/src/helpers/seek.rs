// crates/kino-media/src/helpers/seek.rs
//
// Seek helper wrapping avformat's windowed seek with consistent soft-fail
// behaviour. A failed seek leaves the demuxer where it was; the queue clears
// are skipped in that case and playback simply continues, so failure is a
// log line rather than an error path.

use ffmpeg_the_third as ffmpeg;

/// [min, max] window around `target_us` handed to the demuxer, microseconds.
///
/// For a relative seek the window is closed on the side we came from, so the
/// demuxer cannot land back where we started: seeking forward by `rel` puts
/// the lower bound just past the old position, seeking backward puts the
/// upper bound just before it. The opposite side stays unbounded; keyframe
/// placement decides where we actually land.
pub fn seek_window(target_us: i64, rel_us: i64) -> (i64, i64) {
    let min = if rel_us > 0 {
        target_us - rel_us + 2
    } else {
        i64::MIN
    };
    let max = if rel_us < 0 {
        target_us - rel_us - 2
    } else {
        i64::MAX
    };
    (min, max)
}

/// Seek `ictx` to `target_us`. Returns false on failure, which the caller
/// treats as "stay where we are".
pub fn seek_input(ictx: &mut ffmpeg::format::context::Input, target_us: i64, rel_us: i64) -> bool {
    let (min, max) = seek_window(target_us, rel_us);
    match ictx.seek(target_us, min..=max) {
        Ok(()) => true,
        Err(e) => {
            eprintln!(
                "[seek] soft-fail at {:.3}s: {e} (continuing from current position)",
                target_us as f64 / 1e6
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_seek_excludes_old_position() {
        let (min, max) = seek_window(12_000_000, 2_000_000);
        assert_eq!(min, 10_000_002);
        assert_eq!(max, i64::MAX);
        assert!(min > 10_000_000);
        assert!((min..=max).contains(&12_000_000));
    }

    #[test]
    fn backward_seek_excludes_old_position() {
        let (min, max) = seek_window(8_000_000, -2_000_000);
        assert_eq!(min, i64::MIN);
        assert_eq!(max, 9_999_998);
        assert!(max < 10_000_000);
        assert!((min..=max).contains(&8_000_000));
    }

    #[test]
    fn absolute_seek_is_unbounded() {
        let (min, max) = seek_window(10_000_000, 0);
        assert_eq!((min, max), (i64::MIN, i64::MAX));
    }
}
