// crates/kino-media/src/video.rs
//
// Video presenter. Runs on the main thread: peeks the head of the picture
// queue, paces it against the master clock (shrinking, stretching or
// duplicating the nominal frame delay), and adopts the frame once its time
// has come. Pre-seek frames are recognized by serial and dropped on sight.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use kino_core::helpers::time;
use kino_core::sync::{compute_target_delay, SYNC_THRESHOLD_MAX};
use kino_core::SyncMode;

use crate::frame::VideoPictureRef;
use crate::media::MediaShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new frame was adopted; the canvas must re-upload.
    Updated,
    /// Keep showing whatever was shown last.
    Unchanged,
}

struct LastShown {
    handle: VideoPictureRef,
    pts: f64,
    duration: f64,
    serial: i32,
}

pub struct VideoPresenter {
    shared: Arc<MediaShared>,
    last: Option<LastShown>,
    frame_timer: f64,
}

impl VideoPresenter {
    pub fn new(shared: Arc<MediaShared>) -> Self {
        Self {
            shared,
            last: None,
            frame_timer: 0.0,
        }
    }

    /// The frame currently on screen.
    pub fn current(&self) -> Option<&VideoPictureRef> {
        self.last.as_ref().map(|l| &l.handle)
    }

    pub fn current_pts(&self) -> Option<f64> {
        self.last.as_ref().map(|l| l.pts)
    }

    /// Flip pause. On resume the frame timer moves forward by however long
    /// we sat paused, so the next frame is not treated as hopelessly late.
    pub fn toggle_pause(&mut self) {
        let now = time::now();
        if self.shared.flags.paused.load(Ordering::Acquire) {
            let last_updated = self.shared.clocks.read().video.last_updated();
            self.frame_timer += now - last_updated;
        }
        self.shared.toggle_pause();
    }

    /// One refresh tick. Lowers `remaining_time` to the wait until the next
    /// frame is due, when that is sooner than the caller's own tick.
    pub fn refresh(&mut self, remaining_time: &mut f64) -> RefreshOutcome {
        self.refresh_at(time::now(), remaining_time)
    }

    fn refresh_at(&mut self, now: f64, remaining_time: &mut f64) -> RefreshOutcome {
        if self.shared.flags.paused.load(Ordering::Acquire) {
            return RefreshOutcome::Unchanged;
        }

        loop {
            let queue_serial = self.shared.vframes.serial();
            let Some((serial, pts)) = self
                .shared
                .vframes
                .peek(0, |h| h.payload().map(|p| (p.serial, p.pts)))
                .flatten()
            else {
                self.expire_subtitles();
                return RefreshOutcome::Unchanged;
            };

            if serial != queue_serial {
                // decoded before the latest seek
                self.shared.vframes.pop_head();
                continue;
            }

            if let Some(last) = &self.last {
                if last.serial != serial {
                    // generation boundary: restart pacing from here
                    self.frame_timer = now;
                }
            }

            let last_duration = match &self.last {
                Some(last) if last.serial == serial => {
                    let d = pts - last.pts;
                    if !d.is_finite() || d <= 0.0 || d > self.shared.info.max_frame_duration {
                        last.duration
                    } else {
                        d
                    }
                }
                _ => 0.0,
            };

            let is_video_master = self.shared.effective_sync() == SyncMode::Video;
            let diff = if is_video_master {
                0.0
            } else {
                let clocks = self.shared.clocks.read();
                let master = match self.shared.effective_sync() {
                    SyncMode::Audio => clocks.audio.get_at(now),
                    _ => clocks.external.get_at(now),
                };
                clocks.video.get_at(now) - master
            };
            let delay = compute_target_delay(
                last_duration,
                is_video_master,
                diff,
                self.shared.info.max_frame_duration,
            );

            if now < self.frame_timer + delay {
                *remaining_time = (self.frame_timer + delay - now).min(*remaining_time);
                return RefreshOutcome::Unchanged;
            }

            self.frame_timer += delay;
            if delay > 0.0 && now - self.frame_timer > SYNC_THRESHOLD_MAX {
                // fell too far behind the schedule: re-anchor
                self.frame_timer = now;
            }

            if !pts.is_nan() {
                let mut clocks = self.shared.clocks.write();
                clocks.video.set_at(pts, serial, now);
                let clocks = &mut *clocks;
                clocks.external.sync_to_slave(&clocks.video);
            }

            if let Some(handle) = self.shared.vframes.pop_head() {
                // re-read from the popped frame: a seek may have swapped the
                // head between the peek and this pop
                let meta = handle.payload().map(|p| (p.pts, p.duration, p.serial));
                if let Some((pts, duration, serial)) = meta {
                    // the previous frame is released here
                    self.last = Some(LastShown {
                        handle,
                        pts,
                        duration,
                        serial,
                    });
                }
            }
            self.expire_subtitles();
            return RefreshOutcome::Updated;
        }
    }

    /// Subtitle presentation is a future subsystem; until then, drop events
    /// that are from an old generation or already past their display window
    /// so the queue cannot wedge its decoder.
    fn expire_subtitles(&self) {
        let serial = self.shared.sframes.serial();
        let position = self.last.as_ref().map(|l| l.pts);
        loop {
            let expired = self
                .shared
                .sframes
                .peek(0, |h| {
                    h.payload()
                        .map(|s| {
                            s.serial != serial
                                || position
                                    .map(|p| !s.pts.is_nan() && s.pts + s.end < p)
                                    .unwrap_or(false)
                        })
                        .unwrap_or(true)
                })
                .unwrap_or(false);
            if !expired {
                return;
            }
            self.shared.sframes.pop_head();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{SubtitleEvent, VideoPicture};
    use crate::media::test_support;
    use ffmpeg_the_third::util::frame;
    use kino_core::Shared;

    fn picture(pts: f64, serial: i32) -> crate::frame::VideoPictureRef {
        VideoPicture::new(frame::Video::empty(), pts, 0.04, serial)
    }

    fn presenter() -> (VideoPresenter, Arc<MediaShared>) {
        let (shared, _rx) = test_support::fabricated(true, false, SyncMode::Audio);
        std::mem::forget(_rx); // keep the event channel open for the test
        (VideoPresenter::new(Arc::clone(&shared)), shared)
    }

    #[test]
    fn empty_queue_keeps_previous_frame() {
        let (mut p, _shared) = presenter();
        let mut remaining = 0.01;
        assert_eq!(p.refresh_at(100.0, &mut remaining), RefreshOutcome::Unchanged);
        assert!(p.current().is_none());
    }

    #[test]
    fn first_frame_is_adopted_immediately() {
        let (mut p, shared) = presenter();
        shared.vframes.push_tail(picture(0.0, 0)).ok().unwrap();
        let mut remaining = 0.01;
        assert_eq!(p.refresh_at(100.0, &mut remaining), RefreshOutcome::Updated);
        assert_eq!(p.current_pts(), Some(0.0));
    }

    #[test]
    fn stale_frames_are_dropped_before_presentation() {
        let (mut p, shared) = presenter();
        shared.vframes.clear(); // serial -> 1
        // decoded before the seek, pushed after the clear by a laggy decoder
        shared.vframes.push_tail(picture(0.0, 0)).ok().unwrap();
        shared.vframes.push_tail(picture(0.8, 1)).ok().unwrap();

        let mut remaining = 0.01;
        assert_eq!(p.refresh_at(100.0, &mut remaining), RefreshOutcome::Updated);
        assert_eq!(p.current_pts(), Some(0.8));
        assert!(shared.vframes.is_empty());
    }

    #[test]
    fn next_frame_waits_for_its_delay() {
        let (mut p, shared) = presenter();
        shared.vframes.push_tail(picture(0.0, 0)).ok().unwrap();
        shared.vframes.push_tail(picture(0.04, 0)).ok().unwrap();
        shared.vframes.push_tail(picture(0.08, 0)).ok().unwrap();

        let mut remaining = 0.01;
        // adopt the first, re-anchor on the second (timer far behind)
        assert_eq!(p.refresh_at(100.00, &mut remaining), RefreshOutcome::Updated);
        assert_eq!(p.refresh_at(100.01, &mut remaining), RefreshOutcome::Updated);

        // the third is 40 ms after the second: not due yet
        let mut remaining = 0.10;
        assert_eq!(p.refresh_at(100.02, &mut remaining), RefreshOutcome::Unchanged);
        assert!(remaining < 0.05);
        assert_eq!(p.current_pts(), Some(0.04));

        // once its delay elapses it shows
        let mut remaining = 0.10;
        assert_eq!(p.refresh_at(100.06, &mut remaining), RefreshOutcome::Updated);
        assert_eq!(p.current_pts(), Some(0.08));
    }

    #[test]
    fn refresh_updates_video_clock() {
        let (mut p, shared) = presenter();
        shared.vframes.push_tail(picture(1.5, 0)).ok().unwrap();
        let mut remaining = 0.01;
        p.refresh_at(100.0, &mut remaining);
        let clocks = shared.clocks.read();
        assert!((clocks.video.get_at(100.0) - 1.5).abs() < 1e-9);
        // external clock slaved to video
        assert!((clocks.external.get_at(100.0) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn paused_refresh_changes_nothing() {
        let (mut p, shared) = presenter();
        shared.vframes.push_tail(picture(0.0, 0)).ok().unwrap();
        shared.toggle_pause();
        let mut remaining = 0.01;
        assert_eq!(p.refresh_at(100.0, &mut remaining), RefreshOutcome::Unchanged);
        assert_eq!(shared.vframes.len(), 1);
    }

    #[test]
    fn pause_pair_preserves_clock_reading() {
        let (mut p, shared) = presenter();
        shared.vframes.push_tail(picture(2.0, 0)).ok().unwrap();
        let mut remaining = 0.01;
        p.refresh_at(100.0, &mut remaining);

        p.toggle_pause();
        let frozen = shared.clocks.read().video.get();
        p.toggle_pause();
        let resumed = shared.clocks.read().video.get();
        assert!((resumed - frozen).abs() < 0.05);
    }

    #[test]
    fn expired_subtitles_are_discarded() {
        let (mut p, shared) = presenter();
        shared
            .sframes
            .push_tail(Shared::new(SubtitleEvent {
                pts: 0.0,
                start: 0.0,
                end: 1.0,
                lines: vec!["old".into()],
                serial: 0,
            }))
            .ok()
            .unwrap();
        shared.vframes.push_tail(picture(5.0, 0)).ok().unwrap();
        let mut remaining = 0.01;
        p.refresh_at(100.0, &mut remaining);
        assert!(shared.sframes.is_empty());
    }

    #[test]
    fn stale_subtitles_are_discarded() {
        let (p, shared) = presenter();
        shared.sframes.clear(); // serial -> 1
        shared
            .sframes
            .push_tail(Shared::new(SubtitleEvent {
                pts: 99.0,
                start: 0.0,
                end: 10.0,
                lines: vec!["stale".into()],
                serial: 0,
            }))
            .ok()
            .unwrap();
        p.expire_subtitles();
        assert!(shared.sframes.is_empty());
    }
}
