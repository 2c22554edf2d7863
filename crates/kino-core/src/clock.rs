// crates/kino-core/src/clock.rs
//
// Logical playback clock. A clock is a pts anchored to a wall-clock instant;
// reading it extrapolates the pts forward at `speed`. The serial pairs a
// reading with the queue generation it came from, so a reading taken before
// a seek can be told apart from one taken after.

use crate::helpers::time;
use crate::sync::NOSYNC_THRESHOLD;

#[derive(Debug, Clone)]
pub struct PlaybackClock {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    serial: i32,
    paused: bool,
}

impl PlaybackClock {
    pub fn new() -> Self {
        let mut clock = Self {
            pts: f64::NAN,
            pts_drift: 0.0,
            last_updated: 0.0,
            speed: 1.0,
            serial: -1,
            paused: false,
        };
        clock.set(f64::NAN, -1);
        clock
    }

    /// Read the clock at an explicit wall time. While paused the frozen pts
    /// is returned unchanged.
    pub fn get_at(&self, now: f64) -> f64 {
        if self.paused {
            self.pts
        } else {
            self.pts_drift + now - (now - self.last_updated) * (1.0 - self.speed)
        }
    }

    pub fn get(&self) -> f64 {
        self.get_at(time::now())
    }

    /// Adopt a new reading anchored at `at`.
    pub fn set_at(&mut self, pts: f64, serial: i32, at: f64) {
        self.pts = pts;
        self.last_updated = at;
        self.pts_drift = pts - at;
        self.serial = serial;
    }

    pub fn set(&mut self, pts: f64, serial: i32) {
        self.set_at(pts, serial, time::now());
    }

    /// Freeze the current reading, then change the rate of advance.
    pub fn set_speed(&mut self, speed: f64) {
        let value = self.get();
        let serial = self.serial;
        self.set(value, serial);
        self.speed = speed;
    }

    /// Adopt the slave's reading when this clock is unset or has drifted
    /// past the no-sync threshold. Otherwise a no-op.
    pub fn sync_to_slave(&mut self, slave: &PlaybackClock) {
        let clock = self.get();
        let slave_clock = slave.get();
        if !slave_clock.is_nan()
            && (clock.is_nan() || (clock - slave_clock).abs() > NOSYNC_THRESHOLD)
        {
            self.set(slave_clock, slave.serial);
        }
    }

    pub fn serial(&self) -> i32 {
        self.serial
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn last_updated(&self) -> f64 {
        self.last_updated
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}
