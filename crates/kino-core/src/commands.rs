// crates/kino-core/src/commands.rs
//
// Every user action during playback is expressed as a PlayerCommand. The
// event loop collects them from input handling and dispatches after the
// frame pass; adding a control = add a variant here + one match arm there.

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerCommand {
    TogglePause,
    /// Seek by `by` seconds relative to the master clock, or to an absolute
    /// position when `relative` is false.
    Seek { by: f64, relative: bool },
    /// One 0.75 dB volume step up (+1) or down (-1).
    StepVolume(i32),
    ToggleMute,
    ToggleFullscreen,
    Quit,
}
