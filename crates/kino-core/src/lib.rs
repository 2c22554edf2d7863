// crates/kino-core/src/lib.rs

pub mod clock;
pub mod commands;
pub mod handle;
pub mod queue;
pub mod state;
pub mod sync;
pub mod helpers;

pub use clock::PlaybackClock;
pub use commands::PlayerCommand;
pub use handle::Shared;
pub use queue::BoundedQueue;
pub use state::PlaybackState;
pub use sync::SyncMode;
