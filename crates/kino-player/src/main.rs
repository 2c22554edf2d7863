// crates/kino-player/src/main.rs

mod app;
mod audio_device;

use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ffmpeg_the_third as ffmpeg;

use kino_core::sync::MIX_MAX_VOLUME;
use kino_core::SyncMode;
use kino_media::{Media, OpenFlags};

use crate::audio_device::AudioDevice;

const EXIT_OPEN_FAILED: i32 = 1;
const EXIT_NO_STREAMS: i32 = 2;
const EXIT_DEVICE_FAILED: i32 = 3;
const EXIT_INTERNAL: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SyncArg {
    Audio,
    Video,
    Ext,
}

impl From<SyncArg> for SyncMode {
    fn from(arg: SyncArg) -> Self {
        match arg {
            SyncArg::Audio => SyncMode::Audio,
            SyncArg::Video => SyncMode::Video,
            SyncArg::Ext => SyncMode::External,
        }
    }
}

#[derive(Parser)]
#[command(name = "kino", version, about = "Media player")]
struct Args {
    /// Ignore any video stream
    #[arg(long)]
    no_video: bool,
    /// Ignore any audio stream
    #[arg(long)]
    no_audio: bool,
    /// Ignore any subtitle stream
    #[arg(long)]
    no_subtitle: bool,
    /// Master clock the presenters chase
    #[arg(long, value_enum, default_value_t = SyncArg::Audio)]
    sync: SyncArg,
    /// Startup volume, 0..100
    #[arg(long, default_value_t = 100)]
    volume: u32,
    /// Start playback at this position, seconds
    #[arg(long)]
    start: Option<f64>,
    /// File path or URL the demuxer can open
    url: String,
}

fn main() {
    let args = Args::parse();
    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    if let Err(e) = ffmpeg::init() {
        eprintln!("[player] ffmpeg init failed: {e}");
        return EXIT_INTERNAL;
    }

    let flags = OpenFlags {
        no_video: args.no_video,
        no_audio: args.no_audio,
        no_subtitle: args.no_subtitle,
    };
    let volume = (args.volume.min(100) * MIX_MAX_VOLUME as u32 / 100) as i32;

    let mut media = match Media::open(&args.url, flags, args.sync.into(), volume) {
        Ok(media) => media,
        Err(e) => {
            eprintln!("[player] {e:#}");
            return EXIT_OPEN_FAILED;
        }
    };
    if !media.has_decodable_stream() {
        eprintln!("[player] no decodable streams in {}", args.url);
        return EXIT_NO_STREAMS;
    }

    let shared = media.shared();
    let audio = if shared.has_audio() {
        match audio_device::open(media.shared()) {
            Ok(device) => Some(device),
            Err(e) => {
                if shared.has_video() {
                    // video can still play; drop audio for this session
                    eprintln!("[player] audio device unavailable, continuing without: {e:#}");
                    media.disable_audio();
                    None
                } else {
                    eprintln!("[player] audio device unavailable: {e:#}");
                    return EXIT_DEVICE_FAILED;
                }
            }
        }
    } else {
        None
    };

    if let Some(start) = args.start {
        media.seek(start, false);
    }
    if let Err(e) = media.start() {
        eprintln!("[player] {e:#}");
        return EXIT_INTERNAL;
    }

    if shared.has_video() {
        match app::run(media, audio) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("[player] window error: {e}");
                EXIT_INTERNAL
            }
        }
    } else {
        headless(media, audio)
    }
}

/// Audio-only playback: no window, the device callback does the work and we
/// wait for the pipeline to drain.
fn headless(mut media: Media, audio: Option<AudioDevice>) -> i32 {
    let shared = media.shared();
    loop {
        while media.events().try_recv().is_ok() {}
        if shared.at_end() {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    // let the device flush what it already pulled, then stop it before the
    // decoders go away
    thread::sleep(Duration::from_millis(200));
    drop(audio);
    media.close();
    0
}
