// crates/kino-player/src/app.rs
//
// Windowed event loop. eframe drives the main thread: every update pumps
// input into PlayerCommands, runs one video refresh tick, and schedules the
// next repaint for whenever the following frame is due. The canvas letterboxes
// the current frame into the available rect and hides the cursor after a
// second of inactivity.

use std::sync::atomic::Ordering;
use std::time::Duration;

use eframe::egui;

use kino_core::helpers::geometry::display_rect;
use kino_core::helpers::time;
use kino_core::sync::step_volume;
use kino_core::PlayerCommand;
use kino_media::media::{REFRESH_RATE, SEEK_STEP_SECS};
use kino_media::render::FrameScaler;
use kino_media::{Media, RefreshOutcome, VideoPresenter};

use crate::audio_device::AudioDevice;

/// Cursor disappears after this much pointer inactivity, seconds.
const CURSOR_HIDE_DELAY: f64 = 1.0;

pub fn run(media: Media, audio: Option<AudioDevice>) -> eframe::Result {
    let shared = media.shared();
    let (width, height) = match &shared.info.video {
        Some(video) => {
            let sar = video.sample_aspect_ratio;
            let (num, den) = if sar.numerator() > 0 && sar.denominator() > 0 {
                (sar.numerator() as i64, sar.denominator() as i64)
            } else {
                (1, 1)
            };
            let width = ((video.width as i64 * num + den / 2) / den) & !1;
            (width.max(2) as f32, video.height.max(2) as f32)
        }
        None => (640.0, 480.0),
    };
    let title = format!("kino - {}", shared.info.url);

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(title)
            .with_inner_size([width, height])
            .with_min_inner_size([160.0, 90.0]),
        ..Default::default()
    };

    eframe::run_native(
        "kino",
        native_options,
        Box::new(move |_cc| Ok(Box::new(PlayerApp::new(media, audio)))),
    )
}

struct PlayerApp {
    media: Media,
    /// Dropped before `media` so the callback stops pulling first.
    audio: Option<AudioDevice>,
    presenter: VideoPresenter,
    scaler: FrameScaler,
    texture: Option<egui::TextureHandle>,
    fullscreen: bool,
    cursor_hidden: bool,
    cursor_last_shown: f64,
    canvas_size: egui::Vec2,
}

impl PlayerApp {
    fn new(media: Media, audio: Option<AudioDevice>) -> Self {
        let presenter = VideoPresenter::new(media.shared());
        Self {
            media,
            audio,
            presenter,
            scaler: FrameScaler::new(),
            texture: None,
            fullscreen: false,
            cursor_hidden: false,
            cursor_last_shown: time::now(),
            canvas_size: egui::Vec2::ZERO,
        }
    }

    fn collect_input(&mut self, ctx: &egui::Context, commands: &mut Vec<PlayerCommand>) {
        ctx.input(|input| {
            if input.key_pressed(egui::Key::Space) {
                commands.push(PlayerCommand::TogglePause);
            }
            if input.key_pressed(egui::Key::ArrowLeft) {
                commands.push(PlayerCommand::Seek {
                    by: -SEEK_STEP_SECS,
                    relative: true,
                });
            }
            if input.key_pressed(egui::Key::ArrowRight) {
                commands.push(PlayerCommand::Seek {
                    by: SEEK_STEP_SECS,
                    relative: true,
                });
            }
            if input.key_pressed(egui::Key::Escape) {
                commands.push(PlayerCommand::Quit);
            }
            for event in &input.events {
                if let egui::Event::Text(text) = event {
                    match text.as_str() {
                        "*" => commands.push(PlayerCommand::StepVolume(1)),
                        "/" => commands.push(PlayerCommand::StepVolume(-1)),
                        "m" => commands.push(PlayerCommand::ToggleMute),
                        _ => {}
                    }
                }
            }
            if input
                .pointer
                .button_double_clicked(egui::PointerButton::Primary)
            {
                commands.push(PlayerCommand::ToggleFullscreen);
            }
            if input.pointer.delta() != egui::Vec2::ZERO || input.pointer.any_pressed() {
                self.cursor_last_shown = time::now();
                self.cursor_hidden = false;
            }
        });
    }

    fn dispatch(&mut self, ctx: &egui::Context, command: PlayerCommand) {
        let shared = self.media.shared();
        match command {
            PlayerCommand::TogglePause => {
                self.presenter.toggle_pause();
            }
            PlayerCommand::Seek { by, relative } => {
                self.media.seek(by, relative);
            }
            PlayerCommand::StepVolume(sign) => {
                let volume = shared.flags.volume.load(Ordering::Acquire);
                let next = step_volume(volume, sign);
                shared.flags.volume.store(next, Ordering::Release);
                eprintln!("[player] volume {next}");
            }
            PlayerCommand::ToggleMute => {
                shared.flags.muted.fetch_xor(true, Ordering::AcqRel);
            }
            PlayerCommand::ToggleFullscreen => {
                self.fullscreen = !self.fullscreen;
                ctx.send_viewport_cmd(egui::ViewportCommand::Fullscreen(self.fullscreen));
                shared.flags.force_refresh.store(true, Ordering::Release);
            }
            PlayerCommand::Quit => {
                ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            }
        }
    }

    fn upload_current(&mut self, ctx: &egui::Context) {
        let Some(handle) = self.presenter.current() else {
            return;
        };
        let Some(picture) = handle.payload() else {
            return;
        };
        match self.scaler.rgba(&picture.frame) {
            Ok(image) => {
                let color = egui::ColorImage::from_rgba_unmultiplied(
                    [image.width as usize, image.height as usize],
                    &image.data,
                );
                self.texture =
                    Some(ctx.load_texture("frame", color, egui::TextureOptions::LINEAR));
            }
            Err(e) => eprintln!("[video] frame upload failed: {e}"),
        }
    }
}

impl eframe::App for PlayerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let shared = self.media.shared();

        // keep the notification channel drained; workers already log
        while self.media.events().try_recv().is_ok() {}

        let mut commands = Vec::new();
        self.collect_input(ctx, &mut commands);
        for command in commands {
            self.dispatch(ctx, command);
        }

        if shared.at_end() {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        let mut remaining_time = REFRESH_RATE;
        let force = shared.flags.force_refresh.swap(false, Ordering::AcqRel);
        let paused = shared.flags.paused.load(Ordering::Acquire);
        if !paused || force {
            if self.presenter.refresh(&mut remaining_time) == RefreshOutcome::Updated || force {
                self.upload_current(ctx);
            }
        }

        let now = time::now();
        if !self.cursor_hidden && now - self.cursor_last_shown > CURSOR_HIDE_DELAY {
            self.cursor_hidden = true;
        }
        if self.cursor_hidden {
            ctx.set_cursor_icon(egui::CursorIcon::None);
        }

        egui::CentralPanel::default()
            .frame(egui::Frame::new().fill(egui::Color32::BLACK))
            .show(ctx, |ui| {
                let avail = ui.available_size();
                if avail != self.canvas_size {
                    self.canvas_size = avail;
                    shared.flags.force_refresh.store(true, Ordering::Release);
                }
                let (Some(texture), Some(video)) = (&self.texture, &shared.info.video) else {
                    return;
                };
                let sar = video.sample_aspect_ratio;
                let rect = display_rect(
                    avail.x as i64,
                    avail.y as i64,
                    video.width as i64,
                    video.height as i64,
                    (sar.numerator(), sar.denominator()),
                );
                let origin = ui.max_rect().min;
                let target = egui::Rect::from_min_size(
                    origin + egui::vec2(rect.x as f32, rect.y as f32),
                    egui::vec2(rect.width as f32, rect.height as f32),
                );
                ui.painter().image(
                    texture.id(),
                    target,
                    egui::Rect::from_min_max(egui::Pos2::ZERO, egui::pos2(1.0, 1.0)),
                    egui::Color32::WHITE,
                );
            });

        ctx.request_repaint_after(Duration::from_secs_f64(remaining_time.max(0.0)));
    }
}

impl Drop for PlayerApp {
    fn drop(&mut self) {
        // device first, so no callback touches media state while it stops
        self.audio.take();
        self.media.close();
    }
}
