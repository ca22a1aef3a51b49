//! Kaleido demo: synthetic camera frames through the effect engine onto
//! one to three windows.

use anyhow::Result;
use clap::Parser;
use kaleido::engine::{Engine, EngineConfig, EngineEvents};
use kaleido::render::NUM_EFFECTS;
use kaleido::source::TestPatternSource;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes, WindowId};

/// Multi-display GPU camera-effects engine demo.
#[derive(Parser, Debug)]
#[command(name = "kaleido")]
#[command(about = "Run the effect engine against a synthetic frame source")]
struct Args {
    /// Number of output displays (1-3)
    #[arg(short, long, default_value = "1")]
    displays: usize,

    /// Frame width
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Frame height
    #[arg(long, default_value = "720")]
    height: u32,

    /// Target frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Output path for captured animations
    #[arg(long, default_value = "capture.gif")]
    capture_path: PathBuf,

    /// Optional YAML file overriding the engine geometry
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Forwards engine notifications to the log and flags export readiness for
/// the main loop.
struct DemoEvents {
    encode_ready: Arc<AtomicBool>,
}

impl EngineEvents for DemoEvents {
    fn framerate_update(&self, fps_x10: i32, submit_ms: i32) {
        info!(
            "[Perf] {:.1} fps, last submit {} ms",
            fps_x10 as f32 / 10.0,
            submit_ms
        );
    }

    fn capture_progress(&self, fraction: f32) {
        if fraction >= 0.0 {
            info!("capture progress: {:.0}%", fraction * 100.0);
        }
    }

    fn capture_ready_to_encode(&self) {
        info!("capture buffer full, encoding on next frame");
        self.encode_ready.store(true, Ordering::SeqCst);
    }
}

struct KaleidoApp {
    args: Args,
    engine: Option<Engine>,
    source: TestPatternSource,
    windows: Vec<Arc<Window>>,
    last_frame_time: Instant,
    frame_duration: Duration,
    shutdown: Arc<AtomicBool>,
    encode_ready: Arc<AtomicBool>,
    rotation: i32,
    values: [i32; NUM_EFFECTS],
    toggles: [bool; NUM_EFFECTS],
}

impl KaleidoApp {
    fn new(args: Args, engine: Engine, shutdown: Arc<AtomicBool>, encode_ready: Arc<AtomicBool>) -> Self {
        let frame_duration = Duration::from_secs_f64(1.0 / args.fps as f64);
        let source = TestPatternSource::new(args.width, args.height);
        Self {
            args,
            engine: Some(engine),
            source,
            windows: Vec::new(),
            last_frame_time: Instant::now(),
            frame_duration,
            shutdown,
            encode_ready,
            rotation: 0,
            values: [50; NUM_EFFECTS],
            toggles: [false; NUM_EFFECTS],
        }
    }

    fn slot_of(&self, window_id: WindowId) -> Option<usize> {
        self.windows.iter().position(|w| w.id() == window_id)
    }

    fn process_frame(&mut self) {
        let Some(engine) = &mut self.engine else {
            return;
        };

        engine.on_frame_available(&mut self.source);

        if self.encode_ready.swap(false, Ordering::SeqCst) {
            match engine.encode_and_export() {
                Ok(()) => info!("animation exported to {:?}", self.args.capture_path),
                Err(e) => error!("export failed: {e:#}"),
            }
        }
    }

    fn push_filter_config(&self) {
        if let Some(engine) = &self.engine {
            engine.update_filter_config(self.rotation, &self.values, &self.toggles);
        }
    }

    fn handle_key(&mut self, key: Key) {
        match key.as_ref() {
            Key::Character(c) => match c {
                "1" | "2" | "3" | "4" | "5" | "6" => {
                    let index = c.as_bytes()[0] as usize - b'1' as usize;
                    self.toggles[index] = !self.toggles[index];
                    info!("effect {} {}", index, if self.toggles[index] { "on" } else { "off" });
                    self.push_filter_config();
                }
                "r" => {
                    self.rotation = (self.rotation + 90) % 360;
                    info!("rotation: {} degrees", self.rotation);
                    self.push_filter_config();
                }
                "d" => {
                    if let Some(engine) = &self.engine {
                        let enabled = !engine.is_draw_enabled();
                        engine.set_draw_enabled(enabled);
                        info!("drawing {}", if enabled { "enabled" } else { "disabled" });
                    }
                }
                "c" => {
                    if let Some(engine) = &self.engine {
                        if engine.request_capture(&self.args.capture_path) {
                            info!("capturing frames...");
                        } else {
                            info!("capture busy, request ignored");
                        }
                    }
                }
                _ => {}
            },
            Key::Named(NamedKey::Escape) => {
                self.shutdown.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

impl ApplicationHandler for KaleidoApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if !self.windows.is_empty() {
            return;
        }

        let titles = ["Kaleido", "Kaleido (left)", "Kaleido (right)"];
        for slot in 0..self.args.displays {
            let attrs = WindowAttributes::default()
                .with_title(titles[slot])
                .with_inner_size(PhysicalSize::new(self.args.width, self.args.height));
            match event_loop.create_window(attrs) {
                Ok(window) => {
                    let window = Arc::new(window);
                    self.windows.push(window.clone());
                    if let Some(engine) = &mut self.engine {
                        if let Err(e) = engine.attach_surface(slot, window) {
                            error!("failed to attach surface {slot}: {e}");
                            event_loop.exit();
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("failed to create window {slot}: {e}");
                    event_loop.exit();
                    return;
                }
            }
        }
        info!("created {} window(s)", self.windows.len());
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                info!("window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(slot) = self.slot_of(window_id) {
                    if let Some(engine) = &mut self.engine {
                        engine.resize_surface(slot, size);
                    }
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed && !event.repeat {
                    self.handle_key(event.logical_key);
                }
            }
            WindowEvent::RedrawRequested => {
                if self.slot_of(window_id) == Some(0) {
                    let now = Instant::now();
                    if now.duration_since(self.last_frame_time) >= self.frame_duration {
                        self.process_frame();
                        self.last_frame_time = now;
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.shutdown.load(Ordering::SeqCst) {
            event_loop.exit();
            return;
        }
        if let Some(window) = self.windows.first() {
            window.request_redraw();
        }
    }
}

fn load_engine_config(args: &Args) -> Result<EngineConfig> {
    if let Some(path) = &args.config {
        info!("loading engine config from {:?}", path);
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        return Ok(config);
    }
    Ok(EngineConfig {
        image_width: args.width,
        image_height: args.height,
        ..Default::default()
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    info!("starting Kaleido ({} display(s))...", args.displays);

    let shutdown = Arc::new(AtomicBool::new(false));
    let ctrlc_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("received interrupt signal, shutting down...");
        ctrlc_shutdown.store(true, Ordering::SeqCst);
    })?;

    let config = load_engine_config(&args)?;
    let encode_ready = Arc::new(AtomicBool::new(false));
    let events = Arc::new(DemoEvents {
        encode_ready: encode_ready.clone(),
    });
    let engine = Engine::initialize(args.displays, config, events)?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = KaleidoApp::new(args, engine, shutdown, encode_ready);
    event_loop.run_app(&mut app)?;

    Ok(())
}
