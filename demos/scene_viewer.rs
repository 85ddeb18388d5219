//! glTF scene viewer.
//!
//! Usage: `cargo run --example scene_viewer -- <model.gltf> [environment.hdr]`
//!
//! Keys: 1 shadows, 2 frustum culling, 3 freeze culling, 4 skybox,
//! R reload pipelines (set `ASH_DEFERRED_SHADER_DIR` to pick up edited shaders).

use std::path::PathBuf;
use std::time::Instant;

use ash_deferred::prelude::*;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

const GRID: i32 = 5;
const SPACING: f32 = 4.0;

struct App {
    model: PathBuf,
    environment: Option<PathBuf>,
    window: Option<Window>,
    renderer: Option<Renderer>,
    toggles: RenderToggles,
    start: Instant,
}

impl App {
    fn new(model: PathBuf, environment: Option<PathBuf>) -> Self {
        Self {
            model,
            environment,
            window: None,
            renderer: None,
            toggles: RenderToggles::default(),
            start: Instant::now(),
        }
    }

    fn create_renderer(&self, window: &Window) -> Result<Renderer> {
        let mut renderer = Renderer::new(
            &WindowSurfaceProvider::from_winit(window),
            EngineConfig::default(),
        )?;
        let prefab = renderer.load_prefab(&self.model)?;
        for x in 0..GRID {
            for z in 0..GRID {
                let offset = Vec3::new(
                    (x - GRID / 2) as f32 * SPACING,
                    0.0,
                    (z - GRID / 2) as f32 * SPACING,
                );
                renderer.add_instance(prefab, Mat4::from_translation(offset))?;
            }
        }
        if let Some(environment) = &self.environment {
            renderer.set_environment(environment)?;
        }
        log::info!(
            "Viewing {} as {} instances",
            self.model.display(),
            GRID * GRID
        );
        Ok(renderer)
    }

    fn camera(&self, window: &Window) -> FrameCamera {
        let size = window.inner_size();
        let aspect = size.width.max(1) as f32 / size.height.max(1) as f32;
        let angle = self.start.elapsed().as_secs_f32() * 0.2;
        let radius = GRID as f32 * SPACING;
        let position = Vec3::new(angle.cos() * radius, radius * 0.5, angle.sin() * radius);
        FrameCamera {
            view: Mat4::look_at_rh(position, Vec3::ZERO, Vec3::Y),
            projection: Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 500.0),
            position,
        }
    }

    fn handle_key(&mut self, key: KeyCode) {
        let toggles = &mut self.toggles;
        match key {
            KeyCode::Digit1 => toggles.shadows_enabled = !toggles.shadows_enabled,
            KeyCode::Digit2 => toggles.frustum_cull_enabled = !toggles.frustum_cull_enabled,
            KeyCode::Digit3 => toggles.freeze_cull = !toggles.freeze_cull,
            KeyCode::Digit4 => toggles.skybox_enabled = !toggles.skybox_enabled,
            KeyCode::KeyR => toggles.reload_pipelines = true,
            _ => return,
        }
        log::info!("{toggles:?}");
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attributes = Window::default_attributes()
            .with_title("ash_deferred scene viewer")
            .with_inner_size(winit::dpi::LogicalSize::new(1600, 900));
        let window = match event_loop.create_window(attributes) {
            Ok(window) => window,
            Err(e) => {
                log::error!("Failed to create window: {e}");
                event_loop.exit();
                return;
            }
        };
        match self.create_renderer(&window) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.window = Some(window);
            }
            Err(e) => {
                log::error!("Failed to create renderer: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                if let Some(mut renderer) = self.renderer.take() {
                    renderer.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(renderer) = &mut self.renderer {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        self.handle_key(key);
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                let Some(window) = &self.window else {
                    return;
                };
                let camera = self.camera(window);
                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) = renderer.render_frame(&camera, &mut self.toggles) {
                        log::error!("Render error: {e}");
                    }
                }
                window.request_redraw();
            }
            _ => {}
        }
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args_os().skip(1);
    let Some(model) = args.next().map(PathBuf::from) else {
        eprintln!("usage: scene_viewer <model.gltf> [environment.hdr]");
        std::process::exit(2);
    };
    let environment = args.next().map(PathBuf::from);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    let mut app = App::new(model, environment);
    event_loop.run_app(&mut app)?;
    Ok(())
}
