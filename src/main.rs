//! # axiom-graphics
//!
//! Drives the graphics stack without a display server in front of it: every
//! frame, each output gets a client buffer from its pool, drawn with a moving
//! gradient and posted full-screen. Every other frame a solid cursor square
//! is stacked on top, which forces composition instead of bypass.

use anyhow::Result;
use clap::Parser;
use log::{debug, error, info, warn};
use std::sync::Arc;

use axiom_graphics::buffer::BufferPool;
use axiom_graphics::renderer::software::write_pixel;
use axiom_graphics::renderer::{BufferElement, Color, Scene, SceneElement, SolidColorElement};
use axiom_graphics::{
    FrameOutcome, GraphicsConfig, GraphicsStack, OutputCompositor, PixelBuffer, PlatformKind,
    PostedBuffer, Rectangle,
};

#[derive(Parser, Debug)]
#[command(name = "axiom-graphics")]
#[command(about = "Buffer lifecycle and compositing backend for the Axiom display server")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/axiom/graphics.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Frames to render per output (overrides general.frames)
    #[arg(short, long)]
    frames: Option<u32>,

    /// Buffer platform: shm or gbm (overrides platform.backend)
    #[arg(long)]
    backend: Option<PlatformKind>,
}

/// Fills `buffer` with a diagonal gradient shifted by `frame`
fn draw_gradient(buffer: &PixelBuffer, frame: u32) {
    let Some(mut pixels) = buffer.pixels() else {
        // Device buffers have no CPU mapping; they are posted as allocated
        return;
    };
    let format = buffer.format();
    let bpp = format.bytes_per_pixel() as usize;
    let stride = buffer.stride().as_usize();
    let size = buffer.size();

    for y in 0..size.height {
        let row = &mut pixels[y as usize * stride..];
        for x in 0..size.width {
            let shade = x.wrapping_add(y).wrapping_add(frame.wrapping_mul(4));
            let green = (x * 255 / size.width.max(1)) as u8;
            let blue = (y * 255 / size.height.max(1)) as u8;
            let color = Color::rgba(shade as u8, green, blue, 0xFF);
            let offset = x as usize * bpp;
            write_pixel(format, color, &mut row[offset..offset + bpp]);
        }
    }
}

fn render_frame(
    output: &OutputCompositor,
    pool: &mut BufferPool,
    frame: u32,
) -> Result<FrameOutcome> {
    let area = output.view_area();
    let stride = pool
        .format()
        .packed_stride(area.size.width)
        .ok_or_else(|| {
            anyhow::anyhow!("Output {} is too wide for {:?}", output.name(), pool.format())
        })?;

    let buffer = pool.get_buffer(area.size, stride)?;
    draw_gradient(&buffer, frame);

    let background: Arc<dyn SceneElement> =
        Arc::new(BufferElement::new(area, PostedBuffer::new(buffer)).with_opaque(true));
    let mut scene: Scene = vec![background];
    if frame % 2 == 1 {
        let x = area.left() + (frame as i32 * 8) % area.size.width.max(1) as i32;
        let cursor = Rectangle::from_xywh(x, area.top(), 16, 16);
        let element: Arc<dyn SceneElement> =
            Arc::new(SolidColorElement::new(cursor, Color::rgba(0xFF, 0xFF, 0xFF, 0xC0)));
        scene.push(element);
    }

    Ok(output.composite(scene)?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration; logging settings depend on it
    let loaded = GraphicsConfig::load(&cli.config);
    let debug = cli.debug || loaded.as_ref().is_ok_and(|config| config.general.debug);

    // Initialize logging
    if debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting Axiom graphics backend");
    info!("📄 Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(date) = option_env!("BUILD_DATE") {
        debug!("Built {} from {}", date, option_env!("GIT_COMMIT").unwrap_or("unknown commit"));
    }

    let mut config = match loaded {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            GraphicsConfig::default()
        }
    };

    // Override config with CLI flags
    config.general.debug = debug;
    if let Some(frames) = cli.frames {
        config.general.frames = frames;
    }
    if let Some(backend) = cli.backend {
        info!("🎛️ Buffer platform override: {}", backend.as_str());
        config.platform.backend = backend;
    }

    let stack = match GraphicsStack::from_config(config) {
        Ok(stack) => stack,
        Err(e) => {
            error!("❌ Invalid configuration: {:#}", e);
            return Err(e);
        }
    };

    let outputs = stack.the_outputs()?;
    let mut pools = outputs
        .iter()
        .map(|_| stack.create_buffer_pool())
        .collect::<Result<Vec<_>>>()?;
    let region = stack.the_input_region();
    if let Some(bounds) = region.bounding_rectangle() {
        info!("🖱️ Input confined to {:?}", bounds);
    }

    let frames = stack.config().general.frames;
    info!("🎬 Rendering {} frame(s) on {} output(s)", frames, outputs.len());

    for frame in 0..frames {
        for (output, pool) in outputs.iter().zip(pools.iter_mut()) {
            match render_frame(output, pool, frame) {
                Ok(outcome) => debug!("{} frame {}: {:?}", output.name(), frame, outcome),
                Err(e) => warn!("{} frame {} failed: {:#}", output.name(), frame, e),
            }
        }
    }

    for (output, pool) in outputs.iter().zip(pools.iter()) {
        let stats = output.stats();
        let pool_stats = pool.stats();
        info!(
            "📊 {}: {} composited, {} bypassed, {} bypass rejections, {} failures",
            output.name(),
            stats.frames_composited,
            stats.frames_bypassed,
            stats.bypass_rejections,
            stats.failures
        );
        info!(
            "📊 {} pool: {} allocations, {} replacements, {:.0}% reuse",
            output.name(),
            pool_stats.allocations,
            pool_stats.replacements,
            pool_stats.reuse_rate()
        );
    }

    info!("👋 Axiom graphics backend shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["axiom-graphics"]);
        assert_eq!(cli.config, "~/.config/axiom/graphics.toml");
        assert!(!cli.debug);
        assert_eq!(cli.frames, None);
        assert_eq!(cli.backend, None);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["axiom-graphics", "--backend", "gbm", "--frames", "3", "-d"]);
        assert_eq!(cli.backend, Some(PlatformKind::Gbm));
        assert_eq!(cli.frames, Some(3));
        assert!(cli.debug);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(Cli::try_parse_from(["axiom-graphics", "--backend", "vulkan"]).is_err());
    }
}
