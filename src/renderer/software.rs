//! CPU compositor
//!
//! Draws the scene straight into the display's mapped back buffer:
//! back-to-front, source-over blending, nearest-neighbour scaling of client
//! buffers, and whatever rotation the display leaves to the renderer.

use log::{debug, info, warn};
use std::sync::Arc;

use super::{Color, ElementContent, Renderer, RendererFactory, SceneElement};
use crate::buffer::PixelFormat;
use crate::display::{CurrentDisplay, DisplayBuffer, Orientation, RenderTarget};
use crate::error::RenderError;
use crate::geometry::{Rectangle, Size};

/// Decodes one pixel of `format` (little-endian memory order)
pub fn read_pixel(format: PixelFormat, px: &[u8]) -> Color {
    match format {
        PixelFormat::Argb8888 => Color::rgba(px[2], px[1], px[0], px[3]),
        PixelFormat::Xrgb8888 => Color::rgba(px[2], px[1], px[0], 0xFF),
        PixelFormat::Abgr8888 => Color::rgba(px[0], px[1], px[2], px[3]),
        PixelFormat::Xbgr8888 => Color::rgba(px[0], px[1], px[2], 0xFF),
        PixelFormat::Rgb565 => {
            let value = u16::from_le_bytes([px[0], px[1]]);
            let r = (value >> 11) as u8 & 0x1F;
            let g = (value >> 5) as u8 & 0x3F;
            let b = value as u8 & 0x1F;
            Color::rgba((r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2), 0xFF)
        }
    }
}

pub fn write_pixel(format: PixelFormat, color: Color, px: &mut [u8]) {
    match format {
        PixelFormat::Argb8888 => px[..4].copy_from_slice(&[color.b, color.g, color.r, color.a]),
        PixelFormat::Xrgb8888 => px[..4].copy_from_slice(&[color.b, color.g, color.r, 0xFF]),
        PixelFormat::Abgr8888 => px[..4].copy_from_slice(&[color.r, color.g, color.b, color.a]),
        PixelFormat::Xbgr8888 => px[..4].copy_from_slice(&[color.r, color.g, color.b, 0xFF]),
        PixelFormat::Rgb565 => {
            let value = ((color.r as u16 >> 3) << 11)
                | ((color.g as u16 >> 2) << 5)
                | (color.b as u16 >> 3);
            px[..2].copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Porter-Duff source-over on straight (non-premultiplied) alpha
pub fn blend(src: Color, dst: Color) -> Color {
    match src.a {
        0xFF => return src,
        0 => return dst,
        _ => {}
    }
    let src_a = src.a as u32;
    let inv = 255 - src_a;
    let dst_a = dst.a as u32 * inv / 255;
    let out_a = src_a + dst_a;
    if out_a == 0 {
        return Color::TRANSPARENT;
    }
    let channel = |s: u8, d: u8| ((s as u32 * src_a + d as u32 * dst_a + out_a / 2) / out_a) as u8;
    Color::rgba(
        channel(src.r, dst.r),
        channel(src.g, dst.g),
        channel(src.b, dst.b),
        out_a as u8,
    )
}

/// Back buffer plus the logical → physical mapping for one frame
struct Canvas<'t> {
    pixels: &'t mut [u8],
    size: Size,
    stride: usize,
    bpp: usize,
    format: PixelFormat,
    orientation: Orientation,
    logical: Size,
}

impl<'t> Canvas<'t> {
    fn new(target: &'t mut RenderTarget<'_>, orientation: Orientation, logical: Size) -> Self {
        let size = target.size;
        let stride = target.stride.as_usize();
        let format = target.format;
        Self {
            pixels: target.pixels(),
            size,
            stride,
            bpp: format.bytes_per_pixel() as usize,
            format,
            orientation,
            logical,
        }
    }

    fn physical(&self, x: u32, y: u32) -> (u32, u32) {
        let (w, h) = (self.logical.width, self.logical.height);
        match self.orientation {
            Orientation::Normal => (x, y),
            Orientation::Left => (y, w - 1 - x),
            Orientation::Inverted => (w - 1 - x, h - 1 - y),
            Orientation::Right => (h - 1 - y, x),
        }
    }

    fn clear(&mut self, color: Color) {
        let mut px = [0u8; 4];
        write_pixel(self.format, color, &mut px);
        let row = self.size.width as usize * self.bpp;
        for line in self.pixels.chunks_mut(self.stride).take(self.size.height as usize) {
            let n = row.min(line.len());
            for pixel in line[..n].chunks_exact_mut(self.bpp) {
                pixel.copy_from_slice(&px[..self.bpp]);
            }
        }
    }

    /// Blends `color` over the pixel at logical `(x, y)`
    fn put(&mut self, x: u32, y: u32, color: Color) {
        let (tx, ty) = self.physical(x, y);
        if tx >= self.size.width || ty >= self.size.height {
            return;
        }
        let offset = ty as usize * self.stride + tx as usize * self.bpp;
        let Some(px) = self.pixels.get_mut(offset..offset + self.bpp) else {
            return;
        };
        let out = if color.is_opaque() {
            color
        } else {
            blend(color, read_pixel(self.format, px))
        };
        write_pixel(self.format, out, px);
    }
}

pub struct SoftwareRenderer {
    output: String,
    area: Rectangle,
    background: Color,
    frames: u64,
}

impl SoftwareRenderer {
    pub fn new(output: impl Into<String>, area: Rectangle, background: Color) -> Self {
        Self {
            output: output.into(),
            area,
            background,
            frames: 0,
        }
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }

    fn draw(&self, canvas: &mut Canvas<'_>, element: &dyn SceneElement) {
        let bounds = element.bounds();
        let clip = bounds.intersection(&self.area);
        if clip.is_empty() {
            return;
        }
        let origin = self.area.top_left;

        match element.content() {
            ElementContent::Solid(color) => {
                for y in clip.top()..clip.bottom() {
                    for x in clip.left()..clip.right() {
                        canvas.put((x - origin.x) as u32, (y - origin.y) as u32, color);
                    }
                }
            }
            ElementContent::Buffer(buffer) => {
                let Some(pixels) = buffer.pixels() else {
                    warn!("{}: buffer {:?} has no CPU mapping, skipped", self.output, buffer.id());
                    return;
                };
                let size = buffer.size();
                let stride = buffer.stride().as_usize();
                let format = buffer.format();
                let bpp = format.bytes_per_pixel() as usize;
                for y in clip.top()..clip.bottom() {
                    let sy =
                        (y - bounds.top()) as u64 * size.height as u64 / bounds.size.height as u64;
                    let row = sy as usize * stride;
                    for x in clip.left()..clip.right() {
                        let sx = (x - bounds.left()) as u64 * size.width as u64
                            / bounds.size.width as u64;
                        let offset = row + sx as usize * bpp;
                        let Some(px) = pixels.get(offset..offset + bpp) else {
                            continue;
                        };
                        canvas.put(
                            (x - origin.x) as u32,
                            (y - origin.y) as u32,
                            read_pixel(format, px),
                        );
                    }
                }
            }
        }
    }
}

/// Index of the first element that can be seen: everything below the top-most
/// opaque element covering the whole output is hidden
fn first_visible(scene: &[Arc<dyn SceneElement>], area: &Rectangle) -> usize {
    scene
        .iter()
        .rposition(|element| element.is_opaque() && element.bounds().intersection(area) == *area)
        .unwrap_or(0)
}

impl Renderer for SoftwareRenderer {
    fn render(
        &mut self,
        display: &mut dyn DisplayBuffer,
        scene: &[Arc<dyn SceneElement>],
    ) -> Result<(), RenderError> {
        let area = display.view_area();
        if area != self.area {
            debug!("{}: view area changed to {:?}", self.output, area);
            self.area = area;
        }
        let orientation = display.orientation();

        let mut current = CurrentDisplay::make_current(display)?;
        {
            let mut target = current.render_target()?;
            let mut canvas = Canvas::new(&mut target, orientation, area.size);
            canvas.clear(self.background);
            for element in &scene[first_visible(scene, &area)..] {
                self.draw(&mut canvas, element.as_ref());
            }
        }
        current.post_update()?;

        self.frames += 1;
        Ok(())
    }
}

/// Creates a [`SoftwareRenderer`] per display
#[derive(Debug, Clone)]
pub struct SoftwareRendererFactory {
    background: Color,
}

impl Default for SoftwareRendererFactory {
    fn default() -> Self {
        Self {
            background: Color::BLACK,
        }
    }
}

impl SoftwareRendererFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_background(mut self, background: Color) -> Self {
        self.background = background;
        self
    }
}

impl RendererFactory for SoftwareRendererFactory {
    fn create_renderer_for(&self, display: &dyn DisplayBuffer) -> Box<dyn Renderer> {
        info!("🎨 Software renderer for {} ({:?})", display.name(), display.view_area());
        Box::new(SoftwareRenderer::new(display.name(), display.view_area(), self.background))
    }
}
