//! Scene composition into output framebuffers
//!
//! A [`RendererFactory`] produces one [`Renderer`] per [`DisplayBuffer`]. The
//! renderer keeps whatever per-output state it needs across frames and, for
//! each frame, draws the scene inside the display's render bracket and then
//! posts it.

pub mod software;

use std::sync::Arc;

use crate::buffer::{PixelBuffer, PostedBuffer};
use crate::display::DisplayBuffer;
use crate::error::RenderError;
use crate::geometry::Rectangle;

pub use software::{SoftwareRenderer, SoftwareRendererFactory};

/// Non-premultiplied RGBA colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgba(0, 0, 0, 0xFF);
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// From a `0xAARRGGBB` word
    pub const fn from_argb(argb: u32) -> Self {
        Self::rgba((argb >> 16) as u8, (argb >> 8) as u8, argb as u8, (argb >> 24) as u8)
    }

    pub const fn to_argb(self) -> u32 {
        ((self.a as u32) << 24) | ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }

    pub fn is_opaque(&self) -> bool {
        self.a == 0xFF
    }
}

/// What a scene element draws inside its bounds
#[derive(Debug, Clone)]
pub enum ElementContent {
    Solid(Color),
    /// Client buffer, scaled to the element bounds
    Buffer(PostedBuffer),
}

/// One drawable item of a scene
pub trait SceneElement: Send + Sync {
    /// Screen-space rectangle the element covers
    fn bounds(&self) -> Rectangle;

    fn content(&self) -> ElementContent;

    /// Whether the element hides everything beneath its bounds
    fn is_opaque(&self) -> bool {
        match self.content() {
            ElementContent::Solid(color) => color.is_opaque(),
            ElementContent::Buffer(buffer) => !buffer.format().has_alpha(),
        }
    }
}

/// Elements ordered back to front
pub type Scene = Vec<Arc<dyn SceneElement>>;

#[derive(Debug, Clone)]
pub struct SolidColorElement {
    bounds: Rectangle,
    color: Color,
}

impl SolidColorElement {
    pub fn new(bounds: Rectangle, color: Color) -> Self {
        Self { bounds, color }
    }
}

impl SceneElement for SolidColorElement {
    fn bounds(&self) -> Rectangle {
        self.bounds
    }

    fn content(&self) -> ElementContent {
        ElementContent::Solid(self.color)
    }
}

/// A posted client buffer placed in the scene
///
/// The element holds the post: once the frame is composited and the scene
/// dropped, the buffer is released back to its pool.
#[derive(Debug, Clone)]
pub struct BufferElement {
    bounds: Rectangle,
    buffer: PostedBuffer,
    opaque: bool,
}

impl BufferElement {
    pub fn new(bounds: Rectangle, buffer: PostedBuffer) -> Self {
        let opaque = !buffer.format().has_alpha();
        Self { bounds, buffer, opaque }
    }

    /// Treat an alpha-carrying buffer as opaque (the client promises full alpha)
    pub fn with_opaque(mut self, opaque: bool) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn buffer(&self) -> &Arc<PixelBuffer> {
        self.buffer.buffer()
    }
}

impl SceneElement for BufferElement {
    fn bounds(&self) -> Rectangle {
        self.bounds
    }

    fn content(&self) -> ElementContent {
        ElementContent::Buffer(self.buffer.clone())
    }

    fn is_opaque(&self) -> bool {
        self.opaque
    }
}

/// Per-output compositor of scenes
pub trait Renderer: Send {
    /// Draws `scene` into `display` and posts the result
    fn render(
        &mut self,
        display: &mut dyn DisplayBuffer,
        scene: &[Arc<dyn SceneElement>],
    ) -> Result<(), RenderError>;
}

/// Creates the renderer bound to one display
pub trait RendererFactory: Send + Sync {
    fn create_renderer_for(&self, display: &dyn DisplayBuffer) -> Box<dyn Renderer>;
}
