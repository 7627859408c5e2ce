//! Output framebuffers
//!
//! A [`DisplayBuffer`] is one physical or virtual output: its place in screen
//! space, a render bracket (`make_current` / `release_current`), frame
//! submission and, where the hardware allows it, direct scanout of a client
//! buffer ("bypass").
//!
//! Every display is owned by exactly one thread at a time. The trait is
//! `Send` but not `Sync`, and the [`OutputCompositor`](crate::compositor::OutputCompositor)
//! moves each display onto its own thread, so two threads can never hold the
//! bracket open on the same output.

pub mod headless;
pub mod kms;
pub mod layout;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::buffer::{PixelFormat, PostedBuffer};
use crate::error::{ContextError, RenderError, SubmissionError};
use crate::geometry::{Rectangle, Size, Stride};

pub use headless::HeadlessDisplayBuffer;
pub use kms::KmsDisplayBuffer;
pub use layout::{DisplayLayout, InputRegion};

/// Rotation applied between the logical scene and the scanout memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Normal,
    /// 90° counter-clockwise
    Left,
    Inverted,
    /// 90° clockwise
    Right,
}

impl Orientation {
    pub fn degrees(&self) -> u32 {
        match self {
            Orientation::Normal => 0,
            Orientation::Left => 90,
            Orientation::Inverted => 180,
            Orientation::Right => 270,
        }
    }

    /// Left and right swap the width and height of the output
    pub fn is_quarter_turn(&self) -> bool {
        matches!(self, Orientation::Left | Orientation::Right)
    }

    /// Logical size seen by the scene for a mode of `physical` size
    pub fn logical_size(&self, physical: Size) -> Size {
        if self.is_quarter_turn() {
            physical.transposed()
        } else {
            physical
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// CPU-writable scanout memory exposed while a display is current
pub struct RenderTarget<'a> {
    pixels: Box<dyn DerefMut<Target = [u8]> + 'a>,
    pub size: Size,
    pub stride: Stride,
    pub format: PixelFormat,
}

impl<'a> RenderTarget<'a> {
    pub fn new(
        pixels: Box<dyn DerefMut<Target = [u8]> + 'a>,
        size: Size,
        stride: Stride,
        format: PixelFormat,
    ) -> Self {
        Self {
            pixels,
            size,
            stride,
            format,
        }
    }

    pub fn pixels(&mut self) -> &mut [u8] {
        &mut **self.pixels
    }
}

impl fmt::Debug for RenderTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTarget")
            .field("size", &self.size)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// One output framebuffer
///
/// States: `Idle → Current → Idle` through the render bracket, and
/// independently `Posted → Released` for every buffer handed to
/// [`post_update_bypass`](DisplayBuffer::post_update_bypass). Driver failures
/// are returned to the caller, never retried here.
pub trait DisplayBuffer: Send {
    /// Screen-space rectangle covered by this output
    fn view_area(&self) -> Rectangle;

    fn make_current(&mut self) -> Result<(), ContextError>;

    fn release_current(&mut self);

    /// Submits the rendered contents. May block until the previous frame's
    /// memory can be reused.
    fn post_update(&mut self) -> Result<(), SubmissionError>;

    /// Whether this output can scan a client buffer out directly
    fn can_bypass(&self) -> bool {
        false
    }

    /// Scans `buffer` out without composition.
    ///
    /// The display keeps `buffer` for as long as it is on screen; dropping
    /// it is the release. Outputs without bypass support accept and drop it.
    fn post_update_bypass(&mut self, buffer: PostedBuffer) -> Result<(), SubmissionError> {
        drop(buffer);
        Ok(())
    }

    /// Rotation the renderer still has to apply
    fn orientation(&self) -> Orientation;

    fn orient(&mut self, orientation: Orientation);

    /// CPU view of the back buffer, only while current
    fn render_target(&mut self) -> Result<RenderTarget<'_>, RenderError> {
        Err(RenderError::NoRenderTarget)
    }

    fn name(&self) -> &str;
}

/// Render bracket held open for the lifetime of the guard
///
/// `make_current` runs on creation and `release_current` on drop, so an early
/// return from a failed frame still leaves the display idle.
pub struct CurrentDisplay<'a> {
    display: &'a mut dyn DisplayBuffer,
}

impl<'a> CurrentDisplay<'a> {
    pub fn make_current(display: &'a mut dyn DisplayBuffer) -> Result<Self, ContextError> {
        display.make_current()?;
        Ok(Self { display })
    }
}

impl<'a> Deref for CurrentDisplay<'a> {
    type Target = dyn DisplayBuffer + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.display
    }
}

impl DerefMut for CurrentDisplay<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.display
    }
}

impl Drop for CurrentDisplay<'_> {
    fn drop(&mut self) {
        self.display.release_current();
    }
}
