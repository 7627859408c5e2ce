//! Virtual output backed by heap memory
//!
//! Used when no display hardware is available (CI, nested sessions, the demo
//! binary). It behaves like a real output: a back buffer that is only
//! writable while current, a front buffer that `post_update` flips to, and
//! direct scanout of client buffers that match the mode exactly.

use log::{debug, trace};

use super::{DisplayBuffer, Orientation, RenderTarget};
use crate::buffer::{PixelFormat, PostedBuffer};
use crate::error::{ContextError, RenderError, SubmissionError};
use crate::geometry::{Point, Rectangle, Size, Stride};

pub struct HeadlessDisplayBuffer {
    name: String,
    top_left: Point,
    mode: Size,
    format: PixelFormat,
    requested: Orientation,
    self_rotating: bool,
    bypass: bool,
    back: Vec<u8>,
    front: Vec<u8>,
    current: bool,
    frames_posted: u64,
    frames_bypassed: u64,
    scanout: Option<PostedBuffer>,
}

impl HeadlessDisplayBuffer {
    /// Output whose unrotated mode covers `area`
    pub fn new(name: impl Into<String>, area: Rectangle) -> Self {
        let mut display = Self {
            name: name.into(),
            top_left: area.top_left,
            mode: area.size,
            format: PixelFormat::Argb8888,
            requested: Orientation::Normal,
            self_rotating: false,
            bypass: true,
            back: Vec::new(),
            front: Vec::new(),
            current: false,
            frames_posted: 0,
            frames_bypassed: 0,
            scanout: None,
        };
        display.reallocate();
        display
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self.reallocate();
        self
    }

    /// Rotate in "hardware": the renderer always draws unrotated
    pub fn with_self_rotation(mut self, self_rotating: bool) -> Self {
        self.self_rotating = self_rotating;
        self.reallocate();
        self
    }

    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Size of the scanout memory the renderer draws into
    pub fn scanout_size(&self) -> Size {
        if self.self_rotating {
            self.requested.logical_size(self.mode)
        } else {
            self.mode
        }
    }

    pub fn stride(&self) -> Stride {
        Stride(self.scanout_size().width * self.format.bytes_per_pixel())
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn frames_posted(&self) -> u64 {
        self.frames_posted
    }

    pub fn frames_bypassed(&self) -> u64 {
        self.frames_bypassed
    }

    /// Last frame that reached the screen
    pub fn front_buffer(&self) -> &[u8] {
        &self.front
    }

    /// Client buffer currently scanned out, if the last frame was bypassed
    pub fn scanout_buffer(&self) -> Option<&PostedBuffer> {
        self.scanout.as_ref()
    }

    /// Pixel of the last frame as a little-endian word (32-bit formats only)
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        let size = self.scanout_size();
        if x >= size.width || y >= size.height || self.format.bytes_per_pixel() != 4 {
            return None;
        }
        let offset = y as usize * self.stride().as_usize() + x as usize * 4;
        let bytes = self.front.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn reallocate(&mut self) {
        let len = self.scanout_size().height as usize * self.stride().as_usize();
        if self.back.len() != len {
            self.back = vec![0; len];
            self.front = vec![0; len];
        }
    }
}

impl DisplayBuffer for HeadlessDisplayBuffer {
    fn view_area(&self) -> Rectangle {
        Rectangle::new(self.top_left, self.requested.logical_size(self.mode))
    }

    fn make_current(&mut self) -> Result<(), ContextError> {
        if self.current {
            return Err(ContextError::new(format!("{} is already current", self.name)));
        }
        self.current = true;
        Ok(())
    }

    fn release_current(&mut self) {
        self.current = false;
    }

    fn post_update(&mut self) -> Result<(), SubmissionError> {
        if !self.current {
            return Err(SubmissionError::NotCurrent);
        }
        self.front.copy_from_slice(&self.back);
        self.frames_posted += 1;
        // A composited frame replaces whatever client buffer was on screen
        self.scanout = None;
        trace!("{}: frame {} posted", self.name, self.frames_posted);
        Ok(())
    }

    fn can_bypass(&self) -> bool {
        self.bypass && self.orientation() == Orientation::Normal
    }

    fn post_update_bypass(&mut self, buffer: PostedBuffer) -> Result<(), SubmissionError> {
        if !self.can_bypass() {
            return Err(SubmissionError::bypass_rejected(format!(
                "{} cannot scan out client buffers",
                self.name
            )));
        }
        let size = self.scanout_size();
        if buffer.size() != size || buffer.format() != self.format {
            return Err(SubmissionError::bypass_rejected(format!(
                "{:?} {:?} does not match the {}x{} {:?} mode",
                buffer.size(),
                buffer.format(),
                size.width,
                size.height,
                self.format
            )));
        }

        {
            let pixels = buffer
                .pixels()
                .ok_or_else(|| SubmissionError::bypass_rejected("buffer has no CPU mapping"))?;
            let row = size.width as usize * self.format.bytes_per_pixel() as usize;
            let src_stride = buffer.stride().as_usize();
            let dst_stride = self.stride().as_usize();
            for y in 0..size.height as usize {
                let src = pixels
                    .get(y * src_stride..y * src_stride + row)
                    .ok_or_else(|| {
                        SubmissionError::bypass_rejected("stride leaves rows outside the mapping")
                    })?;
                self.front[y * dst_stride..y * dst_stride + row].copy_from_slice(src);
            }
        }

        debug!("{}: scanning out buffer {:?} directly", self.name, buffer.id());
        self.scanout = Some(buffer);
        self.frames_posted += 1;
        self.frames_bypassed += 1;
        Ok(())
    }

    fn orientation(&self) -> Orientation {
        if self.self_rotating {
            Orientation::Normal
        } else {
            self.requested
        }
    }

    fn orient(&mut self, orientation: Orientation) {
        debug!(
            "{}: orientation {} (self-rotating: {})",
            self.name, orientation, self.self_rotating
        );
        self.requested = orientation;
        self.reallocate();
    }

    fn render_target(&mut self) -> Result<RenderTarget<'_>, RenderError> {
        if !self.current {
            return Err(RenderError::NoRenderTarget);
        }
        let size = self.scanout_size();
        let stride = self.stride();
        let format = self.format;
        Ok(RenderTarget::new(Box::new(self.back.as_mut_slice()), size, stride, format))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
