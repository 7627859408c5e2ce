//! Kernel mode-setting output
//!
//! Drives the first connected connector of a DRM card with two dumb buffers.
//! The renderer draws into the back buffer through a CPU mapping;
//! `post_update` page-flips to it. Flips complete asynchronously, so before
//! touching the scanout again we block on the previous flip's event.
//!
//! Page-flip events are read from the card fd, so one card drives one
//! `KmsDisplayBuffer`.

use drm::buffer::{Buffer as _, DrmFourcc};
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{
    connector, crtc, framebuffer, Device as ControlDevice, Event, Mode, PageFlipFlags,
};
use log::{debug, info, warn};
use std::io;
use std::path::Path;

use super::{DisplayBuffer, Orientation, RenderTarget};
use crate::buffer::{PixelFormat, PostedBuffer};
use crate::error::{ContextError, RenderError, SubmissionError};
use crate::geometry::{Point, Rectangle, Size, Stride};
use crate::platform::card::Card;
use crate::platform::gbm::GbmStorage;

const SCANOUT_FORMAT: PixelFormat = PixelFormat::Xrgb8888;

/// (depth, bits per pixel) for legacy `add_framebuffer`
fn framebuffer_depth(format: PixelFormat) -> Option<(u32, u32)> {
    match format {
        PixelFormat::Xrgb8888 => Some((24, 32)),
        PixelFormat::Argb8888 => Some((32, 32)),
        _ => None,
    }
}

struct ScanoutBuffer {
    dumb: DumbBuffer,
    framebuffer: framebuffer::Handle,
}

/// A client buffer registered with the display controller
struct BypassFrame {
    card: Card,
    framebuffer: framebuffer::Handle,
    _buffer: PostedBuffer,
}

impl Drop for BypassFrame {
    fn drop(&mut self) {
        if let Err(err) = self.card.destroy_framebuffer(self.framebuffer) {
            warn!("Failed to remove bypass framebuffer: {}", err);
        }
    }
}

pub struct KmsDisplayBuffer {
    name: String,
    card: Card,
    crtc: crtc::Handle,
    connector: connector::Handle,
    mode: Mode,
    top_left: Point,
    orientation: Orientation,
    bypass: bool,
    buffers: Vec<ScanoutBuffer>,
    back: usize,
    current: bool,
    mode_set: bool,
    flip_pending: bool,
    on_screen: Option<BypassFrame>,
    queued: Option<BypassFrame>,
}

impl KmsDisplayBuffer {
    pub fn open(path: &Path, top_left: Point) -> io::Result<Self> {
        Self::new(Card::open(path)?, top_left)
    }

    /// Picks the first connected connector, its preferred mode and a CRTC
    pub fn new(card: Card, top_left: Point) -> io::Result<Self> {
        let resources = card.resource_handles()?;
        let info = resources
            .connectors()
            .iter()
            .filter_map(|&handle| card.get_connector(handle, false).ok())
            .find(|info| info.state() == connector::State::Connected && !info.modes().is_empty())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no connected display"))?;

        let mode = info.modes()[0];
        let crtc = info
            .current_encoder()
            .and_then(|encoder| card.get_encoder(encoder).ok())
            .and_then(|encoder| encoder.crtc())
            .or_else(|| resources.crtcs().first().copied())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no CRTC available"))?;

        let (width, height) = mode.size();
        let mut buffers = Vec::with_capacity(2);
        for _ in 0..2 {
            let dumb =
                card.create_dumb_buffer((width as u32, height as u32), DrmFourcc::Xrgb8888, 32)?;
            let framebuffer = card.add_framebuffer(&dumb, 24, 32)?;
            buffers.push(ScanoutBuffer { dumb, framebuffer });
        }

        let name = format!("{:?}-{}", info.interface(), info.interface_id());
        info!("🖥️ KMS output {} ready: {}x{}@{}Hz", name, width, height, mode.vrefresh());

        Ok(Self {
            name,
            card,
            crtc,
            connector: info.handle(),
            mode,
            top_left,
            orientation: Orientation::Normal,
            bypass: true,
            buffers,
            back: 0,
            current: false,
            mode_set: false,
            flip_pending: false,
            on_screen: None,
            queued: None,
        })
    }

    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    fn mode_size(&self) -> Size {
        let (width, height) = self.mode.size();
        Size::new(width as u32, height as u32)
    }

    /// Blocks until the outstanding page flip (if any) has completed
    fn wait_for_flip(&mut self) -> Result<(), SubmissionError> {
        if !self.flip_pending {
            return Ok(());
        }
        while self.flip_pending {
            let events = self.card.receive_events().map_err(SubmissionError::Driver)?;
            for event in events {
                if let Event::PageFlip(flip) = event {
                    if flip.crtc == self.crtc {
                        self.flip_pending = false;
                    }
                }
            }
        }
        // The queued frame is now on screen; the one it replaced is released
        self.on_screen = self.queued.take();
        Ok(())
    }

    fn present(
        &mut self,
        framebuffer: framebuffer::Handle,
        frame: Option<BypassFrame>,
    ) -> Result<(), SubmissionError> {
        self.wait_for_flip()?;
        if self.mode_set {
            self.card
                .page_flip(self.crtc, framebuffer, PageFlipFlags::EVENT, None)
                .map_err(SubmissionError::Driver)?;
            self.flip_pending = true;
            self.queued = frame;
        } else {
            self.card
                .set_crtc(self.crtc, Some(framebuffer), (0, 0), &[self.connector], Some(self.mode))
                .map_err(SubmissionError::Driver)?;
            self.mode_set = true;
            self.on_screen = frame;
        }
        Ok(())
    }
}

impl DisplayBuffer for KmsDisplayBuffer {
    fn view_area(&self) -> Rectangle {
        Rectangle::new(self.top_left, self.orientation.logical_size(self.mode_size()))
    }

    fn make_current(&mut self) -> Result<(), ContextError> {
        if self.current {
            return Err(ContextError::new(format!("{} is already current", self.name)));
        }
        // The back buffer may still be the one being scanned out
        self.wait_for_flip().map_err(|err| {
            ContextError::with_source(format!("{} lost the previous page flip", self.name), err)
        })?;
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
        let framebuffer = self.buffers[self.back].framebuffer;
        self.present(framebuffer, None)?;
        self.back = (self.back + 1) % self.buffers.len();
        Ok(())
    }

    fn can_bypass(&self) -> bool {
        self.bypass && self.orientation == Orientation::Normal
    }

    fn post_update_bypass(&mut self, buffer: PostedBuffer) -> Result<(), SubmissionError> {
        if !self.can_bypass() {
            return Err(SubmissionError::bypass_rejected(format!(
                "{} cannot scan out client buffers",
                self.name
            )));
        }
        if buffer.size() != self.mode_size() {
            return Err(SubmissionError::bypass_rejected(format!(
                "{:?} does not match the output mode",
                buffer.size()
            )));
        }
        let (depth, bpp) = framebuffer_depth(buffer.format()).ok_or_else(|| {
            SubmissionError::bypass_rejected(format!("{:?} cannot be scanned out", buffer.format()))
        })?;
        let storage = buffer
            .storage()
            .as_any()
            .downcast_ref::<GbmStorage>()
            .ok_or_else(|| {
                SubmissionError::bypass_rejected("only device buffers can be scanned out")
            })?;

        let framebuffer = storage
            .with_buffer_object(|bo| self.card.add_framebuffer(bo, depth, bpp))
            .map_err(SubmissionError::Driver)?;
        debug!("{}: flipping to client buffer {:?}", self.name, buffer.id());

        let frame = BypassFrame {
            card: self.card.clone(),
            framebuffer,
            _buffer: buffer,
        };
        self.present(framebuffer, Some(frame))
    }

    fn orientation(&self) -> Orientation {
        self.orientation
    }

    fn orient(&mut self, orientation: Orientation) {
        self.orientation = orientation;
    }

    fn render_target(&mut self) -> Result<RenderTarget<'_>, RenderError> {
        if !self.current {
            return Err(RenderError::NoRenderTarget);
        }
        let size = self.mode_size();
        let card = &self.card;
        let scanout = &mut self.buffers[self.back];
        let stride = Stride(scanout.dumb.pitch());
        let mapping = card.map_dumb_buffer(&mut scanout.dumb).map_err(RenderError::MapTarget)?;
        Ok(RenderTarget::new(Box::new(mapping), size, stride, SCANOUT_FORMAT))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for KmsDisplayBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.wait_for_flip() {
            warn!("{}: lost the final page flip: {}", self.name, err);
        }
        self.on_screen = None;
        self.queued = None;
        for scanout in self.buffers.drain(..) {
            let _ = self.card.destroy_framebuffer(scanout.framebuffer);
            let _ = self.card.destroy_dumb_buffer(scanout.dumb);
        }
    }
}
