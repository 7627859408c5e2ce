//! Per-output compositor threads
//!
//! Each output gets one thread that owns its [`DisplayBuffer`] and the
//! renderer created for it. Every render bracket, post and bypass for that
//! output happens on that thread; other threads only send it scenes.
//!
//! ```text
//!  client threads            output thread "axiom-output-<name>"
//!  ──────────────            ───────────────────────────────────
//!  composite(scene) ──cmd──► bypass? ── yes ─► post_update_bypass
//!         ▲                     │
//!         │                     no ─► renderer.render (make_current,
//!         └────── outcome ◄─────┘      draw, post_update, release)
//! ```

pub mod overlay;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::buffer::{BufferId, PostedBuffer};
use crate::display::{DisplayBuffer, Orientation};
use crate::error::{CompositorError, RenderError, SubmissionError};
use crate::geometry::Rectangle;
use crate::renderer::{ElementContent, Renderer, RendererFactory, Scene, SceneElement};

pub use overlay::OverlayGlProgram;

/// How a frame reached the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The client buffer was scanned out directly
    Bypassed(BufferId),
    /// The scene was drawn and posted by the renderer
    Composited,
}

/// Frame counters for one output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub frames_composited: u64,
    pub frames_bypassed: u64,
    pub bypass_rejections: u64,
    pub failures: u64,
}

/// Top-most element, if it is an opaque client buffer covering the whole
/// output at its native size
pub fn bypass_candidate(
    display: &dyn DisplayBuffer,
    scene: &[Arc<dyn SceneElement>],
) -> Option<PostedBuffer> {
    if !display.can_bypass() {
        return None;
    }
    let area = display.view_area();
    let top = scene.last()?;
    if !top.is_opaque() || top.bounds() != area {
        return None;
    }
    match top.content() {
        ElementContent::Buffer(buffer) if buffer.size() == area.size => Some(buffer),
        _ => None,
    }
}

/// Puts one frame on `display`, bypassing composition when possible
pub fn composite_frame(
    display: &mut dyn DisplayBuffer,
    renderer: &mut dyn Renderer,
    scene: &[Arc<dyn SceneElement>],
    stats: &mut OutputStats,
) -> Result<FrameOutcome, RenderError> {
    if let Some(buffer) = bypass_candidate(&*display, scene) {
        let id = buffer.id();
        match display.post_update_bypass(buffer) {
            Ok(()) => {
                stats.frames_bypassed += 1;
                return Ok(FrameOutcome::Bypassed(id));
            }
            Err(SubmissionError::BypassRejected { reason }) => {
                stats.bypass_rejections += 1;
                debug!("{}: bypass rejected ({}), compositing instead", display.name(), reason);
            }
            Err(err) => return Err(err.into()),
        }
    }

    renderer.render(display, scene)?;
    stats.frames_composited += 1;
    Ok(FrameOutcome::Composited)
}

enum ThreadCommand {
    Frame {
        scene: Scene,
        reply: SyncSender<Result<FrameOutcome, RenderError>>,
    },
    Orient {
        orientation: Orientation,
        reply: SyncSender<Rectangle>,
    },
    End,
}

fn output_thread(
    mut display: Box<dyn DisplayBuffer>,
    factory: Arc<dyn RendererFactory>,
    commands: Receiver<ThreadCommand>,
    stats: Arc<Mutex<OutputStats>>,
) {
    let mut renderer = factory.create_renderer_for(display.as_ref());

    while let Ok(command) = commands.recv() {
        match command {
            ThreadCommand::Frame { scene, reply } => {
                let mut frame_stats = *stats.lock();
                let outcome =
                    composite_frame(display.as_mut(), renderer.as_mut(), &scene, &mut frame_stats);
                if let Err(err) = &outcome {
                    frame_stats.failures += 1;
                    warn!("{}: frame failed: {}", display.name(), err);
                }
                *stats.lock() = frame_stats;
                // Composited buffers are released before the caller hears back
                drop(scene);
                let _ = reply.send(outcome);
            }
            ThreadCommand::Orient { orientation, reply } => {
                display.orient(orientation);
                let _ = reply.send(display.view_area());
            }
            ThreadCommand::End => break,
        }
    }
    debug!("{}: output thread exiting", display.name());
}

/// Handle to one output's compositor thread
pub struct OutputCompositor {
    name: String,
    view_area: Rectangle,
    commands: Sender<ThreadCommand>,
    stats: Arc<Mutex<OutputStats>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputCompositor {
    /// Moves `display` onto a new thread named after it
    pub fn spawn(
        display: Box<dyn DisplayBuffer>,
        factory: Arc<dyn RendererFactory>,
    ) -> Result<Self, CompositorError> {
        let name = display.name().to_string();
        let view_area = display.view_area();
        let (commands, receiver) = channel();
        let stats = Arc::new(Mutex::new(OutputStats::default()));

        let thread_stats = stats.clone();
        let thread = std::thread::Builder::new()
            .name(format!("axiom-output-{name}"))
            .spawn(move || output_thread(display, factory, receiver, thread_stats))
            .map_err(CompositorError::Spawn)?;
        info!("🖥️ Output {} compositing on its own thread ({:?})", name, view_area);

        Ok(Self {
            name,
            view_area,
            commands,
            stats,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn view_area(&self) -> Rectangle {
        self.view_area
    }

    pub fn stats(&self) -> OutputStats {
        *self.stats.lock()
    }

    /// Sends `scene` to the output thread and waits for the frame
    pub fn composite(&self, scene: Scene) -> Result<FrameOutcome, CompositorError> {
        let (reply, outcome) = sync_channel(1);
        self.commands
            .send(ThreadCommand::Frame { scene, reply })
            .map_err(|_| self.disconnected())?;
        let outcome = outcome.recv().map_err(|_| self.disconnected())?;
        Ok(outcome?)
    }

    /// Rotates the output; returns its new view area
    pub fn orient(&mut self, orientation: Orientation) -> Result<Rectangle, CompositorError> {
        let (reply, area) = sync_channel(1);
        self.commands
            .send(ThreadCommand::Orient { orientation, reply })
            .map_err(|_| self.disconnected())?;
        self.view_area = area.recv().map_err(|_| self.disconnected())?;
        Ok(self.view_area)
    }

    /// Stops the thread and waits for it; the display is dropped on it
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.commands.send(ThreadCommand::End);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Output thread {} panicked", self.name);
            } else {
                info!("Output thread {} terminated", self.name);
            }
        }
    }

    fn disconnected(&self) -> CompositorError {
        CompositorError::Disconnected(self.name.clone())
    }
}

impl Drop for OutputCompositor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::test_support::heap_buffer;
    use crate::display::HeadlessDisplayBuffer;
    use crate::renderer::{BufferElement, Color, SoftwareRendererFactory, SolidColorElement};
    use std::sync::atomic::AtomicUsize;

    fn claimed(width: u32, height: u32) -> PostedBuffer {
        let buffer = heap_buffer(width, height, Arc::new(AtomicUsize::new(0)));
        assert!(buffer.try_claim());
        PostedBuffer::new(buffer)
    }

    fn spawn(display: HeadlessDisplayBuffer) -> OutputCompositor {
        OutputCompositor::spawn(Box::new(display), Arc::new(SoftwareRendererFactory::new()))
            .unwrap()
    }

    #[test]
    fn test_fullscreen_opaque_buffer_is_bypassed() {
        let output = spawn(HeadlessDisplayBuffer::new("bypass", Rectangle::from_xywh(0, 0, 8, 8)));
        let posted = claimed(8, 8);
        let buffer = posted.buffer().clone();
        let element = BufferElement::new(output.view_area(), posted).with_opaque(true);

        let outcome = output.composite(vec![Arc::new(element)]).unwrap();
        assert_eq!(outcome, FrameOutcome::Bypassed(buffer.id()));
        // Still on screen
        assert!(buffer.is_in_use());
        assert_eq!(output.stats().frames_bypassed, 1);
    }

    #[test]
    fn test_translucent_buffer_is_composited_and_released() {
        let output = spawn(HeadlessDisplayBuffer::new("blend", Rectangle::from_xywh(0, 0, 8, 8)));
        let posted = claimed(8, 8);
        let buffer = posted.buffer().clone();
        let element = BufferElement::new(output.view_area(), posted);

        let outcome = output.composite(vec![Arc::new(element)]).unwrap();
        assert_eq!(outcome, FrameOutcome::Composited);
        assert!(!buffer.is_in_use());
    }

    #[test]
    fn test_rejected_bypass_falls_back_to_rendering() {
        // Format mismatch: the display only scans out XRGB
        let display = HeadlessDisplayBuffer::new("fallback", Rectangle::from_xywh(0, 0, 8, 8))
            .with_format(crate::buffer::PixelFormat::Xrgb8888);
        let output = spawn(display);
        let element = BufferElement::new(output.view_area(), claimed(8, 8)).with_opaque(true);

        let outcome = output.composite(vec![Arc::new(element)]).unwrap();
        assert_eq!(outcome, FrameOutcome::Composited);
        let stats = output.stats();
        assert_eq!(stats.bypass_rejections, 1);
        assert_eq!(stats.frames_composited, 1);
    }

    #[test]
    fn test_bypass_candidate_requires_exact_cover() {
        let display = HeadlessDisplayBuffer::new("cand", Rectangle::from_xywh(0, 0, 8, 8));
        let offset: Arc<dyn SceneElement> = Arc::new(
            BufferElement::new(Rectangle::from_xywh(1, 0, 8, 8), claimed(8, 8)).with_opaque(true),
        );
        assert!(bypass_candidate(&display, &[offset]).is_none());

        let solid: Arc<dyn SceneElement> =
            Arc::new(SolidColorElement::new(Rectangle::from_xywh(0, 0, 8, 8), Color::BLACK));
        assert!(bypass_candidate(&display, &[solid]).is_none());

        let scaled: Arc<dyn SceneElement> = Arc::new(
            BufferElement::new(Rectangle::from_xywh(0, 0, 8, 8), claimed(4, 4)).with_opaque(true),
        );
        assert!(bypass_candidate(&display, &[scaled]).is_none());
    }

    #[test]
    fn test_orient_updates_cached_view_area() {
        let mut output =
            spawn(HeadlessDisplayBuffer::new("turn", Rectangle::from_xywh(0, 0, 640, 480)));
        let area = output.orient(Orientation::Left).unwrap();
        assert_eq!(area, Rectangle::from_xywh(0, 0, 480, 640));
        assert_eq!(output.view_area(), area);
    }

    #[test]
    fn test_shutdown_joins_after_frames() {
        let output = spawn(HeadlessDisplayBuffer::new("stop", Rectangle::from_xywh(0, 0, 2, 2)));
        let scene: Scene = vec![Arc::new(SolidColorElement::new(output.view_area(), Color::BLACK))];
        output.composite(scene).unwrap();
        output.shutdown();
    }
}
