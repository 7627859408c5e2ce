//! Stack wiring
//!
//! [`GraphicsStack`] turns a [`GraphicsConfig`] into live components. Every
//! component is built on first request and cached, so callers can ask for
//! them in any order. The [`InputRegion`] is the one exception: it is handed
//! out empty straight away and bound once the outputs exist.

use anyhow::{Context, Result};
use log::{debug, info};
use std::sync::{Arc, OnceLock};

use crate::buffer::BufferPool;
use crate::compositor::{OutputCompositor, OverlayGlProgram};
use crate::config::{GraphicsConfig, OutputConfig, OutputKind, PlatformConfig};
use crate::display::{
    DisplayBuffer, DisplayLayout, HeadlessDisplayBuffer, InputRegion, KmsDisplayBuffer,
};
use crate::geometry::Point;
use crate::gpu::{GlContext, GlProgramFactory};
use crate::platform::card::Card;
use crate::platform::gbm::GbmPlatform;
use crate::platform::shm::{ShmPlatform, ShmSearchPath};
use crate::platform::{NativeBufferPlatform, PlatformKind};
use crate::renderer::software::SoftwareRendererFactory;
use crate::renderer::RendererFactory;

/// Returns the cached value, building it on first use
fn cached<'a, T>(
    cell: &'a OnceLock<T>,
    build: impl FnOnce() -> Result<T>,
) -> Result<&'a T> {
    if let Some(value) = cell.get() {
        return Ok(value);
    }
    let value = build()?;
    Ok(cell.get_or_init(|| value))
}

/// Search path for the shm backend: the configured list, or the environment
pub fn shm_search_path(platform: &PlatformConfig) -> ShmSearchPath {
    if platform.shm_directories.is_empty() {
        ShmSearchPath::from_env()
    } else {
        ShmSearchPath::with_candidates(platform.shm_directories.clone())
    }
}

pub struct GraphicsStack {
    config: GraphicsConfig,
    card: OnceLock<Card>,
    buffer_platform: OnceLock<Arc<dyn NativeBufferPlatform>>,
    renderer_factory: OnceLock<Arc<dyn RendererFactory>>,
    input_region: InputRegion,
    outputs: OnceLock<Vec<OutputCompositor>>,
}

impl GraphicsStack {
    pub fn from_config(config: GraphicsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            card: OnceLock::new(),
            buffer_platform: OnceLock::new(),
            renderer_factory: OnceLock::new(),
            input_region: InputRegion::new(),
            outputs: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    /// DRM card shared by the gbm platform and KMS outputs
    pub fn the_card(&self) -> Result<&Card> {
        cached(&self.card, || {
            let path = &self.config.platform.drm_device;
            let card = Card::open(path)
                .with_context(|| format!("Failed to open DRM device {}", path.display()))?;
            info!("🔌 Opened DRM device {}", path.display());
            Ok(card)
        })
    }

    pub fn the_buffer_platform(&self) -> Result<Arc<dyn NativeBufferPlatform>> {
        cached(&self.buffer_platform, || {
            let platform: Arc<dyn NativeBufferPlatform> = match self.config.platform.backend {
                PlatformKind::Shm => {
                    let search = shm_search_path(&self.config.platform);
                    let platform = ShmPlatform::new(search)
                        .context("Failed to set up shared-memory buffers")?;
                    Arc::new(platform)
                }
                PlatformKind::Gbm => {
                    let card = self.the_card()?.clone();
                    Arc::new(GbmPlatform::with_card(card).context("Failed to set up GBM buffers")?)
                }
            };
            info!("🧱 Buffer platform: {}", platform.name());
            Ok(platform)
        })
        .cloned()
    }

    pub fn the_renderer_factory(&self) -> Result<Arc<dyn RendererFactory>> {
        cached(&self.renderer_factory, || {
            let factory: Arc<dyn RendererFactory> =
                Arc::new(SoftwareRendererFactory::new());
            Ok(factory)
        })
        .cloned()
    }

    /// Screen-space region for input confinement. Unbound until
    /// [`the_outputs`](Self::the_outputs) has run.
    pub fn the_input_region(&self) -> InputRegion {
        self.input_region.clone()
    }

    pub fn the_outputs(&self) -> Result<&[OutputCompositor]> {
        cached(&self.outputs, || self.build_outputs()).map(Vec::as_slice)
    }

    /// Mutable access for reorienting outputs. Builds them if needed.
    pub fn outputs_mut(&mut self) -> Result<&mut [OutputCompositor]> {
        self.the_outputs()?;
        match self.outputs.get_mut() {
            Some(outputs) => Ok(outputs.as_mut_slice()),
            None => anyhow::bail!("Outputs were not initialised"),
        }
    }

    /// A fresh pool for one surface, drawing from the shared platform
    pub fn create_buffer_pool(&self) -> Result<BufferPool> {
        let pool = &self.config.pool;
        Ok(BufferPool::new(self.the_buffer_platform()?, pool.format, pool.ring_depth))
    }

    /// Overlay-plane program for the output called `name`, compiled in
    /// `context` and projecting that output's view area
    pub fn create_overlay_program(
        &self,
        name: &str,
        factory: &dyn GlProgramFactory,
        context: &dyn GlContext,
    ) -> Result<OverlayGlProgram> {
        let output = self
            .the_outputs()?
            .iter()
            .find(|output| output.name() == name)
            .with_context(|| format!("No output named {}", name))?;
        let program = OverlayGlProgram::new(factory, context, output.view_area())
            .with_context(|| format!("Failed to build overlay program for {}", name))?;
        Ok(program)
    }

    fn build_display(&self, output: &OutputConfig) -> Result<Box<dyn DisplayBuffer>> {
        let mut display: Box<dyn DisplayBuffer> = match output.kind {
            OutputKind::Headless => Box::new(
                HeadlessDisplayBuffer::new(output.name.clone(), output.area())
                    .with_format(self.config.pool.format)
                    .with_self_rotation(output.self_rotating)
                    .with_bypass(output.bypass),
            ),
            OutputKind::Kms => {
                let card = self.the_card()?.clone();
                let display = KmsDisplayBuffer::new(card, Point::new(output.x, output.y))
                    .with_context(|| format!("Failed to set up KMS output {}", output.name))?;
                Box::new(display.with_bypass(output.bypass))
            }
        };
        display.orient(output.orientation);
        Ok(display)
    }

    fn build_outputs(&self) -> Result<Vec<OutputCompositor>> {
        let factory = self.the_renderer_factory()?;
        let mut layout = DisplayLayout::new();
        let mut outputs = Vec::with_capacity(self.config.outputs.len());

        for output in &self.config.outputs {
            let display = self.build_display(output)?;
            let compositor = OutputCompositor::spawn(display, factory.clone())
                .with_context(|| format!("Failed to start output {}", output.name))?;
            debug!("Output {} covers {:?}", compositor.name(), compositor.view_area());
            layout.add_output(compositor.name(), compositor.view_area());
            outputs.push(compositor);
        }

        info!("🖥️ {} output(s) spanning {:?}", layout.len(), layout.bounding_rectangle());
        self.input_region.bind(layout);
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::Orientation;
    use crate::error::ProgramError;
    use crate::geometry::{Rectangle, Size, Stride};
    use crate::gpu::{GlProgram, MockGlContext, UniformLocation, Vertex};
    use tempfile::tempdir;

    fn headless_config(dir: &std::path::Path) -> GraphicsConfig {
        let mut config = GraphicsConfig::default();
        config.platform.shm_directories = vec![dir.to_path_buf()];
        config.outputs[0].width = 64;
        config.outputs[0].height = 48;
        config
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let mut config = GraphicsConfig::default();
        config.pool.ring_depth = 0;
        assert!(GraphicsStack::from_config(config).is_err());
    }

    #[test]
    fn test_platform_is_created_once() {
        let dir = tempdir().unwrap();
        let stack = GraphicsStack::from_config(headless_config(dir.path())).unwrap();

        let first = stack.the_buffer_platform().unwrap();
        let second = stack.the_buffer_platform().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), PlatformKind::Shm);
    }

    #[test]
    fn test_input_region_binds_after_outputs() {
        let dir = tempdir().unwrap();
        let mut config = headless_config(dir.path());
        let mut second = config.outputs[0].clone();
        second.name = "HEADLESS-2".to_string();
        second.x = 64;
        second.orientation = Orientation::Left;
        config.outputs.push(second);

        let stack = GraphicsStack::from_config(config).unwrap();
        let region = stack.the_input_region();
        assert!(!region.is_bound());

        let outputs = stack.the_outputs().unwrap();
        assert_eq!(outputs.len(), 2);
        // The rotated output is 48 wide and 64 tall
        assert_eq!(outputs[1].view_area(), Rectangle::from_xywh(64, 0, 48, 64));
        assert_eq!(region.bounding_rectangle(), Some(Rectangle::from_xywh(0, 0, 112, 64)));
        assert_eq!(region.confine(Point::new(500, 500)), Point::new(111, 63));
    }

    #[test]
    fn test_outputs_are_cached() {
        let dir = tempdir().unwrap();
        let stack = GraphicsStack::from_config(headless_config(dir.path())).unwrap();

        let first = stack.the_outputs().unwrap().as_ptr();
        let second = stack.the_outputs().unwrap().as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn test_outputs_can_be_reoriented() {
        let dir = tempdir().unwrap();
        let mut stack = GraphicsStack::from_config(headless_config(dir.path())).unwrap();

        let output = &mut stack.outputs_mut().unwrap()[0];
        let area = output.orient(Orientation::Right).unwrap();
        assert_eq!(area.size, Size::new(48, 64));
    }

    #[test]
    fn test_pools_share_the_platform() {
        let dir = tempdir().unwrap();
        let stack = GraphicsStack::from_config(headless_config(dir.path())).unwrap();

        let mut pool = stack.create_buffer_pool().unwrap();
        assert_eq!(pool.ring_depth(), 1);
        let buffer = pool.get_buffer(Size::new(16, 16), Stride(64)).unwrap();
        assert_eq!(buffer.size(), Size::new(16, 16));
    }

    /// Program whose uniform lookup answers from a fixed table
    struct FixedUniforms(Option<i32>);

    impl GlProgram for FixedUniforms {
        fn uniform_location(&self, _name: &str) -> Option<UniformLocation> {
            self.0
        }

        fn bind(&self) {}

        fn set_uniform_matrix4(&self, _location: UniformLocation, _matrix: &[f32; 16]) {}

        fn draw_triangle_strip(&self, _attribute: &str, _vertices: &[Vertex]) {}
    }

    struct FixedFactory(Option<i32>);

    impl GlProgramFactory for FixedFactory {
        fn create_gl_program(
            &self,
            _vertex_shader: &str,
            _fragment_shader: &str,
        ) -> Result<Box<dyn GlProgram>, ProgramError> {
            Ok(Box::new(FixedUniforms(self.0)))
        }
    }

    fn bracketed_context() -> MockGlContext {
        let mut context = MockGlContext::new();
        context.expect_make_current().returning(|| Ok(()));
        context.expect_release_current().return_const(());
        context
    }

    #[test]
    fn test_overlay_program_projects_the_named_output() {
        let dir = tempdir().unwrap();
        let mut config = headless_config(dir.path());
        let mut second = config.outputs[0].clone();
        second.name = "HEADLESS-2".to_string();
        second.x = 64;
        config.outputs.push(second);
        let stack = GraphicsStack::from_config(config).unwrap();

        let overlay = stack
            .create_overlay_program("HEADLESS-2", &FixedFactory(Some(3)), &bracketed_context())
            .unwrap();
        assert_eq!(overlay.area(), Rectangle::from_xywh(64, 0, 64, 48));
        assert_eq!(overlay.display_transform_location(), 3);
    }

    #[test]
    fn test_overlay_program_failures_name_the_output() {
        let dir = tempdir().unwrap();
        let stack = GraphicsStack::from_config(headless_config(dir.path())).unwrap();
        let output = stack.the_outputs().unwrap()[0].name().to_string();

        let err = stack
            .create_overlay_program("HDMI-A-9", &FixedFactory(Some(0)), &bracketed_context())
            .err()
            .map(|err| format!("{err:#}"));
        assert!(err.is_some_and(|err| err.contains("HDMI-A-9")));

        let err = stack
            .create_overlay_program(&output, &FixedFactory(None), &bracketed_context())
            .err()
            .expect("missing uniform is fatal");
        assert!(format!("{err:#}").contains(&output));
        assert!(matches!(
            err.downcast_ref::<ProgramError>(),
            Some(ProgramError::MissingUniform { .. })
        ));
    }

    #[test]
    fn test_missing_drm_device_is_reported() {
        let mut config = GraphicsConfig::default();
        config.platform.backend = PlatformKind::Gbm;
        config.platform.drm_device = "/nonexistent/dri/card9".into();

        let stack = GraphicsStack::from_config(config).unwrap();
        let err = stack.the_buffer_platform().err().map(|err| format!("{err:#}"));
        assert!(err.is_some_and(|err| err.contains("/nonexistent/dri/card9")));
    }
}
