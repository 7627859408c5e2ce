//! GPU program for overlay-plane composition
//!
//! Built once per output: compiling the program and looking up the
//! `display_transform` uniform happen in [`OverlayGlProgram::new`], never per
//! frame. There is no fallback program; if construction fails the overlay
//! path is unavailable for that output.

use log::{debug, info};

use crate::error::{ContextError, ProgramError};
use crate::geometry::Rectangle;
use crate::gpu::{CurrentContext, GlContext, GlProgram, GlProgramFactory, UniformLocation, Vertex};

pub const DISPLAY_TRANSFORM_UNIFORM: &str = "display_transform";
pub const POSITION_ATTRIBUTE: &str = "position";

const VERTEX_SHADER: &str = "\
attribute vec2 position;
uniform mat4 display_transform;
void main() {
   gl_Position = display_transform * vec4(position, 0.0, 1.0);
}
";

const FRAGMENT_SHADER: &str = "\
precision mediump float;
void main() {
   gl_FragColor = vec4(1.0, 1.0, 1.0, 1.0);
}
";

/// Column-major orthographic projection of `area` onto clip space, y down
pub fn display_transform(area: &Rectangle) -> [f32; 16] {
    let width = area.size.width.max(1) as f32;
    let height = area.size.height.max(1) as f32;
    let sx = 2.0 / width;
    let sy = -2.0 / height;
    let tx = -1.0 - sx * area.left() as f32;
    let ty = 1.0 - sy * area.top() as f32;
    #[rustfmt::skip]
    let matrix = [
        sx,  0.0, 0.0, 0.0,
        0.0, sy,  0.0, 0.0,
        0.0, 0.0, 1.0, 0.0,
        tx,  ty,  0.0, 1.0,
    ];
    matrix
}

/// Triangle strip covering `rect`
fn quad(rect: &Rectangle) -> [Vertex; 4] {
    let (left, top) = (rect.left() as f32, rect.top() as f32);
    let (right, bottom) = (rect.right() as f32, rect.bottom() as f32);
    [
        Vertex::new(left, top),
        Vertex::new(left, bottom),
        Vertex::new(right, top),
        Vertex::new(right, bottom),
    ]
}

pub struct OverlayGlProgram {
    program: Box<dyn GlProgram>,
    display_transform: UniformLocation,
    area: Rectangle,
    transform: [f32; 16],
}

impl OverlayGlProgram {
    /// Compiles the overlay program with `context` current
    pub fn new(
        factory: &dyn GlProgramFactory,
        context: &dyn GlContext,
        area: Rectangle,
    ) -> Result<Self, ProgramError> {
        let _current = CurrentContext::make_current(context)?;
        let program = factory.create_gl_program(VERTEX_SHADER, FRAGMENT_SHADER)?;
        let uniform = program
            .uniform_location(DISPLAY_TRANSFORM_UNIFORM)
            .ok_or_else(|| ProgramError::MissingUniform {
                name: DISPLAY_TRANSFORM_UNIFORM.to_string(),
            })?;
        info!("🎨 Overlay program ready for {:?}", area);

        Ok(Self {
            program,
            display_transform: uniform,
            area,
            transform: display_transform(&area),
        })
    }

    pub fn area(&self) -> Rectangle {
        self.area
    }

    pub fn display_transform_location(&self) -> UniformLocation {
        self.display_transform
    }

    /// Draws one quad per plane, clipped to the output
    pub fn render(
        &self,
        context: &dyn GlContext,
        planes: &[Rectangle],
    ) -> Result<(), ContextError> {
        let _current = CurrentContext::make_current(context)?;
        self.program.bind();
        self.program.set_uniform_matrix4(self.display_transform, &self.transform);

        let mut drawn = 0;
        for plane in planes {
            let visible = plane.intersection(&self.area);
            if visible.is_empty() {
                continue;
            }
            self.program.draw_triangle_strip(POSITION_ATTRIBUTE, &quad(&visible));
            drawn += 1;
        }
        debug!("Overlay drew {} of {} planes", drawn, planes.len());
        Ok(())
    }
}
