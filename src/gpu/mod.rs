//! GPU program seam
//!
//! The overlay compositor needs three things from the GPU: a context it can
//! make current, a way to build a program from shader source, and a handful
//! of calls on the built program. They are traits so the context can come
//! from whatever EGL/GLX setup the embedder has, and so tests can run
//! without a GPU.

pub mod program;

use bytemuck::{Pod, Zeroable};

use crate::error::{ContextError, ProgramError};

pub use program::GlesProgramFactory;

/// A GPU context that can be bound to the calling thread
#[cfg_attr(test, mockall::automock)]
pub trait GlContext {
    fn make_current(&self) -> Result<(), ContextError>;
    fn release_current(&self);
}

/// Context bound for the lifetime of the guard
pub struct CurrentContext<'a> {
    context: &'a dyn GlContext,
}

impl<'a> CurrentContext<'a> {
    pub fn make_current(context: &'a dyn GlContext) -> Result<Self, ContextError> {
        context.make_current()?;
        Ok(Self { context })
    }
}

impl Drop for CurrentContext<'_> {
    fn drop(&mut self) {
        self.context.release_current();
    }
}

pub type UniformLocation = i32;

/// 2D vertex as uploaded to the `position` attribute
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
}

impl Vertex {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { position: [x, y] }
    }
}

/// A linked vertex + fragment program
pub trait GlProgram: Send {
    fn uniform_location(&self, name: &str) -> Option<UniformLocation>;

    /// Makes this the active program
    fn bind(&self);

    /// Uploads a column-major 4x4 matrix
    fn set_uniform_matrix4(&self, location: UniformLocation, matrix: &[f32; 16]);

    /// Draws `vertices` as a triangle strip fed to `attribute`
    fn draw_triangle_strip(&self, attribute: &str, vertices: &[Vertex]);
}

/// Compiles and links programs in the current context
pub trait GlProgramFactory {
    fn create_gl_program(
        &self,
        vertex_shader: &str,
        fragment_shader: &str,
    ) -> Result<Box<dyn GlProgram>, ProgramError>;
}
