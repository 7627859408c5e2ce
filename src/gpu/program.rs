//! OpenGL ES 2 programs through the `gl` bindings
//!
//! Every call assumes the context the functions were loaded for is current on
//! the calling thread.

use gl::types::{GLchar, GLenum, GLint, GLsizei, GLuint};
use log::{debug, info};
use std::ffi::{c_void, CString};
use std::ptr;

use super::{GlProgram, GlProgramFactory, UniformLocation, Vertex};
use crate::error::{ProgramError, ShaderStage};

/// Program factory backed by the process's GL function pointers
#[derive(Debug)]
pub struct GlesProgramFactory {
    _loaded: (),
}

impl GlesProgramFactory {
    /// Resolves GL entry points through `loader` (e.g. `eglGetProcAddress`)
    pub fn load_with<F>(loader: F) -> Self
    where
        F: FnMut(&'static str) -> *const c_void,
    {
        gl::load_with(loader);
        info!("🎨 GL program factory ready");
        Self { _loaded: () }
    }
}

fn info_log(
    object: GLuint,
    length_of: impl Fn(GLuint, *mut GLint),
    read: impl Fn(GLuint, GLsizei, *mut GLsizei, *mut GLchar),
) -> String {
    let mut length: GLint = 0;
    length_of(object, &mut length);
    if length <= 0 {
        return String::new();
    }
    let mut log = vec![0u8; length as usize];
    let mut written: GLsizei = 0;
    read(object, length, &mut written, log.as_mut_ptr() as *mut GLchar);
    log.truncate(written.max(0) as usize);
    String::from_utf8_lossy(&log).trim_end().to_string()
}

fn shader_log(shader: GLuint) -> String {
    info_log(
        shader,
        |object, length| unsafe { gl::GetShaderiv(object, gl::INFO_LOG_LENGTH, length) },
        |object, len, written, buf| unsafe { gl::GetShaderInfoLog(object, len, written, buf) },
    )
}

fn program_log(program: GLuint) -> String {
    info_log(
        program,
        |object, length| unsafe { gl::GetProgramiv(object, gl::INFO_LOG_LENGTH, length) },
        |object, len, written, buf| unsafe { gl::GetProgramInfoLog(object, len, written, buf) },
    )
}

fn compile_shader(stage: ShaderStage, source: &str) -> Result<GLuint, ProgramError> {
    let kind: GLenum = match stage {
        ShaderStage::Vertex => gl::VERTEX_SHADER,
        ShaderStage::Fragment => gl::FRAGMENT_SHADER,
    };
    let source = CString::new(source).map_err(|_| ProgramError::Compile {
        stage,
        log: "shader source contains a NUL byte".to_string(),
    })?;

    unsafe {
        let shader = gl::CreateShader(kind);
        gl::ShaderSource(shader, 1, &source.as_ptr(), ptr::null());
        gl::CompileShader(shader);

        let mut status: GLint = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut status);
        if status == gl::FALSE as GLint {
            let log = shader_log(shader);
            gl::DeleteShader(shader);
            return Err(ProgramError::Compile { stage, log });
        }
        Ok(shader)
    }
}

/// Linked program object, deleted on drop
#[derive(Debug)]
pub struct GlesProgram {
    id: GLuint,
}

impl GlesProgram {
    pub fn id(&self) -> GLuint {
        self.id
    }
}

impl GlProgram for GlesProgram {
    fn uniform_location(&self, name: &str) -> Option<UniformLocation> {
        let name = CString::new(name).ok()?;
        let location = unsafe { gl::GetUniformLocation(self.id, name.as_ptr()) };
        (location >= 0).then_some(location)
    }

    fn bind(&self) {
        unsafe { gl::UseProgram(self.id) }
    }

    fn set_uniform_matrix4(&self, location: UniformLocation, matrix: &[f32; 16]) {
        unsafe { gl::UniformMatrix4fv(location, 1, gl::FALSE, matrix.as_ptr()) }
    }

    fn draw_triangle_strip(&self, attribute: &str, vertices: &[Vertex]) {
        let Ok(name) = CString::new(attribute) else {
            return;
        };
        let location = unsafe { gl::GetAttribLocation(self.id, name.as_ptr()) };
        if location < 0 {
            debug!("Program {} has no attribute `{}`", self.id, attribute);
            return;
        }
        let location = location as GLuint;
        let data: &[f32] = bytemuck::cast_slice(vertices);

        unsafe {
            // Client-side vertex array
            gl::BindBuffer(gl::ARRAY_BUFFER, 0);
            gl::EnableVertexAttribArray(location);
            gl::VertexAttribPointer(
                location,
                2,
                gl::FLOAT,
                gl::FALSE,
                0,
                data.as_ptr() as *const c_void,
            );
            gl::DrawArrays(gl::TRIANGLE_STRIP, 0, vertices.len() as GLsizei);
            gl::DisableVertexAttribArray(location);
        }
    }
}

impl Drop for GlesProgram {
    fn drop(&mut self) {
        unsafe { gl::DeleteProgram(self.id) }
    }
}

impl GlProgramFactory for GlesProgramFactory {
    fn create_gl_program(
        &self,
        vertex_shader: &str,
        fragment_shader: &str,
    ) -> Result<Box<dyn GlProgram>, ProgramError> {
        let vertex = compile_shader(ShaderStage::Vertex, vertex_shader)?;
        let fragment = match compile_shader(ShaderStage::Fragment, fragment_shader) {
            Ok(fragment) => fragment,
            Err(err) => {
                unsafe { gl::DeleteShader(vertex) };
                return Err(err);
            }
        };

        unsafe {
            let id = gl::CreateProgram();
            gl::AttachShader(id, vertex);
            gl::AttachShader(id, fragment);
            gl::LinkProgram(id);
            // The program keeps the compiled code alive
            gl::DeleteShader(vertex);
            gl::DeleteShader(fragment);

            let mut status: GLint = 0;
            gl::GetProgramiv(id, gl::LINK_STATUS, &mut status);
            if status == gl::FALSE as GLint {
                let log = program_log(id);
                gl::DeleteProgram(id);
                return Err(ProgramError::Link { log });
            }
            debug!("Linked GL program {}", id);
            Ok(Box::new(GlesProgram { id }))
        }
    }
}
