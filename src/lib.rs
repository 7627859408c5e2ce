//! # Axiom Graphics
//!
//! Buffer lifecycle and compositing backend for the Axiom display server.
//!
//! ## Architecture
//!
//! - `buffer`: shared pixel buffers and the per-surface `BufferPool`
//! - `platform`: native buffer allocation (shared memory or GBM) and IPC descriptors
//! - `display`: the `DisplayBuffer` contract with headless and KMS outputs
//! - `renderer`: scene elements, the `Renderer` seam and a software renderer
//! - `gpu`: GL context and program seams, with a `gl`-crate program factory
//! - `compositor`: per-output compositor threads, bypass and the overlay program
//! - `config`: configuration parsing and management
//! - `stack`: lazy wiring of all of the above from a `GraphicsConfig`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use axiom_graphics::{GraphicsConfig, GraphicsStack};
//!
//! fn main() -> anyhow::Result<()> {
//!     let stack = GraphicsStack::from_config(GraphicsConfig::default())?;
//!     let mut pool = stack.create_buffer_pool()?;
//!     for output in stack.the_outputs()? {
//!         println!("{} at {:?}", output.name(), output.view_area());
//!     }
//!     # let _ = &mut pool;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod compositor;
pub mod config;
pub mod display;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod platform;
pub mod renderer;
pub mod stack;

// Re-export main types for easy access
pub use buffer::{BufferPool, PixelBuffer, PixelFormat, PostedBuffer};
pub use compositor::overlay::OverlayGlProgram;
pub use compositor::{FrameOutcome, OutputCompositor};
pub use config::GraphicsConfig;
pub use display::{DisplayBuffer, Orientation};
pub use geometry::{Point, Rectangle, Size, Stride};
pub use platform::{NativeBufferPlatform, PlatformKind};
pub use renderer::{Renderer, RendererFactory};
pub use stack::GraphicsStack;

// Re-export common error types
pub use anyhow::{Context, Error, Result};

/// Version information for Axiom Graphics
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
