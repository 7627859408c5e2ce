// Buffer lifecycle integration tests for Axiom graphics
//
// Follows client buffers from the pool through a shared-memory platform to
// an output and back: in-use gating, release on another thread, and the
// shared-memory directory search.

use axiom_graphics::buffer::BufferPool;
use axiom_graphics::display::{DisplayBuffer, HeadlessDisplayBuffer};
use axiom_graphics::platform::shm::{ShmPlatform, ShmSearchPath, ShmStrategy, RUNTIME_DIR_ENV};
use axiom_graphics::platform::{NativeBufferPlatform, WireMessage};
use axiom_graphics::{PixelFormat, PostedBuffer, Rectangle, Size, Stride};
use serial_test::serial;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

const SOLID: [u8; 4] = [0x30, 0x60, 0x90, 0xFF];

fn shm_pool(dir: &std::path::Path, ring_depth: usize) -> BufferPool {
    let search = ShmSearchPath::with_candidates(vec![dir.to_path_buf()]);
    let platform: Arc<dyn NativeBufferPlatform> = Arc::new(ShmPlatform::new(search).unwrap());
    BufferPool::new(platform, PixelFormat::Argb8888, ring_depth)
}

fn fill(buffer: &axiom_graphics::PixelBuffer, pixel: [u8; 4]) {
    let mut pixels = buffer.pixels().unwrap();
    for chunk in pixels.chunks_exact_mut(4) {
        chunk.copy_from_slice(&pixel);
    }
}

#[test]
fn test_padded_buffer_is_scanned_out_and_released_on_next_frame() {
    let dir = tempdir().unwrap();
    let mut pool = shm_pool(dir.path(), 1);

    // 64 pixels wide with a 256-byte stride: rows are exactly packed
    let first = pool.get_buffer(Size::new(64, 64), Stride(256)).unwrap();
    assert!(first.is_in_use());
    assert_eq!(first.extent(), 64 * 256);
    fill(&first, SOLID);

    let mut display = HeadlessDisplayBuffer::new("HEADLESS-1", Rectangle::from_xywh(0, 0, 64, 64));
    assert!(display.can_bypass());
    display.post_update_bypass(PostedBuffer::new(first.clone())).unwrap();
    assert_eq!(display.pixel(0, 0), Some(u32::from_le_bytes(SOLID)));
    assert_eq!(display.pixel(63, 63), Some(u32::from_le_bytes(SOLID)));

    // Still on screen, so the pool must not hand it out again
    let second = pool.get_buffer(Size::new(64, 64), Stride(256)).unwrap();
    assert_ne!(second.id(), first.id());
    assert!(first.is_in_use());

    // A composited frame takes the client buffer off screen
    display.make_current().unwrap();
    display.post_update().unwrap();
    display.release_current();
    assert!(!first.is_in_use());
    assert!(display.scanout_buffer().is_none());
}

#[test]
fn test_buffer_posted_to_two_outputs_stays_out_of_the_pool_until_both_let_go() {
    let dir = tempdir().unwrap();
    let mut pool = shm_pool(dir.path(), 1);

    let buffer = pool.get_buffer(Size::new(32, 32), Stride(128)).unwrap();
    fill(&buffer, SOLID);

    // One surface spanning two outputs: each posts the same handout
    let mut scanning = HeadlessDisplayBuffer::new("LEFT", Rectangle::from_xywh(0, 0, 32, 32));
    scanning
        .post_update_bypass(PostedBuffer::new(buffer.clone()))
        .unwrap();
    let composited = PostedBuffer::new(buffer.clone());
    drop(composited);

    assert!(buffer.is_in_use());
    let next = pool.get_buffer(Size::new(32, 32), Stride(128)).unwrap();
    assert_ne!(next.id(), buffer.id());
    assert_eq!(scanning.scanout_buffer().map(|posted| posted.id()), Some(buffer.id()));

    // Off screen at last: the next frame frees it
    scanning.make_current().unwrap();
    scanning.post_update().unwrap();
    scanning.release_current();
    assert!(!buffer.is_in_use());
}

#[test]
fn test_release_from_another_thread_makes_buffer_reusable() {
    let dir = tempdir().unwrap();
    let mut pool = shm_pool(dir.path(), 2);

    let buffer = pool.get_buffer(Size::new(32, 32), Stride(128)).unwrap();
    let id = buffer.id();
    let posted = PostedBuffer::new(buffer);

    thread::spawn(move || posted.release()).join().unwrap();

    let again = pool.get_buffer(Size::new(32, 32), Stride(128)).unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(pool.stats().allocations, 1);
    assert_eq!(pool.stats().reuses, 1);
}

#[test]
fn test_buffers_in_use_on_several_threads_are_never_shared() {
    let dir = tempdir().unwrap();
    let mut pool = shm_pool(dir.path(), 4);

    let held: Vec<_> = (0..4)
        .map(|_| pool.get_buffer(Size::new(16, 16), Stride(64)).unwrap())
        .collect();
    let mut ids: Vec<_> = held.iter().map(|buffer| buffer.id()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);

    let handles: Vec<_> = held
        .into_iter()
        .map(|buffer| {
            let posted = PostedBuffer::new(buffer);
            thread::spawn(move || drop(posted))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Everything came back; the ring serves without allocating
    for _ in 0..4 {
        pool.get_buffer(Size::new(16, 16), Stride(64)).unwrap();
    }
    assert_eq!(pool.stats().allocations, 4);
}

#[test]
fn test_descriptor_travels_through_a_wire_message() {
    let dir = tempdir().unwrap();
    let search = ShmSearchPath::with_candidates(vec![dir.path().to_path_buf()]);
    let platform = Arc::new(ShmPlatform::new(search).unwrap());
    let mut pool = BufferPool::new(platform.clone(), PixelFormat::Xrgb8888, 1);

    let buffer = pool.get_buffer(Size::new(10, 4), Stride(48)).unwrap();
    let mut message = WireMessage::default();
    platform.fill_ipc_package(&mut message, &buffer).unwrap();

    let descriptor = message.into_descriptor().unwrap();
    assert_eq!(descriptor.size, Size::new(10, 4));
    assert_eq!(descriptor.stride, Stride(48));
    assert_eq!(descriptor.format, PixelFormat::Xrgb8888);
    assert_eq!(descriptor.mapped_len(), 4 * 48);
}

#[test]
#[serial]
fn test_missing_runtime_dir_falls_back_to_system_directories() {
    let saved = std::env::var_os(RUNTIME_DIR_ENV);
    std::env::set_var(RUNTIME_DIR_ENV, "/nonexistent/axiom-runtime");

    let search = ShmSearchPath::from_env();
    let platform = ShmPlatform::new(search.clone());

    match saved {
        Some(value) => std::env::set_var(RUNTIME_DIR_ENV, value),
        None => std::env::remove_var(RUNTIME_DIR_ENV),
    }

    assert_eq!(search.candidates()[0], std::path::PathBuf::from("/nonexistent/axiom-runtime"));
    let platform = platform.unwrap();
    let directory = platform.strategy().directory();
    assert!(
        directory == std::path::Path::new("/dev/shm") || directory == std::path::Path::new("/tmp")
    );
}

#[test]
#[serial]
fn test_runtime_dir_is_preferred_when_usable() {
    let dir = tempdir().unwrap();
    let saved = std::env::var_os(RUNTIME_DIR_ENV);
    std::env::set_var(RUNTIME_DIR_ENV, dir.path());

    let platform = ShmPlatform::new(ShmSearchPath::from_env());

    match saved {
        Some(value) => std::env::set_var(RUNTIME_DIR_ENV, value),
        None => std::env::remove_var(RUNTIME_DIR_ENV),
    }

    let platform = platform.unwrap();
    assert_eq!(platform.strategy().directory(), dir.path());
    assert!(matches!(
        platform.strategy(),
        ShmStrategy::Anonymous(_) | ShmStrategy::Unlinked(_)
    ));
}

#[test]
#[serial]
fn test_allocation_falls_back_when_runtime_dir_is_unset_and_primary_fails() {
    let fallback = tempdir().unwrap();
    let saved = std::env::var_os(RUNTIME_DIR_ENV);
    std::env::remove_var(RUNTIME_DIR_ENV);

    // Unset runtime dir: the fixed fallbacks lead the default search
    let defaults = ShmSearchPath::from_env();
    let missing = PathBuf::from("/nonexistent/axiom-shm");
    let search =
        ShmSearchPath::with_candidates(vec![missing.clone(), fallback.path().to_path_buf()]);
    let platform = ShmPlatform::new(search);

    if let Some(value) = saved {
        std::env::set_var(RUNTIME_DIR_ENV, value);
    }

    assert_eq!(
        defaults.candidates(),
        &[PathBuf::from("/dev/shm"), PathBuf::from("/tmp")][..]
    );

    let platform = platform.unwrap();
    assert_eq!(platform.strategy().directory(), fallback.path());

    let buffer = platform
        .allocate(Size::new(16, 16), Stride(64), PixelFormat::Argb8888)
        .unwrap();
    fill(&buffer, SOLID);
    assert!(buffer.pixels().unwrap().chunks_exact(4).all(|px| px == SOLID));

    // The backing file lives in the fallback directory, not the missing one
    let fd = buffer.export_fd().unwrap();
    let backing = std::fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())).unwrap();
    let fallback_dir = fallback.path().canonicalize().unwrap();
    assert!(
        backing.starts_with(&fallback_dir),
        "{} is not inside {}",
        backing.display(),
        fallback_dir.display()
    );
    assert!(!backing.starts_with(&missing));
}
