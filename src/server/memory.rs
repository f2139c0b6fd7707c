// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client shared memory: attached segments, pools handed out over the wire,
//! and buffers describing pixel data inside a pool.
//!
//! Lifetimes are reference-driven: a pool stays mapped while any buffer
//! drawn from it is alive, even after the client asked for its destruction;
//! a buffer destroyed while still attached to a surface is tagged a zombie
//! and reaped by the render thread on its next pass.

use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use nix::fcntl::OFlag;
use nix::sys::mman;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::stat::Mode;

use crate::prelude::*;
use crate::protocol::ClientId;
use crate::protocol::ObjectId;
use crate::protocol::PixelFormat;
use crate::protocol::buffer_flags;

/// A mapped shared-memory segment. The only platform-dependent piece of the
/// memory subsystem; everything above it works on `(ptr, len)`.
pub trait SharedSegment: Send + Sync {
    fn len(&self) -> usize;
    fn as_ptr(&self) -> *mut u8;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Attaches segments from wire handles. The production source resolves
/// handles to POSIX shared memory; tests substitute heap segments.
pub trait SegmentSource: Send {
    fn attach(&self, handle: u64, size: usize) -> Result<Box<dyn SharedSegment>>;
}

/// POSIX shared memory mapped from a named object derived from the handle.
pub struct ShmSegment {
    map: NonNull<std::ffi::c_void>,
    len: usize,
}

// SAFETY: the mapping is owned by this struct for its whole lifetime and the
// pointer itself is never handed out mutably to more than one place; pixel
// reads racing client writes are confined to the renderer's upload path.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    fn shm_name(handle: u64) -> String {
        format!("/prism-{handle:x}")
    }

    pub fn attach(handle: u64, size: usize) -> Result<Self> {
        let name = Self::shm_name(handle);
        let fd: OwnedFd = mman::shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())
            .with_context(loc!(), || format!("shm_open({name}) failed"))?;

        let len = NonZeroUsize::new(size).ok_or(anyhow!("zero-sized segment"))?;
        // SAFETY: fd is a freshly opened shm object and len is non-zero; the
        // mapping is released in Drop.
        let map = unsafe {
            mman::mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .with_context(loc!(), || format!("mmap of {name} ({size} bytes) failed"))?;

        Ok(Self { map, len: size })
    }
}

impl SharedSegment for ShmSegment {
    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr().cast()
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: map/len are the values returned by mmap and the mapping has
        // not been unmapped elsewhere.
        if let Err(e) = unsafe { mman::munmap(self.map, self.len) } {
            warn!("munmap failed: {e}");
        }
    }
}

pub struct ShmSource;

impl SegmentSource for ShmSource {
    fn attach(&self, handle: u64, size: usize) -> Result<Box<dyn SharedSegment>> {
        Ok(Box::new(ShmSegment::attach(handle, size).location(loc!())?))
    }
}

/// Heap-backed segments keyed by handle. Used by tests (and by anything
/// driving the compositor in-process): the "client" writes through the same
/// allocation the compositor reads.
#[derive(Default)]
pub struct HeapSource {
    segments: Mutex<std::collections::HashMap<u64, Arc<HeapSegment>>>,
}

impl HeapSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or returns the existing) segment for `handle` so the caller
    /// can fill it before the compositor attaches it.
    pub fn create(&self, handle: u64, size: usize) -> Arc<HeapSegment> {
        self.segments
            .lock()
            .unwrap()
            .entry(handle)
            .or_insert_with(|| Arc::new(HeapSegment::new(size)))
            .clone()
    }
}

impl SegmentSource for HeapSource {
    fn attach(&self, handle: u64, size: usize) -> Result<Box<dyn SharedSegment>> {
        let segment = self.create(handle, size);
        ensure!(
            segment.len() >= size,
            "segment {handle:#x} is smaller than requested ({} < {size})",
            segment.len()
        );
        Ok(Box::new(SharedHeapSegment(segment)))
    }
}

// Lets the "client" side of a test keep a writing handle to the same source
// the compositor owns.
impl SegmentSource for Arc<HeapSource> {
    fn attach(&self, handle: u64, size: usize) -> Result<Box<dyn SharedSegment>> {
        self.as_ref().attach(handle, size)
    }
}

pub struct HeapSegment {
    data: NonNull<u8>,
    len: usize,
}

// SAFETY: same discipline as ShmSegment; writers and the renderer coordinate
// through the invalidate/commit protocol, not through this type.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

impl HeapSegment {
    pub fn new(len: usize) -> Self {
        let layout = std::alloc::Layout::array::<u8>(len.max(1)).unwrap();
        // SAFETY: layout has non-zero size.
        let data = unsafe { std::alloc::alloc_zeroed(layout) };
        Self {
            data: NonNull::new(data).expect("allocation failed"),
            len,
        }
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len);
        // SAFETY: bounds asserted above; see the Send/Sync note for races.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.data.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }
}

impl SharedSegment for HeapSegment {
    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::array::<u8>(self.len.max(1)).unwrap();
        // SAFETY: allocated in new() with the same layout.
        unsafe { std::alloc::dealloc(self.data.as_ptr(), layout) };
    }
}

/// Wrapper so an `Arc<HeapSegment>` (shared with the writing test) can serve
/// as the pool's boxed segment.
struct SharedHeapSegment(Arc<HeapSegment>);

impl SharedSegment for SharedHeapSegment {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// A shared segment attached on behalf of one client. Buffers keep the pool
/// alive through their `Arc`; `detach` only marks the client's intent, the
/// mapping goes away when the last reference drops.
pub struct MemoryPool {
    client: ClientId,
    id: ObjectId,
    handle: u64,
    segment: Box<dyn SharedSegment>,
    detached: AtomicBool,
}

impl MemoryPool {
    pub fn new(
        client: ClientId,
        id: ObjectId,
        handle: u64,
        segment: Box<dyn SharedSegment>,
    ) -> Self {
        Self {
            client,
            id,
            handle,
            segment,
            detached: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.segment.len()
    }

    /// Bounds-checked pointer into the segment.
    pub fn slice(&self, offset: usize, len: usize) -> Result<*const u8> {
        ensure!(
            offset.checked_add(len).is_some_and(|end| end <= self.size()),
            "range {offset}+{len} outside pool of {} bytes",
            self.size()
        );
        // SAFETY: offset is within the mapping per the check above.
        Ok(unsafe { self.segment.as_ptr().add(offset).cast_const() })
    }

    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        debug!(
            "releasing pool {} of client {} ({} bytes)",
            self.id,
            self.client,
            self.size()
        );
    }
}

/// A view over a pool range. Created with the creating client as the only
/// holder; a surface adopting it clones the `Arc`.
pub struct Buffer {
    pool: Arc<MemoryPool>,
    id: ObjectId,
    offset: usize,
    width: i32,
    height: i32,
    stride: i32,
    format: PixelFormat,
    flags: u32,
    zombie: AtomicBool,
}

impl Buffer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ObjectId,
        pool: Arc<MemoryPool>,
        offset: u64,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
        flags: u32,
    ) -> Result<Arc<Self>> {
        ensure!(width > 0 && height > 0, "zero-sized buffer");
        ensure!(
            stride >= width * format.bytes_per_pixel(),
            "stride {stride} too small for width {width}"
        );

        let offset = usize::try_from(offset).location(loc!())?;
        let len = (stride as usize) * (height as usize);
        // Validates pool.size >= offset + stride * height.
        pool.slice(offset, len).location(loc!())?;

        Ok(Arc::new(Self {
            pool,
            id,
            offset,
            width,
            height,
            stride,
            format,
            flags,
            zombie: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn stride(&self) -> i32 {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn flip_y(&self) -> bool {
        self.flags & buffer_flags::FLIP_Y != 0
    }

    pub fn len(&self) -> usize {
        (self.stride as usize) * (self.height as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The pixel bytes. The client writes this memory concurrently; the
    /// invalidate/commit protocol bounds which frames observe which rows.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the range was validated against the pool at construction
        // and the pool mapping outlives self via the Arc.
        unsafe {
            std::slice::from_raw_parts(self.pool.slice(self.offset, self.len()).unwrap(), self.len())
        }
    }

    pub fn mark_zombie(&self) {
        self.zombie.store(true, Ordering::Release);
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(size: usize) -> Arc<MemoryPool> {
        let source = HeapSource::new();
        let segment = source.attach(1, size).unwrap();
        Arc::new(MemoryPool::new(ClientId(1), ObjectId(1), 1, segment))
    }

    #[test]
    fn slice_bounds_are_enforced() {
        let pool = test_pool(4096);
        assert!(pool.slice(0, 4096).is_ok());
        assert!(pool.slice(4095, 1).is_ok());
        assert!(pool.slice(4096, 1).is_err());
        assert!(pool.slice(0, 4097).is_err());
        assert!(pool.slice(usize::MAX, 2).is_err());
    }

    #[test]
    fn buffer_must_fit_in_pool() {
        let pool = test_pool(40_000);
        // 100x100 @ 400 bytes/row fills the pool exactly.
        assert!(
            Buffer::new(ObjectId(2), pool.clone(), 0, 100, 100, 400, PixelFormat::Argb32, 0)
                .is_ok()
        );
        // One byte over.
        assert!(
            Buffer::new(ObjectId(2), pool.clone(), 1, 100, 100, 400, PixelFormat::Argb32, 0)
                .is_err()
        );
        assert!(
            Buffer::new(ObjectId(2), pool.clone(), 0, 100, 101, 400, PixelFormat::Argb32, 0)
                .is_err()
        );
    }

    #[test]
    fn degenerate_buffers_are_rejected() {
        let pool = test_pool(4096);
        assert!(
            Buffer::new(ObjectId(2), pool.clone(), 0, 0, 1, 4, PixelFormat::Argb32, 0).is_err()
        );
        assert!(
            Buffer::new(ObjectId(2), pool.clone(), 0, 1, 0, 4, PixelFormat::Argb32, 0).is_err()
        );
        // Stride smaller than a row.
        assert!(
            Buffer::new(ObjectId(2), pool.clone(), 0, 10, 10, 16, PixelFormat::Argb32, 0).is_err()
        );
    }

    #[test]
    fn pool_outlives_detach_while_buffer_exists() {
        let source = HeapSource::new();
        let segment = source.attach(7, 4096).unwrap();
        let pool = Arc::new(MemoryPool::new(ClientId(1), ObjectId(1), 7, segment));
        let buffer =
            Buffer::new(ObjectId(2), pool.clone(), 0, 16, 16, 64, PixelFormat::Argb32, 0).unwrap();

        pool.detach();
        drop(pool);
        // The buffer still reads valid memory through its own reference.
        assert_eq!(buffer.bytes().len(), 16 * 64);
    }

    #[test]
    fn heap_segment_writes_are_visible_through_buffer() {
        let source = HeapSource::new();
        let segment = source.create(3, 4096);
        let pool = Arc::new(MemoryPool::new(
            ClientId(1),
            ObjectId(1),
            3,
            source.attach(3, 4096).unwrap(),
        ));
        let buffer =
            Buffer::new(ObjectId(2), pool, 0, 16, 16, 64, PixelFormat::Argb32, 0).unwrap();

        segment.write(0, &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&buffer.bytes()[..4], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn zombie_tag_is_sticky() {
        let pool = test_pool(4096);
        let buffer =
            Buffer::new(ObjectId(2), pool, 0, 16, 16, 64, PixelFormat::Argb32, 0).unwrap();
        assert!(!buffer.is_zombie());
        buffer.mark_zombie();
        assert!(buffer.is_zombie());
    }
}
