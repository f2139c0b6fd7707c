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

//! The renderer: owns the driver behind a lock, numbers frames, and walks
//! the manager's level lists once per frame. Texture handles are created
//! from request threads but always under the driver lock the render thread
//! holds for the duration of a frame.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::prelude::*;
use crate::protocol::PixelFormat;
use crate::region::Region;
use crate::server::backend::RenderDriver;
use crate::server::backend::TextureFlags;
use crate::server::backend::TextureId;
use crate::server::events::EventRouter;
use crate::server::manager::WindowManager;
use crate::server::memory::Buffer;
use crate::server::surface::Surface;

pub struct Renderer {
    driver: Mutex<Box<dyn RenderDriver>>,
    screen: Region,
    frame_count: AtomicU32,
    reaped_zombies: AtomicUsize,
    /// True while a render thread is pacing frames; `wait_frame` is a no-op
    /// without one (there would be no frame to wait for).
    online: AtomicBool,
}

impl Renderer {
    pub fn new(driver: Box<dyn RenderDriver>, screen: Region) -> Self {
        Self {
            driver: Mutex::new(driver),
            screen,
            frame_count: AtomicU32::new(0),
            reaped_zombies: AtomicUsize::new(0),
            online: AtomicBool::new(false),
        }
    }

    pub fn screen_region(&self) -> Region {
        self.screen
    }

    /// Uploads `buffer` and returns the texture handle. Orientation and
    /// alpha hints derive from the buffer's flags and format.
    pub fn create_texture_for(&self, buffer: &Buffer) -> Result<TextureId> {
        let flags = TextureFlags {
            flip_y: buffer.flip_y(),
            premultiplied: buffer.format().premultiplied(),
        };
        self.driver.lock().unwrap().create_texture(
            buffer.width(),
            buffer.height(),
            buffer.format(),
            flags,
            buffer.bytes(),
        )
    }

    pub fn destroy_texture(&self, texture: TextureId) {
        self.driver.lock().unwrap().destroy_texture(texture);
    }

    pub fn supported_formats(&self) -> Vec<PixelFormat> {
        self.driver.lock().unwrap().supported_formats()
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count.load(Ordering::Acquire)
    }

    /// Buffers reclaimed after their client destroyed them while attached.
    /// Observable so the deferred-release contract can be tested.
    pub fn reaped_zombies(&self) -> usize {
        self.reaped_zombies.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Spins until the frame counter advances; lets teardown paths make
    /// sure the render thread is no longer touching a surface.
    pub fn wait_frame(&self) {
        if !self.online.load(Ordering::Acquire) {
            return;
        }
        let start = self.frame_count();
        while self.frame_count() == start && self.online.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    }

    /// One frame: reap destroyed buffers, draw every root intersecting the
    /// screen level by level, present, and bump the frame counter. Focus
    /// fallout from surfaces that vanished mid-frame is applied after the
    /// manager lock is released.
    #[instrument(skip_all, level = "trace")]
    pub fn render(&self, manager: &WindowManager, events: &EventRouter) {
        let mut hidden_roots: Vec<Arc<Surface>> = Vec::new();

        {
            let mut driver = self.driver.lock().unwrap();
            driver.begin_frame();

            manager.with_levels(|levels| {
                for level in levels {
                    for surface in level {
                        let (reaped, hidden) = surface.reap_zombies(driver.as_mut());
                        if reaped > 0 {
                            self.reaped_zombies.fetch_add(reaped, Ordering::AcqRel);
                        }
                        if hidden {
                            hidden_roots.push(surface.clone());
                        }

                        if self.screen.intersects(&surface.region()) {
                            surface.render(driver.as_mut(), events);
                        }
                    }
                }
            });

            if let Err(e) = driver.end_frame() {
                // A failed present loses one frame, not the compositor.
                warn!("present failed: {e:?}");
            }
        }

        self.frame_count.fetch_add(1, Ordering::AcqRel);

        for root in hidden_roots {
            manager.on_visibility_change(&root, false);
        }
    }

    #[cfg(test)]
    pub(crate) fn render_surface_for_test(&self, surface: &Arc<Surface>, events: &EventRouter) {
        let mut driver = self.driver.lock().unwrap();
        surface.render(driver.as_mut(), events);
    }
}
