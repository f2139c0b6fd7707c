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

//! Surfaces: dual-state (pending/active) nodes in the composition tree.
//!
//! Staged changes (buffer, properties, new children) are invisible until
//! `commit` promotes them in one step under the surface lock. Position is
//! the exception: it is applied eagerly because it is the most animated
//! property and a missed frame produces no artifact.
//!
//! Lock discipline: the manager lock is always taken before any surface
//! lock, parents before children, and no surface lock is held while waiting
//! on the render driver (texture teardown happens after unlock).

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::prelude::*;
use crate::protocol::ClientId;
use crate::protocol::ObjectId;
use crate::protocol::edges;
use crate::region::Region;
use crate::server::backend::BlendMode;
use crate::server::backend::RenderDriver;
use crate::server::backend::TextureId;
use crate::server::events::EventRouter;
use crate::server::manager::LEVEL_DEFAULT;
use crate::server::memory::Buffer;
use crate::server::renderer::Renderer;

#[derive(Default)]
struct SurfaceProperties {
    input_region: Region,
    drop_shadow: Region,
    transparent: bool,
    corner_radius: i32,
    border_width: i32,
    border_color: u32,
    children: Vec<Arc<Surface>>,
}

#[derive(Default)]
struct Backbuffer {
    content: Option<Arc<Buffer>>,
    texture: Option<TextureId>,
}

struct SurfaceState {
    level: usize,
    visible: bool,
    dimensions: Region,
    /// Set while maximized; geometry changes target this region so
    /// `restore_size` returns to where the surface would have been.
    saved_dimensions: Option<Region>,
    parent: Option<Weak<Surface>>,
    swap_requested: bool,
    front: usize,
    backbuffers: [Backbuffer; 2],
    active: SurfaceProperties,
    pending: SurfaceProperties,
}

impl SurfaceState {
    /// The region geometry requests operate on: the saved one while
    /// maximized, the live one otherwise.
    fn target_region_mut(&mut self) -> &mut Region {
        self.saved_dimensions.as_mut().unwrap_or(&mut self.dimensions)
    }
}

pub struct Surface {
    client: ClientId,
    id: ObjectId,
    frame_requested: AtomicBool,
    /// Invalidated sub-rects since the last upload. Separate from the state
    /// lock so the renderer can drain it under its read traversal.
    dirt: Mutex<Region>,
    state: RwLock<SurfaceState>,
}

impl Surface {
    pub fn new(
        client: ClientId,
        id: ObjectId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            id,
            frame_requested: AtomicBool::new(false),
            dirt: Mutex::new(Region::default()),
            state: RwLock::new(SurfaceState {
                level: LEVEL_DEFAULT,
                visible: false,
                dimensions: Region::new(x, y, width, height),
                saved_dimensions: None,
                parent: None,
                swap_requested: false,
                front: 0,
                backbuffers: [Backbuffer::default(), Backbuffer::default()],
                active: SurfaceProperties::default(),
                pending: SurfaceProperties::default(),
            }),
        })
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn level(&self) -> usize {
        self.state.read().unwrap().level
    }

    pub fn set_level(&self, level: usize) {
        self.state.write().unwrap().level = level;
    }

    pub fn visible(&self) -> bool {
        self.state.read().unwrap().visible
    }

    pub fn is_maximized(&self) -> bool {
        self.state.read().unwrap().saved_dimensions.is_some()
    }

    /// Snapshot of the on-screen region (position and size).
    pub fn region(&self) -> Region {
        self.state.read().unwrap().dimensions
    }

    pub fn parent(&self) -> Option<Arc<Surface>> {
        self.state
            .read()
            .unwrap()
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// The topmost ancestor: the surface the window manager knows about.
    pub fn root(self: &Arc<Self>) -> Arc<Surface> {
        let mut root = self.clone();
        while let Some(parent) = root.parent() {
            root = parent;
        }
        root
    }

    /// Stages `content` into the non-active backbuffer and uploads its
    /// texture. Replacing a staged buffer releases the replaced texture and
    /// reference; the active content is untouched until `commit`.
    pub fn set_buffer(&self, renderer: &Renderer, content: Option<Arc<Buffer>>) -> Result<()> {
        let staged = match content {
            Some(buffer) => {
                let texture = renderer.create_texture_for(&buffer).location(loc!())?;
                Backbuffer {
                    content: Some(buffer),
                    texture: Some(texture),
                }
            },
            None => Backbuffer::default(),
        };

        let previous = {
            let mut state = self.state.write().unwrap();
            let slot = state.front ^ 1;
            state.swap_requested = true;
            std::mem::replace(&mut state.backbuffers[slot], staged)
        };

        // Texture teardown talks to the driver; never under the state lock.
        if let Some(texture) = previous.texture {
            renderer.destroy_texture(texture);
        }
        Ok(())
    }

    /// Position is eager: it updates the live region in place.
    pub fn set_position(&self, x: i32, y: i32) {
        self.state
            .write()
            .unwrap()
            .target_region_mut()
            .set_position(x, y);
    }

    pub fn move_by(&self, dx: i32, dy: i32) {
        let mut state = self.state.write().unwrap();
        let region = state.target_region_mut();
        let (x, y) = (region.x, region.y);
        region.set_position(x + dx, y + dy);
    }

    pub fn move_absolute(&self, x: i32, y: i32) {
        self.set_position(x, y);
    }

    pub fn resize(&self, events: &EventRouter, width: i32, height: i32, edge_mask: u8) {
        self.state
            .write()
            .unwrap()
            .target_region_mut()
            .set_size(width, height);
        events.surface_resize(self.client, self.id, width, height, edge_mask);
    }

    pub fn set_input_region(&self, x: i32, y: i32, width: i32, height: i32) {
        let mut state = self.state.write().unwrap();
        state.pending.input_region.zero();
        state.pending.input_region.add(x, y, width, height);
    }

    pub fn set_drop_shadow(&self, x: i32, y: i32, width: i32, height: i32) {
        let mut state = self.state.write().unwrap();
        state.pending.drop_shadow.zero();
        state.pending.drop_shadow.add(x, y, width, height);
    }

    pub fn set_transparency(&self, enable: bool) {
        self.state.write().unwrap().pending.transparent = enable;
    }

    pub fn set_corner_radius(&self, radius: i32) {
        self.state.write().unwrap().pending.corner_radius = radius;
    }

    pub fn request_frame(&self) {
        self.frame_requested.store(true, Ordering::Release);
    }

    /// Accumulates `dirt`; a zero-sized rect leaves it untouched.
    pub fn invalidate(&self, x: i32, y: i32, width: i32, height: i32) {
        self.dirt.lock().unwrap().add(x, y, width, height);
    }

    /// Promotes pending state to active: rotates the backbuffer if one was
    /// staged, copies the scalar properties, splices staged children onto
    /// the active list, and recomputes visibility.
    ///
    /// Returns the new visibility if it changed, for the caller to feed the
    /// window manager's focus bookkeeping.
    pub fn commit(&self) -> Option<bool> {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;

        if state.swap_requested {
            state.front ^= 1;
            state.swap_requested = false;
        }

        state.active.border_width = state.pending.border_width;
        state.active.border_color = state.pending.border_color;
        state.active.corner_radius = state.pending.corner_radius;
        state.active.transparent = state.pending.transparent;
        state.active.drop_shadow = state.pending.drop_shadow;
        state.active.input_region = state.pending.input_region;
        state.active.children.append(&mut state.pending.children);

        let was_visible = state.visible;
        state.visible = state.backbuffers[state.front].content.is_some();
        let visible = state.visible;

        (was_visible != visible).then_some(visible)
    }

    /// Attaches `child` at `(x, y)` in parent coordinates. The parent edge
    /// is eager; the child joins the draw list at the parent's next commit.
    pub fn add_child(self: &Arc<Self>, child: &Arc<Surface>, x: i32, y: i32) -> Result<()> {
        ensure!(child.parent().is_none(), "surface {} already has a parent", child.id);

        child.state.write().unwrap().parent = Some(Arc::downgrade(self));
        self.state
            .write()
            .unwrap()
            .pending
            .children
            .push(child.clone());
        child.set_position(x, y);
        Ok(())
    }

    pub(crate) fn remove_child(&self, child: &Arc<Surface>) {
        let mut state = self.state.write().unwrap();
        state
            .active
            .children
            .retain(|entry| !Arc::ptr_eq(entry, child));
        state
            .pending
            .children
            .retain(|entry| !Arc::ptr_eq(entry, child));
    }

    pub(crate) fn make_orphan(&self) {
        self.state.write().unwrap().parent = None;
    }

    /// Detaches every child, leaving them allocated but parentless.
    pub(crate) fn orphan_children(&self) {
        let children = {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;
            let mut children = std::mem::take(&mut state.active.children);
            children.append(&mut state.pending.children);
            children
        };
        for child in children {
            child.make_orphan();
        }
    }

    /// Maximizes to the parent's region, or the screen for roots. The
    /// previous geometry is kept for `restore_size`.
    pub fn maximize(self: &Arc<Self>, events: &EventRouter, screen_region: Region) {
        let target = match self.parent() {
            Some(parent) => parent.region(),
            None => screen_region,
        };

        {
            let mut state = self.state.write().unwrap();
            if state.saved_dimensions.is_none() {
                state.saved_dimensions = Some(state.dimensions);
            }
            state.dimensions = target;
        }

        events.surface_resize(self.client, self.id, target.width, target.height, edges::NO_EDGES);
    }

    pub fn restore_size(&self, events: &EventRouter) {
        let restored = {
            let mut state = self.state.write().unwrap();
            if let Some(saved) = state.saved_dimensions.take() {
                state.dimensions = saved;
            }
            state.dimensions
        };

        events.surface_resize(
            self.client,
            self.id,
            restored.width,
            restored.height,
            edges::NO_EDGES,
        );
    }

    /// `restore_size` without the resize event; used during teardown.
    pub(crate) fn restore_saved(&self) {
        let mut state = self.state.write().unwrap();
        if let Some(saved) = state.saved_dimensions.take() {
            state.dimensions = saved;
        }
    }

    /// Geometric containment over the active (visible) state.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let state = self.state.read().unwrap();
        state.visible && state.dimensions.contains(x, y)
    }

    /// Whether the point (surface-local) falls in the active input region.
    pub fn supports_input(&self, x: i32, y: i32) -> bool {
        let state = self.state.read().unwrap();
        state.visible && state.active.input_region.contains(x, y)
    }

    /// Deepest visible surface under `(x, y)` (parent coordinates), with
    /// the hit translated into that surface's local coordinates. Children
    /// are probed topmost-first.
    pub fn at(self: &Arc<Self>, x: i32, y: i32) -> Option<(Arc<Surface>, i32, i32)> {
        let state = self.state.read().unwrap();
        if !state.visible || !state.dimensions.contains(x, y) {
            return None;
        }

        let local_x = x - state.dimensions.x;
        let local_y = y - state.dimensions.y;
        for child in state.active.children.iter().rev() {
            if let Some(hit) = child.at(local_x, local_y) {
                return Some(hit);
            }
        }
        Some((self.clone(), local_x, local_y))
    }

    /// Per-frame update and draw, called by the renderer under the manager
    /// read-lock. Uploads accumulated dirt (acknowledged to the client with
    /// a buffer release), emits a pending frame callback, then draws shadow,
    /// content and children at the surface's translation.
    pub fn render(self: &Arc<Self>, driver: &mut dyn RenderDriver, events: &EventRouter) {
        let state = self.state.read().unwrap();
        if !state.visible {
            return;
        }

        let front = &state.backbuffers[state.front];
        {
            let mut dirt = self.dirt.lock().unwrap();
            if !dirt.is_zero() {
                if let (Some(buffer), Some(texture)) = (&front.content, front.texture) {
                    match driver.update_texture(texture, buffer.bytes()) {
                        Ok(()) => events.buffer_release(self.client, buffer.id()),
                        // The stale texture keeps rendering; the client will
                        // not see a release for this damage.
                        Err(e) => warn!("content upload for surface {} failed: {e:?}", self.id),
                    }
                }
                dirt.zero();
            }
        }

        if self.frame_requested.swap(false, Ordering::AcqRel) {
            events.surface_frame(self.client, self.id);
        }

        driver.save();
        driver.translate(state.dimensions.x, state.dimensions.y);
        driver.set_blend(if state.active.transparent {
            BlendMode::AlphaOver
        } else {
            BlendMode::Replace
        });

        if let Some(texture) = front.texture {
            if !state.active.drop_shadow.is_zero() {
                driver.draw_shadow(
                    state.active.drop_shadow,
                    state.dimensions.width,
                    state.dimensions.height,
                    state.active.corner_radius,
                );
            }
            driver.draw_texture(texture, state.dimensions.width, state.dimensions.height);
        }

        for child in &state.active.children {
            child.render(driver, events);
        }
        driver.restore();
    }

    /// Releases any backbuffer whose client destroyed the buffer while it
    /// was attached. Returns the number reaped and whether the surface went
    /// invisible as a result. Render-thread only.
    pub fn reap_zombies(self: &Arc<Self>, driver: &mut dyn RenderDriver) -> (usize, bool) {
        let mut reaped = 0;
        let (hidden, children) = {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;

            for slot in &mut state.backbuffers {
                if slot.content.as_ref().is_some_and(|buffer| buffer.is_zombie()) {
                    if let Some(texture) = slot.texture.take() {
                        driver.destroy_texture(texture);
                    }
                    slot.content = None;
                    reaped += 1;
                }
            }

            let was_visible = state.visible;
            state.visible = state.backbuffers[state.front].content.is_some();
            (
                was_visible && !state.visible,
                state.active.children.clone(),
            )
        };

        for child in &children {
            let (count, _) = child.reap_zombies(driver);
            reaped += count;
        }
        (reaped, hidden)
    }

    /// Drops both backbuffers and their textures; the final step of
    /// destruction.
    pub(crate) fn release_backbuffers(&self, renderer: &Renderer) {
        let slots = {
            let mut state = self.state.write().unwrap();
            state.visible = false;
            std::mem::take(&mut state.backbuffers)
        };
        for slot in slots {
            if let Some(texture) = slot.texture {
                renderer.destroy_texture(texture);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::backend::headless::HeadlessDriver;
    use crate::server::memory::HeapSource;
    use crate::server::memory::MemoryPool;
    use crate::server::memory::SegmentSource;
    use crate::server::renderer::Renderer;

    fn test_renderer() -> (Arc<Renderer>, crate::server::backend::headless::DriverProbe) {
        let (driver, probe) = HeadlessDriver::new();
        (
            Arc::new(Renderer::new(
                Box::new(driver),
                Region::with_size(640, 320),
            )),
            probe,
        )
    }

    fn test_buffer(id: u32) -> Arc<Buffer> {
        let segment = HeapSource::new().attach(id as u64, 65536).unwrap();
        let pool = Arc::new(MemoryPool::new(ClientId(1), ObjectId(90 + id), id as u64, segment));
        Buffer::new(
            ObjectId(id),
            pool,
            0,
            64,
            64,
            256,
            crate::protocol::PixelFormat::Argb32,
            0,
        )
        .unwrap()
    }

    #[test]
    fn invisible_until_commit() {
        let (renderer, _probe) = test_renderer();
        let surface = Surface::new(ClientId(1), ObjectId(1), 0, 0, 64, 64);

        surface.set_buffer(&renderer, Some(test_buffer(1))).unwrap();
        assert!(!surface.visible());

        assert_eq!(surface.commit(), Some(true));
        assert!(surface.visible());
    }

    #[test]
    fn commit_without_swap_keeps_front_buffer() {
        let (renderer, _probe) = test_renderer();
        let surface = Surface::new(ClientId(1), ObjectId(1), 0, 0, 64, 64);

        surface.set_buffer(&renderer, Some(test_buffer(1))).unwrap();
        surface.commit();
        let front_before = surface.state.read().unwrap().front;

        // A commit with nothing staged must not rotate.
        assert_eq!(surface.commit(), None);
        assert_eq!(surface.state.read().unwrap().front, front_before);
    }

    #[test]
    fn properties_are_deferred_position_is_eager() {
        let (_renderer, _probe) = test_renderer();
        let surface = Surface::new(ClientId(1), ObjectId(1), 10, 10, 64, 64);

        surface.set_input_region(0, 0, 64, 64);
        assert!(surface.state.read().unwrap().active.input_region.is_zero());

        surface.set_position(50, 60);
        assert_eq!(surface.region().x, 50);
        assert_eq!(surface.region().y, 60);

        surface.commit();
        assert!(!surface.state.read().unwrap().active.input_region.is_zero());
    }

    #[test]
    fn restaging_same_buffer_keeps_one_reference() {
        let (renderer, _probe) = test_renderer();
        let surface = Surface::new(ClientId(1), ObjectId(1), 0, 0, 64, 64);
        let buffer = test_buffer(1);

        surface.set_buffer(&renderer, Some(buffer.clone())).unwrap();
        surface.set_buffer(&renderer, Some(buffer.clone())).unwrap();
        surface.commit();

        // One reference here, one on the surface.
        assert_eq!(Arc::strong_count(&buffer), 2);
    }

    #[test]
    fn maximize_restore_roundtrips() {
        let (_renderer, _probe) = test_renderer();
        let events = EventRouter::new();
        let surface = Surface::new(ClientId(1), ObjectId(1), 30, 40, 100, 80);

        surface.maximize(&events, Region::with_size(640, 320));
        assert!(surface.is_maximized());
        assert_eq!(surface.region(), Region::with_size(640, 320));

        // Geometry requests while maximized retarget the saved region.
        surface.move_by(5, 5);
        assert_eq!(surface.region(), Region::with_size(640, 320));

        surface.restore_size(&events);
        assert!(!surface.is_maximized());
        assert_eq!(surface.region(), Region::new(35, 45, 100, 80));
    }

    #[test]
    fn child_maximize_targets_parent() {
        let (_renderer, _probe) = test_renderer();
        let events = EventRouter::new();
        let parent = Surface::new(ClientId(1), ObjectId(1), 100, 100, 200, 200);
        let child = Surface::new(ClientId(1), ObjectId(2), 0, 0, 50, 50);
        parent.add_child(&child, 10, 10).unwrap();

        child.maximize(&events, Region::with_size(640, 320));
        assert_eq!(child.region(), parent.region());
    }

    #[test]
    fn children_splice_on_commit_and_hit_topmost_first() {
        let (renderer, _probe) = test_renderer();
        let root = Surface::new(ClientId(1), ObjectId(1), 0, 0, 200, 200);
        let a = Surface::new(ClientId(1), ObjectId(2), 0, 0, 50, 50);
        let b = Surface::new(ClientId(1), ObjectId(3), 25, 25, 50, 50);

        for surface in [&root, &a, &b] {
            surface
                .set_buffer(&renderer, Some(test_buffer(surface.id().0)))
                .unwrap();
            surface.commit();
        }

        root.add_child(&a, 0, 0).unwrap();
        root.add_child(&b, 25, 25).unwrap();

        // Staged children are not hit until the parent commits.
        let (hit, _, _) = root.at(30, 30).unwrap();
        assert!(Arc::ptr_eq(&hit, &root));

        root.commit();
        let (hit, local_x, local_y) = root.at(30, 30).unwrap();
        assert!(Arc::ptr_eq(&hit, &b));
        assert_eq!((local_x, local_y), (5, 5));

        // Outside B but inside A.
        let (hit, _, _) = root.at(10, 10).unwrap();
        assert!(Arc::ptr_eq(&hit, &a));
    }

    #[test]
    fn add_child_then_destroy_restores_children() {
        let (_renderer, _probe) = test_renderer();
        let parent = Surface::new(ClientId(1), ObjectId(1), 0, 0, 200, 200);
        let child = Surface::new(ClientId(1), ObjectId(2), 0, 0, 50, 50);

        parent.add_child(&child, 0, 0).unwrap();
        parent.commit();
        assert_eq!(parent.state.read().unwrap().active.children.len(), 1);

        parent.remove_child(&child);
        child.make_orphan();
        assert!(parent.state.read().unwrap().active.children.is_empty());
        assert!(parent.state.read().unwrap().pending.children.is_empty());
        assert!(child.parent().is_none());
    }

    #[test]
    fn second_parent_is_rejected() {
        let (_renderer, _probe) = test_renderer();
        let p1 = Surface::new(ClientId(1), ObjectId(1), 0, 0, 100, 100);
        let p2 = Surface::new(ClientId(1), ObjectId(2), 0, 0, 100, 100);
        let child = Surface::new(ClientId(1), ObjectId(3), 0, 0, 50, 50);

        p1.add_child(&child, 0, 0).unwrap();
        assert!(p2.add_child(&child, 0, 0).is_err());
    }

    #[test]
    fn zero_sized_invalidate_does_not_upload() {
        let (renderer, probe) = test_renderer();
        let events = EventRouter::new();
        let surface = Surface::new(ClientId(1), ObjectId(1), 0, 0, 64, 64);
        surface.set_buffer(&renderer, Some(test_buffer(1))).unwrap();
        surface.commit();

        surface.invalidate(0, 0, 0, 0);
        renderer.render_surface_for_test(&surface, &events);
        assert_eq!(probe.update_count(), 0);

        surface.invalidate(0, 0, 64, 64);
        renderer.render_surface_for_test(&surface, &events);
        assert_eq!(probe.update_count(), 1);
    }
}
