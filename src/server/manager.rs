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

//! The window manager: root surfaces ordered within four z-bands, focus
//! tracking, and z-order-correct hit-testing. A single rw-lock guards the
//! level lists and the focused pointer; focus events are emitted only after
//! it is released.

use std::sync::Arc;
use std::sync::RwLock;

use itertools::Itertools;

use crate::prelude::*;
use crate::protocol::ClientId;
use crate::server::events::EventRouter;
use crate::server::surface::Surface;

pub const LEVEL_COUNT: usize = 4;
pub const LEVEL_BOTTOM: usize = 0;
pub const LEVEL_DEFAULT: usize = 1;
pub const LEVEL_TOP: usize = 2;
/// Reserved for cursor surfaces; skipped by hit-testing and unreachable
/// through `change_level`.
pub const LEVEL_CURSOR: usize = LEVEL_COUNT - 1;

#[derive(Default)]
struct ManagerState {
    /// Per-level draw lists; append order is z-order within a level.
    levels: [Vec<Arc<Surface>>; LEVEL_COUNT],
    focused: Option<Arc<Surface>>,
}

impl ManagerState {
    fn remove(&mut self, surface: &Arc<Surface>) {
        for level in &mut self.levels {
            level.retain(|entry| !Arc::ptr_eq(entry, surface));
        }
    }

    /// Picks the topmost visible default-level surface, or nothing.
    fn focus_top_surface(&mut self) {
        self.focused = self.levels[LEVEL_DEFAULT]
            .iter()
            .rev()
            .find(|surface| surface.visible())
            .cloned();
    }
}

pub struct WindowManager {
    state: RwLock<ManagerState>,
    events: Arc<EventRouter>,
}

impl WindowManager {
    pub fn new(events: Arc<EventRouter>) -> Self {
        Self {
            state: RwLock::new(ManagerState::default()),
            events,
        }
    }

    pub fn register(&self, surface: &Arc<Surface>) {
        let level = surface.level();
        self.state.write().unwrap().levels[level].push(surface.clone());
    }

    pub fn unregister(&self, surface: &Arc<Surface>) {
        let mut state = self.state.write().unwrap();
        state.remove(surface);
        if state
            .focused
            .as_ref()
            .is_some_and(|focused| Arc::ptr_eq(focused, surface))
        {
            state.focus_top_surface();
        }
    }

    /// Atomic relocate between z-bands. The cursor band is only reachable
    /// through `promote_cursor`.
    pub fn change_level(&self, surface: &Arc<Surface>, level: usize) {
        if level >= LEVEL_CURSOR {
            return;
        }
        self.relocate(surface, level);
    }

    pub fn promote_cursor(&self, surface: &Arc<Surface>) {
        self.relocate(surface, LEVEL_CURSOR);
    }

    pub fn demote_cursor(&self, surface: &Arc<Surface>) {
        self.relocate(surface, LEVEL_DEFAULT);
    }

    fn relocate(&self, surface: &Arc<Surface>, level: usize) {
        let mut state = self.state.write().unwrap();
        let registered = state
            .levels
            .iter()
            .flatten()
            .any(|entry| Arc::ptr_eq(entry, surface));
        if !registered {
            return;
        }
        state.remove(surface);
        state.levels[level].push(surface.clone());
        drop(state);
        surface.set_level(level);
    }

    /// Z-order-correct hit test: levels from just below the cursor band
    /// down to the bottom, topmost-first within each level. Returns the
    /// deepest surface and the hit in its local coordinates.
    pub fn surface_at(&self, x: i32, y: i32) -> Option<(Arc<Surface>, i32, i32)> {
        let state = self.state.read().unwrap();
        (0..LEVEL_CURSOR)
            .rev()
            .flat_map(|level| state.levels[level].iter().rev())
            .find_map(|surface| surface.at(x, y))
    }

    pub fn focused(&self) -> Option<Arc<Surface>> {
        self.state.read().unwrap().focused.clone()
    }

    /// Moves focus, raising the new focus's root to the top of its band
    /// (unless it shares a root with the old focus). `None` clears focus.
    /// A parent counts as focused while any of its children are.
    pub fn focus(&self, surface: Option<&Arc<Surface>>) {
        let mut entering = surface.cloned();
        let leaving;

        {
            let mut state = self.state.write().unwrap();
            let already_focused = match (&entering, &state.focused) {
                (Some(new), Some(old)) => Arc::ptr_eq(new, old),
                (None, None) => true,
                _ => false,
            };
            if already_focused {
                return;
            }

            leaving = state.focused.clone();
            state.focused = entering.clone();

            if let Some(new) = &entering {
                let root = new.root();
                let old_root = leaving.as_ref().map(|old| old.root());
                if old_root.is_none_or(|old_root| !Arc::ptr_eq(&old_root, &root)) {
                    let level = root.level();
                    if let Some((position, _)) = state.levels[level]
                        .iter()
                        .find_position(|entry| Arc::ptr_eq(entry, &root))
                    {
                        let raised = state.levels[level].remove(position);
                        state.levels[level].push(raised);
                    } else {
                        // Focus of a surface the manager does not know.
                        warn!("focused surface {} has an unregistered root", new.id());
                        state.focused = None;
                        entering = None;
                    }
                }
            }
        }

        if let Some(old) = leaving {
            self.events.surface_focus(old.client(), old.id(), false);
        }
        if let Some(new) = entering {
            self.events.surface_focus(new.client(), new.id(), true);
        }
    }

    /// Client-requested focus; honored only when the requester already owns
    /// the focused surface, silently denied otherwise.
    pub fn request_focus(&self, client: ClientId, surface: &Arc<Surface>) {
        let Some(current) = self.focused() else {
            return;
        };
        if Arc::ptr_eq(&current, surface) || current.client() != client {
            return;
        }
        self.focus(Some(surface));
    }

    /// Focus bookkeeping for a root surface that appeared or disappeared:
    /// newly visible roots take focus; a hidden root that held it (itself
    /// or through a child) passes it to the topmost remaining surface.
    pub fn on_visibility_change(&self, surface: &Arc<Surface>, visible: bool) {
        if visible {
            self.focus(Some(surface));
            return;
        }

        let focused_root = self.focused().map(|focused| focused.root());
        if focused_root.is_some_and(|root| Arc::ptr_eq(&root, surface)) {
            self.state.write().unwrap().focus_top_surface();
        }
    }

    /// Runs `f` over the level lists under the read lock; the renderer's
    /// per-frame traversal.
    pub fn with_levels<T>(&self, f: impl FnOnce(&[Vec<Arc<Surface>>; LEVEL_COUNT]) -> T) -> T {
        let state = self.state.read().unwrap();
        f(&state.levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Event;
    use crate::protocol::ObjectId;
    use crate::region::Region;
    use crate::server::backend::headless::HeadlessDriver;
    use crate::server::memory::Buffer;
    use crate::server::memory::HeapSource;
    use crate::server::memory::MemoryPool;
    use crate::server::memory::SegmentSource;
    use crate::server::renderer::Renderer;

    fn test_renderer() -> Renderer {
        let (driver, _probe) = HeadlessDriver::new();
        Renderer::new(Box::new(driver), Region::with_size(640, 320))
    }

    fn visible_surface(renderer: &Renderer, id: u32, x: i32, y: i32, w: i32, h: i32) -> Arc<Surface> {
        let surface = Surface::new(ClientId(1), ObjectId(id), x, y, w, h);

        let segment = HeapSource::new().attach(id as u64, 262144).unwrap();
        let pool = Arc::new(MemoryPool::new(ClientId(1), ObjectId(id + 50), id as u64, segment));
        let buffer = Buffer::new(
            ObjectId(id + 100),
            pool,
            0,
            w.min(64),
            h.min(64),
            4 * w.min(64),
            crate::protocol::PixelFormat::Argb32,
            0,
        )
        .unwrap();
        surface.set_buffer(renderer, Some(buffer)).unwrap();
        surface.set_input_region(0, 0, w, h);
        surface.commit();
        surface
    }

    fn manager_with_router() -> (WindowManager, Arc<EventRouter>) {
        let events = Arc::new(EventRouter::new());
        (WindowManager::new(events.clone()), events)
    }

    #[test]
    fn hit_test_prefers_topmost_level_then_insertion_order() {
        let (manager, _events) = manager_with_router();
        let renderer = test_renderer();
        let below = visible_surface(&renderer, 1, 0, 0, 100, 100);
        let above = visible_surface(&renderer, 2, 50, 50, 100, 100);
        let top_band = visible_surface(&renderer, 3, 0, 0, 40, 40);
        top_band.set_level(LEVEL_TOP);

        manager.register(&below);
        manager.register(&above);
        manager.register(&top_band);

        // Overlap of the two default-level surfaces: later registration wins.
        let (hit, _, _) = manager.surface_at(60, 60).unwrap();
        assert!(Arc::ptr_eq(&hit, &above));

        // The top band beats both.
        let (hit, _, _) = manager.surface_at(10, 10).unwrap();
        assert!(Arc::ptr_eq(&hit, &top_band));

        assert!(manager.surface_at(500, 300).is_none());
    }

    #[test]
    fn surface_at_ignores_the_cursor_level() {
        let (manager, _events) = manager_with_router();
        let renderer = test_renderer();
        let cursor = visible_surface(&renderer, 1, 0, 0, 32, 32);
        manager.register(&cursor);
        manager.promote_cursor(&cursor);

        assert!(manager.surface_at(5, 5).is_none());
        assert_eq!(cursor.level(), LEVEL_CURSOR);

        manager.demote_cursor(&cursor);
        assert_eq!(cursor.level(), LEVEL_DEFAULT);
        assert!(manager.surface_at(5, 5).is_some());
    }

    #[test]
    fn change_level_cannot_reach_the_cursor_band() {
        let (manager, _events) = manager_with_router();
        let renderer = test_renderer();
        let surface = visible_surface(&renderer, 1, 0, 0, 32, 32);
        manager.register(&surface);

        manager.change_level(&surface, LEVEL_CURSOR);
        assert_eq!(surface.level(), LEVEL_DEFAULT);

        manager.change_level(&surface, LEVEL_TOP);
        assert_eq!(surface.level(), LEVEL_TOP);
    }

    #[test]
    fn focus_emits_leave_then_enter_and_raises() {
        let (manager, events) = manager_with_router();
        let renderer = test_renderer();
        let rx = events.register_in_process(ClientId(1));
        let first = visible_surface(&renderer, 1, 0, 0, 100, 100);
        let second = visible_surface(&renderer, 2, 0, 0, 100, 100);
        manager.register(&first);
        manager.register(&second);

        manager.focus(Some(&first));
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::SurfaceFocus {
                id: ObjectId(1),
                focus: true
            }
        );

        manager.focus(Some(&second));
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::SurfaceFocus {
                id: ObjectId(1),
                focus: false
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::SurfaceFocus {
                id: ObjectId(2),
                focus: true
            }
        );

        // Refocusing the focused surface is a no-op.
        manager.focus(Some(&second));
        assert!(rx.try_recv().is_err());

        // `second` was raised above `first`.
        let order = manager.with_levels(|levels| {
            levels[LEVEL_DEFAULT]
                .iter()
                .map(|surface| surface.id().0)
                .collect::<Vec<_>>()
        });
        assert_eq!(order, vec![1, 2]);

        manager.focus(Some(&first));
        let order = manager.with_levels(|levels| {
            levels[LEVEL_DEFAULT]
                .iter()
                .map(|surface| surface.id().0)
                .collect::<Vec<_>>()
        });
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn unregister_refocuses_topmost_visible() {
        let (manager, _events) = manager_with_router();
        let renderer = test_renderer();
        let first = visible_surface(&renderer, 1, 0, 0, 100, 100);
        let second = visible_surface(&renderer, 2, 0, 0, 100, 100);
        manager.register(&first);
        manager.register(&second);
        manager.focus(Some(&second));

        manager.unregister(&second);
        let focused = manager.focused().unwrap();
        assert!(Arc::ptr_eq(&focused, &first));

        manager.unregister(&first);
        assert!(manager.focused().is_none());
    }

    #[test]
    fn request_focus_requires_owning_current_focus() {
        let (manager, _events) = manager_with_router();
        let renderer = test_renderer();
        let owned = visible_surface(&renderer, 1, 0, 0, 100, 100);
        let other = visible_surface(&renderer, 2, 0, 0, 100, 100);
        manager.register(&owned);
        manager.register(&other);

        // No focus yet: denied.
        manager.request_focus(ClientId(1), &other);
        assert!(manager.focused().is_none());

        manager.focus(Some(&owned));
        // Current focus owned by client 1; client 2 is denied.
        manager.request_focus(ClientId(2), &other);
        assert!(Arc::ptr_eq(&manager.focused().unwrap(), &owned));

        // The owner may hand focus over.
        manager.request_focus(ClientId(1), &other);
        assert!(Arc::ptr_eq(&manager.focused().unwrap(), &other));
    }

    #[test]
    fn visibility_grants_and_recovers_focus() {
        let (manager, events) = manager_with_router();
        let renderer = test_renderer();
        let rx = events.register_in_process(ClientId(1));
        let first = visible_surface(&renderer, 1, 0, 0, 100, 100);
        let second = visible_surface(&renderer, 2, 0, 0, 100, 100);
        manager.register(&first);
        manager.register(&second);

        manager.on_visibility_change(&first, true);
        manager.on_visibility_change(&second, true);

        let focus_events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(
            focus_events,
            vec![
                Event::SurfaceFocus {
                    id: ObjectId(1),
                    focus: true
                },
                Event::SurfaceFocus {
                    id: ObjectId(1),
                    focus: false
                },
                Event::SurfaceFocus {
                    id: ObjectId(2),
                    focus: true
                },
            ]
        );

        // Hiding the focused root falls back to the topmost remaining.
        second.set_buffer(&renderer, None).unwrap();
        second.commit();
        manager.on_visibility_change(&second, false);
        assert!(Arc::ptr_eq(&manager.focused().unwrap(), &first));
    }
}
