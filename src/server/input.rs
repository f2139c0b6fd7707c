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

//! Input sources and the pointer state machine.
//!
//! One source per device. Pointers run a four-state machine (normal,
//! resizing, moving, grabbed); every axis delta is clamped to the screen
//! before any handler sees it, and the bus's Y-down convention is flipped
//! on entry. Keyboards route to the focused surface unless hooked.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::prelude::*;
use crate::protocol::ObjectId;
use crate::region::Region;
use crate::server::events::EventRouter;
use crate::server::manager::WindowManager;
use crate::server::registry::ObjectPayload;
use crate::server::registry::ObjectRegistry;
use crate::server::renderer::Renderer;
use crate::server::surface::Surface;

pub type DeviceId = u32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InputKind {
    Pointer,
    Keyboard,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PointerMode {
    Normal,
    Resizing,
    Moving,
    Grabbed,
}

struct PointerState {
    x: i32,
    y: i32,
    z: i32,
    mode: PointerMode,
    edge_mask: u8,
    /// The surface pinned by the current mode: the hover target in normal
    /// mode, the dragged/grabbed surface otherwise.
    mode_surface: Option<Arc<Surface>>,
    /// Client-provided cursor image riding the pointer.
    cursor_surface: Option<Arc<Surface>>,
}

struct KeyboardState {
    hooked: Option<Arc<Surface>>,
}

enum SourceState {
    Pointer(Mutex<PointerState>),
    Keyboard(Mutex<KeyboardState>),
}

pub struct InputSource {
    device: DeviceId,
    global_id: AtomicU32,
    state: SourceState,
}

impl InputSource {
    fn new_pointer(device: DeviceId, screen: Region) -> Self {
        Self {
            device,
            global_id: AtomicU32::new(0),
            state: SourceState::Pointer(Mutex::new(PointerState {
                x: screen.width / 2,
                y: screen.height / 2,
                z: 0,
                mode: PointerMode::Normal,
                edge_mask: 0,
                mode_surface: None,
                cursor_surface: None,
            })),
        }
    }

    fn new_keyboard(device: DeviceId) -> Self {
        Self {
            device,
            global_id: AtomicU32::new(0),
            state: SourceState::Keyboard(Mutex::new(KeyboardState { hooked: None })),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn kind(&self) -> InputKind {
        match self.state {
            SourceState::Pointer(_) => InputKind::Pointer,
            SourceState::Keyboard(_) => InputKind::Keyboard,
        }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId(self.global_id.load(Ordering::Acquire))
    }

    fn pointer(&self) -> Option<&Mutex<PointerState>> {
        match &self.state {
            SourceState::Pointer(state) => Some(state),
            SourceState::Keyboard(_) => None,
        }
    }

    pub fn position(&self) -> Option<(i32, i32)> {
        let state = self.pointer()?.lock().unwrap();
        Some((state.x, state.y))
    }

    pub fn mode(&self) -> Option<PointerMode> {
        Some(self.pointer()?.lock().unwrap().mode)
    }
}

pub struct Input {
    sources: RwLock<Vec<Arc<InputSource>>>,
    manager: Arc<WindowManager>,
    events: Arc<EventRouter>,
    renderer: Arc<Renderer>,
    screen: Region,
}

impl Input {
    pub fn new(
        manager: Arc<WindowManager>,
        events: Arc<EventRouter>,
        renderer: Arc<Renderer>,
    ) -> Self {
        let screen = renderer.screen_region();
        Self {
            sources: RwLock::new(Vec::new()),
            manager,
            events,
            renderer,
            screen,
        }
    }

    /// Creates a source for a device and publishes it as a server object.
    /// Pointers start centered on the screen.
    pub fn register_device(
        &self,
        registry: &ObjectRegistry,
        kind: InputKind,
        device: DeviceId,
    ) -> Arc<InputSource> {
        let source = Arc::new(match kind {
            InputKind::Pointer => InputSource::new_pointer(device, self.screen),
            InputKind::Keyboard => InputSource::new_keyboard(device),
        });

        let global_id = registry.register_server(ObjectPayload::Input(source.clone()));
        source.global_id.store(global_id.0, Ordering::Release);

        info!("registered {kind:?} source {global_id} for device {device}");
        self.sources.write().unwrap().push(source.clone());
        source
    }

    /// Removes a device's source: any attached cursor surface is demoted
    /// and the server object withdrawn.
    pub fn unregister_device(&self, registry: &ObjectRegistry, device: DeviceId) {
        let Some(source) = self.take_source(device) else {
            return;
        };

        if let Some(pointer) = source.pointer() {
            let cursor = pointer.lock().unwrap().cursor_surface.take();
            if let Some(cursor) = cursor {
                self.manager.demote_cursor(&cursor);
            }
        }
        registry.remove(crate::protocol::ClientId(0), source.id());
    }

    fn take_source(&self, device: DeviceId) -> Option<Arc<InputSource>> {
        let mut sources = self.sources.write().unwrap();
        let position = sources.iter().position(|source| source.device() == device)?;
        Some(sources.remove(position))
    }

    pub fn source_for_device(&self, device: DeviceId) -> Option<Arc<InputSource>> {
        self.sources
            .read()
            .unwrap()
            .iter()
            .find(|source| source.device() == device)
            .cloned()
    }

    /// Attaches (or detaches, with `None`) a cursor image to a pointer.
    /// Re-attaching the current surface only repositions it; switching
    /// hides the old image and promotes the new one to the cursor band.
    pub fn set_cursor_surface(
        &self,
        source: &InputSource,
        surface: Option<Arc<Surface>>,
        x_offset: i32,
        y_offset: i32,
    ) {
        let Some(pointer) = source.pointer() else {
            return;
        };

        let mut state = pointer.lock().unwrap();
        let (x, y) = (state.x, state.y);

        if let (Some(new), Some(current)) = (&surface, &state.cursor_surface) {
            if Arc::ptr_eq(new, current) {
                current.move_absolute(x + x_offset, y + y_offset);
                return;
            }
        }

        if let Some(old) = state.cursor_surface.take() {
            // Hide the detached image so it doesn't float around.
            self.manager.demote_cursor(&old);
            old.set_buffer(&self.renderer, None).log(loc!()).ok();
            old.commit();
        }

        if let Some(new) = &surface {
            self.manager.promote_cursor(new);
            new.move_absolute(x + x_offset, y + y_offset);
        }

        state.cursor_surface = surface;
    }

    /// Arms an interactive resize. Ignored unless the pointer is idle over
    /// the (unmaximized) surface; denying mid-gesture requests preserves
    /// whatever gesture is running.
    pub fn request_resize(&self, source: &InputSource, surface: &Arc<Surface>, edge_mask: u8) {
        let Some(pointer) = source.pointer() else {
            return;
        };
        let mut state = pointer.lock().unwrap();

        if state.mode != PointerMode::Normal {
            return;
        }
        if surface.is_maximized() || !surface.contains(state.x, state.y) {
            return;
        }

        state.mode_surface = Some(surface.clone());
        state.mode = PointerMode::Resizing;
        state.edge_mask = edge_mask;
    }

    pub fn request_move(&self, source: &InputSource, surface: &Arc<Surface>) {
        let Some(pointer) = source.pointer() else {
            return;
        };
        let mut state = pointer.lock().unwrap();

        if state.mode != PointerMode::Normal {
            return;
        }
        if surface.is_maximized() || !surface.contains(state.x, state.y) {
            return;
        }

        state.mode_surface = Some(surface.clone());
        state.mode = PointerMode::Moving;
    }

    /// Pins the pointer to `surface` and warps it to the surface's center;
    /// all motion is reported to that surface as relative deltas until
    /// ungrab. For keyboards this hooks key routing to the surface.
    pub fn grab(&self, source: &InputSource, surface: &Arc<Surface>) {
        match &source.state {
            SourceState::Pointer(pointer) => {
                let mut state = pointer.lock().unwrap();
                if state.mode != PointerMode::Normal {
                    return;
                }
                if !surface.contains(state.x, state.y) {
                    return;
                }

                let region = surface.region();
                state.mode_surface = Some(surface.clone());
                state.mode = PointerMode::Grabbed;
                state.x = region.x + region.width / 2;
                state.y = region.y + region.height / 2;
            },
            SourceState::Keyboard(keyboard) => {
                keyboard.lock().unwrap().hooked = Some(surface.clone());
            },
        }
    }

    pub fn ungrab(&self, source: &InputSource, surface: &Arc<Surface>) {
        match &source.state {
            SourceState::Pointer(pointer) => {
                let mut state = pointer.lock().unwrap();
                if state.mode != PointerMode::Grabbed {
                    return;
                }
                if state
                    .mode_surface
                    .as_ref()
                    .is_none_or(|pinned| !Arc::ptr_eq(pinned, surface))
                {
                    return;
                }
                state.mode = PointerMode::Normal;
                state.mode_surface = None;
            },
            SourceState::Keyboard(keyboard) => {
                let mut state = keyboard.lock().unwrap();
                if state
                    .hooked
                    .as_ref()
                    .is_some_and(|hooked| Arc::ptr_eq(hooked, surface))
                {
                    state.hooked = None;
                }
            },
        }
    }

    /// Clears every reference to a dying surface: pointers pinned to it
    /// return to normal before its destruction proceeds.
    pub fn on_surface_destroy(&self, surface: &Arc<Surface>) {
        let sources = self.sources.read().unwrap();
        for source in sources.iter() {
            match &source.state {
                SourceState::Pointer(pointer) => {
                    let mut state = pointer.lock().unwrap();
                    if state
                        .mode_surface
                        .as_ref()
                        .is_some_and(|pinned| Arc::ptr_eq(pinned, surface))
                    {
                        state.mode = PointerMode::Normal;
                        state.mode_surface = None;
                    }
                    if state
                        .cursor_surface
                        .as_ref()
                        .is_some_and(|cursor| Arc::ptr_eq(cursor, surface))
                    {
                        state.cursor_surface = None;
                    }
                },
                SourceState::Keyboard(keyboard) => {
                    let mut state = keyboard.lock().unwrap();
                    if state
                        .hooked
                        .as_ref()
                        .is_some_and(|hooked| Arc::ptr_eq(hooked, surface))
                    {
                        state.hooked = None;
                    }
                },
            }
        }
    }

    /// Axis motion from the input bus. `dy` arrives Y-down and is negated;
    /// both deltas are clamped so the position cannot leave the screen.
    pub fn axis_event(&self, device: DeviceId, dx: i32, dy: i32, dz: i32) {
        let Some(source) = self.source_for_device(device) else {
            warn!("axis event for unknown device {device}");
            return;
        };
        let Some(pointer) = source.pointer() else {
            return;
        };

        let mut state = pointer.lock().unwrap();
        let dy = -dy;
        let clamped_x = Region::clamp_delta(state.x, dx, self.screen.x, self.screen.x + self.screen.width);
        let clamped_y = Region::clamp_delta(state.y, dy, self.screen.y, self.screen.y + self.screen.height);

        match state.mode {
            PointerMode::Normal => self.normal_motion(&source, &mut state, clamped_x, clamped_y, dz),
            PointerMode::Resizing => self.resize_motion(&mut state, clamped_x, clamped_y),
            PointerMode::Moving => self.move_motion(&mut state, clamped_x, clamped_y),
            PointerMode::Grabbed => self.grabbed_motion(&source, &mut state, clamped_x, clamped_y, dz),
        }
    }

    fn move_cursor(state: &mut PointerState, dx: i32, dy: i32) {
        if let Some(cursor) = &state.cursor_surface {
            cursor.move_by(dx, dy);
        }
    }

    fn normal_motion(
        &self,
        source: &InputSource,
        state: &mut PointerState,
        dx: i32,
        dy: i32,
        dz: i32,
    ) {
        let previous = state.mode_surface.clone();
        let hit = self.manager.surface_at(state.x + dx, state.y + dy);
        let send_updates = hit
            .as_ref()
            .is_some_and(|(surface, local_x, local_y)| surface.supports_input(*local_x, *local_y));

        state.x += dx;
        state.y += dy;
        state.z += dz;
        Self::move_cursor(state, dx, dy);

        let hovered = match (previous, hit) {
            (previous, Some((surface, local_x, local_y))) => {
                let changed = previous
                    .as_ref()
                    .is_none_or(|old| !Arc::ptr_eq(old, &surface));
                if changed {
                    if let Some(old) = previous {
                        self.events.pointer_leave(old.client(), source.id(), old.id());
                    }
                    if !send_updates {
                        state.mode_surface = None;
                        return;
                    }
                    state.mode_surface = Some(surface.clone());
                    self.events.pointer_enter(
                        surface.client(),
                        source.id(),
                        surface.id(),
                        local_x,
                        local_y,
                    );
                } else if send_updates {
                    self.events.pointer_move(
                        surface.client(),
                        source.id(),
                        surface.id(),
                        local_x,
                        local_y,
                    );
                }
                Some(surface)
            },
            (Some(old), None) => {
                self.events.pointer_leave(old.client(), source.id(), old.id());
                state.mode_surface = None;
                None
            },
            (None, None) => None,
        };

        if dz != 0 && send_updates {
            if let Some(surface) = hovered {
                self.events
                    .pointer_scroll(surface.client(), source.id(), surface.id(), dz);
            }
        }
    }

    fn resize_motion(&self, state: &mut PointerState, dx: i32, dy: i32) {
        if dx == 0 && dy == 0 {
            return;
        }
        let Some(surface) = state.mode_surface.clone() else {
            return;
        };

        let region = surface.region();
        surface.resize(
            &self.events,
            region.width + dx,
            region.height + dy,
            state.edge_mask,
        );

        state.x += dx;
        state.y += dy;
        Self::move_cursor(state, dx, dy);
    }

    fn move_motion(&self, state: &mut PointerState, dx: i32, dy: i32) {
        if dx == 0 && dy == 0 {
            return;
        }
        if let Some(surface) = &state.mode_surface {
            surface.move_by(dx, dy);
        }

        state.x += dx;
        state.y += dy;
        Self::move_cursor(state, dx, dy);
    }

    /// Grabbed pointers never move or re-hit-test; the pinned surface gets
    /// the raw (clamped) deltas.
    fn grabbed_motion(
        &self,
        source: &InputSource,
        state: &mut PointerState,
        dx: i32,
        dy: i32,
        dz: i32,
    ) {
        let Some(surface) = &state.mode_surface else {
            return;
        };
        self.events
            .pointer_move(surface.client(), source.id(), surface.id(), dx, dy);
        if dz != 0 {
            self.events
                .pointer_scroll(surface.client(), source.id(), surface.id(), dz);
        }
        state.z += dz;
    }

    /// Button input. Pointer buttons feed the state machine; keyboard keys
    /// route to the hooked surface if any, otherwise the focused one, and
    /// are dropped when nothing is focused.
    pub fn button_event(&self, device: DeviceId, code: u32, pressed: bool, modifier_mask: u16) {
        let Some(source) = self.source_for_device(device) else {
            warn!("button event for unknown device {device}");
            return;
        };

        match &source.state {
            SourceState::Pointer(pointer) => {
                let mut state = pointer.lock().unwrap();
                match state.mode {
                    PointerMode::Normal | PointerMode::Grabbed => {
                        self.normal_click(&source, &mut state, code, pressed);
                    },
                    PointerMode::Resizing | PointerMode::Moving => {
                        // Left release ends the gesture.
                        if code == 0 && !pressed {
                            state.mode = PointerMode::Normal;
                            state.mode_surface = None;
                        }
                    },
                }
            },
            SourceState::Keyboard(keyboard) => {
                let hooked = keyboard.lock().unwrap().hooked.clone();
                let target = hooked.or_else(|| self.manager.focused());
                match target {
                    Some(surface) => {
                        self.events
                            .keyboard_key(surface.client(), surface.id(), code, modifier_mask);
                    },
                    None => debug!("dropping key {code}: no focused surface"),
                }
            },
        }
    }

    fn normal_click(
        &self,
        source: &InputSource,
        state: &mut PointerState,
        button: u32,
        pressed: bool,
    ) {
        let mut send_click = true;
        let clicked = match state.mode_surface.clone() {
            Some(surface) => Some(surface),
            None => {
                // The pointer may sit over a surface it never entered (e.g.
                // one that appeared underneath it); enter on demand.
                let hit = self.manager.surface_at(state.x, state.y);
                match hit {
                    Some((surface, local_x, local_y)) => {
                        send_click = surface.supports_input(local_x, local_y);
                        if send_click {
                            state.mode_surface = Some(surface.clone());
                            self.events.pointer_enter(
                                surface.client(),
                                source.id(),
                                surface.id(),
                                local_x,
                                local_y,
                            );
                        }
                        Some(surface)
                    },
                    None => {
                        send_click = false;
                        None
                    },
                }
            },
        };

        self.manager.focus(clicked.as_ref());

        if send_click {
            if let Some(surface) = clicked {
                self.events.pointer_click(
                    surface.client(),
                    source.id(),
                    surface.id(),
                    button,
                    pressed,
                );
            }
        }
    }
}
