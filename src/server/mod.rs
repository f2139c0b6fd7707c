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

//! The compositor: wires the registry, window manager, input and renderer
//! together and demultiplexes decoded protocol requests onto them. Lookup
//! misses become `error` events to the requesting client and the request is
//! dropped with state unchanged; nothing a client sends is fatal.

use std::sync::Arc;

use crate::prelude::*;
use crate::protocol::BufferRequest;
use crate::protocol::ClientId;
use crate::protocol::CoreRequest;
use crate::protocol::ErrorCode;
use crate::protocol::FullscreenMode;
use crate::protocol::KeyboardRequest;
use crate::protocol::MemoryPoolRequest;
use crate::protocol::MemoryRequest;
use crate::protocol::ObjectId;
use crate::protocol::ObjectType;
use crate::protocol::PointerRequest;
use crate::protocol::Request;
use crate::protocol::ScreenRequest;
use crate::protocol::SurfaceRequest;
use crate::protocol::Transform;
use crate::protocol::edges;
use crate::protocol::mode_flags;
use crate::protocol::transport::ClientMessage;
use crate::region::Region;
use crate::server::backend::RenderDriver;
use crate::server::events::EventRouter;
use crate::server::input::Input;
use crate::server::input::InputKind;
use crate::server::input::InputSource;
use crate::server::manager::LEVEL_DEFAULT;
use crate::server::manager::LEVEL_TOP;
use crate::server::manager::WindowManager;
use crate::server::memory::Buffer;
use crate::server::memory::MemoryPool;
use crate::server::memory::SegmentSource;
use crate::server::registry::ObjectPayload;
use crate::server::registry::ObjectRegistry;
use crate::server::renderer::Renderer;
use crate::server::surface::Surface;

pub mod backend;
pub mod engine;
pub mod events;
pub mod input;
pub mod manager;
pub mod memory;
pub mod registry;
pub mod renderer;
pub mod surface;

/// The single output. Multi-monitor is a future concern; clients already
/// address screens by id.
pub struct Screen {
    region: Region,
    scale: i32,
    transform: Transform,
    refresh_rate: i32,
}

impl Screen {
    pub fn new(region: Region, refresh_rate: i32) -> Self {
        Self {
            region,
            scale: 1,
            transform: Transform::None,
            refresh_rate,
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn refresh_rate(&self) -> i32 {
        self.refresh_rate
    }
}

/// Fallback placement for surfaces created with x/y of -1, cycled so
/// successive windows don't stack exactly.
const SPAWN_COORDINATES: [(i32, i32); 6] = [
    (100, 100),
    (200, 100),
    (300, 100),
    (100, 200),
    (200, 200),
    (300, 200),
];

pub struct Compositor {
    events: Arc<EventRouter>,
    registry: Arc<ObjectRegistry>,
    manager: Arc<WindowManager>,
    renderer: Arc<Renderer>,
    input: Arc<Input>,
    screen: Arc<Screen>,
    screen_id: ObjectId,
    segments: Box<dyn SegmentSource>,
    spawn_index: usize,
}

impl Compositor {
    pub fn new(
        driver: Box<dyn RenderDriver>,
        segments: Box<dyn SegmentSource>,
        screen_region: Region,
        refresh_rate: i32,
    ) -> Self {
        let events = Arc::new(EventRouter::new());
        let registry = Arc::new(ObjectRegistry::new(events.clone()));
        let manager = Arc::new(WindowManager::new(events.clone()));
        let renderer = Arc::new(Renderer::new(driver, screen_region));
        let input = Arc::new(Input::new(
            manager.clone(),
            events.clone(),
            renderer.clone(),
        ));

        let screen = Arc::new(Screen::new(screen_region, refresh_rate));
        let screen_id = registry.register_server(ObjectPayload::Screen(screen.clone()));

        Self {
            events,
            registry,
            manager,
            renderer,
            input,
            screen,
            screen_id,
            segments,
            spawn_index: 0,
        }
    }

    pub fn events(&self) -> Arc<EventRouter> {
        self.events.clone()
    }

    pub fn registry(&self) -> Arc<ObjectRegistry> {
        self.registry.clone()
    }

    pub fn manager(&self) -> Arc<WindowManager> {
        self.manager.clone()
    }

    pub fn renderer(&self) -> Arc<Renderer> {
        self.renderer.clone()
    }

    pub fn input(&self) -> Arc<Input> {
        self.input.clone()
    }

    pub fn screen_id(&self) -> ObjectId {
        self.screen_id
    }

    /// One pointer and one keyboard, announced as server objects. Called at
    /// startup; hot-plug goes through `Input::register_device` directly.
    pub fn register_default_devices(&self) -> (Arc<InputSource>, Arc<InputSource>) {
        let pointer = self
            .input
            .register_device(&self.registry, InputKind::Pointer, 0);
        let keyboard = self
            .input
            .register_device(&self.registry, InputKind::Keyboard, 1);
        (pointer, keyboard)
    }

    /// Drives one frame outside the engine; used by embedders and tests.
    pub fn render_once(&self) {
        self.renderer.render(&self.manager, &self.events);
    }

    pub fn handle_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Connected { client, events } => {
                info!("client {client} registered");
                self.events.register(client, events);
            },
            ClientMessage::Request { client, request } => {
                self.handle_request(client, request);
            },
            ClientMessage::Disconnected { client } => {
                self.disconnect(client);
            },
        }
    }

    #[instrument(skip(self, request), level = "debug")]
    pub fn handle_request(&mut self, client: ClientId, request: Request) {
        trace!("dispatching {request:?}");
        match request {
            Request::Core(request) => self.handle_core(client, request),
            Request::Screen(request) => self.handle_screen(client, request),
            Request::Memory(request) => self.handle_memory(client, request),
            Request::MemoryPool(request) => self.handle_memory_pool(client, request),
            Request::Buffer(request) => self.handle_buffer(client, request),
            Request::Surface(request) => self.handle_surface(client, request),
            Request::Pointer(request) => self.handle_pointer(client, request),
            Request::Keyboard(request) => self.handle_keyboard(client, request),
        }
    }

    fn handle_core(&self, client: ClientId, request: CoreRequest) {
        match request {
            CoreRequest::Sync { serial } => self.events.sync(client, serial),
            CoreRequest::GetObjects => self.registry.publish(client),
        }
    }

    fn handle_screen(&mut self, client: ClientId, request: ScreenRequest) {
        match request {
            ScreenRequest::GetProperties { id } => {
                let Some(screen) = self.lookup_screen(client, id) else {
                    return;
                };
                self.events.send(
                    client,
                    crate::protocol::Event::ScreenProperties {
                        id,
                        x: screen.region.x,
                        y: screen.region.y,
                        transform: screen.transform,
                        scale: screen.scale,
                    },
                );
            },
            ScreenRequest::GetModes { id } => {
                let Some(screen) = self.lookup_screen(client, id) else {
                    return;
                };
                self.events.send(
                    client,
                    crate::protocol::Event::ScreenMode {
                        id,
                        flags: mode_flags::CURRENT | mode_flags::PREFERRED,
                        width: screen.region.width,
                        height: screen.region.height,
                        refresh_rate: screen.refresh_rate,
                    },
                );
            },
            ScreenRequest::CreateSurface {
                screen,
                id,
                x,
                y,
                width,
                height,
            } => self.create_surface(client, screen, id, x, y, width, height),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_surface(
        &mut self,
        client: ClientId,
        screen_id: ObjectId,
        id: ObjectId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    ) {
        let Some(screen) = self.lookup_screen(client, screen_id) else {
            return;
        };
        if width <= 0 || height <= 0 {
            self.events.error(
                client,
                id,
                ErrorCode::InvalidArgument,
                "screen: surface dimensions must be positive",
            );
            return;
        }

        let (spawn_x, spawn_y) = SPAWN_COORDINATES[self.spawn_index % SPAWN_COORDINATES.len()];
        let x = if x == -1 { spawn_x } else { x };
        let y = if y == -1 { spawn_y } else { y };

        // Oversized surfaces are clamped on attach.
        let width = width.min(screen.region.width);
        let height = height.min(screen.region.height);

        let surface = Surface::new(client, id, x, y, width, height);
        let global_id = match self
            .registry
            .register_client(client, id, ObjectPayload::Surface(surface.clone()))
        {
            Ok(global_id) => global_id,
            Err(e) => {
                debug!("surface registration failed: {e:?}");
                self.events.error(
                    client,
                    id,
                    ErrorCode::InvalidArgument,
                    "screen: surface id already in use",
                );
                return;
            },
        };

        self.spawn_index += 1;
        self.manager.register(&surface);
        self.events
            .object(client, id, global_id, 0, ObjectType::Surface);
    }

    fn handle_memory(&self, client: ClientId, request: MemoryRequest) {
        match request {
            MemoryRequest::CreatePool { id, handle, size } => {
                if size == 0 {
                    self.events.error(
                        client,
                        id,
                        ErrorCode::InvalidArgument,
                        "memory: pool size must be non-zero",
                    );
                    return;
                }

                let segment = match self.segments.attach(handle, size as usize) {
                    Ok(segment) => segment,
                    Err(e) => {
                        warn!("pool attach failed for client {client}: {e:?}");
                        self.events.error(
                            client,
                            id,
                            ErrorCode::ResourceExhausted,
                            "memory: failed to attach pool",
                        );
                        return;
                    },
                };

                let pool = Arc::new(MemoryPool::new(client, id, handle, segment));
                match self
                    .registry
                    .register_client(client, id, ObjectPayload::MemoryPool(pool))
                {
                    Ok(global_id) => {
                        self.events
                            .object(client, id, global_id, handle, ObjectType::MemoryPool);
                    },
                    Err(e) => {
                        debug!("pool registration failed: {e:?}");
                        self.events.error(
                            client,
                            id,
                            ErrorCode::InvalidArgument,
                            "memory: pool id already in use",
                        );
                    },
                }
            },
        }
    }

    fn handle_memory_pool(&self, client: ClientId, request: MemoryPoolRequest) {
        match request {
            MemoryPoolRequest::CreateBuffer {
                pool,
                id,
                offset,
                width,
                height,
                stride,
                format,
                flags,
            } => {
                let Some(pool) = self.lookup_pool(client, pool) else {
                    return;
                };

                let buffer =
                    match Buffer::new(id, pool, offset, width, height, stride, format, flags) {
                        Ok(buffer) => buffer,
                        Err(e) => {
                            debug!("buffer creation failed: {e:?}");
                            self.events.error(
                                client,
                                id,
                                ErrorCode::InvalidArgument,
                                "memory: invalid buffer geometry",
                            );
                            return;
                        },
                    };

                match self
                    .registry
                    .register_client(client, id, ObjectPayload::Buffer(buffer))
                {
                    Ok(global_id) => {
                        self.events
                            .object(client, id, global_id, 0, ObjectType::Buffer);
                    },
                    Err(e) => {
                        debug!("buffer registration failed: {e:?}");
                        self.events.error(
                            client,
                            id,
                            ErrorCode::InvalidArgument,
                            "memory: buffer id already in use",
                        );
                    },
                }
            },
            MemoryPoolRequest::Destroy { id } => {
                let Some(pool) = self.lookup_pool(client, id) else {
                    return;
                };
                pool.detach();
                self.registry.remove(client, id);
            },
        }
    }

    fn handle_buffer(&self, client: ClientId, request: BufferRequest) {
        match request {
            BufferRequest::Destroy { id } => {
                let Some(buffer) = self.lookup_buffer(client, id) else {
                    return;
                };
                // If a surface still shows the buffer, the render thread
                // reaps the texture and the final reference on its next
                // pass.
                buffer.mark_zombie();
                self.registry.remove(client, id);
            },
        }
    }

    fn handle_surface(&self, client: ClientId, request: SurfaceRequest) {
        match request {
            SurfaceRequest::GetFormats { id } => {
                let Some(_surface) = self.lookup_surface(client, id) else {
                    return;
                };
                for format in self.renderer.supported_formats() {
                    self.events.surface_format(client, id, format);
                }
            },
            SurfaceRequest::SetBuffer { id, buffer } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                let content = if buffer.is_none() {
                    None
                } else {
                    let Some(buffer) = self.lookup_buffer(client, buffer) else {
                        return;
                    };
                    Some(buffer)
                };

                if let Err(e) = surface.set_buffer(&self.renderer, content) {
                    warn!("set_buffer failed for surface {id}: {e:?}");
                    self.events.error(
                        client,
                        id,
                        ErrorCode::ResourceExhausted,
                        "surface: failed to stage buffer",
                    );
                }
            },
            SurfaceRequest::SetInputRegion {
                id,
                x,
                y,
                width,
                height,
            } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                surface.set_input_region(x, y, width, height);
            },
            SurfaceRequest::SetDropShadow {
                id,
                x,
                y,
                width,
                height,
            } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                surface.set_drop_shadow(x, y, width, height);
            },
            SurfaceRequest::SetTransparency { id, enable } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                surface.set_transparency(enable);
            },
            SurfaceRequest::SetCornerRadius { id, radius } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                surface.set_corner_radius(radius);
            },
            SurfaceRequest::RequestFrame { id } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                surface.request_frame();
            },
            SurfaceRequest::Invalidate {
                id,
                x,
                y,
                width,
                height,
            } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                surface.invalidate(x, y, width, height);
            },
            SurfaceRequest::AddSubsurface {
                parent,
                child,
                x,
                y,
            } => {
                let Some(parent_surface) = self.lookup_surface(client, parent) else {
                    return;
                };
                let Some(child_surface) = self.lookup_surface(client, child) else {
                    return;
                };

                // Children live in their parent's tree, not the manager's.
                self.manager.unregister(&child_surface);
                if let Err(e) = parent_surface.add_child(&child_surface, x, y) {
                    debug!("add_subsurface failed: {e:?}");
                    self.events.error(
                        client,
                        parent,
                        ErrorCode::InvalidArgument,
                        "surface: already attached to a parent",
                    );
                }
            },
            SurfaceRequest::ResizeSubsurface { id, width, height } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                surface.resize(&self.events, width, height, edges::NO_EDGES);
            },
            SurfaceRequest::MoveSubsurface { id, x, y } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                surface.move_absolute(x, y);
            },
            SurfaceRequest::Commit { id } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                if let Some(visible) = surface.commit() {
                    if surface.parent().is_none() {
                        self.manager.on_visibility_change(&surface, visible);
                    }
                }
            },
            SurfaceRequest::RequestFullscreenMode { id, mode } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                match mode {
                    FullscreenMode::Exit => {
                        self.manager.change_level(&surface, LEVEL_DEFAULT);
                        surface.restore_size(&self.events);
                    },
                    FullscreenMode::Normal => {
                        surface.maximize(&self.events, self.screen.region);
                    },
                    FullscreenMode::Full => {
                        self.manager.change_level(&surface, LEVEL_TOP);
                        surface.maximize(&self.events, self.screen.region);
                    },
                }
            },
            SurfaceRequest::RequestLevel { id, level } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                if let Ok(level) = usize::try_from(level) {
                    self.manager.change_level(&surface, level);
                }
            },
            SurfaceRequest::RequestFocus { id } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                self.manager.request_focus(client, &surface);
            },
            SurfaceRequest::Resize { id, pointer, edges } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                let Some(pointer) = self.lookup_pointer(client, pointer) else {
                    return;
                };
                self.input.request_resize(&pointer, &surface, edges);
            },
            SurfaceRequest::Move { id, pointer } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                let Some(pointer) = self.lookup_pointer(client, pointer) else {
                    return;
                };
                self.input.request_move(&pointer, &surface);
            },
            SurfaceRequest::Destroy { id } => {
                let Some(surface) = self.lookup_surface(client, id) else {
                    return;
                };
                self.registry.remove(client, id);
                self.teardown_surface(surface);
            },
        }
    }

    fn handle_pointer(&self, client: ClientId, request: PointerRequest) {
        match request {
            PointerRequest::SetSurface {
                pointer,
                surface,
                x_offset,
                y_offset,
            } => {
                let Some(pointer) = self.lookup_pointer(client, pointer) else {
                    return;
                };
                let cursor = if surface.is_none() {
                    None
                } else {
                    let Some(surface) = self.lookup_surface(client, surface) else {
                        return;
                    };
                    Some(surface)
                };
                self.input
                    .set_cursor_surface(&pointer, cursor, x_offset, y_offset);
            },
            PointerRequest::Grab { pointer, surface } => {
                let Some(pointer) = self.lookup_pointer(client, pointer) else {
                    return;
                };
                let Some(surface) = self.lookup_surface(client, surface) else {
                    return;
                };
                self.input.grab(&pointer, &surface);
            },
            PointerRequest::Ungrab { pointer, surface } => {
                let Some(pointer) = self.lookup_pointer(client, pointer) else {
                    return;
                };
                let Some(surface) = self.lookup_surface(client, surface) else {
                    return;
                };
                self.input.ungrab(&pointer, &surface);
            },
        }
    }

    fn handle_keyboard(&self, client: ClientId, request: KeyboardRequest) {
        match request {
            KeyboardRequest::Hook { keyboard, surface } => {
                let Some(keyboard) = self.lookup_keyboard(client, keyboard) else {
                    return;
                };
                let Some(surface) = self.lookup_surface(client, surface) else {
                    return;
                };
                self.input.grab(&keyboard, &surface);
            },
            KeyboardRequest::Unhook { keyboard, surface } => {
                let Some(keyboard) = self.lookup_keyboard(client, keyboard) else {
                    return;
                };
                let Some(surface) = self.lookup_surface(client, surface) else {
                    return;
                };
                self.input.ungrab(&keyboard, &surface);
            },
        }
    }

    /// Synchronous surface teardown. The surface has already left the
    /// registry; after this returns no input source or frame references it.
    fn teardown_surface(&self, surface: Arc<Surface>) {
        debug!("tearing down surface {} of client {}", surface.id(), surface.client());

        self.manager.unregister(&surface);
        self.input.on_surface_destroy(&surface);
        surface.restore_saved();

        if let Some(parent) = surface.parent() {
            parent.remove_child(&surface);
            surface.make_orphan();
            // The render thread may be mid-walk over the old child list.
            self.renderer.wait_frame();
        }

        surface.orphan_children();
        surface.release_backbuffers(&self.renderer);
    }

    /// Disconnect is the one unconditional cleanup path: surfaces first
    /// (they hold buffers), then buffers, then pools.
    fn disconnect(&mut self, client: ClientId) {
        info!("client {client} disconnected, releasing its objects");
        self.events.unregister(client);

        for entry in self.registry.drain_client(client) {
            match entry.payload {
                ObjectPayload::Surface(surface) => self.teardown_surface(surface),
                ObjectPayload::Buffer(buffer) => buffer.mark_zombie(),
                ObjectPayload::MemoryPool(pool) => pool.detach(),
                ObjectPayload::Input(_) | ObjectPayload::Screen(_) => {},
            }
        }
    }

    fn lookup_screen(&self, client: ClientId, id: ObjectId) -> Option<Arc<Screen>> {
        match self.registry.lookup(client, id) {
            Some(ObjectPayload::Screen(screen)) => Some(screen),
            Some(_) => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::InvalidArgument,
                    "screen: object is not a screen",
                );
                None
            },
            None => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::NotFound,
                    "screen: object does not exist",
                );
                None
            },
        }
    }

    fn lookup_surface(&self, client: ClientId, id: ObjectId) -> Option<Arc<Surface>> {
        match self.registry.lookup(client, id) {
            Some(ObjectPayload::Surface(surface)) => Some(surface),
            Some(_) => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::InvalidArgument,
                    "surface: object is not a surface",
                );
                None
            },
            None => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::NotFound,
                    "surface: object does not exist",
                );
                None
            },
        }
    }

    fn lookup_pool(&self, client: ClientId, id: ObjectId) -> Option<Arc<MemoryPool>> {
        match self.registry.lookup(client, id) {
            Some(ObjectPayload::MemoryPool(pool)) => Some(pool),
            Some(_) => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::InvalidArgument,
                    "memory: object is not a pool",
                );
                None
            },
            None => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::NotFound,
                    "memory: object does not exist",
                );
                None
            },
        }
    }

    fn lookup_buffer(&self, client: ClientId, id: ObjectId) -> Option<Arc<Buffer>> {
        match self.registry.lookup(client, id) {
            Some(ObjectPayload::Buffer(buffer)) => Some(buffer),
            Some(_) => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::InvalidArgument,
                    "buffer: object is not a buffer",
                );
                None
            },
            None => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::NotFound,
                    "buffer: object does not exist",
                );
                None
            },
        }
    }

    fn lookup_input(
        &self,
        client: ClientId,
        id: ObjectId,
        kind: InputKind,
        tag: &str,
    ) -> Option<Arc<InputSource>> {
        match self.registry.lookup(client, id) {
            Some(ObjectPayload::Input(source)) if source.kind() == kind => Some(source),
            Some(_) => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::InvalidArgument,
                    &format!("{tag}: object is not a {tag}"),
                );
                None
            },
            None => {
                self.events.error(
                    client,
                    id,
                    ErrorCode::NotFound,
                    &format!("{tag}: object does not exist"),
                );
                None
            },
        }
    }

    fn lookup_pointer(&self, client: ClientId, id: ObjectId) -> Option<Arc<InputSource>> {
        self.lookup_input(client, id, InputKind::Pointer, "pointer")
    }

    fn lookup_keyboard(&self, client: ClientId, id: ObjectId) -> Option<Arc<InputSource>> {
        self.lookup_input(client, id, InputKind::Keyboard, "keyboard")
    }
}
