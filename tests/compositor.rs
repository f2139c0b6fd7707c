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

//! End-to-end scenarios driven through the request dispatcher with an
//! in-process client, heap-backed shared memory, and manual frames.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use prism::protocol::BufferRequest;
use prism::protocol::ClientId;
use prism::protocol::CoreRequest;
use prism::protocol::ErrorCode;
use prism::protocol::Event;
use prism::protocol::KeyboardRequest;
use prism::protocol::MemoryPoolRequest;
use prism::protocol::MemoryRequest;
use prism::protocol::ObjectId;
use prism::protocol::ObjectType;
use prism::protocol::PixelFormat;
use prism::protocol::PointerRequest;
use prism::protocol::Request;
use prism::protocol::ScreenRequest;
use prism::protocol::SurfaceRequest;
use prism::protocol::edges;
use prism::protocol::transport::ClientMessage;
use prism::region::Region;
use prism::server::Compositor;
use prism::server::backend::NullOutput;
use prism::server::backend::software;
use prism::server::backend::software::FramebufferProbe;
use prism::server::input::PointerMode;
use prism::server::memory::HeapSource;

const SCREEN: i32 = 400;
const POINTER_DEVICE: u32 = 0;
const KEYBOARD_DEVICE: u32 = 1;

struct Harness {
    compositor: Compositor,
    memory: Arc<HeapSource>,
    framebuffer: FramebufferProbe,
    pointer: ObjectId,
    keyboard: ObjectId,
    client: ClientId,
    events: Receiver<Event>,
}

impl Harness {
    fn new() -> Self {
        let memory = Arc::new(HeapSource::new());
        let (driver, framebuffer) =
            software::with_probe(SCREEN, SCREEN, Box::new(NullOutput));

        let compositor = Compositor::new(
            Box::new(driver),
            Box::new(memory.clone()),
            Region::with_size(SCREEN, SCREEN),
            60,
        );
        let (pointer, keyboard) = compositor.register_default_devices();

        let client = ClientId(1);
        let events = compositor.events().register_in_process(client);

        Self {
            compositor,
            memory,
            framebuffer,
            pointer: pointer.id(),
            keyboard: keyboard.id(),
            client,
            events,
        }
    }

    fn send(&mut self, request: Request) {
        let client = self.client;
        self.compositor.handle_request(client, request);
    }

    fn drain(&self) -> Vec<Event> {
        self.events.try_iter().collect()
    }

    fn create_surface(&mut self, id: u32, x: i32, y: i32, width: i32, height: i32) {
        let screen = self.compositor.screen_id();
        self.send(Request::Screen(ScreenRequest::CreateSurface {
            screen,
            id: ObjectId(id),
            x,
            y,
            width,
            height,
        }));
    }

    /// Pool + buffer + attach + full-damage + commit: the standard client
    /// path to get pixels on screen.
    fn present_surface(&mut self, surface: u32, pool_handle: u64, width: i32, height: i32) {
        let stride = width * 4;
        let size = (stride * height) as u64;
        let pool_id = surface * 100 + 1;
        let buffer_id = surface * 100 + 2;

        self.memory.create(pool_handle, size as usize);
        self.send(Request::Memory(MemoryRequest::CreatePool {
            id: ObjectId(pool_id),
            handle: pool_handle,
            size,
        }));
        self.send(Request::MemoryPool(MemoryPoolRequest::CreateBuffer {
            pool: ObjectId(pool_id),
            id: ObjectId(buffer_id),
            offset: 0,
            width,
            height,
            stride,
            format: PixelFormat::Argb32,
            flags: 0,
        }));
        self.send(Request::Surface(SurfaceRequest::SetBuffer {
            id: ObjectId(surface),
            buffer: ObjectId(buffer_id),
        }));
        self.send(Request::Surface(SurfaceRequest::SetInputRegion {
            id: ObjectId(surface),
            x: 0,
            y: 0,
            width,
            height,
        }));
        self.send(Request::Surface(SurfaceRequest::Invalidate {
            id: ObjectId(surface),
            x: 0,
            y: 0,
            width,
            height,
        }));
        self.send(Request::Surface(SurfaceRequest::Commit {
            id: ObjectId(surface),
        }));
    }
}

#[test]
fn sync_roundtrip_and_object_announces() {
    let mut harness = Harness::new();

    harness.send(Request::Core(CoreRequest::GetObjects));
    harness.send(Request::Core(CoreRequest::Sync { serial: 7 }));

    let events = harness.drain();
    // Screen, pointer, keyboard announces, then the sync.
    let kinds: Vec<ObjectType> = events
        .iter()
        .filter_map(|event| match event {
            Event::Object { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect();
    assert!(kinds.contains(&ObjectType::Screen));
    assert!(kinds.contains(&ObjectType::Pointer));
    assert!(kinds.contains(&ObjectType::Keyboard));
    assert_eq!(events.last(), Some(&Event::Sync { serial: 7 }));
}

#[test]
fn unknown_object_yields_not_found_error() {
    let mut harness = Harness::new();

    harness.send(Request::Surface(SurfaceRequest::Commit { id: ObjectId(99) }));

    let events = harness.drain();
    assert!(matches!(
        events.as_slice(),
        [Event::Error {
            id: ObjectId(99),
            code: ErrorCode::NotFound,
            ..
        }]
    ));
}

#[test]
fn simple_present_reaches_the_framebuffer() {
    let mut harness = Harness::new();

    harness.create_surface(1, 0, 0, 100, 100);
    let segment = harness.memory.create(7, 40_000);
    // Pixel (0, 0) = opaque 0xff123456 in ARGB32 byte order.
    segment.write(0, &0xff12_3456u32.to_le_bytes());

    harness.present_surface(1, 7, 100, 100);
    harness.drain();

    harness.compositor.render_once();

    let events = harness.drain();
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, Event::BufferRelease { id: ObjectId(102) }))
            .count(),
        1,
        "expected exactly one release, got {events:?}"
    );
    assert_eq!(harness.framebuffer.pixel(0, 0), Some(0xff12_3456));

    // A second frame without new damage neither re-uploads nor re-releases.
    harness.compositor.render_once();
    assert!(harness.drain().iter().all(|event| !matches!(event, Event::BufferRelease { .. })));
}

#[test]
fn child_reordering_hits_the_last_added_sibling() {
    let mut harness = Harness::new();

    harness.create_surface(1, 0, 0, 200, 200);
    harness.create_surface(2, 0, 0, 50, 50);
    harness.create_surface(3, 0, 0, 50, 50);
    for (surface, handle) in [(1u32, 11u64), (2, 12), (3, 13)] {
        harness.present_surface(surface, handle, 50, 50);
    }

    for (child, x, y) in [(2u32, 0, 0), (3, 25, 25)] {
        harness.send(Request::Surface(SurfaceRequest::AddSubsurface {
            parent: ObjectId(1),
            child: ObjectId(child),
            x,
            y,
        }));
    }
    harness.send(Request::Surface(SurfaceRequest::Commit { id: ObjectId(1) }));

    let manager = harness.compositor.manager();
    let (hit, local_x, local_y) = manager.surface_at(30, 30).unwrap();
    assert_eq!(hit.id(), ObjectId(3));
    assert_eq!((local_x, local_y), (5, 5));

    // Destroying the top sibling uncovers the one below.
    harness.send(Request::Surface(SurfaceRequest::Destroy { id: ObjectId(3) }));
    let (hit, _, _) = manager.surface_at(30, 30).unwrap();
    assert_eq!(hit.id(), ObjectId(2));
}

#[test]
fn resize_drag_accumulates_and_returns_to_normal() {
    let mut harness = Harness::new();

    // Surface under the pointer's start position (the screen center).
    harness.create_surface(1, 150, 150, 100, 100);
    harness.present_surface(1, 21, 100, 100);
    harness.drain();

    harness.send(Request::Surface(SurfaceRequest::Resize {
        id: ObjectId(1),
        pointer: harness.pointer,
        edges: edges::RIGHT | edges::BOTTOM,
    }));

    let input = harness.compositor.input();
    input.button_event(POINTER_DEVICE, 0, true, 0);
    // The bus reports Y-down; these are downward drags.
    input.axis_event(POINTER_DEVICE, 10, -10, 0);
    input.axis_event(POINTER_DEVICE, 5, -5, 0);
    input.button_event(POINTER_DEVICE, 0, false, 0);

    let resizes: Vec<(i32, i32, u8)> = harness
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            Event::SurfaceResize {
                width,
                height,
                edges,
                ..
            } => Some((width, height, edges)),
            _ => None,
        })
        .collect();
    assert_eq!(
        resizes,
        vec![
            (110, 110, edges::RIGHT | edges::BOTTOM),
            (115, 115, edges::RIGHT | edges::BOTTOM),
        ]
    );

    let sources = harness.compositor.input();
    let pointer = sources.source_for_device(POINTER_DEVICE).unwrap();
    assert_eq!(pointer.mode(), Some(PointerMode::Normal));
}

#[test]
fn focus_follows_the_most_recently_shown_surface() {
    let mut harness = Harness::new();

    harness.create_surface(1, 0, 0, 100, 100);
    harness.create_surface(2, 120, 0, 100, 100);
    harness.present_surface(1, 31, 100, 100);
    harness.present_surface(2, 32, 100, 100);

    let focus: Vec<(u32, bool)> = harness
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            Event::SurfaceFocus { id, focus } => Some((id.0, focus)),
            _ => None,
        })
        .collect();
    assert_eq!(focus, vec![(1, true), (1, false), (2, true)]);
}

#[test]
fn disconnect_releases_surfaces_buffers_and_pools() {
    let mut harness = Harness::new();

    harness.create_surface(1, 0, 0, 64, 64);
    harness.memory.create(41, 65_536);
    harness.send(Request::Memory(MemoryRequest::CreatePool {
        id: ObjectId(10),
        handle: 41,
        size: 65_536,
    }));
    for buffer in [11u32, 12] {
        harness.send(Request::MemoryPool(MemoryPoolRequest::CreateBuffer {
            pool: ObjectId(10),
            id: ObjectId(buffer),
            offset: 0,
            width: 64,
            height: 64,
            stride: 256,
            format: PixelFormat::Argb32,
            flags: 0,
        }));
    }
    harness.send(Request::Surface(SurfaceRequest::SetBuffer {
        id: ObjectId(1),
        buffer: ObjectId(11),
    }));
    harness.send(Request::Surface(SurfaceRequest::Commit { id: ObjectId(1) }));

    let registry = harness.compositor.registry();
    let weak_refs: Vec<_> = [1u32, 10, 11, 12]
        .into_iter()
        .map(|id| {
            let payload = registry.lookup(harness.client, ObjectId(id)).unwrap();
            payload_weak(payload)
        })
        .collect();

    harness
        .compositor
        .handle_message(ClientMessage::Disconnected {
            client: harness.client,
        });

    for id in [1u32, 10, 11, 12] {
        assert!(registry.lookup(harness.client, ObjectId(id)).is_none());
    }
    assert!(harness.compositor.manager().surface_at(10, 10).is_none());
    for weak in weak_refs {
        assert!(weak.upgrade_gone(), "object survived disconnect");
    }
}

/// Type-erased weakness check across the payload variants.
enum PayloadWeak {
    Surface(std::sync::Weak<prism::server::surface::Surface>),
    Buffer(std::sync::Weak<prism::server::memory::Buffer>),
    Pool(std::sync::Weak<prism::server::memory::MemoryPool>),
}

impl PayloadWeak {
    fn upgrade_gone(&self) -> bool {
        match self {
            Self::Surface(weak) => weak.upgrade().is_none(),
            Self::Buffer(weak) => weak.upgrade().is_none(),
            Self::Pool(weak) => weak.upgrade().is_none(),
        }
    }
}

fn payload_weak(payload: prism::server::registry::ObjectPayload) -> PayloadWeak {
    use prism::server::registry::ObjectPayload;
    match payload {
        ObjectPayload::Surface(surface) => PayloadWeak::Surface(Arc::downgrade(&surface)),
        ObjectPayload::Buffer(buffer) => PayloadWeak::Buffer(Arc::downgrade(&buffer)),
        ObjectPayload::MemoryPool(pool) => PayloadWeak::Pool(Arc::downgrade(&pool)),
        _ => unreachable!("only client objects are checked"),
    }
}

#[test]
fn grab_reports_relative_motion_without_enter_leave() {
    let mut harness = Harness::new();

    // Centered under the pointer so the grab is accepted.
    harness.create_surface(1, 150, 150, 100, 100);
    harness.present_surface(1, 51, 100, 100);
    harness.drain();

    harness.send(Request::Pointer(PointerRequest::Grab {
        pointer: harness.pointer,
        surface: ObjectId(1),
    }));
    harness
        .compositor
        .input()
        .axis_event(POINTER_DEVICE, 50, 0, 0);

    let events = harness.drain();
    let moves: Vec<(i32, i32)> = events
        .iter()
        .filter_map(|event| match event {
            Event::PointerMove { x, y, .. } => Some((*x, *y)),
            _ => None,
        })
        .collect();
    assert_eq!(moves, vec![(50, 0)]);
    assert!(
        events
            .iter()
            .all(|event| !matches!(event, Event::PointerEnter { .. } | Event::PointerLeave { .. }))
    );
}

#[test]
fn destroying_the_drag_surface_resets_the_pointer() {
    let mut harness = Harness::new();

    harness.create_surface(1, 150, 150, 100, 100);
    harness.present_surface(1, 61, 100, 100);

    harness.send(Request::Surface(SurfaceRequest::Move {
        id: ObjectId(1),
        pointer: harness.pointer,
    }));
    {
        let input = harness.compositor.input();
        let pointer = input.source_for_device(POINTER_DEVICE).unwrap();
        assert_eq!(pointer.mode(), Some(PointerMode::Moving));
    }

    harness.send(Request::Surface(SurfaceRequest::Destroy { id: ObjectId(1) }));

    let input = harness.compositor.input();
    let pointer = input.source_for_device(POINTER_DEVICE).unwrap();
    assert_eq!(pointer.mode(), Some(PointerMode::Normal));
}

#[test]
fn zombie_buffer_release_is_deferred_to_the_render_thread() {
    let mut harness = Harness::new();

    harness.create_surface(1, 0, 0, 64, 64);
    harness.memory.create(71, 65_536);
    harness.send(Request::Memory(MemoryRequest::CreatePool {
        id: ObjectId(10),
        handle: 71,
        size: 65_536,
    }));
    harness.send(Request::MemoryPool(MemoryPoolRequest::CreateBuffer {
        pool: ObjectId(10),
        id: ObjectId(11),
        offset: 0,
        width: 64,
        height: 64,
        stride: 256,
        format: PixelFormat::Argb32,
        flags: 0,
    }));
    harness.send(Request::Surface(SurfaceRequest::SetBuffer {
        id: ObjectId(1),
        buffer: ObjectId(11),
    }));
    harness.send(Request::Surface(SurfaceRequest::Commit { id: ObjectId(1) }));
    harness.compositor.render_once();

    // Client destroys the buffer while it is still on screen.
    harness.send(Request::Buffer(BufferRequest::Destroy { id: ObjectId(11) }));
    let renderer = harness.compositor.renderer();
    assert_eq!(renderer.reaped_zombies(), 0);

    harness.compositor.render_once();
    assert_eq!(renderer.reaped_zombies(), 1);

    // The surface lost its content with the buffer.
    let registry = harness.compositor.registry();
    let payload = registry.lookup(harness.client, ObjectId(1)).unwrap();
    let surface = payload.as_surface().unwrap();
    assert!(!surface.visible());
}

#[test]
fn keyboard_hook_redirects_keys_until_unhook() {
    let mut harness = Harness::new();

    harness.create_surface(1, 0, 0, 100, 100);
    harness.create_surface(2, 120, 0, 100, 100);
    harness.present_surface(1, 81, 100, 100);
    harness.present_surface(2, 82, 100, 100);
    harness.drain();

    // Surface 2 was shown last and holds focus.
    harness.compositor.input().button_event(KEYBOARD_DEVICE, 30, true, 0);

    harness.send(Request::Keyboard(KeyboardRequest::Hook {
        keyboard: harness.keyboard,
        surface: ObjectId(1),
    }));
    harness.compositor.input().button_event(KEYBOARD_DEVICE, 31, true, 0);

    harness.send(Request::Keyboard(KeyboardRequest::Unhook {
        keyboard: harness.keyboard,
        surface: ObjectId(1),
    }));
    harness.compositor.input().button_event(KEYBOARD_DEVICE, 32, true, 0);

    let keys: Vec<(u32, u32)> = harness
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            Event::KeyboardKey {
                surface, keycode, ..
            } => Some((surface.0, keycode)),
            _ => None,
        })
        .collect();
    assert_eq!(keys, vec![(2, 30), (1, 31), (2, 32)]);
}
