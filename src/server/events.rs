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

//! Fan-out of events to connected clients. Components emit through the
//! typed helpers; the router resolves the client's queue and drops events
//! for clients that are gone (disconnect is not an error for emitters).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::prelude::*;
use crate::protocol::ClientId;
use crate::protocol::ErrorCode;
use crate::protocol::Event;
use crate::protocol::ObjectId;
use crate::protocol::ObjectType;
use crate::protocol::transport::EventSender;

#[derive(Default)]
pub struct EventRouter {
    clients: RwLock<HashMap<ClientId, EventSender>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: ClientId, sender: EventSender) {
        self.clients.write().unwrap().insert(client, sender);
    }

    pub fn unregister(&self, client: ClientId) {
        self.clients.write().unwrap().remove(&client);
    }

    pub fn send(&self, client: ClientId, event: Event) {
        let clients = self.clients.read().unwrap();
        let Some(sender) = clients.get(&client) else {
            trace!("dropping event for unknown client {client}: {event:?}");
            return;
        };
        // A failed send means the write loop is gone; the disconnect path
        // will unregister the client shortly.
        sender.send(event).ok();
    }

    pub fn broadcast(&self, event: Event) {
        let clients = self.clients.read().unwrap();
        for sender in clients.values() {
            sender.send(event.clone()).ok();
        }
    }

    pub fn sync(&self, client: ClientId, serial: u32) {
        self.send(client, Event::Sync { serial });
    }

    pub fn error(&self, client: ClientId, id: ObjectId, code: ErrorCode, message: &str) {
        debug!("error to client {client} for object {id}: {code:?} {message}");
        self.send(
            client,
            Event::Error {
                id,
                code,
                message: message.to_string(),
            },
        );
    }

    /// Announce of a client-created object back to its owner.
    pub fn object(
        &self,
        client: ClientId,
        id: ObjectId,
        global_id: ObjectId,
        handle: u64,
        kind: ObjectType,
    ) {
        self.send(
            client,
            Event::Object {
                id,
                global_id,
                handle,
                kind,
            },
        );
    }

    /// Announce of a server object to every connected client.
    pub fn announce(&self, global_id: ObjectId, handle: u64, kind: ObjectType) {
        self.broadcast(Event::Object {
            id: global_id,
            global_id,
            handle,
            kind,
        });
    }

    pub fn destroyed(&self, global_id: ObjectId) {
        self.broadcast(Event::Destroy { id: global_id });
    }

    pub fn surface_format(&self, client: ClientId, id: ObjectId, format: crate::protocol::PixelFormat) {
        self.send(client, Event::SurfaceFormat { id, format });
    }

    pub fn surface_frame(&self, client: ClientId, id: ObjectId) {
        self.send(client, Event::SurfaceFrame { id });
    }

    pub fn surface_resize(&self, client: ClientId, id: ObjectId, width: i32, height: i32, edges: u8) {
        self.send(
            client,
            Event::SurfaceResize {
                id,
                width,
                height,
                edges,
            },
        );
    }

    pub fn surface_focus(&self, client: ClientId, id: ObjectId, focus: bool) {
        self.send(client, Event::SurfaceFocus { id, focus });
    }

    pub fn buffer_release(&self, client: ClientId, id: ObjectId) {
        self.send(client, Event::BufferRelease { id });
    }

    pub fn pointer_enter(&self, client: ClientId, pointer: ObjectId, surface: ObjectId, x: i32, y: i32) {
        self.send(
            client,
            Event::PointerEnter {
                pointer,
                surface,
                x,
                y,
            },
        );
    }

    pub fn pointer_leave(&self, client: ClientId, pointer: ObjectId, surface: ObjectId) {
        self.send(client, Event::PointerLeave { pointer, surface });
    }

    pub fn pointer_move(&self, client: ClientId, pointer: ObjectId, surface: ObjectId, x: i32, y: i32) {
        self.send(
            client,
            Event::PointerMove {
                pointer,
                surface,
                x,
                y,
            },
        );
    }

    pub fn pointer_click(
        &self,
        client: ClientId,
        pointer: ObjectId,
        surface: ObjectId,
        button: u32,
        pressed: bool,
    ) {
        self.send(
            client,
            Event::PointerClick {
                pointer,
                surface,
                button,
                pressed,
            },
        );
    }

    pub fn pointer_scroll(&self, client: ClientId, pointer: ObjectId, surface: ObjectId, delta: i32) {
        self.send(
            client,
            Event::PointerScroll {
                pointer,
                surface,
                delta,
            },
        );
    }

    pub fn keyboard_key(&self, client: ClientId, surface: ObjectId, keycode: u32, modifiers: u16) {
        self.send(
            client,
            Event::KeyboardKey {
                surface,
                keycode,
                modifiers,
            },
        );
    }

    /// Registers an in-process client and returns the receiving end of its
    /// event queue. For embedders and tests that drive the compositor
    /// without a socket.
    pub fn register_in_process(&self, client: ClientId) -> crossbeam_channel::Receiver<Event> {
        use std::sync::Arc;
        use std::sync::atomic::AtomicBool;

        use crate::channel_utils::DiscardingSender;

        let (tx, rx) = crossbeam_channel::unbounded();
        self.register(
            client,
            DiscardingSender {
                sender: tx,
                actually_send: Arc::new(AtomicBool::new(true)),
            },
        );
        rx
    }
}
