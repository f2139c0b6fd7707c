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

//! The object registry bridging wire ids to server entities. One table keyed
//! by global id plus a (client, local-id) index; server-minted ids live in a
//! disjoint range so lookup dispatch is a single branch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use bimap::BiMap;
use enum_as_inner::EnumAsInner;

use crate::prelude::*;
use crate::protocol::ClientId;
use crate::protocol::ObjectId;
use crate::protocol::ObjectType;
use crate::protocol::SERVER_ID_BASE;
use crate::server::events::EventRouter;
use crate::server::input::InputKind;
use crate::server::input::InputSource;
use crate::server::memory::Buffer;
use crate::server::memory::MemoryPool;
use crate::server::surface::Surface;
use crate::server::Screen;

#[derive(Clone, EnumAsInner)]
pub enum ObjectPayload {
    MemoryPool(Arc<MemoryPool>),
    Buffer(Arc<Buffer>),
    Surface(Arc<Surface>),
    Input(Arc<InputSource>),
    Screen(Arc<Screen>),
}

impl ObjectPayload {
    pub fn kind(&self) -> ObjectType {
        match self {
            Self::MemoryPool(_) => ObjectType::MemoryPool,
            Self::Buffer(_) => ObjectType::Buffer,
            Self::Surface(_) => ObjectType::Surface,
            Self::Input(source) => match source.kind() {
                InputKind::Pointer => ObjectType::Pointer,
                InputKind::Keyboard => ObjectType::Keyboard,
            },
            Self::Screen(_) => ObjectType::Screen,
        }
    }

    /// Native handle announced with the object; only pools carry one.
    fn handle(&self) -> u64 {
        match self {
            Self::MemoryPool(pool) => pool.handle(),
            _ => 0,
        }
    }
}

pub struct ObjectEntry {
    pub owner: Option<ClientId>,
    pub local_id: Option<ObjectId>,
    pub global_id: ObjectId,
    pub kind: ObjectType,
    pub payload: ObjectPayload,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<u32, ObjectEntry>,
    index: BiMap<(ClientId, u32), u32>,
}

pub struct ObjectRegistry {
    next_id: AtomicU32,
    state: RwLock<RegistryState>,
    events: Arc<EventRouter>,
}

impl ObjectRegistry {
    pub fn new(events: Arc<EventRouter>) -> Self {
        Self {
            next_id: AtomicU32::new(SERVER_ID_BASE),
            state: RwLock::new(RegistryState::default()),
            events,
        }
    }

    fn mint_id(&self) -> ObjectId {
        ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Inserts a client-created object under its (client, local-id) pair.
    /// The returned global id keys the entry internally and is included in
    /// the object announce so clients can hand references to each other.
    pub fn register_client(
        &self,
        client: ClientId,
        local_id: ObjectId,
        payload: ObjectPayload,
    ) -> Result<ObjectId> {
        ensure!(
            !local_id.is_none() && !local_id.is_server(),
            "client {client} used reserved id {local_id}"
        );

        let global_id = self.mint_id();
        let kind = payload.kind();

        let mut state = self.state.write().unwrap();
        state
            .index
            .insert_no_overwrite((client, local_id.0), global_id.0)
            .map_err(|_| anyhow!("client {client} reused id {local_id}"))?;
        state.entries.insert(
            global_id.0,
            ObjectEntry {
                owner: Some(client),
                local_id: Some(local_id),
                global_id,
                kind,
                payload,
            },
        );
        Ok(global_id)
    }

    /// Inserts a server-owned object and broadcasts its announce to all
    /// connected clients.
    pub fn register_server(&self, payload: ObjectPayload) -> ObjectId {
        let global_id = self.mint_id();
        let kind = payload.kind();
        let handle = payload.handle();

        self.state.write().unwrap().entries.insert(
            global_id.0,
            ObjectEntry {
                owner: None,
                local_id: None,
                global_id,
                kind,
                payload,
            },
        );

        self.events.announce(global_id, handle, kind);
        global_id
    }

    /// Resolves an id the way the wire sees it: server-range ids resolve
    /// globally, everything else within the requesting client.
    pub fn lookup(&self, client: ClientId, id: ObjectId) -> Option<ObjectPayload> {
        let state = self.state.read().unwrap();
        let key = if id.is_server() {
            id.0
        } else {
            *state.index.get_by_left(&(client, id.0))?
        };
        state.entries.get(&key).map(|entry| entry.payload.clone())
    }

    pub fn remove(&self, client: ClientId, id: ObjectId) -> Option<ObjectEntry> {
        let mut state = self.state.write().unwrap();
        let key = if id.is_server() {
            id.0
        } else {
            *state.index.get_by_left(&(client, id.0))?
        };

        let entry = state.entries.remove(&key)?;
        state.index.remove_by_right(&key);
        drop(state);

        if entry.owner.is_none() {
            self.events.destroyed(entry.global_id);
        }
        Some(entry)
    }

    /// Removes every object owned by `client` and returns the entries
    /// ordered for teardown: surfaces first (they reference buffers), then
    /// buffers, then pools.
    pub fn drain_client(&self, client: ClientId) -> Vec<ObjectEntry> {
        let mut state = self.state.write().unwrap();
        let keys: Vec<u32> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner == Some(client))
            .map(|(key, _)| *key)
            .collect();

        let mut drained: Vec<ObjectEntry> = keys
            .into_iter()
            .filter_map(|key| {
                state.index.remove_by_right(&key);
                state.entries.remove(&key)
            })
            .collect();
        drop(state);

        let rank = |kind: ObjectType| match kind {
            ObjectType::Surface => 0,
            ObjectType::Buffer => 1,
            ObjectType::MemoryPool => 2,
            _ => 3,
        };
        drained.sort_by_key(|entry| rank(entry.kind));
        drained
    }

    /// Sends one announce per server-owned object to a newly connected
    /// client.
    pub fn publish(&self, client: ClientId) {
        let state = self.state.read().unwrap();
        for entry in state.entries.values().filter(|entry| entry.owner.is_none()) {
            self.events.object(
                client,
                entry.global_id,
                entry.global_id,
                entry.payload.handle(),
                entry.kind,
            );
        }
    }
}
