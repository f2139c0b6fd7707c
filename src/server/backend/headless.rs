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

//! A recording driver: no pixels, just a log of what the renderer asked
//! for. Tests assert on uploads, draws and presents through [`DriverProbe`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::prelude::*;
use crate::protocol::PixelFormat;
use crate::region::Region;
use crate::server::backend::BlendMode;
use crate::server::backend::RenderDriver;
use crate::server::backend::TextureFlags;
use crate::server::backend::TextureId;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DriverCall {
    Create {
        id: TextureId,
        width: i32,
        height: i32,
        format: PixelFormat,
        flags: TextureFlags,
    },
    Update {
        id: TextureId,
        bytes: usize,
    },
    Destroy {
        id: TextureId,
    },
    DrawTexture {
        id: TextureId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        blend: BlendMode,
    },
    DrawShadow {
        x: i32,
        y: i32,
    },
    Present,
}

#[derive(Default)]
struct Recording {
    calls: Vec<DriverCall>,
    live_textures: HashMap<TextureId, (i32, i32)>,
    next_texture: TextureId,
    fail_create: bool,
}

/// Shared handle for assertions while the driver itself lives inside the
/// renderer.
#[derive(Clone, Default)]
pub struct DriverProbe(Arc<Mutex<Recording>>);

impl DriverProbe {
    pub fn calls(&self) -> Vec<DriverCall> {
        self.0.lock().unwrap().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<DriverCall> {
        std::mem::take(&mut self.0.lock().unwrap().calls)
    }

    pub fn live_texture_count(&self) -> usize {
        self.0.lock().unwrap().live_textures.len()
    }

    pub fn present_count(&self) -> usize {
        self.0
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| matches!(call, DriverCall::Present))
            .count()
    }

    pub fn update_count(&self) -> usize {
        self.0
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| matches!(call, DriverCall::Update { .. }))
            .count()
    }

    /// Makes the next texture creations fail, for resource-exhaustion paths.
    pub fn fail_creates(&self, fail: bool) {
        self.0.lock().unwrap().fail_create = fail;
    }
}

pub struct HeadlessDriver {
    recording: Arc<Mutex<Recording>>,
    translation: (i32, i32),
    saved: Vec<(i32, i32)>,
    blend: BlendMode,
}

impl HeadlessDriver {
    pub fn new() -> (Self, DriverProbe) {
        let probe = DriverProbe::default();
        probe.0.lock().unwrap().next_texture = 1;
        (
            Self {
                recording: probe.0.clone(),
                translation: (0, 0),
                saved: Vec::new(),
                blend: BlendMode::Replace,
            },
            probe,
        )
    }
}

impl RenderDriver for HeadlessDriver {
    fn create_texture(
        &mut self,
        width: i32,
        height: i32,
        format: PixelFormat,
        flags: TextureFlags,
        _data: &[u8],
    ) -> Result<TextureId> {
        let mut recording = self.recording.lock().unwrap();
        ensure!(!recording.fail_create, "out of texture memory");

        let id = recording.next_texture;
        recording.next_texture += 1;
        recording.live_textures.insert(id, (width, height));
        recording.calls.push(DriverCall::Create {
            id,
            width,
            height,
            format,
            flags,
        });
        Ok(id)
    }

    fn update_texture(&mut self, id: TextureId, data: &[u8]) -> Result<()> {
        let mut recording = self.recording.lock().unwrap();
        ensure!(
            recording.live_textures.contains_key(&id),
            "update of unknown texture {id}"
        );
        recording.calls.push(DriverCall::Update {
            id,
            bytes: data.len(),
        });
        Ok(())
    }

    fn destroy_texture(&mut self, id: TextureId) {
        let mut recording = self.recording.lock().unwrap();
        recording.live_textures.remove(&id);
        recording.calls.push(DriverCall::Destroy { id });
    }

    fn begin_frame(&mut self) {
        self.translation = (0, 0);
        self.saved.clear();
        self.blend = BlendMode::Replace;
    }

    fn end_frame(&mut self) -> Result<()> {
        self.recording.lock().unwrap().calls.push(DriverCall::Present);
        Ok(())
    }

    fn save(&mut self) {
        self.saved.push(self.translation);
    }

    fn restore(&mut self) {
        if let Some(translation) = self.saved.pop() {
            self.translation = translation;
        }
    }

    fn translate(&mut self, x: i32, y: i32) {
        self.translation.0 += x;
        self.translation.1 += y;
    }

    fn set_blend(&mut self, blend: BlendMode) {
        self.blend = blend;
    }

    fn draw_shadow(&mut self, shadow: Region, _width: i32, _height: i32, _corner_radius: i32) {
        self.recording.lock().unwrap().calls.push(DriverCall::DrawShadow {
            x: self.translation.0 + shadow.x,
            y: self.translation.1 + shadow.y,
        });
    }

    fn draw_texture(&mut self, id: TextureId, width: i32, height: i32) {
        self.recording.lock().unwrap().calls.push(DriverCall::DrawTexture {
            id,
            x: self.translation.0,
            y: self.translation.1,
            width,
            height,
            blend: self.blend,
        });
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        vec![PixelFormat::Argb32, PixelFormat::Xrgb32]
    }
}
