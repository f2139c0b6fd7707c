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

//! The windowing protocol: decoded request structs, emitted events, and the
//! identifiers shared between them. The transport (`transport` module)
//! delivers `Request`s already decoded and serializes `Event`s on the way
//! out; everything here is plain data.

use std::fmt;

use enum_as_inner::EnumAsInner;
use rkyv::Archive;
use rkyv::Deserialize;
use rkyv::Serialize;

pub mod framing;
pub mod transport;

/// First id of the server-minted range. A single range check tells the
/// registry whether to resolve an id globally or per-client.
pub const SERVER_ID_BASE: u32 = 0x8000_0000;

#[derive(Archive, Deserialize, Serialize, Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// The null id; used on the wire where an object reference is optional
    /// (e.g. detaching a pointer's cursor surface).
    pub const NONE: ObjectId = ObjectId(0);

    pub fn is_server(&self) -> bool {
        self.0 >= SERVER_ID_BASE
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned connection identity. Never travels on the wire; the
/// transport tags every decoded request with it.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ObjectType {
    MemoryPool,
    Buffer,
    Surface,
    Pointer,
    Keyboard,
    Screen,
}

#[derive(Archive, Deserialize, Serialize, Debug, Copy, Clone, Eq, PartialEq, EnumAsInner)]
pub enum PixelFormat {
    Argb32,
    Abgr32,
    Xrgb32,
    Xbgr32,
    Rgba32,
    Bgra32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> i32 {
        4
    }

    /// The X-channel formats carry no usable alpha and are treated as
    /// premultiplied by the upload path.
    pub fn premultiplied(&self) -> bool {
        matches!(self, Self::Xrgb32 | Self::Xbgr32)
    }
}

/// Buffer creation flags.
pub mod buffer_flags {
    /// Row 0 is at the bottom of the buffer; the upload path flips rows.
    pub const FLIP_Y: u32 = 1 << 0;
}

/// Resize edge bitset. Tells the client which corners stay anchored.
pub mod edges {
    pub const NO_EDGES: u8 = 0;
    pub const LEFT: u8 = 1 << 0;
    pub const TOP: u8 = 1 << 1;
    pub const RIGHT: u8 = 1 << 2;
    pub const BOTTOM: u8 = 1 << 3;
}

/// Keyboard modifier bitset carried on key events.
pub mod modifiers {
    pub const LSHIFT: u16 = 1 << 0;
    pub const RSHIFT: u16 = 1 << 1;
    pub const LCTRL: u16 = 1 << 2;
    pub const RCTRL: u16 = 1 << 3;
    pub const LALT: u16 = 1 << 4;
    pub const RALT: u16 = 1 << 5;
    pub const SCROLL_LOCK: u16 = 1 << 6;
    pub const NUM_LOCK: u16 = 1 << 7;
    pub const CAPS_LOCK: u16 = 1 << 8;
    pub const REPEATED: u16 = 1 << 9;
}

/// Screen mode attribute bits.
pub mod mode_flags {
    pub const CURRENT: u8 = 1 << 0;
    pub const PREFERRED: u8 = 1 << 1;
}

#[derive(Archive, Deserialize, Serialize, Debug, Copy, Clone, Eq, PartialEq)]
pub enum FullscreenMode {
    Exit,
    Normal,
    Full,
}

#[derive(Archive, Deserialize, Serialize, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transform {
    None,
    Rotate90,
    Rotate180,
    Rotate270,
}

#[derive(Archive, Deserialize, Serialize, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    ResourceExhausted,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, EnumAsInner)]
pub enum Request {
    Core(CoreRequest),
    Screen(ScreenRequest),
    Memory(MemoryRequest),
    MemoryPool(MemoryPoolRequest),
    Buffer(BufferRequest),
    Surface(SurfaceRequest),
    Pointer(PointerRequest),
    Keyboard(KeyboardRequest),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum CoreRequest {
    Sync { serial: u32 },
    GetObjects,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum ScreenRequest {
    GetProperties {
        id: ObjectId,
    },
    GetModes {
        id: ObjectId,
    },
    /// x/y of -1 request an auto-placed spawn position.
    CreateSurface {
        screen: ObjectId,
        id: ObjectId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum MemoryRequest {
    CreatePool {
        id: ObjectId,
        handle: u64,
        size: u64,
    },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum MemoryPoolRequest {
    CreateBuffer {
        pool: ObjectId,
        id: ObjectId,
        offset: u64,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
        flags: u32,
    },
    Destroy {
        id: ObjectId,
    },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum BufferRequest {
    Destroy { id: ObjectId },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum SurfaceRequest {
    GetFormats {
        id: ObjectId,
    },
    /// `buffer` of [`ObjectId::NONE`] detaches the content.
    SetBuffer {
        id: ObjectId,
        buffer: ObjectId,
    },
    SetInputRegion {
        id: ObjectId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    SetDropShadow {
        id: ObjectId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    SetTransparency {
        id: ObjectId,
        enable: bool,
    },
    SetCornerRadius {
        id: ObjectId,
        radius: i32,
    },
    RequestFrame {
        id: ObjectId,
    },
    Invalidate {
        id: ObjectId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    AddSubsurface {
        parent: ObjectId,
        child: ObjectId,
        x: i32,
        y: i32,
    },
    ResizeSubsurface {
        id: ObjectId,
        width: i32,
        height: i32,
    },
    MoveSubsurface {
        id: ObjectId,
        x: i32,
        y: i32,
    },
    Commit {
        id: ObjectId,
    },
    RequestFullscreenMode {
        id: ObjectId,
        mode: FullscreenMode,
    },
    RequestLevel {
        id: ObjectId,
        level: i32,
    },
    RequestFocus {
        id: ObjectId,
    },
    /// Begin an interactive resize driven by `pointer`.
    Resize {
        id: ObjectId,
        pointer: ObjectId,
        edges: u8,
    },
    /// Begin an interactive move driven by `pointer`.
    Move {
        id: ObjectId,
        pointer: ObjectId,
    },
    Destroy {
        id: ObjectId,
    },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum PointerRequest {
    /// Attach a cursor image; `surface` of [`ObjectId::NONE`] hides it.
    SetSurface {
        pointer: ObjectId,
        surface: ObjectId,
        x_offset: i32,
        y_offset: i32,
    },
    Grab {
        pointer: ObjectId,
        surface: ObjectId,
    },
    Ungrab {
        pointer: ObjectId,
        surface: ObjectId,
    },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
pub enum KeyboardRequest {
    Hook {
        keyboard: ObjectId,
        surface: ObjectId,
    },
    Unhook {
        keyboard: ObjectId,
        surface: ObjectId,
    },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, EnumAsInner)]
pub enum Event {
    Sync {
        serial: u32,
    },
    Error {
        id: ObjectId,
        code: ErrorCode,
        message: String,
    },
    /// Announces an object. For client-created objects `id` is the client's
    /// local id; for server objects it equals `global_id`.
    Object {
        id: ObjectId,
        global_id: ObjectId,
        handle: u64,
        kind: ObjectType,
    },
    Destroy {
        id: ObjectId,
    },
    ScreenProperties {
        id: ObjectId,
        x: i32,
        y: i32,
        transform: Transform,
        scale: i32,
    },
    ScreenMode {
        id: ObjectId,
        flags: u8,
        width: i32,
        height: i32,
        refresh_rate: i32,
    },
    SurfaceFormat {
        id: ObjectId,
        format: PixelFormat,
    },
    SurfaceFrame {
        id: ObjectId,
    },
    SurfaceResize {
        id: ObjectId,
        width: i32,
        height: i32,
        edges: u8,
    },
    SurfaceFocus {
        id: ObjectId,
        focus: bool,
    },
    BufferRelease {
        id: ObjectId,
    },
    PointerEnter {
        pointer: ObjectId,
        surface: ObjectId,
        x: i32,
        y: i32,
    },
    PointerLeave {
        pointer: ObjectId,
        surface: ObjectId,
    },
    PointerMove {
        pointer: ObjectId,
        surface: ObjectId,
        x: i32,
        y: i32,
    },
    PointerClick {
        pointer: ObjectId,
        surface: ObjectId,
        button: u32,
        pressed: bool,
    },
    PointerScroll {
        pointer: ObjectId,
        surface: ObjectId,
        delta: i32,
    },
    KeyboardKey {
        surface: ObjectId,
        keycode: u32,
        modifiers: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_range_detection() {
        assert!(!ObjectId(1).is_server());
        assert!(!ObjectId(SERVER_ID_BASE - 1).is_server());
        assert!(ObjectId(SERVER_ID_BASE).is_server());
        assert!(ObjectId(u32::MAX).is_server());
    }

    #[test]
    fn request_roundtrips_through_rkyv() {
        let request = Request::Surface(SurfaceRequest::Resize {
            id: ObjectId(7),
            pointer: ObjectId(SERVER_ID_BASE + 2),
            edges: edges::RIGHT | edges::BOTTOM,
        });
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&request).unwrap();
        let decoded: Request = rkyv::from_bytes::<_, rkyv::rancor::Error>(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn event_roundtrips_through_rkyv() {
        let event = Event::Error {
            id: ObjectId(3),
            code: ErrorCode::NotFound,
            message: "surface: object does not exist".to_string(),
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&event).unwrap();
        let decoded: Event = rkyv::from_bytes::<_, rkyv::rancor::Error>(&bytes).unwrap();
        assert_eq!(decoded, event);
    }
}
