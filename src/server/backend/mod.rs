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

//! Render back-ends. The compositor core drives a [`RenderDriver`] and never
//! touches pixels itself; the software driver rasterizes into a framebuffer
//! presented through a [`Framebuffer`], the headless driver records calls
//! for tests.

use crate::prelude::*;
use crate::protocol::PixelFormat;
use crate::region::Region;

pub mod headless;
pub mod software;

pub type TextureId = u32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlendMode {
    /// Opaque surfaces overwrite what is below them.
    Replace,
    /// Source-alpha-over for transparent surfaces.
    AlphaOver,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TextureFlags {
    pub flip_y: bool,
    pub premultiplied: bool,
}

/// What the renderer needs from a back-end. Calls arrive from the render
/// thread and, for texture creation/destruction, from request threads; the
/// renderer serializes them behind its driver lock.
pub trait RenderDriver: Send {
    fn create_texture(
        &mut self,
        width: i32,
        height: i32,
        format: PixelFormat,
        flags: TextureFlags,
        data: &[u8],
    ) -> Result<TextureId>;

    fn update_texture(&mut self, id: TextureId, data: &[u8]) -> Result<()>;

    fn destroy_texture(&mut self, id: TextureId);

    fn begin_frame(&mut self);

    /// Finish composition and present.
    fn end_frame(&mut self) -> Result<()>;

    fn save(&mut self);

    fn restore(&mut self);

    fn translate(&mut self, x: i32, y: i32);

    fn set_blend(&mut self, blend: BlendMode);

    /// Drop shadow behind a surface of the given size. `shadow` is the
    /// client-staged shadow region relative to the surface.
    fn draw_shadow(&mut self, shadow: Region, width: i32, height: i32, corner_radius: i32);

    /// Textured quad at the current translation.
    fn draw_texture(&mut self, id: TextureId, width: i32, height: i32);

    fn supported_formats(&self) -> Vec<PixelFormat>;
}

/// The present surface: accepts a finished frame of `0xAARRGGBB` words.
pub trait Framebuffer: Send {
    fn present(&mut self, pixels: &[u32], width: i32, height: i32) -> Result<()>;
}

/// Swallows frames. The default output when prism runs without a display
/// device of its own.
pub struct NullOutput;

impl Framebuffer for NullOutput {
    fn present(&mut self, _pixels: &[u32], _width: i32, _height: i32) -> Result<()> {
        Ok(())
    }
}
