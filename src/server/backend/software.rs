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

//! A software rasterizing driver. Textures and the framebuffer are
//! `0xAARRGGBB` words; uploads swizzle the client's pixel format into that
//! layout (honoring flip-Y) so composition is format-free.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::prelude::*;
use crate::protocol::PixelFormat;
use crate::region::Region;
use crate::server::backend::BlendMode;
use crate::server::backend::Framebuffer;
use crate::server::backend::RenderDriver;
use crate::server::backend::TextureFlags;
use crate::server::backend::TextureId;

const SHADOW_ALPHA: u32 = 128;

struct Texture {
    width: i32,
    height: i32,
    format: PixelFormat,
    flags: TextureFlags,
    pixels: Vec<u32>,
}

impl Texture {
    /// `data` is the client buffer: `height` rows at its own stride, which
    /// may exceed the row width.
    fn upload(&mut self, data: &[u8]) -> Result<()> {
        let row_bytes = (self.width as usize) * 4;
        let height = self.height.max(1) as usize;
        let src_stride = data.len() / height;
        ensure!(
            src_stride >= row_bytes,
            "texture data too short: stride {} < row {}",
            src_stride,
            row_bytes
        );

        // ARGB32 is already the framebuffer layout; lift the whole image
        // when the rows are packed and the client memory is word-aligned.
        if self.format == PixelFormat::Argb32 && !self.flags.flip_y && src_stride == row_bytes {
            if let Ok(words) = bytemuck::try_cast_slice::<u8, u32>(data) {
                self.pixels.copy_from_slice(words);
                return Ok(());
            }
        }

        for row in 0..height {
            let src_row = if self.flags.flip_y { height - 1 - row } else { row };
            let src = &data[src_row * src_stride..src_row * src_stride + row_bytes];
            let dst = &mut self.pixels[row * self.width as usize..(row + 1) * self.width as usize];
            for (dst_px, src_px) in dst.iter_mut().zip(src.chunks_exact(4)) {
                *dst_px = decode_pixel(self.format, src_px.try_into().unwrap());
            }
        }
        Ok(())
    }
}

/// Byte layout per format, normalized to an `0xAARRGGBB` word. The format
/// names give the channel order within a little-endian 32-bit word, so e.g.
/// ARGB32 stores bytes B, G, R, A.
fn decode_pixel(format: PixelFormat, px: [u8; 4]) -> u32 {
    let [b0, b1, b2, b3] = px;
    let (a, r, g, b) = match format {
        PixelFormat::Argb32 => (b3, b2, b1, b0),
        PixelFormat::Abgr32 => (b3, b0, b1, b2),
        PixelFormat::Xrgb32 => (0xff, b2, b1, b0),
        PixelFormat::Xbgr32 => (0xff, b0, b1, b2),
        PixelFormat::Rgba32 => (b0, b3, b2, b1),
        PixelFormat::Bgra32 => (b0, b1, b2, b3),
    };
    u32::from(a) << 24 | u32::from(r) << 16 | u32::from(g) << 8 | u32::from(b)
}

fn alpha_over(dst: u32, src: u32, premultiplied: bool) -> u32 {
    let sa = src >> 24 & 0xff;
    if sa == 0xff {
        return src;
    }
    if sa == 0 && !premultiplied {
        return dst;
    }

    let blend_channel = |shift: u32| -> u32 {
        let s = src >> shift & 0xff;
        let d = dst >> shift & 0xff;
        let s = if premultiplied { s } else { s * sa / 255 };
        (s + d * (255 - sa) / 255).min(255)
    };

    let da = dst >> 24 & 0xff;
    let out_a = (sa + da * (255 - sa) / 255).min(255);
    out_a << 24 | blend_channel(16) << 16 | blend_channel(8) << 8 | blend_channel(0)
}

pub struct SoftwareDriver {
    width: i32,
    height: i32,
    framebuffer: Vec<u32>,
    clear_color: u32,
    textures: HashMap<TextureId, Texture>,
    next_texture: TextureId,
    translation: (i32, i32),
    saved: Vec<(i32, i32)>,
    blend: BlendMode,
    output: Box<dyn Framebuffer>,
}

impl SoftwareDriver {
    pub fn new(width: i32, height: i32, output: Box<dyn Framebuffer>) -> Self {
        Self {
            width,
            height,
            framebuffer: vec![0; (width * height).max(0) as usize],
            // The boot teal, fully opaque.
            clear_color: 0xff28_575a,
            textures: HashMap::new(),
            next_texture: 1,
            translation: (0, 0),
            saved: Vec::new(),
            blend: BlendMode::Replace,
            output,
        }
    }

    /// Shares the framebuffer for inspection; used by tests and by outputs
    /// that want zero-copy access.
    pub fn snapshot(&self) -> Vec<u32> {
        self.framebuffer.clone()
    }

    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return None;
        }
        Some(self.framebuffer[(y * self.width + x) as usize])
    }

    fn fill(&mut self, x: i32, y: i32, width: i32, height: i32, color: u32, blend: BlendMode) {
        let x0 = (x + self.translation.0).max(0);
        let y0 = (y + self.translation.1).max(0);
        let x1 = (x + self.translation.0 + width).min(self.width);
        let y1 = (y + self.translation.1 + height).min(self.height);
        for fy in y0..y1 {
            for fx in x0..x1 {
                let dst = &mut self.framebuffer[(fy * self.width + fx) as usize];
                *dst = match blend {
                    BlendMode::Replace => color,
                    BlendMode::AlphaOver => alpha_over(*dst, color, false),
                };
            }
        }
    }
}

/// A software driver paired with a handle to inspect its framebuffer after
/// frames. The driver itself moves into the renderer; tests keep the handle.
pub fn with_probe(
    width: i32,
    height: i32,
    output: Box<dyn Framebuffer>,
) -> (SharedSoftwareDriver, FramebufferProbe) {
    let driver = Arc::new(Mutex::new(SoftwareDriver::new(width, height, output)));
    (
        SharedSoftwareDriver(driver.clone()),
        FramebufferProbe(driver),
    )
}

pub struct SharedSoftwareDriver(Arc<Mutex<SoftwareDriver>>);

pub struct FramebufferProbe(Arc<Mutex<SoftwareDriver>>);

impl FramebufferProbe {
    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        self.0.lock().unwrap().pixel(x, y)
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.0.lock().unwrap().snapshot()
    }
}

impl RenderDriver for SharedSoftwareDriver {
    fn create_texture(
        &mut self,
        width: i32,
        height: i32,
        format: PixelFormat,
        flags: TextureFlags,
        data: &[u8],
    ) -> Result<TextureId> {
        self.0
            .lock()
            .unwrap()
            .create_texture(width, height, format, flags, data)
    }

    fn update_texture(&mut self, id: TextureId, data: &[u8]) -> Result<()> {
        self.0.lock().unwrap().update_texture(id, data)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        self.0.lock().unwrap().destroy_texture(id);
    }

    fn begin_frame(&mut self) {
        self.0.lock().unwrap().begin_frame();
    }

    fn end_frame(&mut self) -> Result<()> {
        self.0.lock().unwrap().end_frame()
    }

    fn save(&mut self) {
        self.0.lock().unwrap().save();
    }

    fn restore(&mut self) {
        self.0.lock().unwrap().restore();
    }

    fn translate(&mut self, x: i32, y: i32) {
        self.0.lock().unwrap().translate(x, y);
    }

    fn set_blend(&mut self, blend: BlendMode) {
        self.0.lock().unwrap().set_blend(blend);
    }

    fn draw_shadow(&mut self, shadow: Region, width: i32, height: i32, corner_radius: i32) {
        self.0
            .lock()
            .unwrap()
            .draw_shadow(shadow, width, height, corner_radius);
    }

    fn draw_texture(&mut self, id: TextureId, width: i32, height: i32) {
        self.0.lock().unwrap().draw_texture(id, width, height);
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        self.0.lock().unwrap().supported_formats()
    }
}

impl RenderDriver for SoftwareDriver {
    fn create_texture(
        &mut self,
        width: i32,
        height: i32,
        format: PixelFormat,
        flags: TextureFlags,
        data: &[u8],
    ) -> Result<TextureId> {
        ensure!(width > 0 && height > 0, "zero-sized texture");

        let id = self.next_texture;
        self.next_texture += 1;

        let mut texture = Texture {
            width,
            height,
            format,
            flags,
            pixels: vec![0; (width * height) as usize],
        };
        texture.upload(data).location(loc!())?;
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn update_texture(&mut self, id: TextureId, data: &[u8]) -> Result<()> {
        let texture = self
            .textures
            .get_mut(&id)
            .ok_or(anyhow!("unknown texture {id}"))?;
        texture.upload(data).location(loc!())
    }

    fn destroy_texture(&mut self, id: TextureId) {
        self.textures.remove(&id);
    }

    fn begin_frame(&mut self) {
        self.framebuffer.fill(self.clear_color);
        self.translation = (0, 0);
        self.saved.clear();
        self.blend = BlendMode::Replace;
    }

    fn end_frame(&mut self) -> Result<()> {
        // The output may keep the slice only for the duration of the call.
        let frame = std::mem::take(&mut self.framebuffer);
        let result = self.output.present(&frame, self.width, self.height);
        self.framebuffer = frame;
        result
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

    fn draw_shadow(&mut self, shadow: Region, width: i32, height: i32, _corner_radius: i32) {
        // An even fill standing in for the box gradient of GPU back-ends.
        let color = SHADOW_ALPHA << 24;
        self.fill(
            shadow.x,
            shadow.y,
            width + shadow.width,
            height + shadow.height,
            color,
            BlendMode::AlphaOver,
        );
    }

    fn draw_texture(&mut self, id: TextureId, width: i32, height: i32) {
        let Some(texture) = self.textures.remove(&id) else {
            warn!("draw of unknown texture {id}");
            return;
        };

        let draw_width = width.min(texture.width);
        let draw_height = height.min(texture.height);
        for y in 0..draw_height {
            for x in 0..draw_width {
                let src = texture.pixels[(y * texture.width + x) as usize];
                let fx = x + self.translation.0;
                let fy = y + self.translation.1;
                if fx < 0 || fy < 0 || fx >= self.width || fy >= self.height {
                    continue;
                }
                let dst = &mut self.framebuffer[(fy * self.width + fx) as usize];
                *dst = match self.blend {
                    BlendMode::Replace => src,
                    BlendMode::AlphaOver => {
                        alpha_over(*dst, src, texture.flags.premultiplied)
                    },
                };
            }
        }
        self.textures.insert(id, texture);
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        vec![
            PixelFormat::Argb32,
            PixelFormat::Abgr32,
            PixelFormat::Xrgb32,
            PixelFormat::Xbgr32,
            PixelFormat::Rgba32,
            PixelFormat::Bgra32,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argb_bytes(pixels: &[u32]) -> Vec<u8> {
        pixels.iter().flat_map(|px| px.to_le_bytes()).collect()
    }

    #[test]
    fn argb_upload_is_identity() {
        let mut driver = SoftwareDriver::new(4, 4, Box::new(crate::server::backend::NullOutput));
        let pixels = vec![0xff12_3456u32; 4];
        let id = driver
            .create_texture(2, 2, PixelFormat::Argb32, TextureFlags::default(), &argb_bytes(&pixels))
            .unwrap();

        driver.begin_frame();
        driver.draw_texture(id, 2, 2);
        assert_eq!(driver.pixel(0, 0), Some(0xff12_3456));
        assert_eq!(driver.pixel(1, 1), Some(0xff12_3456));
        assert_eq!(driver.pixel(2, 2), Some(driver.clear_color));
    }

    #[test]
    fn bgra_channels_are_swizzled() {
        let mut driver = SoftwareDriver::new(1, 1, Box::new(crate::server::backend::NullOutput));
        // Bytes A, B, G, R for Bgra32 (word 0xRRGGBBAA).
        let data = [0xff, 0x56, 0x34, 0x12];
        let id = driver
            .create_texture(1, 1, PixelFormat::Bgra32, TextureFlags::default(), &data)
            .unwrap();
        driver.begin_frame();
        driver.draw_texture(id, 1, 1);
        assert_eq!(driver.pixel(0, 0), Some(0xff12_3456));
    }

    #[test]
    fn flip_y_reverses_rows() {
        let mut driver = SoftwareDriver::new(1, 2, Box::new(crate::server::backend::NullOutput));
        let data = argb_bytes(&[0xff00_0001, 0xff00_0002]);
        let id = driver
            .create_texture(
                1,
                2,
                PixelFormat::Argb32,
                TextureFlags {
                    flip_y: true,
                    premultiplied: false,
                },
                &data,
            )
            .unwrap();
        driver.begin_frame();
        driver.draw_texture(id, 1, 2);
        assert_eq!(driver.pixel(0, 0), Some(0xff00_0002));
        assert_eq!(driver.pixel(0, 1), Some(0xff00_0001));
    }

    #[test]
    fn translation_offsets_draws_and_restores() {
        let mut driver = SoftwareDriver::new(8, 8, Box::new(crate::server::backend::NullOutput));
        let id = driver
            .create_texture(
                1,
                1,
                PixelFormat::Argb32,
                TextureFlags::default(),
                &argb_bytes(&[0xffff_ffff]),
            )
            .unwrap();

        driver.begin_frame();
        driver.save();
        driver.translate(3, 4);
        driver.draw_texture(id, 1, 1);
        driver.restore();
        driver.draw_texture(id, 1, 1);

        assert_eq!(driver.pixel(3, 4), Some(0xffff_ffff));
        assert_eq!(driver.pixel(0, 0), Some(0xffff_ffff));
        assert_eq!(driver.pixel(3, 0), Some(driver.clear_color));
    }

    #[test]
    fn alpha_over_blends_halfway() {
        let dst = 0xff00_0000; // opaque black
        let src = 0x80ff_0000; // half-alpha red
        let out = alpha_over(dst, src, false);
        let r = out >> 16 & 0xff;
        assert!((0x7e..=0x82).contains(&r), "r = {r:#x}");
        assert_eq!(out >> 24, 0xff);
    }

    #[test]
    fn replace_blend_copies_source_verbatim() {
        let mut driver = SoftwareDriver::new(1, 1, Box::new(crate::server::backend::NullOutput));
        let id = driver
            .create_texture(
                1,
                1,
                PixelFormat::Argb32,
                TextureFlags::default(),
                &argb_bytes(&[0x1122_3344]),
            )
            .unwrap();
        driver.begin_frame();
        driver.set_blend(BlendMode::Replace);
        driver.draw_texture(id, 1, 1);
        assert_eq!(driver.pixel(0, 0), Some(0x1122_3344));
    }
}
