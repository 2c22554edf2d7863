// crates/kino-media/src/render.rs
//
// Frame-to-texture planning. A closed table maps decoder pixel formats to
// texture formats; packed 24/32-bit formats carry a channel layout the
// canvas shuffles into RGBA directly, and the blend mode decides whether
// their alpha bytes are honored or forced opaque. Everything else (sub-byte
// and 16-bit RGB, YUV) goes through a cached software rescale, since the
// canvas consumes RGBA only. Negative line strides are walked from the last
// row; pictures mixing positive and negative strides across planes are
// rejected.

use anyhow::{bail, Result};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::scaling;
use ffmpeg::util::format::Pixel;
use ffmpeg::util::frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Rgb332,
    Rgb555,
    Bgr555,
    Rgb565,
    Bgr565,
    Rgb24,
    Bgr24,
    Xrgb8888,
    Xbgr8888,
    Rgbx8888,
    Bgrx8888,
    Argb8888,
    Rgba8888,
    Abgr8888,
    Bgra8888,
    Iyuv,
    Yuy2,
    Uyvy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    Blend,
}

/// Byte offsets of the color channels inside one packed pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLayout {
    pub bytes_per_pixel: usize,
    pub r: usize,
    pub g: usize,
    pub b: usize,
    pub alpha: Option<usize>,
}

impl TextureFormat {
    /// Channel layout for formats the canvas can shuffle into RGBA without
    /// a rescale pass. None for sub-byte, 16-bit and YUV formats.
    pub fn packed_rgb(self) -> Option<PackedLayout> {
        fn layout(
            bytes_per_pixel: usize,
            r: usize,
            g: usize,
            b: usize,
            alpha: Option<usize>,
        ) -> Option<PackedLayout> {
            Some(PackedLayout {
                bytes_per_pixel,
                r,
                g,
                b,
                alpha,
            })
        }
        match self {
            TextureFormat::Rgb24 => layout(3, 0, 1, 2, None),
            TextureFormat::Bgr24 => layout(3, 2, 1, 0, None),
            TextureFormat::Rgba8888 => layout(4, 0, 1, 2, Some(3)),
            TextureFormat::Bgra8888 => layout(4, 2, 1, 0, Some(3)),
            TextureFormat::Argb8888 => layout(4, 1, 2, 3, Some(0)),
            TextureFormat::Abgr8888 => layout(4, 3, 2, 1, Some(0)),
            TextureFormat::Rgbx8888 => layout(4, 0, 1, 2, None),
            TextureFormat::Bgrx8888 => layout(4, 2, 1, 0, None),
            TextureFormat::Xrgb8888 => layout(4, 1, 2, 3, None),
            TextureFormat::Xbgr8888 => layout(4, 3, 2, 1, None),
            _ => None,
        }
    }
}

/// Texture format for a decoder pixel format, None when only the rescale
/// fallback applies. Formats carrying real alpha ask for blending.
pub fn map_texture_format(format: Pixel) -> (Option<TextureFormat>, BlendMode) {
    let blend = match format {
        Pixel::RGBA | Pixel::BGRA | Pixel::ARGB | Pixel::ABGR => BlendMode::Blend,
        _ => BlendMode::Opaque,
    };
    let texture = match format {
        Pixel::RGB8 => Some(TextureFormat::Rgb332),
        Pixel::RGB555LE => Some(TextureFormat::Rgb555),
        Pixel::BGR555LE => Some(TextureFormat::Bgr555),
        Pixel::RGB565LE => Some(TextureFormat::Rgb565),
        Pixel::BGR565LE => Some(TextureFormat::Bgr565),
        Pixel::RGB24 => Some(TextureFormat::Rgb24),
        Pixel::BGR24 => Some(TextureFormat::Bgr24),
        Pixel::ZRGB => Some(TextureFormat::Xrgb8888),
        Pixel::ZBGR => Some(TextureFormat::Xbgr8888),
        Pixel::RGBZ => Some(TextureFormat::Rgbx8888),
        Pixel::BGRZ => Some(TextureFormat::Bgrx8888),
        Pixel::ARGB => Some(TextureFormat::Argb8888),
        Pixel::RGBA => Some(TextureFormat::Rgba8888),
        Pixel::ABGR => Some(TextureFormat::Abgr8888),
        Pixel::BGRA => Some(TextureFormat::Bgra8888),
        Pixel::YUV420P => Some(TextureFormat::Iyuv),
        Pixel::YUYV422 => Some(TextureFormat::Yuy2),
        Pixel::UYVY422 => Some(TextureFormat::Uyvy),
        _ => None,
    };
    (texture, blend)
}

pub struct RgbaImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Converts decoded pictures to tightly packed RGBA for upload. Packed RGB
/// pictures are shuffled channel-wise per the texture table; everything
/// else goes through a rescale context cached across frames of the same
/// shape.
pub struct FrameScaler {
    ctx: Option<scaling::Context>,
    key: Option<(Pixel, u32, u32)>,
}

impl FrameScaler {
    pub fn new() -> Self {
        Self {
            ctx: None,
            key: None,
        }
    }

    pub fn rgba(&mut self, picture: &frame::Video) -> Result<RgbaImage> {
        let width = picture.width();
        let height = picture.height();
        if width == 0 || height == 0 {
            bail!("empty picture");
        }

        let (texture, blend) = map_texture_format(picture.format());
        if let Some(layout) = texture.and_then(TextureFormat::packed_rgb) {
            let data = shuffle_packed_rgba(picture, layout, blend)?;
            return Ok(RgbaImage {
                width,
                height,
                data,
            });
        }

        reject_mixed_strides(picture)?;

        let key = (picture.format(), width, height);
        if self.key != Some(key) || self.ctx.is_none() {
            self.ctx = Some(scaling::Context::get(
                picture.format(),
                width,
                height,
                Pixel::RGBA,
                width,
                height,
                scaling::Flags::BILINEAR,
            )?);
            self.key = Some(key);
        }
        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None => bail!("no rescale context"),
        };

        let mut converted = frame::Video::empty();
        ctx.run(picture, &mut converted)?;
        // the rescaler output is straight RGBA; the fallback is opaque, as
        // alpha outside the packed table is not part of the texture contract
        let data = shuffle_packed_rgba(
            &converted,
            PackedLayout {
                bytes_per_pixel: 4,
                r: 0,
                g: 1,
                b: 2,
                alpha: None,
            },
            BlendMode::Opaque,
        )?;
        Ok(RgbaImage {
            width,
            height,
            data,
        })
    }
}

impl Default for FrameScaler {
    fn default() -> Self {
        Self::new()
    }
}

/// Shuffle plane 0 into tightly packed RGBA, top row first. The alpha byte
/// is taken from the source only when the format has one and the blend mode
/// asks for it; otherwise the output is opaque.
fn shuffle_packed_rgba(
    picture: &frame::Video,
    layout: PackedLayout,
    blend: BlendMode,
) -> Result<Vec<u8>> {
    let width = picture.width() as usize;
    let height = picture.height() as usize;
    let row_bytes = width * layout.bytes_per_pixel;
    let keep_alpha = blend == BlendMode::Blend && layout.alpha.is_some();

    let passthrough = layout
        == PackedLayout {
            bytes_per_pixel: 4,
            r: 0,
            g: 1,
            b: 2,
            alpha: Some(3),
        }
        && keep_alpha;

    let mut data = Vec::with_capacity(width * height * 4);
    for_each_row(picture, row_bytes, |row| {
        if passthrough {
            data.extend_from_slice(row);
            return;
        }
        for pixel in row.chunks_exact(layout.bytes_per_pixel) {
            let alpha = match layout.alpha {
                Some(at) if keep_alpha => pixel[at],
                _ => 0xFF,
            };
            data.extend_from_slice(&[pixel[layout.r], pixel[layout.g], pixel[layout.b], alpha]);
        }
    })?;
    Ok(data)
}

/// Visit each row of plane 0 top-down. A negative stride walks up from the
/// last row instead.
fn for_each_row(
    picture: &frame::Video,
    row_bytes: usize,
    mut visit: impl FnMut(&[u8]),
) -> Result<()> {
    let height = picture.height() as usize;
    let stride = unsafe { (*picture.as_ptr()).linesize[0] } as isize;
    if stride == 0 {
        bail!("picture has no line stride");
    }
    if stride > 0 {
        let plane = picture.data(0);
        let stride = stride as usize;
        if stride < row_bytes || plane.len() < (height - 1) * stride + row_bytes {
            bail!("picture plane too short for its geometry");
        }
        for row in 0..height {
            let start = row * stride;
            visit(&plane[start..start + row_bytes]);
        }
    } else {
        // rows are stored bottom-up: data[0] points at the visually first
        // row, each following row sits `stride` bytes lower in memory
        let base = unsafe { (*picture.as_ptr()).data[0] };
        if base.is_null() {
            bail!("picture has no data plane");
        }
        for row in 0..height {
            let row_ptr = unsafe { base.offset(stride * row as isize) };
            let row_slice = unsafe { std::slice::from_raw_parts(row_ptr, row_bytes) };
            visit(row_slice);
        }
    }
    Ok(())
}

/// Planes must agree on stride direction; a picture mixing signs cannot be
/// addressed as one surface.
fn reject_mixed_strides(picture: &frame::Video) -> Result<()> {
    let planes = picture.planes();
    let mut negative = 0usize;
    let mut positive = 0usize;
    for plane in 0..planes {
        let stride = unsafe { (*picture.as_ptr()).linesize[plane] };
        if stride < 0 {
            negative += 1;
        } else if stride > 0 {
            positive += 1;
        }
    }
    if negative > 0 && positive > 0 {
        bail!("mixed negative and positive line strides are not supported");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_formats_request_blending() {
        for format in [Pixel::RGBA, Pixel::BGRA, Pixel::ARGB, Pixel::ABGR] {
            let (texture, blend) = map_texture_format(format);
            assert!(texture.is_some());
            assert_eq!(blend, BlendMode::Blend);
        }
    }

    #[test]
    fn planar_yuv_maps_to_iyuv() {
        assert_eq!(
            map_texture_format(Pixel::YUV420P),
            (Some(TextureFormat::Iyuv), BlendMode::Opaque)
        );
    }

    #[test]
    fn unknown_formats_fall_through() {
        let (texture, blend) = map_texture_format(Pixel::YUV444P10LE);
        assert_eq!(texture, None);
        assert_eq!(blend, BlendMode::Opaque);
    }

    #[test]
    fn packed_layouts_cover_byte_orders_only() {
        assert!(TextureFormat::Rgb24.packed_rgb().is_some());
        assert!(TextureFormat::Bgra8888.packed_rgb().is_some());
        assert!(TextureFormat::Xrgb8888.packed_rgb().is_some());
        // sub-byte, 16-bit and YUV formats need the rescaler
        assert!(TextureFormat::Rgb332.packed_rgb().is_none());
        assert!(TextureFormat::Rgb565.packed_rgb().is_none());
        assert!(TextureFormat::Iyuv.packed_rgb().is_none());
        assert!(TextureFormat::Yuy2.packed_rgb().is_none());
    }

    #[test]
    fn rgba_picture_copies_straight_through() {
        let mut picture = frame::Video::new(Pixel::RGBA, 4, 2);
        let stride = picture.stride(0);
        {
            let plane = picture.data_mut(0);
            for row in 0..2 {
                for col in 0..4 {
                    let at = row * stride + col * 4;
                    plane[at..at + 4].copy_from_slice(&[row as u8, col as u8, 0xAB, 0x80]);
                }
            }
        }
        let mut scaler = FrameScaler::new();
        let image = scaler.rgba(&picture).unwrap();
        assert_eq!((image.width, image.height), (4, 2));
        assert_eq!(image.data.len(), 4 * 2 * 4);
        // alpha survives: RGBA is a blending format
        assert_eq!(&image.data[0..4], &[0, 0, 0xAB, 0x80]);
        assert_eq!(&image.data[4 * 4..4 * 4 + 4], &[1, 0, 0xAB, 0x80]);
    }

    #[test]
    fn bgra_picture_is_swizzled() {
        let mut picture = frame::Video::new(Pixel::BGRA, 2, 1);
        {
            let plane = picture.data_mut(0);
            for col in 0..2 {
                let at = col * 4;
                // b, g, r, a
                plane[at..at + 4].copy_from_slice(&[1, 2, 3, 4]);
            }
        }
        let mut scaler = FrameScaler::new();
        let image = scaler.rgba(&picture).unwrap();
        assert_eq!(&image.data[0..4], &[3, 2, 1, 4]);
    }

    #[test]
    fn alphaless_packed_formats_come_out_opaque() {
        let mut picture = frame::Video::new(Pixel::RGB24, 2, 1);
        {
            let plane = picture.data_mut(0);
            plane[0..3].copy_from_slice(&[10, 20, 30]);
            plane[3..6].copy_from_slice(&[40, 50, 60]);
        }
        let mut scaler = FrameScaler::new();
        let image = scaler.rgba(&picture).unwrap();
        assert_eq!(&image.data[0..4], &[10, 20, 30, 0xFF]);
        assert_eq!(&image.data[4..8], &[40, 50, 60, 0xFF]);
    }

    #[test]
    fn yuv_picture_converts_to_rgba() {
        let picture = frame::Video::new(Pixel::YUV420P, 8, 8);
        let mut scaler = FrameScaler::new();
        let image = scaler.rgba(&picture).unwrap();
        assert_eq!(image.data.len(), 8 * 8 * 4);
    }
}
