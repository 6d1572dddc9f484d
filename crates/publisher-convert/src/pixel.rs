//! RGBA to planar YUV 4:2:0 conversion with bilinear scaling.
//!
//! Colors use BT.601 limited range integer coefficients. Chroma is the
//! average of each 2x2 block of scaled RGB samples; odd edges reuse the last
//! row or column.

use tracing::debug;

use crate::error::ConvertError;
use crate::ConvertResult;

/// Fixed-point precision of the interpolation weights.
const WEIGHT_BITS: u32 = 8;
const WEIGHT_ONE: u32 = 1 << WEIGHT_BITS;

/// A planar YUV 4:2:0 picture with tightly packed planes.
#[derive(Debug, Clone)]
pub struct I420Picture {
    width: u32,
    height: u32,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

impl I420Picture {
    /// Allocate a picture, reporting allocation failure instead of aborting.
    pub fn try_new(width: u32, height: u32) -> ConvertResult<Self> {
        if width == 0 || height == 0 {
            return Err(ConvertError::InvalidDimensions { width, height });
        }
        let luma = width as usize * height as usize;
        let chroma = chroma_len(width) * chroma_len(height);

        Ok(Self {
            width,
            height,
            y: zeroed(luma)?,
            u: zeroed(chroma)?,
            v: zeroed(chroma)?,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Width of the chroma planes.
    pub fn chroma_width(&self) -> usize {
        chroma_len(self.width)
    }

    /// Luma plane, stride `width`.
    pub fn y(&self) -> &[u8] {
        &self.y
    }

    /// Cb plane, stride `chroma_width()`.
    pub fn u(&self) -> &[u8] {
        &self.u
    }

    /// Cr plane, stride `chroma_width()`.
    pub fn v(&self) -> &[u8] {
        &self.v
    }

    /// Total bytes across the three planes.
    pub fn byte_len(&self) -> usize {
        self.y.len() + self.u.len() + self.v.len()
    }
}

/// Interpolation tap along one axis.
#[derive(Debug, Clone, Copy)]
struct Tap {
    near: usize,
    far: usize,
    /// Weight of `far` in 1/256ths.
    weight: u32,
}

/// Bilinear RGBA scaler producing I420 pictures.
pub struct RgbaScaler {
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
    x_taps: Vec<Tap>,
    y_taps: Vec<Tap>,
    /// Two scaled RGB rows, the pair feeding one chroma row.
    rows: [Vec<u8>; 2],
}

impl RgbaScaler {
    /// Create a scaler from `src` to `dst` geometry.
    pub fn new(
        src_width: u32,
        src_height: u32,
        dst_width: u32,
        dst_height: u32,
    ) -> ConvertResult<Self> {
        for (width, height) in [(src_width, src_height), (dst_width, dst_height)] {
            if width == 0 || height == 0 {
                return Err(ConvertError::InvalidDimensions { width, height });
            }
        }

        debug!(
            src_width,
            src_height,
            dst_width,
            dst_height,
            "Creating RGBA scaler"
        );

        let row_len = dst_width as usize * 3;
        Ok(Self {
            src_width,
            src_height,
            dst_width,
            dst_height,
            x_taps: build_taps(src_width, dst_width),
            y_taps: build_taps(src_height, dst_height),
            rows: [zeroed(row_len)?, zeroed(row_len)?],
        })
    }

    /// Expected RGBA input length in bytes.
    pub fn input_len(&self) -> usize {
        self.src_width as usize * self.src_height as usize * 4
    }

    /// Scale and convert one RGBA frame into `dst`.
    pub fn convert(&mut self, rgba: &[u8], dst: &mut I420Picture) -> ConvertResult<()> {
        if rgba.len() != self.input_len() {
            return Err(ConvertError::SizeMismatch {
                expected: self.input_len(),
                actual: rgba.len(),
            });
        }
        if dst.width != self.dst_width || dst.height != self.dst_height {
            return Err(ConvertError::InvalidDimensions {
                width: dst.width,
                height: dst.height,
            });
        }

        let width = self.dst_width as usize;
        let height = self.dst_height as usize;
        let chroma_width = dst.chroma_width();
        let src_stride = self.src_width as usize * 4;

        for pair in 0..chroma_len(self.dst_height) {
            let top = pair * 2;
            let bottom = (top + 1).min(height - 1);

            let [first, second] = &mut self.rows;
            scale_row(rgba, src_stride, self.y_taps[top], &self.x_taps, first);
            if bottom != top {
                scale_row(rgba, src_stride, self.y_taps[bottom], &self.x_taps, second);
            } else {
                second.copy_from_slice(first);
            }

            for (row, rgb) in [(top, &*first), (bottom, &*second)] {
                let luma = &mut dst.y[row * width..(row + 1) * width];
                for (x, out) in luma.iter_mut().enumerate() {
                    let p = &rgb[x * 3..x * 3 + 3];
                    *out = luma_of(p[0] as i32, p[1] as i32, p[2] as i32);
                }
            }

            for cx in 0..chroma_width {
                let left = cx * 2;
                let right = (left + 1).min(width - 1);
                let mut sum = [0i32; 3];
                for rgb in [&*first, &*second] {
                    for x in [left, right] {
                        for (c, acc) in sum.iter_mut().enumerate() {
                            *acc += rgb[x * 3 + c] as i32;
                        }
                    }
                }
                let [r, g, b] = sum.map(|s| (s + 2) >> 2);
                let index = pair * chroma_width + cx;
                dst.u[index] = cb_of(r, g, b);
                dst.v[index] = cr_of(r, g, b);
            }
        }

        Ok(())
    }
}

/// Interpolate one destination row of RGB from the source frame.
fn scale_row(src: &[u8], stride: usize, y_tap: Tap, x_taps: &[Tap], out: &mut [u8]) {
    let near_row = &src[y_tap.near * stride..(y_tap.near + 1) * stride];
    let far_row = &src[y_tap.far * stride..(y_tap.far + 1) * stride];
    let wy = y_tap.weight;

    for (x, tap) in x_taps.iter().enumerate() {
        let wx = tap.weight;
        for c in 0..3 {
            let horizontal = |row: &[u8]| {
                row[tap.near * 4 + c] as u32 * (WEIGHT_ONE - wx) + row[tap.far * 4 + c] as u32 * wx
            };
            let value = horizontal(near_row) * (WEIGHT_ONE - wy) + horizontal(far_row) * wy;
            out[x * 3 + c] = ((value + (1 << (2 * WEIGHT_BITS - 1))) >> (2 * WEIGHT_BITS)) as u8;
        }
    }
}

/// Pixel-center aligned taps mapping `dst` samples onto `src`.
fn build_taps(src: u32, dst: u32) -> Vec<Tap> {
    let ratio = src as f64 / dst as f64;
    let last = src as usize - 1;

    (0..dst as usize)
        .map(|i| {
            let pos = ((i as f64 + 0.5) * ratio - 0.5).max(0.0);
            let near = (pos.floor() as usize).min(last);
            let far = (near + 1).min(last);
            let weight = ((pos - near as f64) * WEIGHT_ONE as f64).round() as u32;
            Tap {
                near,
                far,
                weight: weight.min(WEIGHT_ONE),
            }
        })
        .collect()
}

fn luma_of(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

fn cb_of(r: i32, g: i32, b: i32) -> u8 {
    (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8
}

fn cr_of(r: i32, g: i32, b: i32) -> u8 {
    (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8
}

fn chroma_len(luma: u32) -> usize {
    (luma as usize + 1) / 2
}

fn zeroed(len: usize) -> ConvertResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| ConvertError::Alloc(len))?;
    buf.resize(len, 0);
    Ok(buf)
}
