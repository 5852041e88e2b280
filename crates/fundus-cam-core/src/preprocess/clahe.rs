//! Contrast-limited adaptive histogram equalization of an 8-bit plane.
//!
//! Matches OpenCV's `createCLAHE(clipLimit, tileGridSize).apply`: the plane is
//! padded with reflect-101 borders when it does not divide into the tile grid,
//! each tile's histogram is clipped and redistributed, and every output pixel
//! is bilinearly interpolated between the LUTs of its four nearest tiles.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

const HIST_SIZE: usize = 256;

/// CLAHE parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clahe {
    /// Contrast limit, relative to a uniform histogram.
    pub clip_limit: f32,
    /// Tiles along x.
    pub tiles_x: usize,
    /// Tiles along y.
    pub tiles_y: usize,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tiles_x: 8,
            tiles_y: 8,
        }
    }
}

/// Maps `i` into `0..n` by mirroring without repeating the edge sample.
fn reflect_101(i: usize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let i = i % period;
    if i < n {
        i
    } else {
        period - i
    }
}

impl Clahe {
    /// Equalizes a `width x height` row-major plane.
    ///
    /// Returns the input unchanged when it is empty.
    #[must_use]
    pub fn apply(&self, plane: &[u8], width: usize, height: usize) -> Vec<u8> {
        if width == 0 || height == 0 || plane.len() != width * height {
            return plane.to_vec();
        }
        let tiles_x = self.tiles_x.max(1);
        let tiles_y = self.tiles_y.max(1);

        // OpenCV pads both axes as soon as either one does not divide evenly.
        let (ext_w, ext_h) = if width % tiles_x == 0 && height % tiles_y == 0 {
            (width, height)
        } else {
            (
                width + tiles_x - width % tiles_x,
                height + tiles_y - height % tiles_y,
            )
        };
        let tile_w = ext_w / tiles_x;
        let tile_h = ext_h / tiles_y;
        let tile_area = tile_w * tile_h;

        let luts = self.tile_luts(plane, width, height, tile_w, tile_h, tiles_x, tiles_y);

        let inv_tw = 1.0 / tile_w as f32;
        let inv_th = 1.0 / tile_h as f32;
        let last_x = tiles_x as isize - 1;
        let last_y = tiles_y as isize - 1;
        debug_assert!(tile_area > 0);

        let mut out = vec![0u8; plane.len()];
        for y in 0..height {
            let tyf = y as f32 * inv_th - 0.5;
            let ty1 = tyf.floor() as isize;
            let ya = tyf - ty1 as f32;
            let ty2 = (ty1 + 1).min(last_y) as usize;
            let ty1 = ty1.max(0) as usize;

            for x in 0..width {
                let txf = x as f32 * inv_tw - 0.5;
                let tx1 = txf.floor() as isize;
                let xa = txf - tx1 as f32;
                let tx2 = (tx1 + 1).min(last_x) as usize;
                let tx1 = tx1.max(0) as usize;

                let v = usize::from(plane[y * width + x]);
                let lut = |ty: usize, tx: usize| f32::from(luts[(ty * tiles_x + tx) * HIST_SIZE + v]);

                let top = lut(ty1, tx1) * (1.0 - xa) + lut(ty1, tx2) * xa;
                let bottom = lut(ty2, tx1) * (1.0 - xa) + lut(ty2, tx2) * xa;
                out[y * width + x] = (top * (1.0 - ya) + bottom * ya).round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }

    /// Builds the clipped cumulative LUT of every tile, concatenated row-major.
    #[allow(clippy::too_many_arguments)]
    fn tile_luts(
        &self,
        plane: &[u8],
        width: usize,
        height: usize,
        tile_w: usize,
        tile_h: usize,
        tiles_x: usize,
        tiles_y: usize,
    ) -> Vec<u8> {
        let tile_area = tile_w * tile_h;
        let lut_scale = (HIST_SIZE - 1) as f32 / tile_area as f32;
        let clip = if self.clip_limit > 0.0 {
            ((self.clip_limit * tile_area as f32 / HIST_SIZE as f32) as usize).max(1)
        } else {
            0
        };

        let mut luts = vec![0u8; tiles_x * tiles_y * HIST_SIZE];
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let mut hist = [0usize; HIST_SIZE];
                for yy in ty * tile_h..(ty + 1) * tile_h {
                    let sy = reflect_101(yy, height);
                    for xx in tx * tile_w..(tx + 1) * tile_w {
                        let sx = reflect_101(xx, width);
                        hist[usize::from(plane[sy * width + sx])] += 1;
                    }
                }

                if clip > 0 {
                    clip_histogram(&mut hist, clip);
                }

                let lut = &mut luts[(ty * tiles_x + tx) * HIST_SIZE..][..HIST_SIZE];
                let mut sum = 0usize;
                for (entry, count) in lut.iter_mut().zip(hist.iter()) {
                    sum += count;
                    *entry = (sum as f32 * lut_scale).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        luts
    }
}

/// Clips bins at `limit` and spreads the excess: evenly first, then one count
/// per bin at a fixed stride until the residual is used up.
fn clip_histogram(hist: &mut [usize; HIST_SIZE], limit: usize) {
    let mut clipped = 0;
    for bin in hist.iter_mut() {
        if *bin > limit {
            clipped += *bin - limit;
            *bin = limit;
        }
    }

    let batch = clipped / HIST_SIZE;
    let mut residual = clipped - batch * HIST_SIZE;
    for bin in hist.iter_mut() {
        *bin += batch;
    }

    if residual > 0 {
        let step = (HIST_SIZE / residual).max(1);
        let mut i = 0;
        while i < HIST_SIZE && residual > 0 {
            hist[i] += 1;
            i += step;
            residual -= 1;
        }
    }
}
