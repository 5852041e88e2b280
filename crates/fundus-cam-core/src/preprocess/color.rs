//! sRGB <-> CIE L*a*b* conversion with 8-bit channel scaling.
//!
//! Channels are stored the way 8-bit OpenCV images store them: `L` scaled from
//! `[0, 100]` to `[0, 255]`, `a` and `b` offset by 128. D65 white point.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use image::{Rgb, RgbImage};

const WHITE_X: f32 = 0.950_456;
const WHITE_Z: f32 = 1.088_754;
const EPSILON: f32 = 0.008_856;
const KAPPA: f32 = 903.3;

/// A planar 8-bit Lab image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabImage {
    pub width: u32,
    pub height: u32,
    /// Lightness, `L * 255 / 100`.
    pub l: Vec<u8>,
    /// Green-red axis, `a + 128`.
    pub a: Vec<u8>,
    /// Blue-yellow axis, `b + 128`.
    pub b: Vec<u8>,
}

impl LabImage {
    /// Converts an RGB image to Lab.
    #[must_use]
    pub fn from_rgb(rgb: &RgbImage) -> Self {
        let n = (rgb.width() * rgb.height()) as usize;
        let mut l = Vec::with_capacity(n);
        let mut a = Vec::with_capacity(n);
        let mut b = Vec::with_capacity(n);
        for px in rgb.pixels() {
            let [lv, av, bv] = rgb_to_lab(px.0);
            l.push(lv);
            a.push(av);
            b.push(bv);
        }
        Self {
            width: rgb.width(),
            height: rgb.height(),
            l,
            a,
            b,
        }
    }

    /// Converts back to RGB.
    #[must_use]
    pub fn to_rgb(&self) -> RgbImage {
        let mut out = RgbImage::new(self.width, self.height);
        for (i, px) in out.pixels_mut().enumerate() {
            *px = Rgb(lab_to_rgb([self.l[i], self.a[i], self.b[i]]));
        }
        out
    }
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f32) -> f32 {
    if t > EPSILON {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

fn lab_f_inv(f: f32) -> f32 {
    let cube = f * f * f;
    if cube > EPSILON {
        cube
    } else {
        (f - 16.0 / 116.0) / 7.787
    }
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Converts one 8-bit sRGB pixel to 8-bit Lab.
#[must_use]
pub fn rgb_to_lab(rgb: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = rgb.map(|c| srgb_to_linear(f32::from(c) / 255.0));

    let x = (0.412_453 * r + 0.357_580 * g + 0.180_423 * b) / WHITE_X;
    let y = 0.212_671 * r + 0.715_160 * g + 0.072_169 * b;
    let z = (0.019_334 * r + 0.119_193 * g + 0.950_227 * b) / WHITE_Z;

    let fx = lab_f(x);
    let fy = lab_f(y);
    let fz = lab_f(z);

    let l = if y > EPSILON { 116.0 * fy - 16.0 } else { KAPPA * y };
    let a = 500.0 * (fx - fy);
    let bb = 200.0 * (fy - fz);

    [to_u8(l * 255.0 / 100.0), to_u8(a + 128.0), to_u8(bb + 128.0)]
}

/// Converts one 8-bit Lab pixel back to 8-bit sRGB.
#[must_use]
pub fn lab_to_rgb(lab: [u8; 3]) -> [u8; 3] {
    let l = f32::from(lab[0]) * 100.0 / 255.0;
    let a = f32::from(lab[1]) - 128.0;
    let b = f32::from(lab[2]) - 128.0;

    let (y, fy) = if l > KAPPA * EPSILON {
        let fy = (l + 16.0) / 116.0;
        (fy * fy * fy, fy)
    } else {
        let y = l / KAPPA;
        (y, 7.787 * y + 16.0 / 116.0)
    };
    let x = lab_f_inv(fy + a / 500.0) * WHITE_X;
    let z = lab_f_inv(fy - b / 200.0) * WHITE_Z;

    let r = 3.240_479 * x - 1.537_150 * y - 0.498_535 * z;
    let g = -0.969_256 * x + 1.875_991 * y + 0.041_556 * z;
    let bl = 0.055_648 * x - 0.204_043 * y + 1.057_311 * z;

    [r, g, bl].map(|c| to_u8(linear_to_srgb(c.clamp(0.0, 1.0)) * 255.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extremes() {
        assert_eq!(rgb_to_lab([0, 0, 0]), [0, 128, 128]);
        assert_eq!(rgb_to_lab([255, 255, 255]), [255, 128, 128]);
    }

    #[test]
    fn test_gray_is_neutral() {
        let [_, a, b] = rgb_to_lab([128, 128, 128]);
        assert!((i16::from(a) - 128).abs() <= 1);
        assert!((i16::from(b) - 128).abs() <= 1);
    }

    #[test]
    fn test_red_has_positive_a() {
        let [l, a, _] = rgb_to_lab([255, 0, 0]);
        // L* of pure red is about 53.2, a* about 80.
        assert!((i16::from(l) - 136).abs() <= 1);
        assert!(a > 200);
    }

    #[test]
    fn test_conversion_is_nearly_lossless() {
        for rgb in [[12, 200, 90], [250, 10, 10], [90, 60, 30], [3, 3, 3]] {
            let back = lab_to_rgb(rgb_to_lab(rgb));
            for (x, y) in rgb.iter().zip(back.iter()) {
                assert!((i16::from(*x) - i16::from(*y)).abs() <= 3, "{rgb:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn test_image_round_trip_dimensions() {
        let img = RgbImage::from_pixel(5, 3, Rgb([40, 80, 120]));
        let lab = LabImage::from_rgb(&img);
        assert_eq!(lab.l.len(), 15);
        assert_eq!(lab.to_rgb().dimensions(), (5, 3));
    }
}
