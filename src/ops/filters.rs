// ============================================================================
// IMAGE FILTERS: Gaussian blur, sharpen, noise reduction, portrait blur
// ============================================================================
//
// These are the deterministic, model-free paths. They also serve as the
// fallbacks for upscale / enhance / denoise when a model cannot be used.

use image::{GrayImage, RgbaImage};
use rayon::prelude::*;

// ---------------------------------------------------------------------------
//  Parallel separable Gaussian blur (rayon)
// ---------------------------------------------------------------------------

/// Build a 1-D Gaussian kernel truncated at ceil(3*sigma).
fn build_gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil() as usize;
    if radius == 0 {
        return vec![1.0];
    }
    let len = radius * 2 + 1;
    let mut kernel = vec![0.0f32; len];
    let s2 = 2.0 * sigma * sigma;
    let mut sum = 0.0f32;
    for (i, k) in kernel.iter_mut().enumerate() {
        let x = i as f32 - radius as f32;
        let v = (-x * x / s2).exp();
        *k = v;
        sum += v;
    }
    let inv = 1.0 / sum;
    for v in &mut kernel {
        *v *= inv;
    }
    kernel
}

/// Separable Gaussian blur over all four channels.
pub fn gaussian_blur(src: &RgbaImage, sigma: f32) -> RgbaImage {
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 || sigma <= 0.0 {
        return src.clone();
    }

    let kernel = build_gaussian_kernel(sigma);
    let radius = kernel.len() / 2;
    let buf_in: Vec<f32> = src.as_raw().iter().map(|&b| b as f32).collect();
    let pixel_count = w * h * 4;

    // --- Horizontal pass (parallel by row) ---
    let mut buf_h = vec![0.0f32; pixel_count];
    buf_h.par_chunks_mut(w * 4).enumerate().for_each(|(y, row_out)| {
        let row_in_start = y * w * 4;
        for x in 0..w {
            let mut acc = [0.0f32; 4];
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = (x as isize + ki as isize - radius as isize).clamp(0, w as isize - 1) as usize;
                let idx = row_in_start + sx * 4;
                for c in 0..4 {
                    acc[c] += buf_in[idx + c] * kv;
                }
            }
            row_out[x * 4..x * 4 + 4].copy_from_slice(&acc);
        }
    });

    // --- Vertical pass (parallel by row) ---
    let mut dst_raw = vec![0u8; pixel_count];
    dst_raw.par_chunks_mut(w * 4).enumerate().for_each(|(y, row_out)| {
        for x in 0..w {
            let mut acc = [0.0f32; 4];
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y as isize + ki as isize - radius as isize).clamp(0, h as isize - 1) as usize;
                let idx = sy * w * 4 + x * 4;
                for c in 0..4 {
                    acc[c] += buf_h[idx + c] * kv;
                }
            }
            for c in 0..4 {
                row_out[x * 4 + c] = acc[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    });

    RgbaImage::from_raw(w as u32, h as u32, dst_raw).unwrap_or_else(|| src.clone())
}

/// Simple box-approximated blur for grayscale masks.
/// Uses separable horizontal + vertical passes.
pub fn blur_grayscale(img: &GrayImage, radius: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let r = (radius.ceil() as i32).max(1);
    let count = (2 * r + 1) as f32;

    let mut temp = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0f32;
            for dx in -r..=r {
                let nx = (x as i32 + dx).clamp(0, w as i32 - 1) as u32;
                sum += img.get_pixel(nx, y)[0] as f32;
            }
            temp.put_pixel(x, y, image::Luma([(sum / count).round() as u8]));
        }
    }

    let mut result = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0f32;
            for dy in -r..=r {
                let ny = (y as i32 + dy).clamp(0, h as i32 - 1) as u32;
                sum += temp.get_pixel(x, ny)[0] as f32;
            }
            result.put_pixel(x, y, image::Luma([(sum / count).round() as u8]));
        }
    }

    result
}

/// Unsharp mask: `src + amount * (src - blur(src))` on RGB, alpha untouched.
pub fn unsharp_mask(src: &RgbaImage, sigma: f32, amount: f32) -> RgbaImage {
    if amount <= 0.0 {
        return src.clone();
    }
    let blurred = gaussian_blur(src, sigma);
    let (w, h) = src.dimensions();
    let src_raw = src.as_raw();
    let blur_raw = blurred.as_raw();
    let mut out = vec![0u8; src_raw.len()];
    out.par_chunks_mut(4).enumerate().for_each(|(i, px)| {
        let si = i * 4;
        for c in 0..3 {
            let s = src_raw[si + c] as f32;
            let b = blur_raw[si + c] as f32;
            px[c] = (s + amount * (s - b)).round().clamp(0.0, 255.0) as u8;
        }
        px[3] = src_raw[si + 3];
    });
    RgbaImage::from_raw(w, h, out).unwrap_or_else(|| src.clone())
}

/// Edge-preserving (bilateral) noise reduction.
/// `strength` 0..100 sets the colour tolerance, `radius` the window.
pub fn reduce_noise(flat: &RgbaImage, strength: f32, radius: u32) -> RgbaImage {
    let w = flat.width() as usize;
    let h = flat.height() as usize;
    if w == 0 || h == 0 {
        return flat.clone();
    }

    let r = radius.max(1) as i32;
    let sigma_s = r as f32;
    let sigma_r = strength.clamp(0.0, 100.0) * 2.55;

    let src_raw = flat.as_raw();
    let stride = w * 4;
    let mut dst_raw = vec![0u8; w * h * 4];

    dst_raw
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(y, row_out)| {
            for x in 0..w {
                let pi = x * 4;
                let center_si = y * stride + pi;
                let cr = src_raw[center_si] as f32;
                let cg = src_raw[center_si + 1] as f32;
                let cb = src_raw[center_si + 2] as f32;

                let mut sum = [0.0f32; 4];
                let mut weight_sum = 0.0f32;

                for dy in -r..=r {
                    let sy = (y as i32 + dy).clamp(0, h as i32 - 1) as usize;
                    for dx in -r..=r {
                        let sx = (x as i32 + dx).clamp(0, w as i32 - 1) as usize;
                        let si = sy * stride + sx * 4;
                        let pr = src_raw[si] as f32;
                        let pg = src_raw[si + 1] as f32;
                        let pb = src_raw[si + 2] as f32;

                        let spatial = (dx * dx + dy * dy) as f32 / (2.0 * sigma_s * sigma_s);
                        let diff = (cr - pr).powi(2) + (cg - pg).powi(2) + (cb - pb).powi(2);
                        let range = diff / (2.0 * sigma_r * sigma_r + 0.001);
                        let weight = (-spatial - range).exp();

                        for c in 0..4 {
                            sum[c] += src_raw[si + c] as f32 * weight;
                        }
                        weight_sum += weight;
                    }
                }

                if weight_sum > 0.0 {
                    let inv = 1.0 / weight_sum;
                    for c in 0..4 {
                        row_out[pi + c] = (sum[c] * inv).round().clamp(0.0, 255.0) as u8;
                    }
                } else {
                    row_out[pi..pi + 4].copy_from_slice(&src_raw[center_si..center_si + 4]);
                }
            }
        });

    RgbaImage::from_raw(w as u32, h as u32, dst_raw).unwrap_or_else(|| flat.clone())
}

/// Fake shallow depth of field: keep an elliptical centre region sharp and
/// fade into a blurred copy towards the edges.
/// `focus` is the fraction (0..1) of the half-extent that stays sharp.
pub fn portrait_blur(src: &RgbaImage, sigma: f32, focus: f32) -> RgbaImage {
    let (w, h) = src.dimensions();
    if w == 0 || h == 0 {
        return src.clone();
    }
    let blurred = gaussian_blur(src, sigma);
    let focus = focus.clamp(0.0, 0.95);
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let rx = (w as f32 / 2.0).max(1.0);
    let ry = (h as f32 / 2.0).max(1.0);

    let src_raw = src.as_raw();
    let blur_raw = blurred.as_raw();
    let stride = w as usize * 4;
    let mut out = vec![0u8; src_raw.len()];
    out.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        let ny = (y as f32 - cy) / ry;
        for x in 0..w as usize {
            let nx = (x as f32 - cx) / rx;
            let d = (nx * nx + ny * ny).sqrt();
            // smoothstep from the focus edge to the frame edge
            let t = ((d - focus) / (1.0 - focus)).clamp(0.0, 1.0);
            let k = t * t * (3.0 - 2.0 * t);
            let si = y * stride + x * 4;
            for c in 0..4 {
                let s = src_raw[si + c] as f32;
                let b = blur_raw[si + c] as f32;
                row[x * 4 + c] = (s + (b - s) * k).round().clamp(0.0, 255.0) as u8;
            }
        }
    });
    RgbaImage::from_raw(w, h, out).unwrap_or_else(|| src.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn checker(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        })
    }

    #[test]
    fn kernel_sums_to_one() {
        let k = build_gaussian_kernel(2.0);
        assert_eq!(k.len(), 13);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn blur_of_flat_image_is_unchanged() {
        let img = RgbaImage::from_pixel(10, 7, Rgba([40, 80, 120, 255]));
        assert_eq!(gaussian_blur(&img, 3.0), img);
        assert_eq!(reduce_noise(&img, 50.0, 2), img);
    }

    #[test]
    fn blur_smooths_checkerboard() {
        let out = gaussian_blur(&checker(16, 16), 2.0);
        let p = out.get_pixel(8, 8);
        assert!(p[0] > 100 && p[0] < 155);
    }

    #[test]
    fn sharpen_increases_contrast() {
        let mut img = RgbaImage::from_pixel(9, 9, Rgba([100, 100, 100, 255]));
        img.put_pixel(4, 4, Rgba([150, 150, 150, 255]));
        let out = unsharp_mask(&img, 1.0, 1.0);
        assert!(out.get_pixel(4, 4)[0] > 150);
        assert_eq!(out.get_pixel(4, 4)[3], 255);
    }

    #[test]
    fn portrait_keeps_centre_sharp() {
        let img = checker(41, 41);
        let out = portrait_blur(&img, 3.0, 0.4);
        assert_eq!(out.get_pixel(20, 20), img.get_pixel(20, 20));
        assert_ne!(out.get_pixel(0, 0), img.get_pixel(0, 0));
    }
}
