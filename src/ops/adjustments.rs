// ============================================================================
// ADJUSTMENT OPERATIONS: per-pixel colour controls and named filters
// ============================================================================
//
// Operations are parallelized via rayon for multi-core performance.
// ============================================================================

use image::RgbaImage;
use rayon::prelude::*;
use serde::Deserialize;

use super::filters;

// ============================================================================
// HELPER: per-pixel transform
// ============================================================================

/// Apply a per-pixel transform function to the whole image.
/// `transform` receives (r, g, b, a) as f32 and returns (r, g, b, a) as f32.
pub fn apply_pixel_transform<F>(src: &RgbaImage, transform: F) -> RgbaImage
where
    F: Fn(f32, f32, f32, f32) -> (f32, f32, f32, f32) + Sync,
{
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 {
        return src.clone();
    }

    let src_raw = src.as_raw();
    let mut dst_raw = vec![0u8; w * h * 4];
    let stride = w * 4;

    dst_raw.par_chunks_mut(stride).enumerate().for_each(|(y, row_out)| {
        let row_in = &src_raw[y * stride..(y + 1) * stride];
        for x in 0..w {
            let pi = x * 4;
            let r = row_in[pi] as f32;
            let g = row_in[pi + 1] as f32;
            let b = row_in[pi + 2] as f32;
            let a = row_in[pi + 3] as f32;
            let (nr, ng, nb, na) = transform(r, g, b, a);
            row_out[pi] = nr.round().clamp(0.0, 255.0) as u8;
            row_out[pi + 1] = ng.round().clamp(0.0, 255.0) as u8;
            row_out[pi + 2] = nb.round().clamp(0.0, 255.0) as u8;
            row_out[pi + 3] = na.round().clamp(0.0, 255.0) as u8;
        }
    });

    RgbaImage::from_raw(w as u32, h as u32, dst_raw).unwrap_or_else(|| src.clone())
}

// ============================================================================
// COLOUR CONTROLS
// ============================================================================

/// Brightness/Contrast adjustment.
/// `brightness`: -100..100 (additive offset)
/// `contrast`: -100..100 (multiplier around midpoint)
pub fn brightness_contrast(src: &RgbaImage, brightness: f32, contrast: f32) -> RgbaImage {
    if brightness == 0.0 && contrast == 0.0 {
        return src.clone();
    }
    let factor = (259.0 * (contrast + 255.0)) / (255.0 * (259.0 - contrast));
    apply_pixel_transform(src, move |r, g, b, a| {
        let nr = factor * (r + brightness - 128.0) + 128.0;
        let ng = factor * (g + brightness - 128.0) + 128.0;
        let nb = factor * (b + brightness - 128.0) + 128.0;
        (nr, ng, nb, a)
    })
}

/// Saturation scale. `saturation`: -100..100 (0 = no change, -100 = grey).
pub fn saturation(src: &RgbaImage, saturation: f32) -> RgbaImage {
    if saturation == 0.0 {
        return src.clone();
    }
    let sat_factor = 1.0 + saturation / 100.0;
    apply_pixel_transform(src, move |r, g, b, a| {
        let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
        let ns = (s * sat_factor).clamp(0.0, 1.0);
        let (nr, ng, nb) = hsl_to_rgb(h, ns, l);
        (nr * 255.0, ng * 255.0, nb * 255.0, a)
    })
}

/// Luminance-based desaturation (BT.709 weights).
pub fn grayscale(src: &RgbaImage) -> RgbaImage {
    apply_pixel_transform(src, |r, g, b, a| {
        let l = 0.2126 * r + 0.7152 * g + 0.0722 * b;
        (l, l, l, a)
    })
}

/// Apply a sepia tone effect.
pub fn sepia(src: &RgbaImage) -> RgbaImage {
    apply_pixel_transform(src, |r, g, b, a| {
        let sr = 0.393 * r + 0.769 * g + 0.189 * b;
        let sg = 0.349 * r + 0.686 * g + 0.168 * b;
        let sb = 0.272 * r + 0.534 * g + 0.131 * b;
        (sr.min(255.0), sg.min(255.0), sb.min(255.0), a)
    })
}

/// Invert all color channels (R, G, B). Alpha is preserved.
pub fn invert(src: &RgbaImage) -> RgbaImage {
    apply_pixel_transform(src, |r, g, b, a| (255.0 - r, 255.0 - g, 255.0 - b, a))
}

/// Warm/cool shift. Positive `amount` pushes towards orange, negative towards blue.
pub fn temperature(src: &RgbaImage, amount: f32) -> RgbaImage {
    let shift = amount.clamp(-100.0, 100.0) * 0.3;
    apply_pixel_transform(src, move |r, g, b, a| (r + shift, g + shift * 0.2, b - shift, a))
}

/// Boosts saturation selectively; less-saturated colours gain more.
/// `amount`: -100..100 (positive = boost, negative = reduce)
pub fn vibrance(src: &RgbaImage, amount: f32) -> RgbaImage {
    let v = amount / 100.0;
    apply_pixel_transform(src, move |r, g, b, a| {
        let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
        let boost = if v >= 0.0 { v * (1.0 - s).powi(2) } else { v * s.powi(2) };
        let ns = (s + boost).clamp(0.0, 1.0);
        let (nr, ng, nb) = hsl_to_rgb(h, ns, l);
        (nr * 255.0, ng * 255.0, nb * 255.0, a)
    })
}

pub fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;
    if (max - min).abs() < 1e-6 {
        return (0.0, 0.0, l);
    }
    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };
    let h = if max == r {
        (g - b) / d + if g < b { 6.0 } else { 0.0 }
    } else if max == g {
        (b - r) / d + 2.0
    } else {
        (r - g) / d + 4.0
    };
    (h / 6.0, s, l)
}

pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ============================================================================
// ADJUSTMENT MAP
// ============================================================================

/// Slider values for `applyAdjustments`. Missing keys default to 0 (no-op);
/// out-of-range values are clamped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Adjustments {
    /// -100..100
    pub brightness: f32,
    /// -100..100
    pub contrast: f32,
    /// -100..100
    pub saturation: f32,
    /// Gaussian sigma, 0..20
    pub blur: f32,
    /// Unsharp amount, 0..100 (100 = 2× edge gain)
    pub sharpen: f32,
}

impl Adjustments {
    pub fn clamped(&self) -> Self {
        let c = |v: f32, lo: f32, hi: f32| if v.is_finite() { v.clamp(lo, hi) } else { 0.0 };
        Self {
            brightness: c(self.brightness, -100.0, 100.0),
            contrast: c(self.contrast, -100.0, 100.0),
            saturation: c(self.saturation, -100.0, 100.0),
            blur: c(self.blur, 0.0, 20.0),
            sharpen: c(self.sharpen, 0.0, 100.0),
        }
    }
}

/// Colour controls first, then blur, then sharpen.
pub fn apply_adjustments(src: &RgbaImage, adjustments: &Adjustments) -> RgbaImage {
    let a = adjustments.clamped();
    let mut out = brightness_contrast(src, a.brightness * 1.275, a.contrast * 1.275);
    out = saturation(&out, a.saturation);
    if a.blur > 0.0 {
        out = filters::gaussian_blur(&out, a.blur);
    }
    if a.sharpen > 0.0 {
        out = filters::unsharp_mask(&out, 1.0, a.sharpen / 50.0);
    }
    out
}

// ============================================================================
// NAMED FILTERS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamedFilter {
    None,
    Grayscale,
    Sepia,
    Invert,
    Vintage,
    Warm,
    Cool,
    Vivid,
    Blur,
    Sharpen,
}

impl NamedFilter {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.trim().to_ascii_lowercase().as_str() {
            "none" | "original" => NamedFilter::None,
            "grayscale" | "greyscale" | "mono" | "bw" => NamedFilter::Grayscale,
            "sepia" => NamedFilter::Sepia,
            "invert" => NamedFilter::Invert,
            "vintage" => NamedFilter::Vintage,
            "warm" => NamedFilter::Warm,
            "cool" => NamedFilter::Cool,
            "vivid" => NamedFilter::Vivid,
            "blur" => NamedFilter::Blur,
            "sharpen" => NamedFilter::Sharpen,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NamedFilter::None => "none",
            NamedFilter::Grayscale => "grayscale",
            NamedFilter::Sepia => "sepia",
            NamedFilter::Invert => "invert",
            NamedFilter::Vintage => "vintage",
            NamedFilter::Warm => "warm",
            NamedFilter::Cool => "cool",
            NamedFilter::Vivid => "vivid",
            NamedFilter::Blur => "blur",
            NamedFilter::Sharpen => "sharpen",
        }
    }

    pub fn apply(&self, src: &RgbaImage) -> RgbaImage {
        match self {
            NamedFilter::None => src.clone(),
            NamedFilter::Grayscale => grayscale(src),
            NamedFilter::Sepia => sepia(src),
            NamedFilter::Invert => invert(src),
            NamedFilter::Vintage => {
                let toned = sepia(src);
                brightness_contrast(&toned, 10.0, -25.0)
            }
            NamedFilter::Warm => temperature(src, 40.0),
            NamedFilter::Cool => temperature(src, -40.0),
            NamedFilter::Vivid => vibrance(src, 60.0),
            NamedFilter::Blur => filters::gaussian_blur(src, 2.5),
            NamedFilter::Sharpen => filters::unsharp_mask(src, 1.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn zero_adjustments_are_identity() {
        let img = RgbaImage::from_fn(5, 5, |x, y| Rgba([(x * 40) as u8, (y * 40) as u8, 90, 255]));
        assert_eq!(apply_adjustments(&img, &Adjustments::default()), img);
    }

    #[test]
    fn adjustments_are_clamped() {
        let a = Adjustments { brightness: 500.0, blur: -3.0, sharpen: f32::NAN, ..Default::default() }.clamped();
        assert_eq!(a.brightness, 100.0);
        assert_eq!(a.blur, 0.0);
        assert_eq!(a.sharpen, 0.0);
    }

    #[test]
    fn full_desaturation_is_grey() {
        let img = RgbaImage::from_pixel(2, 2, Rgba([200, 40, 40, 255]));
        let out = saturation(&img, -100.0);
        let p = out.get_pixel(0, 0);
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
    }

    #[test]
    fn hsl_round_trip() {
        let (h, s, l) = rgb_to_hsl(0.2, 0.6, 0.9);
        let (r, g, b) = hsl_to_rgb(h, s, l);
        assert!((r - 0.2).abs() < 1e-4 && (g - 0.6).abs() < 1e-4 && (b - 0.9).abs() < 1e-4);
    }

    #[test]
    fn named_filters_parse() {
        assert_eq!(NamedFilter::parse("Sepia"), Some(NamedFilter::Sepia));
        assert_eq!(NamedFilter::parse("mono"), Some(NamedFilter::Grayscale));
        assert_eq!(NamedFilter::parse("glitter"), None);
        let img = RgbaImage::from_pixel(1, 1, Rgba([10, 20, 30, 128]));
        assert_eq!(NamedFilter::Invert.apply(&img).get_pixel(0, 0), &Rgba([245, 235, 225, 128]));
    }
}
