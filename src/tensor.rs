// ============================================================================
// TENSOR CODEC: bitmap <-> model tensor conversion
// ============================================================================
//
// Every model in the bridge consumes and produces flat f32 buffers with an
// explicit shape. Inputs are RGB scaled linearly to [0, 1]; any model-specific
// mean/std normalisation is expected to be baked into the model graph.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbaImage};
use rayon::prelude::*;
use thiserror::Error;

/// Channel ordering of a rank-4 image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[batch, channels, height, width]`
    Nchw,
    /// `[batch, height, width, channels]`
    Nhwc,
}

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("cannot encode image: {0}")]
    Encode(String),
    #[error("cannot decode tensor: {0}")]
    Decode(String),
}

/// A flat numeric buffer plus its shape. Values are normalised to [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub layout: TensorLayout,
}

impl ImageTensor {
    /// Build a tensor, checking that the buffer length matches the shape.
    pub fn new(data: Vec<f32>, shape: Vec<usize>, layout: TensorLayout) -> Result<Self, TensorError> {
        let expected = element_count(&shape);
        if data.len() != expected {
            return Err(TensorError::Decode(format!(
                "buffer holds {} values but shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape, layout })
    }

    /// Spatial `(height, width)` of a rank-4 tensor.
    pub fn spatial(&self) -> Option<(usize, usize)> {
        if self.shape.len() != 4 {
            return None;
        }
        Some(match self.layout {
            TensorLayout::Nchw => (self.shape[2], self.shape[3]),
            TensorLayout::Nhwc => (self.shape[1], self.shape[2]),
        })
    }

    /// Channel count of a rank-4 tensor.
    pub fn channels(&self) -> Option<usize> {
        if self.shape.len() != 4 {
            return None;
        }
        Some(match self.layout {
            TensorLayout::Nchw => self.shape[1],
            TensorLayout::Nhwc => self.shape[3],
        })
    }
}

/// Product of all dimensions.
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// How a mask is turned into an alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskMode {
    /// Alpha follows the mask value linearly.
    #[default]
    Soft,
    /// Alpha is 0 or 255 with the cut at mid-grey.
    Hard,
}

impl MaskMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "soft" => Some(MaskMode::Soft),
            "hard" | "clip" => Some(MaskMode::Hard),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MaskMode::Soft => "soft",
            MaskMode::Hard => "hard",
        }
    }
}

/// Post-processing applied to a segmentation mask before compositing.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MaskSettings {
    pub mode: MaskMode,
    /// Box-blur radius applied to the full-resolution mask. 0 = off.
    pub feather: f32,
}

// ============================================================================
// ENCODE
// ============================================================================

/// Split a rank-4 target shape into `(height, width, channels)` for `layout`.
fn target_dims(shape: &[usize], layout: TensorLayout) -> Result<(usize, usize, usize), TensorError> {
    if shape.len() != 4 {
        return Err(TensorError::Encode(format!(
            "target shape {:?} must have rank 4",
            shape
        )));
    }
    if shape[0] != 1 {
        return Err(TensorError::Encode(format!(
            "batch size must be 1, got {}",
            shape[0]
        )));
    }
    let (h, w, c) = match layout {
        TensorLayout::Nchw => (shape[2], shape[3], shape[1]),
        TensorLayout::Nhwc => (shape[1], shape[2], shape[3]),
    };
    if h == 0 || w == 0 {
        return Err(TensorError::Encode(format!(
            "target shape {:?} has an empty spatial extent",
            shape
        )));
    }
    Ok((h, w, c))
}

/// Resize to `w`×`h` with bilinear filtering, skipping the copy when the size
/// already matches.
fn resize_to(image: &RgbaImage, w: u32, h: u32) -> RgbaImage {
    if image.dimensions() == (w, h) {
        image.clone()
    } else {
        imageops::resize(image, w, h, FilterType::Triangle)
    }
}

/// Write `channels` values per pixel into a fresh buffer laid out as `layout`.
/// `sample(pixel_index, channel)` yields the normalised value.
fn fill_tensor<F>(h: usize, w: usize, channels: usize, layout: TensorLayout, sample: F) -> Vec<f32>
where
    F: Fn(usize, usize) -> f32 + Sync,
{
    let npixels = h * w;
    let mut data = vec![0.0f32; npixels * channels];
    match layout {
        TensorLayout::Nchw => {
            // Channel-first: one contiguous plane per channel
            data.par_chunks_mut(npixels).enumerate().for_each(|(c, plane)| {
                for (i, v) in plane.iter_mut().enumerate() {
                    *v = sample(i, c);
                }
            });
        }
        TensorLayout::Nhwc => {
            data.par_chunks_mut(channels).enumerate().for_each(|(i, px)| {
                for (c, v) in px.iter_mut().enumerate() {
                    *v = sample(i, c);
                }
            });
        }
    }
    data
}

/// Encode an image as a `[1, 3, H, W]` / `[1, H, W, 3]` tensor.
///
/// The image is resized to the spatial size in `target_shape`, alpha is
/// dropped and every channel is divided by 255.
pub fn encode(
    image: &RgbaImage,
    target_shape: &[usize],
    layout: TensorLayout,
) -> Result<ImageTensor, TensorError> {
    let (h, w, c) = target_dims(target_shape, layout)?;
    if c != 3 {
        return Err(TensorError::Encode(format!(
            "expected 3 channels in target shape, got {}",
            c
        )));
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(TensorError::Encode("source image is empty".to_string()));
    }

    let resized = resize_to(image, w as u32, h as u32);
    let raw = resized.as_raw();
    let data = fill_tensor(h, w, 3, layout, |i, c| raw[i * 4 + c] as f32 / 255.0);
    ImageTensor::new(data, target_shape.to_vec(), layout)
        .map_err(|e| TensorError::Encode(e.to_string()))
}

/// Encode an image plus a hole mask as a 4-channel tensor (RGB + mask),
/// the input format used by inpainting models.
pub fn encode_with_mask(
    image: &RgbaImage,
    mask: &GrayImage,
    target_shape: &[usize],
    layout: TensorLayout,
) -> Result<ImageTensor, TensorError> {
    let (h, w, c) = target_dims(target_shape, layout)?;
    if c != 4 {
        return Err(TensorError::Encode(format!(
            "expected 4 channels (RGB + mask) in target shape, got {}",
            c
        )));
    }
    if image.width() == 0 || image.height() == 0 || mask.width() == 0 || mask.height() == 0 {
        return Err(TensorError::Encode("source image or mask is empty".to_string()));
    }

    let resized = resize_to(image, w as u32, h as u32);
    let resized_mask = if mask.dimensions() == (w as u32, h as u32) {
        mask.clone()
    } else {
        imageops::resize(mask, w as u32, h as u32, FilterType::Triangle)
    };
    let raw = resized.as_raw();
    let mraw = resized_mask.as_raw();
    let data = fill_tensor(h, w, 4, layout, |i, c| {
        if c < 3 {
            raw[i * 4 + c] as f32 / 255.0
        } else {
            mraw[i] as f32 / 255.0
        }
    });
    ImageTensor::new(data, target_shape.to_vec(), layout)
        .map_err(|e| TensorError::Encode(e.to_string()))
}

// ============================================================================
// DECODE
// ============================================================================

#[inline]
fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Decode a single-channel mask. The spatial size comes from the last two
/// dimensions (or dims 1 and 2 for an NHWC rank-4 tensor); only the first
/// channel is read.
pub fn decode_mask(tensor: &ImageTensor) -> Result<GrayImage, TensorError> {
    let rank = tensor.shape.len();
    if rank < 2 {
        return Err(TensorError::Decode(format!(
            "mask tensor must have rank >= 2, got shape {:?}",
            tensor.shape
        )));
    }
    let (h, w) = match (tensor.layout, rank) {
        (TensorLayout::Nhwc, 4) => (tensor.shape[1], tensor.shape[2]),
        _ => (tensor.shape[rank - 2], tensor.shape[rank - 1]),
    };
    let npixels = h * w;
    if npixels == 0 {
        return Err(TensorError::Decode(format!(
            "mask tensor has zero spatial size: {:?}",
            tensor.shape
        )));
    }
    if tensor.data.len() < npixels {
        return Err(TensorError::Decode(format!(
            "mask tensor holds {} values, need {}",
            tensor.data.len(),
            npixels
        )));
    }

    let pixels: Vec<u8> = match (tensor.layout, rank) {
        (TensorLayout::Nhwc, 4) => {
            let c = tensor.shape[3].max(1);
            (0..npixels).map(|i| to_u8(tensor.data[i * c])).collect()
        }
        _ => tensor.data[..npixels].iter().map(|&v| to_u8(v)).collect(),
    };
    GrayImage::from_raw(w as u32, h as u32, pixels)
        .ok_or_else(|| TensorError::Decode("mask buffer size mismatch".to_string()))
}

/// Decode a `[1, 3, H, W]` (or NHWC) tensor into an opaque RGBA image.
pub fn decode_rgb(tensor: &ImageTensor) -> Result<RgbaImage, TensorError> {
    if tensor.shape.len() != 4 {
        return Err(TensorError::Decode(format!(
            "RGB tensor must have rank 4, got shape {:?}",
            tensor.shape
        )));
    }
    if tensor.shape[0] != 1 {
        return Err(TensorError::Decode(format!(
            "RGB tensor batch must be 1, got {}",
            tensor.shape[0]
        )));
    }
    let channels = tensor.channels().unwrap_or(0);
    if channels != 3 {
        return Err(TensorError::Decode(format!(
            "RGB tensor must have 3 channels, got {}",
            channels
        )));
    }
    let (h, w) = tensor.spatial().unwrap_or((0, 0));
    let npixels = h * w;
    if npixels == 0 || tensor.data.len() != npixels * 3 {
        return Err(TensorError::Decode(format!(
            "RGB tensor shape {:?} does not match {} values",
            tensor.shape,
            tensor.data.len()
        )));
    }

    let data = &tensor.data;
    let layout = tensor.layout;
    let mut raw = vec![0u8; npixels * 4];
    raw.par_chunks_mut(4).enumerate().for_each(|(i, px)| {
        for c in 0..3 {
            let v = match layout {
                TensorLayout::Nchw => data[c * npixels + i],
                TensorLayout::Nhwc => data[i * 3 + c],
            };
            px[c] = to_u8(v);
        }
        px[3] = 255;
    });
    RgbaImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| TensorError::Decode("RGB buffer size mismatch".to_string()))
}

// ============================================================================
// COMPOSITE
// ============================================================================

/// Cut `image` out with `mask` using soft (linear) alpha.
pub fn apply_mask(image: &RgbaImage, mask: &GrayImage) -> RgbaImage {
    apply_mask_with(image, mask, &MaskSettings::default())
}

/// Resize `mask` to the image, optionally harden/feather it, and use it as the
/// alpha channel of the image's RGB content on a transparent canvas.
pub fn apply_mask_with(image: &RgbaImage, mask: &GrayImage, settings: &MaskSettings) -> RgbaImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }

    let mut alpha = if mask.dimensions() == (w, h) {
        mask.clone()
    } else {
        imageops::resize(mask, w, h, FilterType::Triangle)
    };

    if settings.mode == MaskMode::Hard {
        for p in alpha.pixels_mut() {
            *p = Luma([if p[0] >= 128 { 255 } else { 0 }]);
        }
    }
    if settings.feather > 0.5 {
        alpha = crate::ops::filters::blur_grayscale(&alpha, settings.feather);
    }

    let src = image.as_raw();
    let mask_raw = alpha.as_raw();
    let mut out = vec![0u8; (w * h * 4) as usize];
    out.par_chunks_mut(4).enumerate().for_each(|(i, px)| {
        let a = mask_raw[i];
        if a == 0 {
            return;
        }
        px[0] = src[i * 4];
        px[1] = src[i * 4 + 1];
        px[2] = src[i * 4 + 2];
        px[3] = a;
    });
    RgbaImage::from_raw(w, h, out).unwrap_or_else(|| RgbaImage::new(w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn gradient(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) * 3 % 256) as u8, 200])
        })
    }

    #[test]
    fn encode_fills_exact_shape() {
        let img = gradient(40, 30);
        let t = encode(&img, &[1, 3, 16, 16], TensorLayout::Nchw).unwrap();
        assert_eq!(t.data.len(), 3 * 16 * 16);
        assert!(t.data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn nchw_and_nhwc_store_same_pixel() {
        let img = gradient(4, 3);
        let a = encode(&img, &[1, 3, 3, 4], TensorLayout::Nchw).unwrap();
        let b = encode(&img, &[1, 3, 4, 3], TensorLayout::Nhwc).unwrap();
        // pixel (x=2, y=1), green channel
        let i = 4 + 2;
        assert_eq!(a.data[12 + i], b.data[i * 3 + 1]);
        assert!((a.data[12 + i] - img.get_pixel(2, 1)[1] as f32 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn encode_rejects_bad_shapes() {
        let img = gradient(4, 4);
        assert!(matches!(encode(&img, &[1, 3, 4], TensorLayout::Nchw), Err(TensorError::Encode(_))));
        assert!(matches!(encode(&img, &[1, 1, 4, 4], TensorLayout::Nchw), Err(TensorError::Encode(_))));
        assert!(matches!(encode(&RgbaImage::new(0, 0), &[1, 3, 4, 4], TensorLayout::Nchw), Err(TensorError::Encode(_))));
    }

    #[test]
    fn identity_round_trip_is_exact() {
        for (w, h) in [(1, 1), (7, 3), (64, 33)] {
            let img = gradient(w, h);
            let t = encode(&img, &[1, 3, h as usize, w as usize], TensorLayout::Nchw).unwrap();
            let back = decode_rgb(&t).unwrap();
            for (a, b) in img.pixels().zip(back.pixels()) {
                for c in 0..3 {
                    assert!((a[c] as i16 - b[c] as i16).abs() <= 2);
                }
                assert_eq!(b[3], 255);
            }
        }
    }

    #[test]
    fn decode_mask_clamps_and_uses_last_two_dims() {
        let t = ImageTensor::new(vec![-1.0, 0.0, 0.5, 2.0], vec![1, 1, 2, 2], TensorLayout::Nchw).unwrap();
        let m = decode_mask(&t).unwrap();
        assert_eq!(m.dimensions(), (2, 2));
        assert_eq!(m.as_raw(), &vec![0, 0, 128, 255]);

        let rank2 = ImageTensor::new(vec![1.0; 6], vec![2, 3], TensorLayout::Nchw).unwrap();
        assert_eq!(decode_mask(&rank2).unwrap().dimensions(), (3, 2));
    }

    #[test]
    fn decode_mask_reads_first_nhwc_channel() {
        // 1×2×3×2: channel 0 is the mask, channel 1 is noise
        let data = vec![0.0, 0.9, 0.5, 0.9, 1.0, 0.9, 1.0, 0.1, 0.5, 0.1, 0.0, 0.1];
        let t = ImageTensor::new(data, vec![1, 2, 3, 2], TensorLayout::Nhwc).unwrap();
        let m = decode_mask(&t).unwrap();
        assert_eq!(m.dimensions(), (3, 2));
        assert_eq!(m.as_raw(), &vec![0, 128, 255, 255, 128, 0]);
    }

    #[test]
    fn decode_rgb_reads_interleaved_nhwc() {
        let img = gradient(5, 3);
        let t = encode(&img, &[1, 3, 5, 3], TensorLayout::Nhwc).unwrap();
        assert_eq!(t.spatial(), Some((3, 5)));
        let back = decode_rgb(&t).unwrap();
        assert_eq!(back.dimensions(), (5, 3));
        for (a, b) in img.pixels().zip(back.pixels()) {
            for c in 0..3 {
                assert!((a[c] as i16 - b[c] as i16).abs() <= 2);
            }
            assert_eq!(b[3], 255);
        }

        // a distinct value per channel at pixel (x=1, y=0)
        let mut data = vec![0.0; 2 * 3];
        data[3..6].copy_from_slice(&[1.0, 0.0, 0.5]);
        let t = ImageTensor::new(data, vec![1, 1, 2, 3], TensorLayout::Nhwc).unwrap();
        let px = *decode_rgb(&t).unwrap().get_pixel(1, 0);
        assert_eq!(px.0, [255, 0, 128, 255]);
    }

    #[test]
    fn decode_mask_errors() {
        let rank1 = ImageTensor::new(vec![1.0; 4], vec![4], TensorLayout::Nchw).unwrap();
        assert!(matches!(decode_mask(&rank1), Err(TensorError::Decode(_))));
        let empty = ImageTensor::new(vec![], vec![1, 1, 0, 5], TensorLayout::Nchw).unwrap();
        assert!(matches!(decode_mask(&empty), Err(TensorError::Decode(_))));
    }

    #[test]
    fn decode_rgb_errors() {
        let rank3 = ImageTensor::new(vec![0.0; 12], vec![3, 2, 2], TensorLayout::Nchw).unwrap();
        assert!(decode_rgb(&rank3).is_err());
        let batch2 = ImageTensor::new(vec![0.0; 24], vec![2, 3, 2, 2], TensorLayout::Nchw).unwrap();
        assert!(decode_rgb(&batch2).is_err());
        let four = ImageTensor::new(vec![0.0; 16], vec![1, 4, 2, 2], TensorLayout::Nchw).unwrap();
        assert!(decode_rgb(&four).is_err());
    }

    #[test]
    fn zero_mask_is_fully_transparent() {
        let img = gradient(9, 5);
        let out = apply_mask(&img, &GrayImage::new(3, 3));
        assert_eq!(out.dimensions(), (9, 5));
        assert!(out.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn full_mask_keeps_rgb_and_is_opaque() {
        let img = gradient(9, 5);
        let mask = GrayImage::from_pixel(4, 4, Luma([255]));
        let out = apply_mask(&img, &mask);
        for (a, b) in img.pixels().zip(out.pixels()) {
            assert_eq!(&a.0[..3], &b.0[..3]);
            assert_eq!(b[3], 255);
        }
    }

    #[test]
    fn hard_mode_snaps_alpha() {
        let img = gradient(4, 4);
        let mask = GrayImage::from_pixel(4, 4, Luma([140]));
        let settings = MaskSettings { mode: MaskMode::Hard, feather: 0.0 };
        let out = apply_mask_with(&img, &mask, &settings);
        assert!(out.pixels().all(|p| p[3] == 255));
        let soft = apply_mask(&img, &mask);
        assert!(soft.pixels().all(|p| p[3] == 140));
    }

    #[test]
    fn encode_with_mask_puts_mask_in_fourth_plane() {
        let img = gradient(2, 2);
        let mask = GrayImage::from_raw(2, 2, vec![0, 255, 255, 0]).unwrap();
        let t = encode_with_mask(&img, &mask, &[1, 4, 2, 2], TensorLayout::Nchw).unwrap();
        assert_eq!(&t.data[12..], &[0.0, 1.0, 1.0, 0.0]);
    }
}
