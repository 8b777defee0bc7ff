// ============================================================================
// TRANSFORM ORCHESTRATOR: one request from input path to saved output
// ============================================================================
//
// decode → orientation → (model: ensure → load → encode → infer → decode)
//        → post-resize / composite → save
//
// Upscale, enhance and denoise degrade to a deterministic filter when the
// model cannot be obtained or inference fails. Background removal and
// inpainting have no fallback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbaImage};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::inference::{SessionError, SessionManager};
use crate::io::{self, ImageIoError, SaveFormat};
use crate::models::descriptor::{BACKGROUND_MODEL, INPAINT_MODEL, UPSCALE_MODEL};
use crate::models::{ModelDescriptor, ModelRegistry};
use crate::ops::adjustments::{self, Adjustments, NamedFilter};
use crate::ops::filters;
use crate::tensor::{self, ImageTensor, MaskSettings, TensorError};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid scale {0}, expected 2, 3 or 4")]
    InvalidScale(i64),
    #[error("invalid input image: {0}")]
    Input(#[source] ImageIoError),
    #[error("model unavailable: {0}")]
    ModelUnavailable(#[source] SessionError),
    #[error("{0}")]
    Inference(#[source] SessionError),
    #[error("image processing failed: {0}")]
    Processing(String),
    #[error("could not save result: {0}")]
    Persistence(#[source] ImageIoError),
}

impl TransformError {
    /// Failures that let upscale / enhance / denoise switch to their filter path.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            TransformError::ModelUnavailable(_) | TransformError::Inference(_)
        )
    }
}

impl From<TensorError> for TransformError {
    fn from(e: TensorError) -> Self {
        TransformError::Processing(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscaleFactor {
    X2,
    X3,
    X4,
}

impl UpscaleFactor {
    pub fn value(&self) -> u32 {
        match self {
            UpscaleFactor::X2 => 2,
            UpscaleFactor::X3 => 3,
            UpscaleFactor::X4 => 4,
        }
    }

    /// Number of ×2 model passes, or `None` when only the filter path exists.
    pub fn model_passes(&self) -> Option<u32> {
        match self {
            UpscaleFactor::X2 => Some(1),
            UpscaleFactor::X3 => None,
            UpscaleFactor::X4 => Some(2),
        }
    }
}

impl TryFrom<i64> for UpscaleFactor {
    type Error = TransformError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(UpscaleFactor::X2),
            3 => Ok(UpscaleFactor::X3),
            4 => Ok(UpscaleFactor::X4),
            other => Err(TransformError::InvalidScale(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    RemoveBackground,
    PortraitMode,
    AutoEnhance,
    Upscale(UpscaleFactor),
    ReduceNoise,
    ApplyFilter(NamedFilter),
    ApplyAdjustments(Adjustments),
    Inpaint { mask_path: PathBuf },
}

impl Operation {
    pub fn method_name(&self) -> &'static str {
        match self {
            Operation::RemoveBackground => "removeBackground",
            Operation::PortraitMode => "portraitMode",
            Operation::AutoEnhance => "autoEnhance",
            Operation::Upscale(_) => "upscale",
            Operation::ReduceNoise => "reduceNoise",
            Operation::ApplyFilter(_) => "applyFilter",
            Operation::ApplyAdjustments(_) => "applyAdjustments",
            Operation::Inpaint { .. } => "inpaint",
        }
    }

    /// File-name prefix of the saved result.
    pub fn output_prefix(&self) -> String {
        match self {
            Operation::RemoveBackground => "removed_bg".to_string(),
            Operation::PortraitMode => "portrait".to_string(),
            Operation::AutoEnhance => "enhanced".to_string(),
            Operation::Upscale(f) => format!("upscaled_x{}", f.value()),
            Operation::ReduceNoise => "denoised".to_string(),
            Operation::ApplyFilter(f) => format!("filter_{}", f.as_str()),
            Operation::ApplyAdjustments(_) => "adjusted".to_string(),
            Operation::Inpaint { .. } => "inpainted".to_string(),
        }
    }

    /// Whether the result carries meaningful transparency.
    fn needs_alpha(&self) -> bool {
        matches!(self, Operation::RemoveBackground)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    pub image_path: PathBuf,
    pub operation: Operation,
}

#[derive(Debug, Clone)]
pub struct OutputOptions {
    pub dir: PathBuf,
    pub format: SaveFormat,
    pub jpeg_quality: u8,
}

impl OutputOptions {
    pub fn png(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            format: SaveFormat::Png,
            jpeg_quality: 92,
        }
    }
}

/// Runs [`TransformRequest`]s against the registry and session manager.
pub struct Orchestrator {
    registry: ModelRegistry,
    sessions: Arc<SessionManager>,
    output: OutputOptions,
    mask: MaskSettings,
}

impl Orchestrator {
    pub fn new(
        registry: ModelRegistry,
        sessions: Arc<SessionManager>,
        output: OutputOptions,
        mask: MaskSettings,
    ) -> Self {
        Self {
            registry,
            sessions,
            output,
            mask,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn output_dir(&self) -> &Path {
        &self.output.dir
    }

    /// Run one request to completion. Returns the path of the saved result.
    pub fn execute(&self, request: &TransformRequest) -> Result<PathBuf, TransformError> {
        let op = &request.operation;
        info!(
            method = op.method_name(),
            path = %request.image_path.display(),
            "transform started"
        );
        let result = self.run_steps(request);
        match &result {
            Ok(path) => info!(method = op.method_name(), output = %path.display(), "transform finished"),
            Err(e) => error!(method = op.method_name(), "transform failed: {}", e),
        }
        result
    }

    fn run_steps(&self, request: &TransformRequest) -> Result<PathBuf, TransformError> {
        // -- validate + decode --
        let hole_mask = match &request.operation {
            Operation::Inpaint { mask_path } => Some(load_mask(mask_path)?),
            _ => None,
        };
        let decoded = io::load_image(&request.image_path).map_err(TransformError::Input)?;
        let image = io::normalize_orientation(decoded).pixels;
        if image.width() == 0 || image.height() == 0 {
            return Err(TransformError::InvalidArgument("input image is empty".to_string()));
        }
        debug!(width = image.width(), height = image.height(), "input normalised");

        // -- transform --
        let result = match &request.operation {
            Operation::RemoveBackground => self.remove_background(&image)?,
            Operation::PortraitMode => filters::portrait_blur(&image, 6.0, 0.45),
            Operation::AutoEnhance => self.with_fallback("autoEnhance", &image, |img| self.enhance(img), fallback_enhance)?,
            Operation::ReduceNoise => self.with_fallback("reduceNoise", &image, |img| self.enhance(img), fallback_denoise)?,
            Operation::Upscale(factor) => self.upscale(&image, *factor)?,
            Operation::ApplyFilter(filter) => filter.apply(&image),
            Operation::ApplyAdjustments(values) => adjustments::apply_adjustments(&image, values),
            Operation::Inpaint { .. } => match &hole_mask {
                Some(mask) => self.inpaint(&image, mask)?,
                None => return Err(TransformError::InvalidArgument("maskPath is required".to_string())),
            },
        };

        // -- save --
        let format = if request.operation.needs_alpha() {
            SaveFormat::Png
        } else {
            self.output.format
        };
        io::save_output(
            &result,
            &self.output.dir,
            &request.operation.output_prefix(),
            format,
            self.output.jpeg_quality,
        )
        .map_err(TransformError::Persistence)
    }

    fn descriptor(&self, name: &str) -> Result<&ModelDescriptor, TransformError> {
        self.registry
            .get(name)
            .ok_or_else(|| TransformError::ModelUnavailable(SessionError::NotLoaded(name.to_string())))
    }

    fn infer(&self, descriptor: &ModelDescriptor, input: &ImageTensor) -> Result<ImageTensor, TransformError> {
        let session = self
            .sessions
            .get_or_load(descriptor)
            .map_err(TransformError::ModelUnavailable)?;
        debug!(model = %descriptor.name, shape = ?input.shape, "running inference");
        session.run(input).map_err(TransformError::Inference)
    }

    fn with_fallback<M, F>(
        &self,
        label: &str,
        image: &RgbaImage,
        model_path: M,
        fallback: F,
    ) -> Result<RgbaImage, TransformError>
    where
        M: FnOnce(&RgbaImage) -> Result<RgbaImage, TransformError>,
        F: FnOnce(&RgbaImage) -> RgbaImage,
    {
        match model_path(image) {
            Ok(out) => Ok(out),
            Err(e) if e.allows_fallback() => {
                warn!("{}: model path unavailable ({}), using filter fallback", label, e);
                Ok(fallback(image))
            }
            Err(e) => Err(e),
        }
    }

    fn remove_background(&self, image: &RgbaImage) -> Result<RgbaImage, TransformError> {
        let descriptor = self.descriptor(BACKGROUND_MODEL)?;
        let input = tensor::encode(image, &descriptor.input_shape, descriptor.layout)?;
        let output = self.infer(descriptor, &input)?;
        let mask = tensor::decode_mask(&output)?;
        Ok(tensor::apply_mask_with(image, &mask, &self.mask))
    }

    /// One ×2 super-resolution pass. The input is squashed into the nearest
    /// square bucket and the output stretched back to the source aspect.
    fn super_resolve(&self, image: &RgbaImage) -> Result<RgbaImage, TransformError> {
        let descriptor = self.descriptor(UPSCALE_MODEL)?;
        let (w, h) = image.dimensions();
        let side = descriptor.nearest_bucket(w.max(h));
        let input = tensor::encode(image, &descriptor.shape_for(side), descriptor.layout)?;
        let output = self.infer(descriptor, &input)?;
        let decoded = tensor::decode_rgb(&output)?;
        let scale = descriptor.output_scale.max(1);
        Ok(resize_exact(&decoded, w * scale, h * scale))
    }

    fn upscale(&self, image: &RgbaImage, factor: UpscaleFactor) -> Result<RgbaImage, TransformError> {
        let Some(passes) = factor.model_passes() else {
            debug!("×{} has no model path, resampling", factor.value());
            return Ok(fallback_upscale(image, factor.value()));
        };
        self.with_fallback(
            "upscale",
            image,
            |img| {
                let mut current = img.clone();
                for pass in 0..passes {
                    debug!(pass = pass + 1, of = passes, "super-resolution pass");
                    current = self.super_resolve(&current)?;
                }
                let (w, h) = img.dimensions();
                Ok(resize_exact(&current, w * factor.value(), h * factor.value()))
            },
            |img| fallback_upscale(img, factor.value()),
        )
        .map(|out| restore_alpha_scaled(out, image))
    }

    /// ×2 pass resized back to the source size (enhance / denoise).
    fn enhance(&self, image: &RgbaImage) -> Result<RgbaImage, TransformError> {
        let (w, h) = image.dimensions();
        let upscaled = self.super_resolve(image)?;
        let mut out = resize_exact(&upscaled, w, h);
        copy_alpha(&mut out, image);
        Ok(out)
    }

    fn inpaint(&self, image: &RgbaImage, hole: &GrayImage) -> Result<RgbaImage, TransformError> {
        let descriptor = self.descriptor(INPAINT_MODEL)?;
        let input = tensor::encode_with_mask(image, hole, &descriptor.input_shape, descriptor.layout)?;
        let output = self.infer(descriptor, &input)?;
        let (w, h) = image.dimensions();
        let filled = resize_exact(&tensor::decode_rgb(&output)?, w, h);
        let hole = if hole.dimensions() == (w, h) {
            hole.clone()
        } else {
            imageops::resize(hole, w, h, FilterType::Triangle)
        };

        // Blend model pixels in proportionally to the hole mask.
        let mut out = image.clone();
        for (x, y, px) in out.enumerate_pixels_mut() {
            let m = hole.get_pixel(x, y)[0] as f32 / 255.0;
            if m <= 0.0 {
                continue;
            }
            let f = filled.get_pixel(x, y);
            for c in 0..3 {
                px[c] = (px[c] as f32 * (1.0 - m) + f[c] as f32 * m).round() as u8;
            }
        }
        Ok(out)
    }
}

fn load_mask(path: &Path) -> Result<GrayImage, TransformError> {
    let mask = io::load_image(path).map_err(TransformError::Input)?;
    let upright = io::normalize_orientation(mask).pixels;
    Ok(DynamicImage::ImageRgba8(upright).to_luma8())
}

fn resize_exact(image: &RgbaImage, w: u32, h: u32) -> RgbaImage {
    if image.dimensions() == (w, h) {
        image.clone()
    } else {
        imageops::resize(image, w.max(1), h.max(1), FilterType::Lanczos3)
    }
}

fn copy_alpha(dst: &mut RgbaImage, src: &RgbaImage) {
    if dst.dimensions() != src.dimensions() {
        return;
    }
    for (d, s) in dst.pixels_mut().zip(src.pixels()) {
        d[3] = s[3];
    }
}

/// Model output is opaque; carry the source alpha over at the new size.
fn restore_alpha_scaled(mut out: RgbaImage, src: &RgbaImage) -> RgbaImage {
    if src.pixels().all(|p| p[3] == 255) {
        return out;
    }
    let alpha = resize_exact(src, out.width(), out.height());
    copy_alpha(&mut out, &alpha);
    out
}

// ============================================================================
// FILTER FALLBACKS
// ============================================================================

pub fn fallback_upscale(image: &RgbaImage, scale: u32) -> RgbaImage {
    let (w, h) = image.dimensions();
    let resized = resize_exact(image, w * scale, h * scale);
    filters::unsharp_mask(&resized, 1.0, 0.3)
}

pub fn fallback_enhance(image: &RgbaImage) -> RgbaImage {
    let sharpened = filters::unsharp_mask(image, 1.2, 0.6);
    adjustments::brightness_contrast(&sharpened, 0.0, 8.0)
}

pub fn fallback_denoise(image: &RgbaImage) -> RgbaImage {
    let smoothed = filters::reduce_noise(image, 12.0, 2);
    filters::unsharp_mask(&smoothed, 1.0, 0.25)
}
