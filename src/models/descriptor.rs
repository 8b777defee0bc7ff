use std::collections::BTreeMap;
use std::path::Path;

use crate::tensor::TensorLayout;

/// Name under which an explicitly loaded model file is registered.
pub const DEFAULT_MODEL: &str = "default";
/// Portrait matting network, 512×512 in, single-channel mask out.
pub const BACKGROUND_MODEL: &str = "modnet";
/// ×2 super-resolution network shared by upscale, enhance and denoise.
pub const UPSCALE_MODEL: &str = "realesrgan_x2";
/// Hole-filling network, RGB + mask in, RGB out.
pub const INPAINT_MODEL: &str = "lama";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Mask,
    RgbImage,
}

/// Static description of a downloadable model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    /// Location of the zip archive holding the compiled model.
    pub source_url: String,
    /// Path of the compiled model inside the extracted archive.
    pub artifact: String,
    /// `[N, C, H, W]` or `[N, H, W, C]` depending on `layout`.
    pub input_shape: [usize; 4],
    pub layout: TensorLayout,
    pub output_kind: OutputKind,
    /// Square spatial sizes the model accepts. Empty = only `input_shape`.
    pub allowed_sizes: Vec<u32>,
    /// Spatial scale between input and output (1 for masks, 2 for ×2 SR).
    pub output_scale: u32,
}

impl ModelDescriptor {
    /// `(height, width)` of the declared input.
    pub fn input_hw(&self) -> (u32, u32) {
        match self.layout {
            TensorLayout::Nchw => (self.input_shape[2] as u32, self.input_shape[3] as u32),
            TensorLayout::Nhwc => (self.input_shape[1] as u32, self.input_shape[2] as u32),
        }
    }

    pub fn channels(&self) -> usize {
        match self.layout {
            TensorLayout::Nchw => self.input_shape[1],
            TensorLayout::Nhwc => self.input_shape[3],
        }
    }

    /// Input shape with the spatial dims replaced by `side`×`side`.
    pub fn shape_for(&self, side: u32) -> Vec<usize> {
        let mut shape = self.input_shape.to_vec();
        let side = side as usize;
        match self.layout {
            TensorLayout::Nchw => {
                shape[2] = side;
                shape[3] = side;
            }
            TensorLayout::Nhwc => {
                shape[1] = side;
                shape[2] = side;
            }
        }
        shape
    }

    /// File name of the installed artifact: `<name>.<artifact extension>`.
    pub fn canonical_file_name(&self) -> String {
        match Path::new(&self.artifact).extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{}", self.name, ext),
            None => self.name.clone(),
        }
    }

    /// Pick the supported square size closest to `side`, preferring the
    /// larger bucket on ties. Falls back to the declared input size.
    pub fn nearest_bucket(&self, side: u32) -> u32 {
        if self.allowed_sizes.is_empty() {
            return self.input_hw().0;
        }
        let mut best = self.allowed_sizes[0];
        for &b in &self.allowed_sizes {
            let d = b.abs_diff(side);
            let bd = best.abs_diff(side);
            if d < bd || (d == bd && b > best) {
                best = b;
            }
        }
        best
    }
}

/// The set of models the bridge knows how to fetch.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in descriptors, with archives served from `base_url`.
    pub fn builtin(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let mut registry = Self::empty();
        registry.register(ModelDescriptor {
            name: BACKGROUND_MODEL.to_string(),
            source_url: format!("{}/{}.zip", base, BACKGROUND_MODEL),
            artifact: "modnet/modnet_photographic_portrait_matting.onnx".to_string(),
            input_shape: [1, 3, 512, 512],
            layout: TensorLayout::Nchw,
            output_kind: OutputKind::Mask,
            allowed_sizes: Vec::new(),
            output_scale: 1,
        });
        registry.register(ModelDescriptor {
            name: UPSCALE_MODEL.to_string(),
            source_url: format!("{}/{}.zip", base, UPSCALE_MODEL),
            artifact: "realesrgan/realesrgan_x2plus.onnx".to_string(),
            input_shape: [1, 3, 512, 512],
            layout: TensorLayout::Nchw,
            output_kind: OutputKind::RgbImage,
            allowed_sizes: vec![128, 256, 512],
            output_scale: 2,
        });
        registry.register(ModelDescriptor {
            name: INPAINT_MODEL.to_string(),
            source_url: format!("{}/{}.zip", base, INPAINT_MODEL),
            artifact: "lama/lama_fp32.onnx".to_string(),
            input_shape: [1, 4, 512, 512],
            layout: TensorLayout::Nchw,
            output_kind: OutputKind::RgbImage,
            allowed_sizes: Vec::new(),
            output_scale: 1,
        });
        registry
    }

    pub fn register(&mut self, descriptor: ModelDescriptor) {
        self.models.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_descriptors() {
        let r = ModelRegistry::builtin("https://example.test/models/");
        let bg = r.get(BACKGROUND_MODEL).unwrap();
        assert_eq!(bg.source_url, "https://example.test/models/modnet.zip");
        assert_eq!(bg.input_hw(), (512, 512));
        assert_eq!(bg.canonical_file_name(), "modnet.onnx");
        assert_eq!(r.get(INPAINT_MODEL).unwrap().channels(), 4);
        assert_eq!(r.names().count(), 3);
    }

    #[test]
    fn buckets_pick_nearest() {
        let r = ModelRegistry::builtin("http://x");
        let sr = r.get(UPSCALE_MODEL).unwrap();
        assert_eq!(sr.nearest_bucket(100), 128);
        assert_eq!(sr.nearest_bucket(192), 256);
        assert_eq!(sr.nearest_bucket(200), 256);
        assert_eq!(sr.nearest_bucket(4000), 512);
        assert_eq!(sr.shape_for(256), vec![1, 3, 256, 256]);
        // no buckets: always the declared size
        assert_eq!(r.get(BACKGROUND_MODEL).unwrap().nearest_bucket(64), 512);
    }
}
