// ============================================================================
// IMAGE I/O: decode with orientation, atomic encode + write
// ============================================================================

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops;
use image::{DynamicImage, ImageEncoder, ImageError, RgbaImage};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ImageIoError {
    #[error("could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("could not encode image: {0}")]
    Encode(#[from] ImageError),
    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// EXIF orientation (tag 0x0112). Each variant names the transform that must
/// be applied to the stored pixels to display them upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    /// Rotate 90° clockwise, then flip horizontally.
    Transpose,
    Rotate90,
    /// Rotate 270° clockwise, then flip horizontally.
    Transverse,
    Rotate270,
}

impl Orientation {
    pub fn from_exif(value: u32) -> Self {
        match value {
            2 => Orientation::FlipHorizontal,
            3 => Orientation::Rotate180,
            4 => Orientation::FlipVertical,
            5 => Orientation::Transpose,
            6 => Orientation::Rotate90,
            7 => Orientation::Transverse,
            8 => Orientation::Rotate270,
            _ => Orientation::Normal,
        }
    }
}

/// Decoded pixels together with the orientation they were stored in.
#[derive(Debug, Clone, PartialEq)]
pub struct OrientedImage {
    pub pixels: RgbaImage,
    pub orientation: Orientation,
}

impl OrientedImage {
    pub fn upright(pixels: RgbaImage) -> Self {
        Self {
            pixels,
            orientation: Orientation::Normal,
        }
    }
}

/// Read the EXIF orientation tag. Files without EXIF (PNG, BMP, …) report
/// `Normal`.
fn read_orientation(path: &Path) -> Orientation {
    let Ok(file) = File::open(path) else {
        return Orientation::Normal;
    };
    let mut reader = BufReader::new(file);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut reader) else {
        return Orientation::Normal;
    };
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .map(Orientation::from_exif)
        .unwrap_or_default()
}

/// Decode an image file to RGBA, keeping its EXIF orientation alongside.
pub fn load_image(path: &Path) -> Result<OrientedImage, ImageIoError> {
    if !path.is_file() {
        return Err(ImageIoError::Open {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such image file"),
        });
    }
    let pixels = image::open(path)
        .map_err(|source| ImageIoError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgba8();
    let orientation = read_orientation(path);
    debug!(
        path = %path.display(),
        width = pixels.width(),
        height = pixels.height(),
        ?orientation,
        "decoded image"
    );
    Ok(OrientedImage {
        pixels,
        orientation,
    })
}

/// Bake the orientation into the pixel data. The result is always
/// `Orientation::Normal`, so applying this twice is a no-op.
pub fn normalize_orientation(image: OrientedImage) -> OrientedImage {
    let px = &image.pixels;
    let pixels = match image.orientation {
        Orientation::Normal => return image,
        Orientation::FlipHorizontal => imageops::flip_horizontal(px),
        Orientation::Rotate180 => imageops::rotate180(px),
        Orientation::FlipVertical => imageops::flip_vertical(px),
        Orientation::Transpose => imageops::flip_horizontal(&imageops::rotate90(px)),
        Orientation::Rotate90 => imageops::rotate90(px),
        Orientation::Transverse => imageops::flip_horizontal(&imageops::rotate270(px)),
        Orientation::Rotate270 => imageops::rotate270(px),
    };
    OrientedImage::upright(pixels)
}

// ============================================================================
// SAVE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    Png,
    Jpeg,
}

impl SaveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Png => "png",
            SaveFormat::Jpeg => "jpg",
        }
    }
}

/// Encode `image` into `writer`. JPEG drops the alpha channel.
pub fn encode_image<W: Write>(
    image: &RgbaImage,
    writer: W,
    format: SaveFormat,
    quality: u8,
) -> Result<(), ImageError> {
    match format {
        SaveFormat::Png => {
            PngEncoder::new(writer).write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ColorType::Rgba8,
            )?;
        }
        SaveFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            JpegEncoder::new_with_quality(writer, quality.clamp(1, 100)).write_image(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                image::ColorType::Rgb8,
            )?;
        }
    }
    Ok(())
}

/// Write `image` into `dir` as `<prefix>_<uuid>.<ext>`.
///
/// The bytes go to a hidden `.part` file first and are renamed into place
/// only after a successful encode + flush, so the returned path never points
/// at a partial file.
pub fn save_output(
    image: &RgbaImage,
    dir: &Path,
    prefix: &str,
    format: SaveFormat,
    quality: u8,
) -> Result<PathBuf, ImageIoError> {
    fs::create_dir_all(dir).map_err(|source| ImageIoError::Write {
        path: dir.to_path_buf(),
        source,
    })?;

    let id = uuid::Uuid::new_v4().simple().to_string();
    let final_path = dir.join(format!("{}_{}.{}", prefix, id, format.extension()));
    let part_path = dir.join(format!(".{}_{}.part", prefix, id));

    let written = (|| -> Result<(), ImageIoError> {
        let file = File::create(&part_path).map_err(|source| ImageIoError::Write {
            path: part_path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        encode_image(image, &mut writer, format, quality)?;
        writer.flush().map_err(|source| ImageIoError::Write {
            path: part_path.clone(),
            source,
        })?;
        fs::rename(&part_path, &final_path).map_err(|source| ImageIoError::Write {
            path: final_path.clone(),
            source,
        })
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&part_path);
        return Err(e);
    }
    debug!(path = %final_path.display(), "saved output image");
    Ok(final_path)
}
