use std::fs;
use std::path::{Path, PathBuf};

use crate::io::SaveFormat;
use crate::tensor::{MaskMode, MaskSettings};

const SETTINGS_FILE: &str = "photobridge_settings.cfg";

/// Persistent bridge configuration, stored as `key=value` lines.
#[derive(Clone, Debug, PartialEq)]
pub struct BridgeSettings {
    /// Absolute path to onnxruntime.dll / libonnxruntime.so / .dylib.
    pub onnx_runtime_path: Option<PathBuf>,
    pub models_dir: PathBuf,
    /// Read-only models shipped next to the application.
    pub bundled_models_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Model archives are fetched from `<model_base_url>/<name>.zip`.
    pub model_base_url: String,
    pub prefer_gpu: bool,
    pub intra_op_threads: usize,
    pub mask_mode: MaskMode,
    pub mask_feather: f32,
    pub output_format: SaveFormat,
    pub jpeg_quality: u8,
    pub log_level: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let base = absolute_path(data_dir().join("PhotoBridge"));
        Self {
            onnx_runtime_path: None,
            models_dir: base.join("models"),
            bundled_models_dir: None,
            output_dir: base.join("output"),
            model_base_url: String::new(),
            prefer_gpu: true,
            intra_op_threads: 4,
            mask_mode: MaskMode::Soft,
            mask_feather: 0.0,
            output_format: SaveFormat::Png,
            jpeg_quality: 92,
            log_level: "info".to_string(),
        }
    }
}

impl BridgeSettings {
    /// Platform config location for the settings file.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    home_dir().join(".config")
                })
                .join("photobridge");
            return Some(config_dir.join(SETTINGS_FILE));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(PathBuf::from(appdata).join("PhotoBridge").join(SETTINGS_FILE));
        }
        #[cfg(target_os = "macos")]
        {
            return Some(
                home_dir()
                    .join("Library")
                    .join("Application Support")
                    .join("PhotoBridge")
                    .join(SETTINGS_FILE),
            );
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join(SETTINGS_FILE)))
        }
    }

    /// Load from the platform location (defaults if missing or unreadable).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from `path`. Unknown keys are skipped and unparsable values keep
    /// their default.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else { return Self::default() };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "onnx_runtime_path" => {
                    s.onnx_runtime_path = non_empty_path(val);
                }
                "models_dir" => {
                    if let Some(p) = non_empty_path(val) { s.models_dir = p; }
                }
                "bundled_models_dir" => {
                    s.bundled_models_dir = non_empty_path(val);
                }
                "output_dir" => {
                    if let Some(p) = non_empty_path(val) { s.output_dir = p; }
                }
                "model_base_url" => {
                    s.model_base_url = val.to_string();
                }
                "prefer_gpu" => {
                    s.prefer_gpu = val == "true";
                }
                "intra_op_threads" => {
                    if let Ok(n) = val.parse::<usize>() { s.intra_op_threads = n.clamp(1, 64); }
                }
                "mask_mode" => {
                    if let Some(m) = MaskMode::parse(val) { s.mask_mode = m; }
                }
                "mask_feather" => {
                    if let Ok(v) = val.parse::<f32>() && v.is_finite() { s.mask_feather = v.clamp(0.0, 50.0); }
                }
                "output_format" => {
                    s.output_format = match val {
                        "jpg" | "jpeg" => SaveFormat::Jpeg,
                        _ => SaveFormat::Png,
                    };
                }
                "jpeg_quality" => {
                    if let Ok(q) = val.parse::<u8>() { s.jpeg_quality = q.clamp(1, 100); }
                }
                "log_level" => {
                    if !val.is_empty() { s.log_level = val.to_string(); }
                }
                _ => {}
            }
        }
        s.onnx_runtime_path = s.onnx_runtime_path.map(absolute_path);
        s.models_dir = absolute_path(s.models_dir);
        s.bundled_models_dir = s.bundled_models_dir.map(absolute_path);
        s.output_dir = absolute_path(s.output_dir);
        s
    }

    pub fn to_config_string(&self) -> String {
        let path_str = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        format!(
            "onnx_runtime_path={}\n\
             models_dir={}\n\
             bundled_models_dir={}\n\
             output_dir={}\n\
             model_base_url={}\n\
             prefer_gpu={}\n\
             intra_op_threads={}\n\
             mask_mode={}\n\
             mask_feather={}\n\
             output_format={}\n\
             jpeg_quality={}\n\
             log_level={}\n",
            path_str(&self.onnx_runtime_path),
            self.models_dir.display(),
            path_str(&self.bundled_models_dir),
            self.output_dir.display(),
            self.model_base_url,
            self.prefer_gpu,
            self.intra_op_threads,
            self.mask_mode.as_str(),
            self.mask_feather,
            self.output_format.extension(),
            self.jpeg_quality,
            self.log_level,
        )
    }

    /// Write to `path` via a temp file + rename.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("cfg.tmp");
        fs::write(&tmp, self.to_config_string())?;
        fs::rename(&tmp, path)
    }

    pub fn save(&self) -> std::io::Result<()> {
        match Self::settings_path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    pub fn mask_settings(&self) -> MaskSettings {
        MaskSettings {
            mode: self.mask_mode,
            feather: self.mask_feather,
        }
    }
}

fn non_empty_path(val: &str) -> Option<PathBuf> {
    (!val.is_empty()).then(|| PathBuf::from(val))
}

/// Anchor a relative path at the current directory. The native runtime only
/// accepts absolute model paths, so every configured directory goes through
/// here.
pub fn absolute_path(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    std::path::absolute(&path).unwrap_or(path)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| absolute_path("."))
}

/// Platform data directory (without the app sub-folder).
pub fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    absolute_path(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join(SETTINGS_FILE);
        let s = BridgeSettings {
            onnx_runtime_path: Some(PathBuf::from("/opt/ort/libonnxruntime.so")),
            models_dir: dir.path().join("models"),
            model_base_url: "https://models.example.test/v1".to_string(),
            prefer_gpu: false,
            intra_op_threads: 2,
            mask_mode: MaskMode::Hard,
            mask_feather: 1.5,
            output_format: SaveFormat::Jpeg,
            jpeg_quality: 80,
            ..BridgeSettings::default()
        };
        s.save_to(&path).unwrap();
        assert_eq!(BridgeSettings::load_from(&path), s);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let s = BridgeSettings::parse(
            "# comment\nintra_op_threads=lots\nmask_mode=fuzzy\njpeg_quality=900\nunknown_key=1\nprefer_gpu=false\n",
        );
        let d = BridgeSettings::default();
        assert_eq!(s.intra_op_threads, d.intra_op_threads);
        assert_eq!(s.mask_mode, MaskMode::Soft);
        assert_eq!(s.jpeg_quality, d.jpeg_quality);
        assert!(!s.prefer_gpu);
    }

    #[test]
    fn relative_dirs_are_anchored_at_the_working_dir() {
        let s = BridgeSettings::parse("models_dir=models\noutput_dir=./out\nbundled_models_dir=shipped\n");
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(s.models_dir, cwd.join("models"));
        assert_eq!(s.output_dir, cwd.join("out"));
        assert_eq!(s.bundled_models_dir, Some(cwd.join("shipped")));
        assert!(BridgeSettings::default().models_dir.is_absolute());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = BridgeSettings::load_from(&dir.path().join("nope.cfg"));
        assert_eq!(s, BridgeSettings::default());
    }
}
