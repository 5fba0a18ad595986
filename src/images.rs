//! Storage of agent pictures and report photos on disk.
//!
//! Images arrive base64 encoded, get decoded, downscaled into the bounding box of their
//! [`ImageRole`] and are re-encoded with the single configured output format. Files are
//! named after a sanitised logical name, so the same name always maps to the same path.
//!
//! Writes go through a staging file first ([`ImageStore::stage`]) and only appear under
//! their final name once [`StagedImage::publish`] is called.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use base64::{engine::general_purpose, Engine as _};
use image::{imageops::FilterType, DynamicImage, ImageBuffer, ImageFormat, Rgb};
use log::{trace, warn};
use rand::Rng;
use thiserror::Error;

/// Directory, relative to the data directory, holding agent pictures
pub const AGENT_DIR: &str = "images/agent";
/// Directory, relative to the data directory, holding full size report images
pub const REPORT_DIR: &str = "images/reports";
/// Directory, relative to the data directory, holding report thumbnails under the
/// same file name as their full size image
pub const THUMB_DIR: &str = "images/reports/thumbs";

const PLACEHOLDER_SIZE: u32 = 64;

/// What an image is used for, which decides where it lives and how large it may be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageRole {
    /// Profile picture of an agent
    Agent,
    /// Full resolution photo attached to a report
    Report,
    /// Thumbnail variant of a report photo
    ReportThumb,
}

impl ImageRole {
    /// Maximum (width, height) an image of this role is stored at
    pub fn bound(self) -> (u32, u32) {
        match self {
            ImageRole::Agent => (500, 500),
            ImageRole::Report => (2000, 2000),
            ImageRole::ReportThumb => (500, 500),
        }
    }

    /// Directory of this role, relative to the data directory
    pub fn dir(self) -> &'static str {
        match self {
            ImageRole::Agent => AGENT_DIR,
            ImageRole::Report => REPORT_DIR,
            ImageRole::ReportThumb => THUMB_DIR,
        }
    }
}

/// Failures while decoding or storing an image
#[derive(Debug, Error)]
pub enum ImageError {
    /// The payload was not valid base64
    #[error("image payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    /// The decoded bytes are not an image we recognise
    #[error("image payload is not a recognised image: {0}")]
    Format(#[source] image::ImageError),
    /// The logical name sanitises down to nothing
    #[error("`{0}` does not produce a usable file name")]
    InvalidName(String),
    /// The decoded image could not be encoded into the output format
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
    /// Filesystem failure
    #[error("image store io failure: {0}")]
    Io(#[from] io::Error),
}

impl From<image::ImageError> for ImageError {
    fn from(e: image::ImageError) -> Self {
        match e {
            image::ImageError::IoError(e) => ImageError::Io(e),
            e => ImageError::Encode(e),
        }
    }
}

/// Reduce `name` to something that is safe to use as a single file name.
///
/// Path separators and whitespace become underscores, anything outside of
/// `[A-Za-z0-9._-]` is dropped and leading/trailing dots and underscores are removed.
pub fn secure_filename(name: &str) -> String {
    let spaced: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Converts `img` into 8 bit RGB or RGBA when `format` cannot encode its color type.
///
/// Returns `None` when the image can be encoded as it is.
fn encodable(img: &DynamicImage, format: ImageFormat) -> Option<DynamicImage> {
    match format {
        ImageFormat::Png => None,
        ImageFormat::Jpeg => match img {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_) => None,
            _ => Some(DynamicImage::ImageRgb8(img.to_rgb8())),
        },
        _ => match img {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => None,
            _ if img.color().has_alpha() => Some(DynamicImage::ImageRgba8(img.to_rgba8())),
            _ => Some(DynamicImage::ImageRgb8(img.to_rgb8())),
        },
    }
}

/// An encoded image written to a staging file, not yet visible under its final name.
///
/// Dropping it without calling [`StagedImage::publish`] deletes the staging file.
#[derive(Debug)]
pub struct StagedImage {
    staging: PathBuf,
    target: PathBuf,
    relative: PathBuf,
    published: bool,
}

impl StagedImage {
    /// Path, relative to the data directory, the image will live at once published
    pub fn relative_path(&self) -> &Path {
        &self.relative
    }

    /// Move the staged file onto its final name, replacing any previous file
    pub fn publish(mut self) -> Result<PathBuf, ImageError> {
        fs::rename(&self.staging, &self.target)?;
        self.published = true;
        trace!("published image {:?}", self.relative);
        Ok(self.relative.clone())
    }
}

impl Drop for StagedImage {
    fn drop(&mut self) {
        if !self.published {
            if let Err(e) = fs::remove_file(&self.staging) {
                warn!("failed to discard staged image {:?}: {}", self.staging, e);
            }
        }
    }
}

/// Writes images below a data directory
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
    format: ImageFormat,
}

impl ImageStore {
    /// Create a store rooted at the data directory, writing images as `format`
    pub fn new(root: impl Into<PathBuf>, format: ImageFormat) -> Self {
        Self {
            root: root.into(),
            format,
        }
    }

    /// The data directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File extension of stored images
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("img")
    }

    /// MIME type of stored images
    pub fn content_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    /// Create the image directories, returns whether the data directory already existed
    pub fn init(&self) -> io::Result<bool> {
        let existed = self.root.exists();
        for dir in [AGENT_DIR, REPORT_DIR, THUMB_DIR] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(existed)
    }

    /// Decode a base64 payload into an image
    pub fn decode(&self, payload: &str) -> Result<DynamicImage, ImageError> {
        let bytes = general_purpose::STANDARD.decode(payload.trim())?;
        image::load_from_memory(&bytes).map_err(|e| {
            warn!("failed to open image payload, broken file or unknown format");
            ImageError::Format(e)
        })
    }

    /// Path, relative to the data directory, that `logical_name` is stored at for `role`
    pub fn relative_path(&self, logical_name: &str, role: ImageRole) -> Result<PathBuf, ImageError> {
        let name = secure_filename(logical_name);
        if name.is_empty() {
            return Err(ImageError::InvalidName(logical_name.to_string()));
        }
        Ok(Path::new(role.dir()).join(format!("{}.{}", name, self.extension())))
    }

    /// Decode `payload` and write it to a staging file for `logical_name`
    pub fn stage(
        &self,
        logical_name: &str,
        payload: &str,
        role: ImageRole,
    ) -> Result<StagedImage, ImageError> {
        let relative = self.relative_path(logical_name, role)?;
        let img = self.decode(payload)?;
        self.stage_at(relative, &img, role)
    }

    /// Write an already decoded image to a staging file for `logical_name`
    pub fn stage_decoded(
        &self,
        logical_name: &str,
        img: &DynamicImage,
        role: ImageRole,
    ) -> Result<StagedImage, ImageError> {
        let relative = self.relative_path(logical_name, role)?;
        self.stage_at(relative, img, role)
    }

    fn stage_at(
        &self,
        relative: PathBuf,
        img: &DynamicImage,
        role: ImageRole,
    ) -> Result<StagedImage, ImageError> {
        let target = self.root.join(&relative);
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let salt: u32 = rand::thread_rng().gen();
        let staging = dir.join(format!(".{}.{:08x}.staged", file_name, salt));

        let (max_w, max_h) = role.bound();
        let resized;
        let mut out = img;
        if img.width() > max_w || img.height() > max_h {
            resized = img.resize(max_w, max_h, FilterType::Lanczos3);
            out = &resized;
        }

        // the staging file has to be cleaned up if encoding fails halfway
        let staged = StagedImage {
            staging,
            target,
            relative,
            published: false,
        };
        match encodable(out, self.format) {
            Some(converted) => converted.save_with_format(&staged.staging, self.format)?,
            None => out.save_with_format(&staged.staging, self.format)?,
        }
        trace!(
            "staged {:?} at {}x{}",
            staged.relative,
            out.width(),
            out.height()
        );
        Ok(staged)
    }

    /// Decode, resize and write `payload`, returning the path relative to the data directory
    pub fn store(
        &self,
        logical_name: &str,
        payload: &str,
        role: ImageRole,
    ) -> Result<PathBuf, ImageError> {
        self.stage(logical_name, payload, role)?.publish()
    }

    /// Read back a stored file by its path relative to the data directory
    pub fn open(&self, relative: &Path) -> io::Result<Vec<u8>> {
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !contained {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path escapes the data directory",
            ));
        }
        fs::read(self.root.join(relative))
    }

    /// A neutral placeholder image, served when a picture is not available
    pub fn placeholder(&self) -> Result<Vec<u8>, ImageError> {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
            PLACEHOLDER_SIZE,
            PLACEHOLDER_SIZE,
            Rgb([200, 200, 200]),
        ));
        let mut buf = io::Cursor::new(Vec::new());
        img.write_to(&mut buf, self.format)?;
        Ok(buf.into_inner())
    }
}
