//! Transform registry
//!
//! Maps each [`Operation`] to a pure image transformation. Decoding and
//! encoding are file based and CPU bound, so callers on the async runtime
//! should go through [`transform_file_async`].

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::job::Operation;

/// Apply an operation to a decoded image.
pub fn apply(operation: &Operation, img: DynamicImage) -> DynamicImage {
    match operation {
        Operation::Resize(params) => img.resize_exact(params.width, params.height, FilterType::CatmullRom),
        Operation::Grayscale => DynamicImage::ImageLuma8(img.to_luma8()),
        Operation::Blur(params) if params.radius == 0 => img,
        Operation::Blur(params) => img.blur(params.radius as f32),
    }
}

/// Decode `source`, apply `operation` and encode the result to `output`.
///
/// The source format is sniffed from its content; the output format is
/// chosen from the output path's extension. The image is fully encoded in
/// memory first, so a failed encode never leaves a file behind.
pub fn transform_file(source: &Path, output: &Path, operation: &Operation) -> Result<(u32, u32), TransformError> {
    let img = decode(source)?;
    debug!(
        source = %source.display(),
        width = img.width(),
        height = img.height(),
        "Decoded source image"
    );

    let transformed = apply(operation, img);
    let dimensions = (transformed.width(), transformed.height());

    let format = ImageFormat::from_path(output).map_err(|e| TransformError::from_image(output, e))?;
    let mut encoded = Vec::new();
    encodable_for(format, transformed)
        .write_to(&mut Cursor::new(&mut encoded), format)
        .map_err(|e| TransformError::from_image(output, e))?;

    std::fs::write(output, &encoded).map_err(|source| TransformError::Io {
        path: output.display().to_string(),
        source,
    })?;

    debug!(
        output = %output.display(),
        width = dimensions.0,
        height = dimensions.1,
        bytes = encoded.len(),
        "Wrote transformed image"
    );

    Ok(dimensions)
}

fn decode(source: &Path) -> Result<DynamicImage, TransformError> {
    let io_err = |source_err| TransformError::Io {
        path: source.display().to_string(),
        source: source_err,
    };
    ImageReader::open(source)
        .map_err(io_err)?
        .with_guessed_format()
        .map_err(io_err)?
        .decode()
        .map_err(|e| TransformError::from_image(source, e))
}

/// Convert to a pixel layout the target encoder accepts.
///
/// GIF only encodes 8-bit RGB(A); JPEG has no alpha channel and no 16-bit
/// support; lossless WebP only takes 8-bit samples.
fn encodable_for(format: ImageFormat, img: DynamicImage) -> DynamicImage {
    let color = img.color();
    match format {
        ImageFormat::Gif => DynamicImage::ImageRgba8(img.to_rgba8()),
        ImageFormat::Jpeg => match img {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => img,
            _ if color.has_color() => DynamicImage::ImageRgb8(img.to_rgb8()),
            _ => DynamicImage::ImageLuma8(img.to_luma8()),
        },
        ImageFormat::WebP => match img {
            DynamicImage::ImageLuma8(_)
            | DynamicImage::ImageLumaA8(_)
            | DynamicImage::ImageRgb8(_)
            | DynamicImage::ImageRgba8(_) => img,
            _ if color.has_alpha() => DynamicImage::ImageRgba8(img.to_rgba8()),
            _ => DynamicImage::ImageRgb8(img.to_rgb8()),
        },
        _ => img,
    }
}

/// Run [`transform_file`] on the blocking thread pool.
pub async fn transform_file_async(
    source: PathBuf,
    output: PathBuf,
    operation: Operation,
) -> Result<(u32, u32), TransformError> {
    tokio::task::spawn_blocking(move || transform_file(&source, &output, &operation))
        .await
        .map_err(|e| TransformError::TaskFailed(e.to_string()))?
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Transform task failed: {0}")]
    TaskFailed(String),
}

impl TransformError {
    fn from_image(path: &Path, err: image::ImageError) -> Self {
        let path = path.display().to_string();
        match err {
            image::ImageError::IoError(source) => TransformError::Io { path, source },
            source => TransformError::Image { path, source },
        }
    }
}
