use std::any::Any;
use std::borrow::Cow;
use std::fs::File;
use std::io::Read;
use std::panic;
use std::path::Path;

use anyhow::{anyhow, Context};
use image::{DynamicImage, ImageBuffer, Rgb};
use quickraw::{data, DemosaicingMethod, Export, Input, Output, OutputType};

use crate::error::{FaceError, Result};
use crate::models::face::BoundingBox;

type Rgb16Image = ImageBuffer<Rgb<u16>, Vec<u16>>;

/// Camera raw containers recognised by their first bytes.
pub fn raw_kind(header: &[u8]) -> Option<&'static str> {
    if header.len() < 12 {
        return None;
    }
    if &header[0..8] == b"FUJIFILM" {
        return Some("RAF");
    }
    if &header[4..8] == b"ftyp" && (&header[8..12] == b"cr3 " || &header[8..12] == b"crx ") {
        return Some("CR3");
    }
    let tiff = header[0..4] == [0x49, 0x49, 0x2A, 0x00] || header[0..4] == [0x4D, 0x4D, 0x00, 0x2A];
    if tiff {
        if &header[8..10] == b"CR" {
            return Some("CR2");
        }
        return Some("TIFF-based raw");
    }
    None
}

fn decode_raster(path: &Path) -> anyhow::Result<DynamicImage> {
    let img = image::io::Reader::open(path)?.with_guessed_format()?.decode()?;
    Ok(img)
}

fn decode_raw(path: &Path) -> anyhow::Result<DynamicImage> {
    let mut buffer = Vec::new();
    File::open(path)?.read_to_end(&mut buffer)?;
    let kind = raw_kind(&buffer).ok_or_else(|| anyhow!("not a recognised camera raw file"))?;
    tracing::debug!("Decoding {:?} as {}", path, kind);

    // quickraw panics on some truncated or malformed containers.
    match panic::catch_unwind(move || export_raw(buffer)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("raw decoder panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn export_raw(buffer: Vec<u8>) -> anyhow::Result<DynamicImage> {
    let export = Export::new(
        Input::ByBuffer(buffer),
        Output::new(
            DemosaicingMethod::Linear,
            data::XYZ2SRGB,
            data::GAMMA_SRGB,
            OutputType::Raw16,
            false,
            true,
        ),
    )
    .map_err(|e| anyhow!("raw decoder rejected file: {:?}", e))?;

    let (pixels, width, height) = export.export_16bit_image();
    let image = Rgb16Image::from_raw(width as u32, height as u32, pixels)
        .context("raw decoder returned a truncated buffer")?;
    Ok(DynamicImage::ImageRgb16(image))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Standard raster formats first, camera raw as the fallback. Both failing
/// yields `FaceError::Decode` carrying the reason of each stage.
pub fn decode_image(path: &Path) -> Result<DynamicImage> {
    let raster_err = match decode_raster(path) {
        Ok(img) => return Ok(img),
        Err(e) => e,
    };
    match decode_raw(path) {
        Ok(img) => Ok(img),
        Err(raw_err) => Err(FaceError::Decode {
            path: path.to_path_buf(),
            reason: format!("{raster_err}; raw fallback: {raw_err}"),
        }),
    }
}

/// Image handed to the analyzer, possibly a downscaled copy of the source.
/// `scale_x`/`scale_y` are working size divided by source size.
pub struct WorkingImage<'a> {
    pub image: Cow<'a, DynamicImage>,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl WorkingImage<'_> {
    pub fn is_downscaled(&self) -> bool {
        matches!(self.image, Cow::Owned(_))
    }

    /// Maps a box found on the working image to source pixels.
    pub fn to_source(&self, bbox: &BoundingBox) -> BoundingBox {
        bbox.unscale(self.scale_x, self.scale_y)
    }
}

/// Downscales to `max_width` (keeping the aspect ratio) when the source is wider.
pub fn working_copy(img: &DynamicImage, max_width: u32) -> WorkingImage<'_> {
    let (w, h) = (img.width(), img.height());
    if max_width == 0 || w <= max_width {
        return WorkingImage { image: Cow::Borrowed(img), scale_x: 1.0, scale_y: 1.0 };
    }
    let nh = ((h as f64 * max_width as f64 / w as f64).round() as u32).max(1);
    let resized = img.resize_exact(max_width, nh, image::imageops::FilterType::Triangle);
    WorkingImage {
        scale_x: max_width as f32 / w as f32,
        scale_y: nh as f32 / h as f32,
        image: Cow::Owned(resized),
    }
}
