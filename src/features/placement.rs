//! Signature image decoding, adaptive sizing and placement onto PDF pages.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::content::Operation;
use lopdf::{dictionary, Document, ObjectId, Stream};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::features::pdf;

const DATA_URI_PATTERN: &str = r"(?s)^data:([A-Za-z0-9.+/-]*)((?:;[A-Za-z0-9=._-]+)*),(.*)$";

const SMALL_MIN_WIDTH: f64 = 50.0;
const SMALL_MIN_HEIGHT: f64 = 25.0;
const SMALL_BOX: (f64, f64) = (80.0, 40.0);
const LARGE_MAX_WIDTH: f64 = 300.0;
const LARGE_MAX_HEIGHT: f64 = 150.0;
const LARGE_BOX: (f64, f64) = (200.0, 100.0);
const MEDIUM_BOX: (f64, f64) = (200.0, 100.0);
const FLOOR: (f64, f64) = (60.0, 30.0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Raster,
    /// Stand-in for a payload that could not be rendered; the reason is logged.
    Placeholder { reason: String },
}

/// A decoded signature bitmap split into the RGB samples and alpha mask PDF wants.
#[derive(Debug, Clone)]
pub struct SignatureImage {
    pub width: u32,
    pub height: u32,
    rgb: Vec<u8>,
    alpha: Vec<u8>,
    pub source: ImageSource,
}

impl SignatureImage {
    pub fn from_rgba(img: &image::RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        let mut alpha = Vec::with_capacity((width * height) as usize);
        for pixel in img.pixels() {
            let [r, g, b, a] = pixel.0;
            rgb.extend_from_slice(&[r, g, b]);
            alpha.push(a);
        }
        Self {
            width,
            height,
            rgb,
            alpha,
            source: ImageSource::Raster,
        }
    }

    /// Fully transparent 1×1 bitmap.
    pub fn placeholder(reason: &str) -> Self {
        log::warn!("Signature image degraded to placeholder: {}", reason);
        Self {
            width: 1,
            height: 1,
            rgb: vec![255, 255, 255],
            alpha: vec![0],
            source: ImageSource::Placeholder {
                reason: reason.to_string(),
            },
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.source, ImageSource::Placeholder { .. })
    }

    pub fn natural_size(&self) -> (f64, f64) {
        (self.width as f64, self.height as f64)
    }
}

fn data_uri_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(DATA_URI_PATTERN))
        .as_ref()
        .map_err(|e| Error::Config(format!("data uri pattern: {e}")))
}

fn looks_like_vector(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let head = &bytes[start..];
    head.starts_with(b"<svg") || head.starts_with(b"<?xml")
}

/// Decode a signature payload given as raw image bytes, bare base64 text or a
/// `data:<mime>;base64,` URI.
///
/// Vector input is replaced by a placeholder; anything else that is not a decodable raster
/// fails with [`Error::UnsupportedImageFormat`].
pub fn decode_signature_payload(payload: &[u8]) -> Result<SignatureImage> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(Error::SourceNotFound("empty signature payload".into()));
    }

    let mut raw: Vec<u8> = payload.to_vec();
    if let Ok(text) = std::str::from_utf8(payload) {
        let text = text.trim();
        if let Some(caps) = data_uri_pattern()?.captures(text) {
            let mime = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let params = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let body = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            if mime.eq_ignore_ascii_case("image/svg+xml") {
                return Ok(SignatureImage::placeholder("vector payload (image/svg+xml)"));
            }
            raw = if params.split(';').any(|p| p.eq_ignore_ascii_case("base64")) {
                decode_base64(body)?
            } else {
                body.as_bytes().to_vec()
            };
        } else if !looks_like_vector(text.as_bytes()) && image::guess_format(payload).is_err() {
            raw = decode_base64(text)?;
        }
    }

    if looks_like_vector(&raw) {
        return Ok(SignatureImage::placeholder("vector payload"));
    }

    let img = image::load_from_memory(&raw)
        .map_err(|e| Error::UnsupportedImageFormat(format!("signature_image_invalid:{e}")))?
        .to_rgba8();
    Ok(SignatureImage::from_rgba(&img))
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    B64.decode(compact.as_bytes())
        .map_err(|e| Error::UnsupportedImageFormat(format!("signature_decode_failed:{e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeTier {
    Small,
    Medium,
    Large,
}

pub fn size_tier(width: f64, height: f64) -> SizeTier {
    if width < SMALL_MIN_WIDTH || height < SMALL_MIN_HEIGHT {
        SizeTier::Small
    } else if width > LARGE_MAX_WIDTH || height > LARGE_MAX_HEIGHT {
        SizeTier::Large
    } else {
        SizeTier::Medium
    }
}

/// Scale `(width, height)` so it exactly meets the box along the constraining axis.
fn fit_to_box(width: f64, height: f64, target: (f64, f64)) -> (f64, f64) {
    let ratio = width / height;
    if ratio > target.0 / target.1 {
        (target.0, target.0 / ratio)
    } else {
        (target.1 * ratio, target.1)
    }
}

/// Display size in points for an image of natural size `(width, height)`.
pub fn adaptive_size(width: f64, height: f64) -> (f64, f64) {
    if !(width > 0.0 && height > 0.0 && width.is_finite() && height.is_finite()) {
        return FLOOR;
    }
    let ratio = width / height;
    let (mut w, mut h) = match size_tier(width, height) {
        SizeTier::Small => fit_to_box(width, height, SMALL_BOX),
        SizeTier::Large => fit_to_box(width, height, LARGE_BOX),
        SizeTier::Medium => {
            if width <= MEDIUM_BOX.0 && height <= MEDIUM_BOX.1 {
                (width, height)
            } else {
                fit_to_box(width, height, MEDIUM_BOX)
            }
        }
    };
    if w < FLOOR.0 {
        w = FLOOR.0;
        h = w / ratio;
    }
    if h < FLOOR.1 {
        h = FLOOR.1;
        w = h * ratio;
    }
    (w, h)
}

/// Top-left corner of a placement, in PDF points measured from the page's top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub x: f64,
    pub y: f64,
}

impl Anchor {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedSignature {
    /// 0-based page index
    pub page_index: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Draws one signature image, at one computed size, onto any number of pages.
pub struct SignaturePlacer<'a> {
    image: &'a SignatureImage,
    width: f64,
    height: f64,
}

impl<'a> SignaturePlacer<'a> {
    pub fn new(image: &'a SignatureImage) -> Self {
        let (natural_w, natural_h) = image.natural_size();
        let (width, height) = adaptive_size(natural_w, natural_h);
        log::debug!(
            "Signature {}x{} px -> {:.1}x{:.1} pt ({:?})",
            image.width,
            image.height,
            width,
            height,
            size_tier(natural_w, natural_h)
        );
        Self {
            image,
            width,
            height,
        }
    }

    pub fn size(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    /// Place the image on every page in `target_pages` (0-based) at that page's anchor.
    ///
    /// All pages and anchors are checked before the document is touched.
    pub fn place(
        &self,
        doc: &mut Document,
        target_pages: &[usize],
        anchors: &HashMap<usize, Anchor>,
    ) -> Result<Vec<PlacedSignature>> {
        let page_count = doc.get_pages().len() as u32;
        let mut seen = HashSet::new();
        let mut plan = Vec::new();
        for &index in target_pages {
            if !seen.insert(index) {
                continue;
            }
            let page_id = pdf::page_id(doc, index)?;
            let anchor = anchors.get(&index).ok_or(Error::PageIndexOutOfRange {
                field: "signature_anchor".into(),
                page: index as i64,
                page_count,
            })?;
            let (page_w, page_h) = pdf::page_dimensions(doc, page_id)?;
            self.check_fits(index, anchor, page_w, page_h)?;
            plan.push((index, page_id, *anchor, page_h));
        }
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let image_id = self.embed(doc)?;
        let name = format!("ImSig{}", image_id.0);
        let mut placed = Vec::with_capacity(plan.len());
        for (index, page_id, anchor, page_height) in plan {
            let pdf_y = page_height - anchor.y - self.height;
            pdf::register_page_resource(doc, page_id, "XObject", &name, image_id)?;
            pdf::isolate_page_contents(doc, page_id)?;
            pdf::append_operations(
                doc,
                page_id,
                vec![
                    Operation::new("q", vec![]),
                    Operation::new(
                        "cm",
                        vec![
                            self.width.into(),
                            0.into(),
                            0.into(),
                            self.height.into(),
                            anchor.x.into(),
                            pdf_y.into(),
                        ],
                    ),
                    Operation::new("Do", vec![name.as_str().into()]),
                    Operation::new("Q", vec![]),
                ],
            )?;
            placed.push(PlacedSignature {
                page_index: index,
                x: anchor.x,
                y: anchor.y,
                width: self.width,
                height: self.height,
            });
        }
        log::info!("Placed signature image on {} page(s)", placed.len());
        Ok(placed)
    }

    /// The image box at `anchor` must lie fully inside the page.
    fn check_fits(&self, index: usize, anchor: &Anchor, page_w: f64, page_h: f64) -> Result<()> {
        let inside = anchor.x >= 0.0
            && anchor.y >= 0.0
            && anchor.x + self.width <= page_w
            && anchor.y + self.height <= page_h;
        if inside {
            return Ok(());
        }
        Err(Error::InvalidFieldArea(format!(
            "signature at ({:.1}, {:.1}) size {:.1}x{:.1} falls outside page {} ({:.1}x{:.1})",
            anchor.x, anchor.y, self.width, self.height, index, page_w, page_h
        )))
    }

    fn embed(&self, doc: &mut Document) -> Result<ObjectId> {
        let smask = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => self.image.width as i64,
                "Height" => self.image.height as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
            },
            deflate(&self.image.alpha)?,
        );
        let smask_id = doc.add_object(smask);
        let image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => self.image.width as i64,
                "Height" => self.image.height as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
                "SMask" => smask_id,
            },
            deflate(&self.image.rgb)?,
        );
        Ok(doc.add_object(image))
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
