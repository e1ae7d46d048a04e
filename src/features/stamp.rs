//! Low-contrast provenance stamps drawn after signing.

use std::collections::HashSet;

use lopdf::content::Operation;
use lopdf::{dictionary, Document, Object, ObjectId, StringFormat};

use crate::error::{Error, Result};
use crate::features::footprint::SignatureMetadata;
use crate::features::pdf;

/// Info dictionary key recording the signature id of the last stamping pass.
pub const STAMP_MARKER_KEY: &str = "SolarSignStamp";

const DEFAULT_ADVANCE: u16 = 556;

/// Helvetica advance widths (1/1000 em) for ASCII 32..=126.
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 222, 333, 333, 389, 584, 278, 333, 278, 278, // ' '../
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // 0..9
    278, 278, 584, 584, 584, 556, 1015, // :..@
    667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, // A..M
    722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, // N..Z
    278, 278, 278, 469, 556, 222, // [..`
    556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, // a..m
    556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, // n..z
    334, 260, 334, 584, // {..~
];

/// Width of `text` in points when set in Helvetica at `size`.
pub fn helvetica_text_width(text: &str, size: f64) -> f64 {
    let units: u32 = text
        .chars()
        .map(|c| {
            let code = c as u32;
            if (32..=126).contains(&code) {
                HELVETICA_WIDTHS[(code - 32) as usize] as u32
            } else {
                DEFAULT_ADVANCE as u32
            }
        })
        .sum();
    units as f64 * size / 1000.0
}

/// Encode as WinAnsi bytes; characters outside Latin-1 become `?`.
fn win_ansi(text: &str) -> Object {
    let bytes = text
        .chars()
        .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
        .collect();
    Object::String(bytes, StringFormat::Literal)
}

#[derive(Debug, Clone)]
pub struct StampOptions {
    /// Distance of the compact stamp from the top and right page edges
    pub margin: f64,
    pub compact_font_size: f64,
    /// Gray level (0 black, 1 white) for stamp text and strokes
    pub gray: f64,
    pub id_fragment_len: usize,
    pub panel_x: f64,
    pub panel_y: f64,
    pub panel_width: f64,
    pub panel_height: f64,
    pub panel_font_size: f64,
}

impl Default for StampOptions {
    fn default() -> Self {
        Self {
            margin: 18.0,
            compact_font_size: 6.0,
            gray: 0.6,
            id_fragment_len: 14,
            panel_x: 36.0,
            panel_y: 36.0,
            panel_width: 230.0,
            panel_height: 58.0,
            panel_font_size: 7.0,
        }
    }
}

/// Draws stamps on one document. Each page gets at most one compact stamp and one
/// detailed panel per renderer, however often the stamp methods are called.
pub struct StampRenderer {
    options: StampOptions,
    font: Option<(ObjectId, String)>,
    isolated: HashSet<ObjectId>,
    compact_done: HashSet<ObjectId>,
    detailed_done: HashSet<ObjectId>,
}

impl StampRenderer {
    pub fn new(options: StampOptions) -> Self {
        Self {
            options,
            font: None,
            isolated: HashSet::new(),
            compact_done: HashSet::new(),
            detailed_done: HashSet::new(),
        }
    }

    /// Stamp every page; returns how many pages were newly stamped.
    pub fn stamp_all(&mut self, doc: &mut Document, metadata: &SignatureMetadata) -> Result<usize> {
        let page_ids: Vec<ObjectId> = doc.get_pages().values().copied().collect();
        let text = self.compact_text(metadata);
        let mut stamped = 0;
        for page_id in page_ids {
            if self.compact_done.contains(&page_id) {
                continue;
            }
            let font = self.prepare_page(doc, page_id)?;
            let (page_w, page_h) = pdf::page_dimensions(doc, page_id)?;
            let ops = self.compact_operations(&font, &text, page_w, page_h);
            pdf::append_operations(doc, page_id, ops)?;
            self.compact_done.insert(page_id);
            stamped += 1;
        }
        pdf::set_info_entry(doc, STAMP_MARKER_KEY, &metadata.signature_id)?;
        log::debug!("Compact stamp applied to {} page(s)", stamped);
        Ok(stamped)
    }

    /// Draw the expanded panel on the given 0-based pages.
    pub fn stamp_detailed(
        &mut self,
        doc: &mut Document,
        metadata: &SignatureMetadata,
        signature_pages: &[usize],
    ) -> Result<usize> {
        let mut targets = Vec::new();
        for &index in signature_pages {
            let page_id = pdf::page_id(doc, index)?;
            if !targets.contains(&page_id) {
                targets.push(page_id);
            }
        }
        let mut stamped = 0;
        for page_id in targets {
            if self.detailed_done.contains(&page_id) {
                continue;
            }
            let font = self.prepare_page(doc, page_id)?;
            let ops = self.panel_operations(&font, metadata);
            pdf::append_operations(doc, page_id, ops)?;
            self.detailed_done.insert(page_id);
            stamped += 1;
        }
        log::debug!("Detailed stamp applied to {} page(s)", stamped);
        Ok(stamped)
    }

    fn prepare_page(&mut self, doc: &mut Document, page_id: ObjectId) -> Result<String> {
        let (font_id, font_name) = match &self.font {
            Some(font) => font.clone(),
            None => {
                let id = doc.add_object(dictionary! {
                    "Type" => "Font",
                    "Subtype" => "Type1",
                    "BaseFont" => "Helvetica",
                    "Encoding" => "WinAnsiEncoding",
                });
                let font = (id, format!("FStamp{}", id.0));
                self.font = Some(font.clone());
                font
            }
        };
        if self.isolated.insert(page_id) {
            pdf::register_page_resource(doc, page_id, "Font", &font_name, font_id)?;
            pdf::isolate_page_contents(doc, page_id)?;
        }
        Ok(font_name)
    }

    fn compact_text(&self, metadata: &SignatureMetadata) -> String {
        let fragment: String = metadata
            .signature_id
            .chars()
            .take(self.options.id_fragment_len)
            .collect();
        format!("{} {}", fragment, metadata.signed_at.format("%d.%m.%Y"))
    }

    fn compact_operations(
        &self,
        font: &str,
        text: &str,
        page_w: f64,
        page_h: f64,
    ) -> Vec<Operation> {
        let opts = &self.options;
        let size = opts.compact_font_size;
        let text_w = helvetica_text_width(text, size);
        let text_x = page_w - opts.margin - text_w;
        let baseline = page_h - opts.margin - size;
        let check = size * 0.9;
        let check_x = text_x - check - size * 0.4;

        let mut ops = vec![Operation::new("q", vec![])];
        ops.extend(checkmark(check_x, baseline, check, 0.6, opts.gray));
        ops.extend(text_line(font, size, opts.gray, text_x, baseline, text));
        ops.push(Operation::new("Q", vec![]));
        ops
    }

    fn panel_operations(&self, font: &str, metadata: &SignatureMetadata) -> Vec<Operation> {
        let opts = &self.options;
        let (x, y, w, h) = (opts.panel_x, opts.panel_y, opts.panel_width, opts.panel_height);
        let size = opts.panel_font_size;
        let icon = 16.0;
        let text_x = x + icon + 16.0;
        let line = size * 1.45;

        let mut ops = vec![
            Operation::new("q", vec![]),
            Operation::new("w", vec![0.75.into()]),
            Operation::new("G", vec![opts.gray.into()]),
            Operation::new("re", vec![x.into(), y.into(), w.into(), h.into()]),
            Operation::new("S", vec![]),
        ];
        ops.extend(checkmark(x + 8.0, y + (h - icon) / 2.0, icon, 1.5, opts.gray));

        let lines = [
            (size + 1.0, "Digitally signed".to_string()),
            (size, format!("ID: {}", metadata.signature_id)),
            (size, format!("Signer: {}", metadata.signed_by)),
            (size, format!("Date: {}", metadata.signed_at.format("%Y-%m-%d %H:%M UTC"))),
        ];
        let mut baseline = y + h - 8.0 - size;
        for (font_size, text) in lines.iter() {
            ops.extend(text_line(font, *font_size, opts.gray * 0.7, text_x, baseline, text));
            baseline -= line;
        }
        ops.push(Operation::new("Q", vec![]));
        ops
    }
}

impl Default for StampRenderer {
    fn default() -> Self {
        Self::new(StampOptions::default())
    }
}

fn text_line(font: &str, size: f64, gray: f64, x: f64, y: f64, text: &str) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("g", vec![gray.into()]),
        Operation::new("Tf", vec![font.into(), size.into()]),
        Operation::new("Td", vec![x.into(), y.into()]),
        Operation::new("Tj", vec![win_ansi(text)]),
        Operation::new("ET", vec![]),
    ]
}

/// A tick inside the `size`×`size` square whose lower-left corner is `(x, y)`.
fn checkmark(x: f64, y: f64, size: f64, line_width: f64, gray: f64) -> Vec<Operation> {
    vec![
        Operation::new("w", vec![line_width.into()]),
        Operation::new("G", vec![gray.into()]),
        Operation::new("J", vec![1.into()]),
        Operation::new("m", vec![x.into(), (y + size * 0.5).into()]),
        Operation::new("l", vec![(x + size * 0.38).into(), (y + size * 0.12).into()]),
        Operation::new("l", vec![(x + size).into(), (y + size * 0.9).into()]),
        Operation::new("S", vec![]),
    ]
}

/// Convenience wrapper: compact stamp on every page with default options.
pub fn stamp_all(doc: &mut Document, metadata: &SignatureMetadata) -> Result<usize> {
    StampRenderer::default().stamp_all(doc, metadata)
}

/// Convenience wrapper: detailed panel on `signature_pages` with default options.
pub fn stamp_detailed(
    doc: &mut Document,
    metadata: &SignatureMetadata,
    signature_pages: &[usize],
) -> Result<usize> {
    StampRenderer::default().stamp_detailed(doc, metadata, signature_pages)
}

/// Signature id left by an earlier stamping pass, if any.
pub fn stamp_marker(doc: &Document) -> Option<String> {
    pdf::info_entry(doc, STAMP_MARKER_KEY)
}

pub fn is_stamped(doc: &Document) -> bool {
    stamp_marker(doc).is_some()
}

/// Read the marker from PDF bytes.
pub fn is_stamped_bytes(bytes: &[u8]) -> Result<bool> {
    Ok(is_stamped(&pdf::load_document(bytes)?))
}
