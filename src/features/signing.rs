//! Local signing: signature placement, provenance stamps and the audit record, plus
//! verification and history lookups against the metadata store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::features::footprint::{
    generate_signature_id, sha256_hex, DigitalFootprint, SignatureMetadata, SignaturePosition,
};
use crate::features::metadata_store::MetadataStore;
use crate::features::pdf;
use crate::features::placement::{decode_signature_payload, Anchor, SignatureImage, SignaturePlacer};
use crate::features::stamp::{self, StampOptions, StampRenderer};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignRequest {
    pub pdf_path: PathBuf,
    pub opportunity_id: String,
    pub signed_by: String,
    /// Raster image as base64 or a data URI
    pub signature_payload: String,
    pub footprint: DigitalFootprint,
    /// 0-based pages that receive the signature image
    pub target_pages: Vec<usize>,
    pub anchors: HashMap<usize, Anchor>,
    /// Overrides the configured output directory for this request
    pub output_dir: Option<PathBuf>,
    /// File stem of the signed copy; defaults to the source file's stem
    pub output_stem: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignOutcome {
    pub signature_id: String,
    pub output_path: PathBuf,
    pub metadata: SignatureMetadata,
    /// The payload could not be drawn and a blank placeholder was used
    pub image_degraded: bool,
    pub metadata_persisted: bool,
    pub pages_stamped: usize,
    pub document_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub metadata: Option<SignatureMetadata>,
}

pub struct DigitalSignatureService {
    store: Box<dyn MetadataStore>,
    output_dir: Option<PathBuf>,
    skip_if_stamped: bool,
    stamp_options: StampOptions,
}

impl DigitalSignatureService {
    pub fn new(store: Box<dyn MetadataStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            output_dir: config.output_dir.clone(),
            skip_if_stamped: config.skip_if_stamped,
            stamp_options: StampOptions::default(),
        }
    }

    pub fn with_stamp_options(mut self, options: StampOptions) -> Self {
        self.stamp_options = options;
        self
    }

    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    fn decode_or_placeholder(&self, payload: &str) -> Result<SignatureImage> {
        match decode_signature_payload(payload.as_bytes()) {
            Ok(image) => Ok(image),
            Err(Error::UnsupportedImageFormat(reason)) => Ok(SignatureImage::placeholder(&reason)),
            Err(e) => Err(e),
        }
    }

    fn output_path(&self, request: &SignRequest, signature_id: &str) -> Result<PathBuf> {
        let dir = match (&request.output_dir, &self.output_dir) {
            (Some(dir), _) | (None, Some(dir)) => dir.clone(),
            (None, None) => request
                .pdf_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let stem = match &request.output_stem {
            Some(stem) => stem.as_str(),
            None => request
                .pdf_path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::SourceNotFound(request.pdf_path.display().to_string()))?,
        };
        Ok(dir.join(format!("{stem}_signed_{signature_id}.pdf")))
    }

    /// Sign the PDF at `request.pdf_path` and write the result as a new file.
    ///
    /// Nothing is written when loading, placement or stamping fails. A failure to persist the
    /// metadata record is logged and reported in the outcome, not returned.
    pub fn sign(&self, request: &SignRequest) -> Result<SignOutcome> {
        let source = pdf::read_source(&request.pdf_path)?;
        let mut doc = pdf::load_document(&source)?;

        let image = self.decode_or_placeholder(&request.signature_payload)?;
        for warning in request.footprint.consistency_warnings() {
            log::warn!(
                "Footprint for opportunity {} accepted with inconsistency: {}",
                request.opportunity_id,
                warning
            );
        }
        let previously_stamped = stamp::stamp_marker(&doc);

        let placed =
            SignaturePlacer::new(&image).place(&mut doc, &request.target_pages, &request.anchors)?;

        let signature_id = generate_signature_id();
        let output_path = self.output_path(request, &signature_id)?;
        let position = placed
            .first()
            .map(|p| SignaturePosition {
                x: p.x,
                y: p.y,
                w: p.width,
                h: p.height,
                page: p.page_index as u32,
            })
            .unwrap_or_default();
        let metadata = SignatureMetadata::create(
            signature_id.clone(),
            &request.opportunity_id,
            &request.signed_by,
            Utc::now(),
            request.footprint.clone(),
            &request.signature_payload,
            &output_path.to_string_lossy(),
            position,
        )?;

        let pages_stamped = match (&previously_stamped, self.skip_if_stamped) {
            (Some(previous), true) => {
                log::info!(
                    "Document already stamped by {}; skipping stamps for {}",
                    previous,
                    signature_id
                );
                0
            }
            _ => {
                let mut renderer = StampRenderer::new(self.stamp_options.clone());
                let signed_pages: Vec<usize> = placed.iter().map(|p| p.page_index).collect();
                let stamped = renderer.stamp_all(&mut doc, &metadata)?;
                renderer.stamp_detailed(&mut doc, &metadata, &signed_pages)?;
                stamped
            }
        };

        let bytes = pdf::save_to_bytes(&mut doc)?;
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&output_path, &bytes)?;
        log::info!(
            "Signed {} as {} ({} bytes)",
            request.pdf_path.display(),
            output_path.display(),
            bytes.len()
        );

        let metadata_persisted = match self.store.save(&metadata) {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "Signature metadata not persisted: signature_id={} opportunity_id={} \
                     path={} error={}",
                    metadata.signature_id,
                    metadata.opportunity_id,
                    output_path.display(),
                    e
                );
                false
            }
        };

        Ok(SignOutcome {
            signature_id,
            output_path,
            image_degraded: image.is_placeholder(),
            metadata_persisted,
            pages_stamped,
            document_sha256: sha256_hex(&bytes),
            metadata,
        })
    }

    /// Check that a signature record exists and still points at `pdf_path` on disk.
    ///
    /// The document bytes are not rehashed, so edits to the PDF itself go unnoticed.
    pub fn verify(&self, pdf_path: &Path, signature_id: &str) -> Result<VerificationReport> {
        let metadata = match self.store.find_by_id(signature_id)? {
            Some(metadata) => metadata,
            None => {
                return Ok(VerificationReport {
                    is_valid: false,
                    reason: Some("signature_not_found".into()),
                    metadata: None,
                })
            }
        };
        let stored = PathBuf::from(&metadata.pdf_path);
        let reason = if !stored.is_file() {
            Some("signed_document_missing")
        } else if !same_file(&stored, pdf_path) {
            Some("path_mismatch")
        } else {
            None
        };
        if let Some(reason) = reason {
            log::warn!("Verification of {} failed: {}", signature_id, reason);
        }
        Ok(VerificationReport {
            is_valid: reason.is_none(),
            reason: reason.map(str::to_string),
            metadata: Some(metadata),
        })
    }

    pub fn history(&self, opportunity_id: &str) -> Result<Vec<SignatureMetadata>> {
        self.store.find_by_opportunity(opportunity_id)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
