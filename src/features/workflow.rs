//! Package preparation for one business document: merge, field correction, then either a
//! vendor submission or local signing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::features::cache::{InFlightRegistry, TtlCache};
use crate::features::coordinates::{
    to_vendor_fields, FieldAnchor, FieldArea, FieldMap, FieldType, PageBase, SignatureField,
    VendorField,
};
use crate::features::footprint::DigitalFootprint;
use crate::features::metadata_store::{open_store, MetadataStore};
use crate::features::pdf;
use crate::features::placement::Anchor;
use crate::features::signing::{DigitalSignatureService, SignOutcome, SignRequest};
use crate::features::storage::TempPdf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Contract,
    Disclaimer,
    BookingConfirmation,
}

fn area(page: u32, x: f64, y: f64, w: f64, h: f64) -> FieldArea {
    FieldArea { page, x, y, w, h }
}

fn field(name: &str, field_type: FieldType, role: &str, areas: Vec<FieldArea>) -> SignatureField {
    SignatureField::new(name, field_type, role, areas)
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Contract => "contract",
            DocumentKind::Disclaimer => "disclaimer",
            DocumentKind::BookingConfirmation => "booking_confirmation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contract" => Some(DocumentKind::Contract),
            "disclaimer" => Some(DocumentKind::Disclaimer),
            "booking_confirmation" => Some(DocumentKind::BookingConfirmation),
            _ => None,
        }
    }

    /// Document appended after the primary one, if this kind is sent as a package.
    pub fn secondary(self) -> Option<DocumentKind> {
        match self {
            DocumentKind::Contract => Some(DocumentKind::BookingConfirmation),
            _ => None,
        }
    }

    /// Built-in field map, authored one-based.
    pub fn field_map(self) -> FieldMap {
        match self {
            DocumentKind::Contract => FieldMap {
                name: "contract".into(),
                page_base: PageBase::OneBased,
                baseline_pages: 23,
                validated_primary_pages: vec![23, 24],
                fields: vec![
                    field(
                        "customer_signature",
                        FieldType::Signature,
                        "Customer",
                        vec![area(6, 0.12, 0.78, 0.32, 0.06), area(23, 0.12, 0.70, 0.32, 0.06)],
                    ),
                    field(
                        "customer_date",
                        FieldType::Date,
                        "Customer",
                        vec![area(6, 0.12, 0.86, 0.18, 0.03), area(23, 0.12, 0.78, 0.18, 0.03)],
                    ),
                    field(
                        "seller_signature",
                        FieldType::Signature,
                        "Seller",
                        vec![area(23, 0.56, 0.70, 0.32, 0.06)],
                    ),
                    field(
                        "terms_accepted",
                        FieldType::Checkbox,
                        "Customer",
                        vec![area(22, 0.10, 0.64, 0.03, 0.02)],
                    ),
                    field(
                        "confirmation_signature",
                        FieldType::Signature,
                        "Customer",
                        vec![area(1, 0.12, 0.74, 0.32, 0.06)],
                    )
                    .on_secondary(),
                    field(
                        "confirmation_date",
                        FieldType::Date,
                        "Customer",
                        vec![area(1, 0.12, 0.82, 0.18, 0.03)],
                    )
                    .on_secondary(),
                ],
            },
            DocumentKind::Disclaimer => FieldMap {
                name: "disclaimer".into(),
                page_base: PageBase::OneBased,
                baseline_pages: 2,
                validated_primary_pages: vec![2],
                fields: vec![
                    field(
                        "disclaimer_acknowledged",
                        FieldType::Checkbox,
                        "Customer",
                        vec![area(1, 0.10, 0.80, 0.03, 0.02)],
                    ),
                    field(
                        "customer_signature",
                        FieldType::Signature,
                        "Customer",
                        vec![area(2, 0.12, 0.72, 0.32, 0.06)],
                    ),
                    field(
                        "customer_name",
                        FieldType::Text,
                        "Customer",
                        vec![area(2, 0.12, 0.80, 0.40, 0.03)],
                    )
                    .optional(),
                ],
            },
            DocumentKind::BookingConfirmation => FieldMap {
                name: "booking_confirmation".into(),
                page_base: PageBase::OneBased,
                baseline_pages: 1,
                validated_primary_pages: vec![1],
                fields: vec![field(
                    "customer_signature",
                    FieldType::Signature,
                    "Customer",
                    vec![area(1, 0.12, 0.74, 0.32, 0.06)],
                )],
            },
        }
    }
}

/// A party the vendor should collect a signature from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submitter {
    pub role: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorSubmission {
    pub template_id: String,
    pub submission_id: String,
    #[serde(default)]
    pub signing_urls: Vec<String>,
}

/// External e-signature service. Implementations own the transport and are shared between
/// request threads.
pub trait SigningVendor: Send + Sync {
    /// A fresh access token.
    fn authenticate(&self) -> Result<String>;

    /// Upload `document` with its field layout; returns the template id.
    fn create_template(
        &self,
        token: &str,
        name: &str,
        document: &Path,
        fields: &[VendorField],
    ) -> Result<String>;

    fn create_submission(
        &self,
        token: &str,
        template_id: &str,
        submitters: &[Submitter],
    ) -> Result<VendorSubmission>;
}

/// Signature drawn locally when no vendor is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSignature {
    pub signed_by: String,
    /// Field role whose signature areas receive the image
    pub role: String,
    pub signature_payload: String,
    pub footprint: DigitalFootprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRequest {
    pub opportunity_id: String,
    pub kind: DocumentKind,
    pub primary_pdf: PathBuf,
    #[serde(default)]
    pub secondary_pdf: Option<PathBuf>,
    #[serde(default)]
    pub submitters: Vec<Submitter>,
    #[serde(default)]
    pub local_signature: Option<LocalSignature>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreparedPackage {
    pub correlation_id: String,
    pub opportunity_id: String,
    pub kind: DocumentKind,
    pub primary_pages: u32,
    pub total_pages: u32,
    /// Whether the field map has been checked against this primary page count
    pub validated_layout: bool,
    pub page_base: PageBase,
    pub fields: Vec<SignatureField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission: Option<VendorSubmission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed: Option<SignOutcome>,
}

impl PreparedPackage {
    /// One-line outcome, flagging a primary page count the field map was not checked against.
    pub fn summary(&self) -> String {
        if self.validated_layout {
            format!("{} package prepared", self.kind.as_str())
        } else {
            format!(
                "{} package prepared with unvalidated page count {}",
                self.kind.as_str(),
                self.primary_pages
            )
        }
    }
}

/// Structured result handed across the workflow boundary instead of an error.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> OperationResult<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(err: &Error) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            error: Some(err.code().to_string()),
            data: None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        OperationResult {
            success: self.success,
            message: self.message,
            error: self.error,
            data: self.data.map(f),
        }
    }
}

const VENDOR_TOKEN_KEY: &str = "vendor";

pub struct SigningWorkflow {
    config: PipelineConfig,
    signer: DigitalSignatureService,
    vendor: Option<Box<dyn SigningVendor>>,
    tokens: Mutex<TtlCache<String, String>>,
    in_flight: InFlightRegistry,
}

impl SigningWorkflow {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: PipelineConfig, store: Box<dyn MetadataStore>) -> Self {
        let tokens = TtlCache::new(
            Duration::from_secs(config.token_ttl_secs),
            config.token_cache_capacity,
        );
        Self {
            signer: DigitalSignatureService::new(store, &config),
            config,
            vendor: None,
            tokens: Mutex::new(tokens),
            in_flight: InFlightRegistry::new(),
        }
    }

    pub fn with_vendor(mut self, vendor: Box<dyn SigningVendor>) -> Self {
        self.vendor = Some(vendor);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn signer(&self) -> &DigitalSignatureService {
        &self.signer
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    fn vendor_token(&self, vendor: &dyn SigningVendor) -> Result<String> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        tokens.get_or_try_insert_with(VENDOR_TOKEN_KEY.to_string(), || vendor.authenticate())
    }

    fn forget_vendor_token(&self) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        tokens.remove(&VENDOR_TOKEN_KEY.to_string());
    }

    /// Merge, correct the field map, then submit to the vendor or sign locally.
    ///
    /// The merged intermediate file is removed before this returns, whatever the outcome.
    pub fn prepare_package(&self, request: &PackageRequest) -> Result<PreparedPackage> {
        let correlation_id = Uuid::new_v4().to_string();
        let key = format!("{}:{}", request.opportunity_id, request.kind.as_str());
        let guard = self.in_flight.try_acquire(&key)?;
        log::info!("[{}] preparing {} package", correlation_id, guard.key());

        let map = request.kind.field_map();
        let primary = pdf::read_source(&request.primary_pdf)?;
        let primary_pages = pdf::page_count(&primary)?;
        log::debug!("[{}] primary document has {} pages", correlation_id, primary_pages);

        let needs_secondary = map.fields.iter().any(|f| f.anchor == FieldAnchor::Secondary);
        let merged = match (&request.secondary_pdf, needs_secondary) {
            (Some(path), _) => {
                let secondary = pdf::read_source(path)?;
                pdf::merge(&primary, &secondary)?
            }
            (None, true) => {
                return Err(Error::SourceNotFound(format!(
                    "{} package requires a {} document",
                    request.kind.as_str(),
                    request
                        .kind
                        .secondary()
                        .map(DocumentKind::as_str)
                        .unwrap_or("secondary")
                )))
            }
            (None, false) => primary,
        };
        let total_pages = pdf::page_count(&merged)?;
        log::debug!("[{}] merged package has {} pages", correlation_id, total_pages);

        let validated_layout = map.is_validated_for(primary_pages);
        let fields = map.resolve(primary_pages, total_pages)?;

        let prefix = format!("{}_{}_", request.kind.as_str(), file_safe(&request.opportunity_id));
        let temp = TempPdf::write(&self.config.temp_dir, &prefix, &merged)?;

        let mut package = PreparedPackage {
            correlation_id: correlation_id.clone(),
            opportunity_id: request.opportunity_id.clone(),
            kind: request.kind,
            primary_pages,
            total_pages,
            validated_layout,
            page_base: map.page_base,
            fields,
            submission: None,
            signed: None,
        };

        if let Some(vendor) = &self.vendor {
            let vendor_fields =
                to_vendor_fields(&package.fields, map.page_base, self.config.vendor_page_base)?;
            let submission = self.submit(vendor.as_ref(), request, temp.path(), &vendor_fields)?;
            package.submission = Some(submission);
            log::info!("[{}] submitted to signing vendor", correlation_id);
        } else if let Some(local) = &request.local_signature {
            let sign_request = self.local_sign_request(request, local, &temp, &merged, &package)?;
            package.signed = Some(self.signer.sign(&sign_request)?);
            log::info!("[{}] signed locally", correlation_id);
        } else {
            log::debug!("[{}] no vendor or local signature; fields prepared only", correlation_id);
        }
        Ok(package)
    }

    fn submit(
        &self,
        vendor: &dyn SigningVendor,
        request: &PackageRequest,
        document: &Path,
        fields: &[VendorField],
    ) -> Result<VendorSubmission> {
        let token = self.vendor_token(vendor)?;
        let name = format!("{} {}", request.kind.as_str(), request.opportunity_id);
        let outcome = vendor
            .create_template(&token, &name, document, fields)
            .and_then(|template_id| {
                vendor.create_submission(&token, &template_id, &request.submitters)
            });
        if outcome.is_err() {
            self.forget_vendor_token();
        }
        outcome
    }

    fn local_sign_request(
        &self,
        request: &PackageRequest,
        local: &LocalSignature,
        temp: &TempPdf,
        merged: &[u8],
        package: &PreparedPackage,
    ) -> Result<SignRequest> {
        let doc = pdf::load_document(merged)?;
        let role = if local.role.is_empty() { "Customer" } else { local.role.as_str() };
        let mut target_pages = Vec::new();
        let mut anchors = HashMap::new();
        for field in package
            .fields
            .iter()
            .filter(|f| f.field_type == FieldType::Signature && f.role == role)
        {
            for area in &field.areas {
                let index = package.page_base.to_index(area.page).ok_or(Error::PageIndexOutOfRange {
                    field: field.name.clone(),
                    page: area.page as i64,
                    page_count: package.total_pages,
                })?;
                if anchors.contains_key(&index) {
                    continue;
                }
                let page_id = pdf::page_id(&doc, index)?;
                let (page_w, page_h) = pdf::page_dimensions(&doc, page_id)?;
                let (x, y, _, _) = area.to_pdf_rect(page_w, page_h);
                anchors.insert(index, Anchor::new(x, y));
                target_pages.push(index);
            }
        }
        let output_dir = self.config.output_dir.clone().unwrap_or_else(|| {
            request
                .primary_pdf
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.config.temp_dir.clone())
        });
        Ok(SignRequest {
            pdf_path: temp.path().to_path_buf(),
            opportunity_id: request.opportunity_id.clone(),
            signed_by: local.signed_by.clone(),
            signature_payload: local.signature_payload.clone(),
            footprint: local.footprint.clone(),
            target_pages,
            anchors,
            output_dir: Some(output_dir),
            output_stem: Some(format!(
                "{}_{}",
                request.kind.as_str(),
                file_safe(&request.opportunity_id)
            )),
        })
    }

    pub fn run(&self, request: &PackageRequest) -> OperationResult<PreparedPackage> {
        match self.prepare_package(request) {
            Ok(package) => OperationResult::ok(package.summary(), package),
            Err(e) => {
                log::error!(
                    "{} package for {} failed: {}",
                    request.kind.as_str(),
                    request.opportunity_id,
                    e
                );
                OperationResult::failure(&e)
            }
        }
    }

    /// One result per request, in order. A failure never stops the remaining requests.
    pub fn process_batch(
        &self,
        requests: &[PackageRequest],
    ) -> Vec<OperationResult<PreparedPackage>> {
        let results: Vec<_> = requests.iter().map(|r| self.run(r)).collect();
        let failed = results.iter().filter(|r| !r.success).count();
        log::info!("Processed {} package(s), {} failed", results.len(), failed);
        results
    }
}

fn file_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Convenience wrapper around [`process_batch`](SigningWorkflow::process_batch).
pub fn process_batch(
    workflow: &SigningWorkflow,
    requests: &[PackageRequest],
) -> Vec<OperationResult<PreparedPackage>> {
    workflow.process_batch(requests)
}
