//! Document assembly and local signing for sales packages.
//!
//! A package is a generated primary document (a contract, say) optionally followed by a
//! secondary one (the booking confirmation). The pipeline merges them, moves the authored
//! signature fields to where the pages actually ended up, and then either hands the package
//! to an external signing vendor or signs it locally: a raster signature is placed on the
//! signature pages, every page gets a provenance stamp, and an audit record binding the
//! client's digital footprint to the signing time is stored.
//!
//! ```no_run
//! use solarsign_core::{DocumentKind, PackageRequest, PipelineConfig, SigningWorkflow};
//!
//! # fn main() -> solarsign_core::Result<()> {
//! let workflow = SigningWorkflow::new(PipelineConfig::from_env()?)?;
//! let result = workflow.run(&PackageRequest {
//!     opportunity_id: "opp-1".into(),
//!     kind: DocumentKind::Contract,
//!     primary_pdf: "/srv/docs/contract.pdf".into(),
//!     secondary_pdf: Some("/srv/docs/confirmation.pdf".into()),
//!     submitters: Vec::new(),
//!     local_signature: None,
//! });
//! println!("{}", result.message);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod features;
pub mod router;

pub use config::{MetadataBackend, PipelineConfig};
pub use error::{Error, Result};
pub use features::coordinates::{
    correct_page_offsets, FieldAnchor, FieldArea, FieldMap, FieldType, PageBase, SignatureField,
};
pub use features::footprint::{DigitalFootprint, SignatureMetadata};
pub use features::metadata_store::{open_store, MetadataStore};
pub use features::pdf::{merge, page_count};
pub use features::signing::{DigitalSignatureService, SignOutcome, SignRequest, VerificationReport};
pub use features::workflow::{
    process_batch, DocumentKind, OperationResult, PackageRequest, PreparedPackage, SigningVendor,
    SigningWorkflow,
};
pub use router::{Command, Router};
