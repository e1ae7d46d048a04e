use crate::error::{Error, Result};
use crate::features::coordinates::to_vendor_fields;
use crate::features::pdf;
use crate::features::signing::SignRequest;
use crate::features::storage::{output_dir_for, parse_file_uri_path};
use crate::features::workflow::{DocumentKind, OperationResult, PackageRequest, SigningWorkflow};

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One JSON command, e.g. `{"action": "page_count", "path": "/srv/docs/contract.pdf"}`.
#[derive(Debug, Default, Deserialize)]
pub struct Command {
    pub action: String,
    pub path: Option<String>,
    pub primary_path: Option<String>,
    pub secondary_path: Option<String>,
    pub output_path: Option<String>,
    pub kind: Option<String>,
    pub opportunity_id: Option<String>,
    pub signature_id: Option<String>,
    pub bindings: Option<HashMap<String, String>>,
    pub sign: Option<SignRequest>,
    pub package: Option<PackageRequest>,
}

#[derive(Debug)]
pub enum Action {
    PageCount {
        path: PathBuf,
    },
    Merge {
        primary: PathBuf,
        secondary: PathBuf,
        output: Option<PathBuf>,
    },
    CorrectFields {
        kind: DocumentKind,
        primary_pages: u32,
        total_pages: u32,
        vendor_format: bool,
    },
    Sign(Box<SignRequest>),
    Verify {
        path: PathBuf,
        signature_id: String,
    },
    History {
        opportunity_id: String,
    },
    PreparePackage(Box<PackageRequest>),
}

fn to_path(raw: &str) -> PathBuf {
    parse_file_uri_path(raw).unwrap_or_else(|| PathBuf::from(raw))
}

fn require(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::InvalidRequest(format!("missing_{name}")))
}

fn parse_u32_binding(bindings: &HashMap<String, String>, key: &str) -> Option<u32> {
    bindings.get(key).and_then(|v| v.trim().parse::<u32>().ok())
}

fn parse_bool_binding(bindings: &HashMap<String, String>, key: &str) -> bool {
    bindings
        .get(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn parse_kind(kind: Option<String>) -> Result<DocumentKind> {
    let raw = require(kind, "kind")?;
    DocumentKind::parse(raw.trim())
        .ok_or_else(|| Error::InvalidRequest(format!("unknown_kind:{raw}")))
}

pub fn parse_action(command: Command) -> Result<Action> {
    let Command {
        action,
        path,
        primary_path,
        secondary_path,
        output_path,
        kind,
        opportunity_id,
        signature_id,
        bindings,
        sign,
        package,
    } = command;

    let bindings = bindings.unwrap_or_default();

    match action.as_str() {
        "page_count" => Ok(Action::PageCount {
            path: to_path(&require(path, "path")?),
        }),
        "merge" => Ok(Action::Merge {
            primary: to_path(&require(primary_path, "primary_path")?),
            secondary: to_path(&require(secondary_path, "secondary_path")?),
            output: output_path.as_deref().map(to_path),
        }),
        "correct_fields" => {
            let primary_pages = parse_u32_binding(&bindings, "primary_pages")
                .ok_or_else(|| Error::InvalidRequest("missing_primary_pages".into()))?;
            let total_pages = parse_u32_binding(&bindings, "total_pages").unwrap_or(primary_pages);
            Ok(Action::CorrectFields {
                kind: parse_kind(kind)?,
                primary_pages,
                total_pages,
                vendor_format: parse_bool_binding(&bindings, "vendor_format"),
            })
        }
        "sign" => {
            let request = sign.ok_or_else(|| Error::InvalidRequest("missing_sign".into()))?;
            Ok(Action::Sign(Box::new(request)))
        }
        "verify" => Ok(Action::Verify {
            path: to_path(&require(path, "path")?),
            signature_id: require(signature_id, "signature_id")?,
        }),
        "history" => Ok(Action::History {
            opportunity_id: require(opportunity_id, "opportunity_id")?,
        }),
        "prepare_package" => {
            let request = package.ok_or_else(|| Error::InvalidRequest("missing_package".into()))?;
            Ok(Action::PreparePackage(Box::new(request)))
        }
        other => Err(Error::InvalidRequest(format!("unknown_action:{other}"))),
    }
}

fn merged_output_path(primary: &Path) -> PathBuf {
    let stem = primary
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    output_dir_for(primary.to_str()).join(format!("{stem}_merged.pdf"))
}

/// Executes commands against one workflow and answers with an [`OperationResult`].
pub struct Router {
    workflow: SigningWorkflow,
}

impl Router {
    pub fn new(workflow: SigningWorkflow) -> Self {
        Self { workflow }
    }

    pub fn workflow(&self) -> &SigningWorkflow {
        &self.workflow
    }

    pub fn dispatch(&self, command: Command) -> OperationResult<Value> {
        let action = match parse_action(command) {
            Ok(action) => action,
            Err(e) => return OperationResult::failure(&e),
        };
        log::debug!("Dispatching {:?}", action);
        match self.execute(action) {
            Ok((message, data)) => OperationResult::ok(message, data),
            Err(e) => {
                log::error!("Command failed: {}", e);
                OperationResult::failure(&e)
            }
        }
    }

    /// Parse `input` as a [`Command`] and return the serialized result.
    pub fn dispatch_json(&self, input: &str) -> String {
        let result = match serde_json::from_str::<Command>(input) {
            Ok(command) => self.dispatch(command),
            Err(e) => {
                let error = Error::InvalidRequest(format!("command_parse_failed:{e}"));
                OperationResult::failure(&error)
            }
        };
        serde_json::to_string(&result).unwrap_or_else(|e| {
            json!({
                "success": false,
                "message": format!("result_serialize_failed:{e}"),
                "error": "json_error",
            })
            .to_string()
        })
    }

    fn execute(&self, action: Action) -> Result<(String, Value)> {
        match action {
            Action::PageCount { path } => {
                let pages = pdf::page_count_at(&path)?;
                Ok((format!("{pages} pages"), json!({ "page_count": pages })))
            }
            Action::Merge {
                primary,
                secondary,
                output,
            } => {
                let primary_bytes = pdf::read_source(&primary)?;
                let merged = pdf::merge(&primary_bytes, &pdf::read_source(&secondary)?)?;
                let pages = pdf::page_count(&merged)?;
                let output = output.unwrap_or_else(|| merged_output_path(&primary));
                if let Some(parent) = output.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&output, &merged)?;
                Ok((
                    format!("merged into {pages} pages"),
                    json!({ "output_path": output, "page_count": pages }),
                ))
            }
            Action::CorrectFields {
                kind,
                primary_pages,
                total_pages,
                vendor_format,
            } => {
                let map = kind.field_map();
                let fields = map.resolve(primary_pages, total_pages)?;
                let validated = map.is_validated_for(primary_pages);
                let data = if vendor_format {
                    let base = self.workflow.config().vendor_page_base;
                    json!({
                        "validated_layout": validated,
                        "page_base": base,
                        "fields": to_vendor_fields(&fields, map.page_base, base)?,
                    })
                } else {
                    json!({
                        "validated_layout": validated,
                        "page_base": map.page_base,
                        "fields": fields,
                    })
                };
                Ok((format!("{} fields corrected", fields.len()), data))
            }
            Action::Sign(request) => {
                let outcome = self.workflow.signer().sign(&request)?;
                Ok(("signed".to_string(), json!(outcome)))
            }
            Action::Verify { path, signature_id } => {
                let report = self.workflow.signer().verify(&path, &signature_id)?;
                let message = if report.is_valid { "valid" } else { "invalid" };
                Ok((message.to_string(), json!(report)))
            }
            Action::History { opportunity_id } => {
                let records = self.workflow.signer().history(&opportunity_id)?;
                Ok((format!("{} record(s)", records.len()), json!(records)))
            }
            Action::PreparePackage(request) => {
                let package = self.workflow.prepare_package(&request)?;
                Ok((package.summary(), json!(package)))
            }
        }
    }
}
