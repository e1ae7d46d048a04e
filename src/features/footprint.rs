//! Digital footprint records, verification hashes and signature ids.
//!
//! The footprint is captured client-side and accepted as given. It is hashed together with the
//! signature payload and the signing time so that a stored record can be checked for loss or
//! alteration, but nothing here proves that the biometrics are genuine.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rand::distributions::Uniform;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{digest::Digest, Sha256};

use crate::error::Result;

/// Leading characters of the signature payload that enter the verification hash.
pub const HASHED_PAYLOAD_CHARS: usize = 100;

const ID_RANDOM_LEN: usize = 9;
const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub platform: String,
    pub user_agent: String,
    pub screen_resolution: String,
    pub timezone: String,
    pub language: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Stroke telemetry recorded while the signature was drawn. Times are Unix milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignatureTelemetry {
    pub total_points: u32,
    pub duration_ms: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub pressure_points: Vec<f64>,
    pub velocity_points: Vec<f64>,
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityInfo {
    pub hash: String,
    pub timestamp: i64,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DigitalFootprint {
    pub device_info: DeviceInfo,
    pub signature_data: SignatureTelemetry,
    pub security: SecurityInfo,
}

impl DigitalFootprint {
    /// Internal inconsistencies in the client-supplied telemetry.
    ///
    /// These are reported, never rejected: the footprint stays trusted input.
    pub fn consistency_warnings(&self) -> Vec<String> {
        let data = &self.signature_data;
        let mut warnings = Vec::new();
        if data.end_time < data.start_time {
            warnings.push(format!(
                "endTime {} precedes startTime {}",
                data.end_time, data.start_time
            ));
        } else if data.start_time != 0 || data.end_time != 0 {
            let span = data.end_time.abs_diff(data.start_time);
            if span.abs_diff(data.duration_ms) > 1000 {
                warnings.push(format!(
                    "durationMs {} disagrees with time span {}",
                    data.duration_ms, span
                ));
            }
        }
        if data.bounding_box.width() < 0.0 || data.bounding_box.height() < 0.0 {
            warnings.push("bounding box has negative extent".to_string());
        }
        if (data.pressure_points.len() as u32) > data.total_points && data.total_points > 0 {
            warnings.push(format!(
                "{} pressure samples for {} points",
                data.pressure_points.len(),
                data.total_points
            ));
        }
        if self.security.session_id.is_empty() {
            warnings.push("missing sessionId".to_string());
        }
        warnings
    }
}

/// Where the signature image landed, in PDF points with a top-left origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePosition {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    /// 0-based page index
    pub page: u32,
}

/// Immutable audit record written once per signing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureMetadata {
    pub signature_id: String,
    pub opportunity_id: String,
    pub signed_by: String,
    pub signed_at: DateTime<Utc>,
    pub digital_footprint: DigitalFootprint,
    pub pdf_path: String,
    pub signature_position: SignaturePosition,
    pub verification_hash: String,
}

impl SignatureMetadata {
    /// Build a record, computing its verification hash. `signed_at` is truncated to
    /// milliseconds so the stored timestamp matches the hashed one.
    pub fn create(
        signature_id: String,
        opportunity_id: &str,
        signed_by: &str,
        signed_at: DateTime<Utc>,
        footprint: DigitalFootprint,
        signature_payload: &str,
        pdf_path: &str,
        position: SignaturePosition,
    ) -> Result<Self> {
        let signed_at = signed_at.trunc_subsecs(3);
        let verification_hash =
            compute_verification_hash(&footprint, signature_payload, signed_at)?;
        Ok(Self {
            signature_id,
            opportunity_id: opportunity_id.to_string(),
            signed_by: signed_by.to_string(),
            signed_at,
            digital_footprint: footprint,
            pdf_path: pdf_path.to_string(),
            signature_position: position,
            verification_hash,
        })
    }

    pub fn signed_at_iso(&self) -> String {
        iso_millis(self.signed_at)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashInput<'a> {
    footprint: &'a DigitalFootprint,
    signature_data: &'a str,
    signed_at: String,
}

pub fn iso_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn payload_prefix(payload: &str) -> &str {
    match payload.char_indices().nth(HASHED_PAYLOAD_CHARS) {
        Some((end, _)) => &payload[..end],
        None => payload,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 over the JSON of `{footprint, signatureData, signedAt}`, where `signatureData`
/// is the first 100 characters of the payload and `signedAt` is ISO-8601 with milliseconds.
pub fn compute_verification_hash(
    footprint: &DigitalFootprint,
    signature_payload: &str,
    signed_at: DateTime<Utc>,
) -> Result<String> {
    let input = HashInput {
        footprint,
        signature_data: payload_prefix(signature_payload),
        signed_at: iso_millis(signed_at),
    };
    let canonical = serde_json::to_vec(&input)?;
    Ok(sha256_hex(&canonical))
}

static LAST_ID_MILLIS: AtomicI64 = AtomicI64::new(0);

fn next_id_millis() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_ID_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        let swapped =
            LAST_ID_MILLIS.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed);
        match swapped {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// `sig_<unix millis>_<9 lowercase alphanumerics>`; the millisecond part never repeats or goes
/// backwards within a process.
pub fn generate_signature_id() -> String {
    let millis = next_id_millis();
    let suffix: String = thread_rng()
        .sample_iter(Uniform::new(0, ID_CHARSET.len()))
        .take(ID_RANDOM_LEN)
        .map(|i| ID_CHARSET[i] as char)
        .collect();
    format!("sig_{millis}_{suffix}")
}

/// Millisecond component of a generated id.
pub fn signature_id_millis(id: &str) -> Option<i64> {
    let mut parts = id.splitn(3, '_');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("sig"), Some(millis), Some(_)) => millis.parse().ok(),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::sample_footprint;
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn hash_is_deterministic_lowercase_hex() {
        let fp = sample_footprint();
        let a = compute_verification_hash(&fp, "data:image/png;base64,AAAA", at()).unwrap();
        let b = compute_verification_hash(&fp, "data:image/png;base64,AAAA", at()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_changes_with_payload_footprint_and_time() {
        let fp = sample_footprint();
        let base = compute_verification_hash(&fp, "payload-A", at()).unwrap();
        assert_ne!(base, compute_verification_hash(&fp, "payload-B", at()).unwrap());

        let mut other = fp.clone();
        other.security.session_id = "sess-43".into();
        assert_ne!(base, compute_verification_hash(&other, "payload-A", at()).unwrap());

        let later = at() + chrono::Duration::milliseconds(1);
        assert_ne!(base, compute_verification_hash(&fp, "payload-A", later).unwrap());
    }

    #[test]
    fn only_first_hundred_payload_chars_are_hashed() {
        let fp = sample_footprint();
        let prefix = "x".repeat(100);
        let a = compute_verification_hash(&fp, &format!("{prefix}AAAA"), at()).unwrap();
        let b = compute_verification_hash(&fp, &format!("{prefix}BBBB"), at()).unwrap();
        assert_eq!(a, b);
        assert_eq!(payload_prefix("äöü"), "äöü");
        assert_eq!(payload_prefix(&"é".repeat(150)).chars().count(), 100);
    }

    #[test]
    fn signed_at_is_hashed_as_iso_millis() {
        assert_eq!(iso_millis(at()), "2024-03-01T09:30:00.000Z");
    }

    #[test]
    fn create_truncates_to_millis_and_hashes() {
        let precise = at() + chrono::Duration::nanoseconds(1_234_567);
        let meta = SignatureMetadata::create(
            generate_signature_id(),
            "opp-1",
            "Jane Doe",
            precise,
            sample_footprint(),
            "payload",
            "/tmp/a_signed.pdf",
            SignaturePosition::default(),
        )
        .unwrap();
        assert_eq!(meta.signed_at_iso(), "2024-03-01T09:30:00.001Z");
        assert_eq!(
            meta.verification_hash,
            compute_verification_hash(&meta.digital_footprint, "payload", meta.signed_at).unwrap()
        );
    }

    #[test]
    fn metadata_serializes_camel_case() {
        let meta = SignatureMetadata::create(
            "sig_1_abcdefghi".into(),
            "opp-1",
            "Jane Doe",
            at(),
            sample_footprint(),
            "payload",
            "/tmp/a.pdf",
            SignaturePosition { x: 1.0, y: 2.0, w: 80.0, h: 40.0, page: 23 },
        )
        .unwrap();
        let json = serde_json::to_value(&meta).unwrap();
        for key in [
            "signatureId",
            "opportunityId",
            "signedBy",
            "signedAt",
            "digitalFootprint",
            "pdfPath",
            "signaturePosition",
            "verificationHash",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json["digitalFootprint"]["signatureData"]["boundingBox"]["minX"].is_number());
        let back: SignatureMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn partial_client_footprint_deserializes() {
        let raw = r#"{"deviceInfo":{"platform":"iPad"},"security":{"sessionId":"s"}}"#;
        let fp: DigitalFootprint = serde_json::from_str(raw).unwrap();
        assert_eq!(fp.device_info.platform, "iPad");
        assert_eq!(fp.signature_data.total_points, 0);
    }

    #[test]
    fn consistency_warnings_flag_but_do_not_reject() {
        assert!(sample_footprint().consistency_warnings().is_empty());
        let mut fp = sample_footprint();
        fp.signature_data.end_time = fp.signature_data.start_time - 1;
        fp.security.session_id.clear();
        assert_eq!(fp.consistency_warnings().len(), 2);
    }

    #[test]
    fn extreme_client_timestamps_are_warned_about() {
        let mut fp = sample_footprint();
        fp.signature_data.start_time = -5_000_000_000_000_000_000;
        fp.signature_data.end_time = 5_000_000_000_000_000_000;
        let warnings = fp.consistency_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("10000000000000000000"));

        fp.signature_data.start_time = i64::MIN;
        fp.signature_data.end_time = i64::MAX;
        assert_eq!(fp.consistency_warnings().len(), 1);
    }

    #[test]
    fn ids_are_unique_monotonic_and_well_formed() {
        let ids: Vec<String> = (0..500).map(|_| generate_signature_id()).collect();
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());

        let millis: Vec<i64> = ids.iter().map(|id| signature_id_millis(id).unwrap()).collect();
        assert!(millis.windows(2).all(|w| w[0] < w[1]));

        for id in &ids {
            let suffix = id.rsplit('_').next().unwrap();
            assert_eq!(suffix.len(), 9);
            assert!(suffix.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    proptest! {
        #[test]
        fn any_byte_change_in_hashed_payload_changes_hash(
            payload in "[a-zA-Z0-9+/=]{1,100}",
            index in 0usize..100,
        ) {
            let index = index % payload.len();
            let mut bytes = payload.clone().into_bytes();
            bytes[index] = if bytes[index] == b'a' { b'b' } else { b'a' };
            let changed = String::from_utf8(bytes).unwrap();
            let fp = sample_footprint();
            prop_assert_ne!(
                compute_verification_hash(&fp, &payload, at()).unwrap(),
                compute_verification_hash(&fp, &changed, at()).unwrap()
            );
        }
    }
}
