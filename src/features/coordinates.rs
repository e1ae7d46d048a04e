//! Field maps: named, typed signature/text regions in normalized page coordinates, and the
//! page-offset correction applied when a generated document's length differs from the length
//! the map was authored against.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Page numbering convention of a field map or of an external API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageBase {
    /// First page is 0
    ZeroBased,
    /// First page is 1
    #[default]
    OneBased,
}

impl PageBase {
    /// Number of the first page in this convention.
    pub const fn first(self) -> u32 {
        match self {
            PageBase::ZeroBased => 0,
            PageBase::OneBased => 1,
        }
    }

    /// Last valid page number for a document with `page_count` pages.
    pub fn last(self, page_count: u32) -> Option<u32> {
        page_count.checked_sub(1).map(|p| p + self.first())
    }

    /// 0-based PDF page index for `page`, if `page` is valid in this convention.
    pub fn to_index(self, page: u32) -> Option<usize> {
        page.checked_sub(self.first()).map(|p| p as usize)
    }
}

/// Convert a page number between conventions.
pub fn convert_page(page: u32, from: PageBase, to: PageBase) -> Result<u32> {
    let index = from.to_index(page).ok_or_else(|| Error::PageIndexOutOfRange {
        field: "page_conversion".into(),
        page: page as i64,
        page_count: 0,
    })?;
    Ok(index as u32 + to.first())
}

/// Kind of input a field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Signature,
    Text,
    Date,
    Checkbox,
}

/// Which generated document a field's pages refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldAnchor {
    /// Pages counted from the start of the primary document; shifted by the page offset
    #[default]
    Primary,
    /// Pages counted within the secondary document; placed after the primary's last page
    Secondary,
}

/// One occurrence of a field on a page, in normalized (0..=1) page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldArea {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl FieldArea {
    /// Create an area, rejecting boxes that leave the unit square.
    pub fn new(page: u32, x: f64, y: f64, w: f64, h: f64) -> Result<Self> {
        let area = Self { page, x, y, w, h };
        area.validate()?;
        Ok(area)
    }

    pub fn validate(&self) -> Result<()> {
        let values = [self.x, self.y, self.w, self.h];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidFieldArea(format!(
                "non-finite coordinate on page {}",
                self.page
            )));
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !(in_unit(self.x)
            && in_unit(self.y)
            && in_unit(self.x + self.w)
            && in_unit(self.y + self.h)
            && self.w >= 0.0
            && self.h >= 0.0)
        {
            return Err(Error::InvalidFieldArea(format!(
                "box ({}, {}, {}, {}) on page {} leaves the unit square",
                self.x, self.y, self.w, self.h, self.page
            )));
        }
        Ok(())
    }

    /// Project onto a page of the given size in points: `(x, y_from_top, width, height)`.
    pub fn to_pdf_rect(&self, page_width: f64, page_height: f64) -> (f64, f64, f64, f64) {
        (
            self.x * page_width,
            self.y * page_height,
            self.w * page_width,
            self.h * page_height,
        )
    }
}

/// A named input region, possibly occurring on several pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub role: String,
    pub required: bool,
    #[serde(default)]
    pub anchor: FieldAnchor,
    pub areas: Vec<FieldArea>,
}

impl SignatureField {
    pub fn new(name: &str, field_type: FieldType, role: &str, areas: Vec<FieldArea>) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            role: role.to_string(),
            required: true,
            anchor: FieldAnchor::Primary,
            areas,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn on_secondary(mut self) -> Self {
        self.anchor = FieldAnchor::Secondary;
        self
    }
}

/// Field as sent to the external signing vendor: `{name, type, role, required, areas}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub role: String,
    pub required: bool,
    pub areas: Vec<FieldArea>,
}

/// Shift authored field pages to match the generated primary document.
///
/// Primary-anchored areas move by `actual_primary_pages - authored_baseline_pages`.
/// Secondary-anchored areas resolve to `actual_primary_pages + page`, where `page` is the
/// area's page within the secondary document; in one-based numbering the secondary's first
/// page therefore lands on `actual_primary_pages + 1` whatever the offset.
///
/// Fails with [`Error::PageIndexOutOfRange`] when a shift would produce a negative page.
pub fn correct_page_offsets(
    fields: &[SignatureField],
    authored_baseline_pages: u32,
    actual_primary_pages: u32,
) -> Result<Vec<SignatureField>> {
    let offset = actual_primary_pages as i64 - authored_baseline_pages as i64;
    fields
        .iter()
        .map(|field| {
            let mut corrected = field.clone();
            for area in corrected.areas.iter_mut() {
                let page = match field.anchor {
                    FieldAnchor::Primary => area.page as i64 + offset,
                    FieldAnchor::Secondary => actual_primary_pages as i64 + area.page as i64,
                };
                area.page = u32::try_from(page).map_err(|_| Error::PageIndexOutOfRange {
                    field: field.name.clone(),
                    page,
                    page_count: actual_primary_pages,
                })?;
            }
            Ok(corrected)
        })
        .collect()
}

/// Reject any area whose page does not exist in a document of `page_count` pages.
pub fn validate_page_range(
    fields: &[SignatureField],
    base: PageBase,
    page_count: u32,
) -> Result<()> {
    let last = base.last(page_count);
    for field in fields {
        for area in &field.areas {
            let valid = area.page >= base.first() && last.map_or(false, |l| area.page <= l);
            if !valid {
                return Err(Error::PageIndexOutOfRange {
                    field: field.name.clone(),
                    page: area.page as i64,
                    page_count,
                });
            }
        }
    }
    Ok(())
}

/// Convert fields to the vendor wire format, changing page convention explicitly.
pub fn to_vendor_fields(
    fields: &[SignatureField],
    from: PageBase,
    to: PageBase,
) -> Result<Vec<VendorField>> {
    fields
        .iter()
        .map(|field| {
            let areas = field
                .areas
                .iter()
                .map(|area| {
                    Ok(FieldArea {
                        page: convert_page(area.page, from, to).map_err(|_| {
                            Error::PageIndexOutOfRange {
                                field: field.name.clone(),
                                page: area.page as i64,
                                page_count: 0,
                            }
                        })?,
                        ..*area
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(VendorField {
                name: field.name.clone(),
                field_type: field.field_type,
                role: field.role.clone(),
                required: field.required,
                areas,
            })
        })
        .collect()
}

/// A complete field map for one business document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMap {
    pub name: String,
    pub page_base: PageBase,
    /// Primary page count the primary-anchored pages were authored against
    pub baseline_pages: u32,
    /// Primary page counts this map has been checked against
    pub validated_primary_pages: Vec<u32>,
    pub fields: Vec<SignatureField>,
}

impl FieldMap {
    /// Check area geometry, field-name uniqueness, and secondary page numbers.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(Error::InvalidFieldArea(format!(
                    "duplicate field name '{}' in map '{}'",
                    field.name, self.name
                )));
            }
            for area in &field.areas {
                area.validate()?;
                if field.anchor == FieldAnchor::Secondary && area.page < self.page_base.first() {
                    return Err(Error::PageIndexOutOfRange {
                        field: field.name.clone(),
                        page: area.page as i64,
                        page_count: 0,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn is_validated_for(&self, primary_pages: u32) -> bool {
        self.validated_primary_pages.contains(&primary_pages)
    }

    /// Corrected fields for a merged document whose primary part has `actual_primary_pages`
    /// pages and which has `total_pages` pages overall.
    pub fn resolve(
        &self,
        actual_primary_pages: u32,
        total_pages: u32,
    ) -> Result<Vec<SignatureField>> {
        self.validate()?;
        if !self.is_validated_for(actual_primary_pages) {
            log::warn!(
                "Field map '{}' was not validated for a {}-page primary document \
                 (validated: {:?}); applying offset {}",
                self.name,
                actual_primary_pages,
                self.validated_primary_pages,
                actual_primary_pages as i64 - self.baseline_pages as i64
            );
        }
        let corrected =
            correct_page_offsets(&self.fields, self.baseline_pages, actual_primary_pages)?;
        validate_page_range(&corrected, self.page_base, total_pages)?;
        Ok(corrected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn area(page: u32) -> FieldArea {
        FieldArea::new(page, 0.1, 0.8, 0.3, 0.05).unwrap()
    }

    fn customer(name: &str, field_type: FieldType, pages: &[u32]) -> SignatureField {
        let areas = pages.iter().map(|&page| area(page)).collect();
        SignatureField::new(name, field_type, "Customer", areas)
    }

    fn contract_fields() -> Vec<SignatureField> {
        vec![
            customer("customer_signature", FieldType::Signature, &[6]),
            customer("customer_date", FieldType::Date, &[6, 23]),
            customer("confirmation_signature", FieldType::Signature, &[1])
                .on_secondary(),
        ]
    }

    fn page_of(fields: &[SignatureField], name: &str) -> Vec<u32> {
        fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.areas.iter().map(|a| a.page).collect())
            .unwrap_or_default()
    }

    #[test]
    fn standard_contract_keeps_pages_and_places_confirmation_after_primary() {
        let corrected = correct_page_offsets(&contract_fields(), 23, 23).unwrap();
        assert_eq!(page_of(&corrected, "customer_signature"), vec![6]);
        assert_eq!(page_of(&corrected, "confirmation_signature"), vec![24]);
        validate_page_range(&corrected, PageBase::OneBased, 24).unwrap();
    }

    #[test]
    fn longer_contract_shifts_primary_fields_by_one() {
        let corrected = correct_page_offsets(&contract_fields(), 23, 24).unwrap();
        assert_eq!(page_of(&corrected, "customer_signature"), vec![7]);
        assert_eq!(page_of(&corrected, "customer_date"), vec![7, 24]);
        assert_eq!(page_of(&corrected, "confirmation_signature"), vec![25]);
        validate_page_range(&corrected, PageBase::OneBased, 25).unwrap();
    }

    #[test]
    fn zero_offset_leaves_primary_fields_unchanged() {
        let fields: Vec<_> = contract_fields()
            .into_iter()
            .filter(|f| f.anchor == FieldAnchor::Primary)
            .collect();
        let corrected = correct_page_offsets(&fields, 23, 23).unwrap();
        assert_eq!(corrected, fields);
    }

    #[test]
    fn negative_page_is_an_error() {
        let fields = vec![customer("early", FieldType::Text, &[1])];
        let err = correct_page_offsets(&fields, 23, 20).unwrap_err();
        assert!(matches!(err, Error::PageIndexOutOfRange { page: -2, .. }));
    }

    #[test]
    fn page_past_the_end_is_rejected_not_clamped() {
        let corrected = correct_page_offsets(&contract_fields(), 23, 24).unwrap();
        let err = validate_page_range(&corrected, PageBase::OneBased, 24).unwrap_err();
        match err {
            Error::PageIndexOutOfRange { field, page, page_count } => {
                assert_eq!(field, "confirmation_signature");
                assert_eq!(page, 25);
                assert_eq!(page_count, 24);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn zero_based_range_excludes_page_count() {
        let fields = vec![customer("last", FieldType::Signature, &[3])];
        assert!(validate_page_range(&fields, PageBase::ZeroBased, 4).is_ok());
        assert!(validate_page_range(&fields, PageBase::ZeroBased, 3).is_err());
        assert!(validate_page_range(&fields, PageBase::OneBased, 3).is_ok());
    }

    #[test]
    fn page_conversion_is_explicit_and_checked() {
        assert_eq!(convert_page(0, PageBase::ZeroBased, PageBase::OneBased).unwrap(), 1);
        assert_eq!(convert_page(24, PageBase::OneBased, PageBase::ZeroBased).unwrap(), 23);
        assert_eq!(convert_page(5, PageBase::OneBased, PageBase::OneBased).unwrap(), 5);
        assert!(convert_page(0, PageBase::OneBased, PageBase::ZeroBased).is_err());
    }

    #[test]
    fn vendor_fields_drop_anchor_and_convert_pages() {
        let vendor =
            to_vendor_fields(&contract_fields(), PageBase::OneBased, PageBase::ZeroBased).unwrap();
        assert_eq!(vendor[0].areas[0].page, 5);
        let json = serde_json::to_value(&vendor[0]).unwrap();
        assert_eq!(json["type"], "signature");
        assert!(json.get("anchor").is_none());
        assert_eq!(json["areas"][0]["page"], 5);
    }

    #[test]
    fn area_outside_unit_square_is_rejected() {
        assert!(FieldArea::new(1, 0.9, 0.5, 0.2, 0.1).is_err());
        assert!(FieldArea::new(1, -0.1, 0.5, 0.2, 0.1).is_err());
        assert!(FieldArea::new(1, 0.1, 0.5, 0.2, f64::NAN).is_err());
        assert!(FieldArea::new(1, 0.0, 0.0, 1.0, 1.0).is_ok());
    }

    #[test]
    fn field_type_typos_do_not_deserialize() {
        let bad = r#"{"name":"s","type":"signatur","role":"r","required":true,"areas":[]}"#;
        assert!(serde_json::from_str::<SignatureField>(bad).is_err());
        let good = r#"{"name":"s","type":"signature","role":"r","required":true,"areas":[]}"#;
        let field: SignatureField = serde_json::from_str(good).unwrap();
        assert_eq!(field.anchor, FieldAnchor::Primary);
    }

    #[test]
    fn map_validation_rejects_duplicate_names() {
        let map = FieldMap {
            name: "dup".into(),
            page_base: PageBase::OneBased,
            baseline_pages: 2,
            validated_primary_pages: vec![2],
            fields: vec![
                customer("a", FieldType::Text, &[1]),
                customer("a", FieldType::Date, &[2]),
            ],
        };
        assert!(matches!(map.validate(), Err(Error::InvalidFieldArea(_))));
    }

    #[test]
    fn pdf_rect_scales_by_page_size() {
        let a = FieldArea::new(1, 0.5, 0.25, 0.1, 0.1).unwrap();
        let (x, y, w, h) = a.to_pdf_rect(600.0, 800.0);
        assert_eq!((x, y, w, h), (300.0, 200.0, 60.0, 80.0));
    }

    proptest! {
        #[test]
        fn offset_is_linear(
            baseline in 1u32..60,
            actual in 1u32..60,
            page in 1u32..40,
            sec in 1u32..4,
        ) {
            let fields = vec![
                customer("p", FieldType::Signature, &[page + 60]),
                customer("s", FieldType::Signature, &[sec]).on_secondary(),
            ];
            let corrected = correct_page_offsets(&fields, baseline, actual).unwrap();
            let k = actual as i64 - baseline as i64;
            prop_assert_eq!(corrected[0].areas[0].page as i64, (page + 60) as i64 + k);
            prop_assert_eq!(corrected[1].areas[0].page, actual + sec);
        }
    }
}
