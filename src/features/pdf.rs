//! PDF object plumbing on top of lopdf: loading, page counting, page-for-page merging,
//! resource registration and content appends used by the placement and stamp renderers.

use std::collections::HashSet;
use std::path::Path;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};

use crate::error::{Error, Result};

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE_KEYS: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

/// Fallback page size (A4 portrait, points) when no MediaBox can be found.
const DEFAULT_PAGE_SIZE: (f64, f64) = (595.0, 842.0);

pub fn load_document(bytes: &[u8]) -> Result<Document> {
    if bytes.is_empty() {
        return Err(Error::SourceNotFound("empty PDF buffer".into()));
    }
    Document::load_mem(bytes).map_err(|e| Error::MalformedDocument(format!("pdf_parse_failed:{e}")))
}

pub fn load_document_from_path(path: &Path) -> Result<Document> {
    let bytes = read_source(path)?;
    load_document(&bytes)
}

/// Read an input file, mapping a missing file to [`Error::SourceNotFound`].
pub fn read_source(path: &Path) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(Error::SourceNotFound(path.display().to_string()));
    }
    Ok(std::fs::read(path)?)
}

pub fn page_count(bytes: &[u8]) -> Result<u32> {
    Ok(load_document(bytes)?.get_pages().len() as u32)
}

pub fn page_count_at(path: &Path) -> Result<u32> {
    Ok(load_document_from_path(path)?.get_pages().len() as u32)
}

/// Concatenate two PDFs: every page of `primary`, then every page of `secondary`.
pub fn merge(primary: &[u8], secondary: &[u8]) -> Result<Vec<u8>> {
    let primary = load_document(primary)?;
    let secondary = load_document(secondary)?;
    let mut merged = merge_documents(primary, secondary)?;
    save_to_bytes(&mut merged)
}

pub fn merge_documents(mut primary: Document, mut secondary: Document) -> Result<Document> {
    let start_id = primary.max_id + 1;
    secondary.renumber_objects_with(start_id);

    let secondary_page_ids: Vec<ObjectId> = secondary.page_iter().collect();

    // Pages are re-parented below, so anything they inherited must move onto the page itself.
    for page_id in &secondary_page_ids {
        flatten_inherited_attributes(&mut secondary, *page_id)?;
    }

    let tree_nodes: HashSet<ObjectId> = secondary
        .objects
        .iter()
        .filter(|(_, obj)| is_dict_of_type(obj, b"Pages") || is_dict_of_type(obj, b"Catalog"))
        .map(|(id, _)| *id)
        .collect();

    for (id, obj) in secondary.objects.into_iter() {
        if !tree_nodes.contains(&id) {
            primary.objects.insert(id, obj);
        }
    }
    if secondary.max_id > primary.max_id {
        primary.max_id = secondary.max_id;
    }

    let pages_root_id = primary
        .catalog()
        .map_err(|e| Error::MalformedDocument(format!("pdf_merge_no_catalog:{e}")))?
        .get(b"Pages")
        .and_then(|o| o.as_reference())
        .map_err(|_| Error::MalformedDocument("pdf_merge_missing_pages_root".into()))?;

    {
        let pages_dict = primary
            .get_object_mut(pages_root_id)
            .and_then(|o| o.as_dict_mut())
            .map_err(|_| Error::MalformedDocument("pdf_merge_missing_pages_dict".into()))?;
        let kids = pages_dict
            .get_mut(b"Kids")
            .and_then(|o| o.as_array_mut())
            .map_err(|_| Error::MalformedDocument("pdf_merge_missing_kids".into()))?;
        for page_id in &secondary_page_ids {
            kids.push(Object::Reference(*page_id));
        }
        let count = pages_dict
            .get(b"Count")
            .and_then(|c| c.as_i64())
            .unwrap_or(0);
        pages_dict.set("Count", count + secondary_page_ids.len() as i64);
    }

    for page_id in secondary_page_ids {
        page_dict_mut(&mut primary, page_id)?.set("Parent", pages_root_id);
    }

    log::debug!(
        "Merged documents: {} pages total",
        primary.get_pages().len()
    );
    Ok(primary)
}

pub fn save_to_bytes(doc: &mut Document) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    doc.save_to(&mut out).map_err(|e| {
        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, format!("pdf_save_failed:{e}")))
    })?;
    Ok(out)
}

/// Object id of the page at 0-based `index`.
pub fn page_id(doc: &Document, index: usize) -> Result<ObjectId> {
    let pages = doc.get_pages();
    let count = pages.len() as u32;
    pages
        .get(&(index as u32 + 1))
        .copied()
        .ok_or(Error::PageIndexOutOfRange {
            field: "page".into(),
            page: index as i64,
            page_count: count,
        })
}

pub fn page_dimensions(doc: &Document, page_id: ObjectId) -> Result<(f64, f64)> {
    let raw = match inherited_attribute(doc, page_id, b"MediaBox")? {
        Some(raw) => raw,
        None => return Ok(DEFAULT_PAGE_SIZE),
    };
    let resolved = match raw {
        Object::Reference(id) => doc.get_object(id)?.clone(),
        other => other,
    };
    Ok(media_box_size(&resolved).unwrap_or(DEFAULT_PAGE_SIZE))
}

fn media_box_size(obj: &Object) -> Option<(f64, f64)> {
    let arr = obj.as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    let llx = obj_to_f64(&arr[0])?;
    let lly = obj_to_f64(&arr[1])?;
    let urx = obj_to_f64(&arr[2])?;
    let ury = obj_to_f64(&arr[3])?;
    Some(((urx - llx).abs(), (ury - lly).abs()))
}

fn obj_to_f64(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some((*f).into()),
        _ => None,
    }
}

/// Look up `key` on the page, then on each ancestor page-tree node.
pub fn inherited_attribute(
    doc: &Document,
    page_id: ObjectId,
    key: &[u8],
) -> Result<Option<Object>> {
    let mut current = Some(page_id);
    let mut visited = HashSet::new();
    while let Some(id) = current {
        if !visited.insert(id) {
            return Err(Error::MalformedDocument(format!(
                "page tree cycle at object {} {}",
                id.0, id.1
            )));
        }
        let dict = doc
            .get_object(id)
            .and_then(|o| o.as_dict())
            .map_err(|_| Error::MalformedDocument("page_missing_dict".into()))?;
        if let Ok(value) = dict.get(key) {
            return Ok(Some(value.clone()));
        }
        current = dict.get(b"Parent").and_then(|p| p.as_reference()).ok();
    }
    Ok(None)
}

fn flatten_inherited_attributes(doc: &mut Document, page_id: ObjectId) -> Result<()> {
    let mut inherited = Vec::new();
    {
        let dict = doc
            .get_object(page_id)
            .and_then(|o| o.as_dict())
            .map_err(|_| Error::MalformedDocument("page_missing_dict".into()))?;
        for key in INHERITABLE_KEYS {
            if dict.has(key) {
                continue;
            }
            if let Some(value) = inherited_attribute(doc, page_id, key)? {
                inherited.push((key.to_vec(), value));
            }
        }
    }
    let dict = page_dict_mut(doc, page_id)?;
    for (key, value) in inherited {
        dict.set(key, value);
    }
    Ok(())
}

fn is_dict_of_type(obj: &Object, type_name: &[u8]) -> bool {
    obj.as_dict()
        .and_then(|d| d.get(b"Type"))
        .and_then(|t| t.as_name())
        .map(|name| name == type_name)
        .unwrap_or(false)
}

fn page_dict_mut(doc: &mut Document, page_id: ObjectId) -> Result<&mut Dictionary> {
    doc.get_object_mut(page_id)
        .and_then(|o| o.as_dict_mut())
        .map_err(|_| Error::MalformedDocument("page_missing_dict".into()))
}

fn resolve_dict(doc: &Document, obj: Object, what: &str) -> Result<Dictionary> {
    match obj {
        Object::Dictionary(dict) => Ok(dict),
        Object::Reference(id) => doc
            .get_object(id)
            .and_then(|o| o.as_dict())
            .map(|d| d.clone())
            .map_err(|_| Error::MalformedDocument(format!("{what}_not_a_dictionary"))),
        _ => Err(Error::MalformedDocument(format!("{what}_not_a_dictionary"))),
    }
}

/// Make `target` available to the page's content as `/<name>` under `category`
/// (`XObject`, `Font`, `ExtGState`), keeping whatever the page already references.
pub fn register_page_resource(
    doc: &mut Document,
    page_id: ObjectId,
    category: &str,
    name: &str,
    target: ObjectId,
) -> Result<()> {
    let mut resources = match inherited_attribute(doc, page_id, b"Resources")? {
        Some(obj) => resolve_dict(doc, obj, "resources")?,
        None => Dictionary::new(),
    };
    let mut entries = match resources.remove(category.as_bytes()) {
        Some(obj) => resolve_dict(doc, obj, category)?,
        None => Dictionary::new(),
    };
    entries.set(name, target);
    resources.set(category, entries);
    page_dict_mut(doc, page_id)?.set("Resources", resources);
    Ok(())
}

/// Wrap the page's existing content streams in `q … Q` so appended drawing starts from the
/// default graphics state.
pub fn isolate_page_contents(doc: &mut Document, page_id: ObjectId) -> Result<()> {
    let existing = match page_dict_mut(doc, page_id)?.get(b"Contents") {
        Ok(Object::Reference(id)) => vec![Object::Reference(*id)],
        Ok(Object::Array(arr)) => arr.clone(),
        _ => return Ok(()),
    };
    if existing.is_empty() {
        return Ok(());
    }
    let save_id = doc.add_object(Stream::new(dictionary! {}, b"q\n".to_vec()));
    let restore_id = doc.add_object(Stream::new(dictionary! {}, b"\nQ\n".to_vec()));
    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(save_id));
    contents.extend(existing);
    contents.push(Object::Reference(restore_id));
    page_dict_mut(doc, page_id)?.set("Contents", contents);
    Ok(())
}

/// Append drawing operations as a new content stream on the page.
pub fn append_operations(
    doc: &mut Document,
    page_id: ObjectId,
    operations: Vec<Operation>,
) -> Result<()> {
    let bytes = Content { operations }.encode()?;
    doc.add_page_contents(page_id, bytes)?;
    Ok(())
}

fn info_dict_id(doc: &mut Document) -> ObjectId {
    match doc.trailer.get(b"Info").and_then(|o| o.as_reference()) {
        Ok(id) => id,
        Err(_) => {
            let new_info = doc.add_object(Object::Dictionary(dictionary! {}));
            doc.trailer.set("Info", new_info);
            new_info
        }
    }
}

/// Set a text entry in the document Info dictionary, creating the dictionary if needed.
pub fn set_info_entry(doc: &mut Document, key: &str, value: &str) -> Result<()> {
    let info_id = info_dict_id(doc);
    let info_dict = doc
        .get_object_mut(info_id)
        .and_then(|o| o.as_dict_mut())
        .map_err(|_| Error::MalformedDocument("pdf_info_missing_dict".into()))?;
    info_dict.set(
        key,
        Object::String(value.as_bytes().to_vec(), StringFormat::Literal),
    );
    Ok(())
}

pub fn info_entry(doc: &Document, key: &str) -> Option<String> {
    let info_id = doc.trailer.get(b"Info").and_then(|o| o.as_reference()).ok()?;
    let dict = doc.get_object(info_id).and_then(|o| o.as_dict()).ok()?;
    match dict.get(key.as_bytes()).ok()? {
        Object::String(bytes, _) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{sample_a5_pdf, sample_pdf};
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn page_text(doc: &Document, index: usize) -> Vec<u8> {
        let id = page_id(doc, index).unwrap();
        doc.get_page_content(id).unwrap()
    }

    #[test]
    fn counts_pages() {
        assert_eq!(page_count(&sample_pdf(23, "contract")).unwrap(), 23);
    }

    #[test]
    fn empty_buffer_is_source_not_found() {
        assert!(matches!(page_count(&[]), Err(Error::SourceNotFound(_))));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = page_count(b"this is not a pdf").unwrap_err();
        assert!(matches!(err, Error::MalformedDocument(_)));
    }

    #[test]
    fn missing_path_is_source_not_found() {
        let dir = tempdir().unwrap();
        let err = page_count_at(&dir.path().join("nope.pdf")).unwrap_err();
        assert!(matches!(err, Error::SourceNotFound(_)));
    }

    #[test]
    fn contract_plus_confirmation_has_24_pages_in_order() {
        let contract = sample_pdf(23, "contract");
        let confirmation = sample_pdf(1, "confirmation");
        let merged = merge(&contract, &confirmation).unwrap();
        let doc = load_document(&merged).unwrap();
        assert_eq!(doc.get_pages().len(), 24);
        let first = String::from_utf8_lossy(&page_text(&doc, 0)).into_owned();
        let last = String::from_utf8_lossy(&page_text(&doc, 23)).into_owned();
        assert!(first.contains("contract page 1"));
        assert!(last.contains("confirmation page 1"));
    }

    #[test]
    fn merged_secondary_pages_keep_inherited_media_box() {
        let merged = merge(&sample_pdf(2, "a"), &sample_a5_pdf(1, "b")).unwrap();
        let doc = load_document(&merged).unwrap();
        let first = page_dimensions(&doc, page_id(&doc, 0).unwrap()).unwrap();
        let last = page_dimensions(&doc, page_id(&doc, 2).unwrap()).unwrap();
        assert_eq!(first, (612.0, 792.0));
        assert_eq!(last, (420.0, 595.0));
    }

    #[test]
    fn merged_document_has_single_catalog() {
        let merged = merge(&sample_pdf(1, "a"), &sample_pdf(1, "b")).unwrap();
        let doc = load_document(&merged).unwrap();
        let catalogs = doc
            .objects
            .values()
            .filter(|o| is_dict_of_type(o, b"Catalog"))
            .count();
        assert_eq!(catalogs, 1);
    }

    #[test]
    fn merge_rejects_malformed_secondary() {
        let err = merge(&sample_pdf(1, "a"), b"%PDF-broken").unwrap_err();
        assert!(matches!(err, Error::MalformedDocument(_)));
    }

    #[test]
    fn page_index_past_end_is_out_of_range() {
        let doc = load_document(&sample_pdf(2, "a")).unwrap();
        assert!(page_id(&doc, 1).is_ok());
        assert!(matches!(
            page_id(&doc, 2),
            Err(Error::PageIndexOutOfRange { page: 2, page_count: 2, .. })
        ));
    }

    #[test]
    fn registering_a_resource_keeps_inherited_fonts() {
        let mut doc = load_document(&sample_pdf(1, "a")).unwrap();
        let page = page_id(&doc, 0).unwrap();
        let image = doc.add_object(dictionary! { "Type" => "XObject" });
        register_page_resource(&mut doc, page, "XObject", "ImSig", image).unwrap();

        let resources = resolve_dict(
            &doc,
            inherited_attribute(&doc, page, b"Resources").unwrap().unwrap(),
            "resources",
        )
        .unwrap();
        assert!(resources.get(b"Font").unwrap().as_dict().unwrap().has(b"F1"));
        assert_eq!(
            resources
                .get(b"XObject")
                .unwrap()
                .as_dict()
                .unwrap()
                .get(b"ImSig")
                .unwrap()
                .as_reference()
                .unwrap(),
            image
        );
    }

    #[test]
    fn isolating_contents_brackets_existing_streams() {
        let mut doc = load_document(&sample_pdf(1, "a")).unwrap();
        let page = page_id(&doc, 0).unwrap();
        isolate_page_contents(&mut doc, page).unwrap();
        let content = String::from_utf8_lossy(&doc.get_page_content(page).unwrap()).into_owned();
        assert!(content.trim_start().starts_with('q'));
        assert!(content.trim_end().ends_with('Q'));
        assert!(content.contains("a page 1"));
    }

    #[test]
    fn info_entries_round_trip() {
        let mut doc = load_document(&sample_pdf(1, "a")).unwrap();
        assert_eq!(info_entry(&doc, "SolarSignStamp"), None);
        set_info_entry(&mut doc, "SolarSignStamp", "sig_1_abc").unwrap();
        let bytes = save_to_bytes(&mut doc).unwrap();
        let reloaded = load_document(&bytes).unwrap();
        assert_eq!(info_entry(&reloaded, "SolarSignStamp").as_deref(), Some("sig_1_abc"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn merge_preserves_count_and_order(m in 1u32..6, n in 1u32..6) {
            let a = sample_pdf(m, "alpha");
            let b = sample_pdf(n, "beta");
            let doc_a = load_document(&a).unwrap();
            let doc_b = load_document(&b).unwrap();
            let merged = load_document(&merge(&a, &b).unwrap()).unwrap();
            prop_assert_eq!(merged.get_pages().len() as u32, m + n);
            for i in 0..(m + n) as usize {
                let expected = if i < m as usize {
                    page_text(&doc_a, i)
                } else {
                    page_text(&doc_b, i - m as usize)
                };
                prop_assert_eq!(page_text(&merged, i), expected);
            }
        }
    }
}
