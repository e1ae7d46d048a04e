// Hot paths of a signing run: merging, sizing, hashing and placement.
// Run with: cargo bench --bench signing_performance

use std::collections::HashMap;
use std::io::Cursor;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use solarsign_core::features::footprint::{compute_verification_hash, DigitalFootprint};
use solarsign_core::features::pdf;
use solarsign_core::features::placement::{
    adaptive_size, decode_signature_payload, Anchor, SignaturePlacer,
};

fn build_pdf(pages: u32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let mut kids = Vec::new();
    for n in 1..=pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(format!("Page {n}"))]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        kids.push(page_id.into());
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

fn build_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_fn(width, height, |x, y| {
        if (x + y) % 7 == 0 {
            image::Rgba([0, 0, 90, 255])
        } else {
            image::Rgba([0, 0, 0, 0])
        }
    });
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageOutputFormat::Png)
        .unwrap();
    out.into_inner()
}

fn benchmark_signing_operations(c: &mut Criterion) {
    let contract = build_pdf(24);
    let confirmation = build_pdf(1);
    c.bench_function("merge_contract_with_confirmation", |b| {
        b.iter(|| black_box(pdf::merge(&contract, &confirmation).unwrap()))
    });

    c.bench_function("adaptive_size_tiers", |b| {
        b.iter(|| {
            black_box((
                adaptive_size(black_box(30.0), black_box(10.0)),
                adaptive_size(black_box(150.0), black_box(60.0)),
                adaptive_size(black_box(900.0), black_box(300.0)),
            ))
        })
    });

    let footprint = DigitalFootprint::default();
    let payload = "data:image/png;base64,".to_string() + &"A".repeat(4096);
    let signed_at = Utc::now();
    c.bench_function("verification_hash", |b| {
        b.iter(|| black_box(compute_verification_hash(&footprint, &payload, signed_at).unwrap()))
    });

    let png = build_png(300, 120);
    c.bench_function("decode_signature_png", |b| {
        b.iter(|| black_box(decode_signature_payload(&png).unwrap()))
    });

    let image = decode_signature_payload(&png).unwrap();
    let anchors = HashMap::from([(5, Anchor::new(72.0, 600.0)), (22, Anchor::new(72.0, 580.0))]);
    c.bench_function("place_on_two_pages", |b| {
        b.iter(|| {
            let mut doc = pdf::load_document(&contract).unwrap();
            black_box(SignaturePlacer::new(&image).place(&mut doc, &[5, 22], &anchors).unwrap())
        })
    });
}

criterion_group!(benches, benchmark_signing_operations);
criterion_main!(benches);
