//! Shared helpers for pipeline integration tests
//!
//! - input Parquet files in the LAION column layout
//! - in-process generated images
//! - output dataset readers
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use arrow::array::{Array, AsArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, UInt16Type, UInt32Type};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use imgdl_ingest::config::IngestConfig;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One input row
#[derive(Debug, Clone)]
pub struct InputRow {
    pub url: String,
    pub caption: String,
    pub width: i64,
    pub height: i64,
}

impl InputRow {
    pub fn new(url: impl Into<String>, caption: &str, width: i64, height: i64) -> Self {
        Self {
            url: url.into(),
            caption: caption.to_string(),
            width,
            height,
        }
    }
}

/// Write an input file with URL/TEXT/WIDTH/HEIGHT plus an unrelated column
pub fn write_input(path: &Path, rows: &[InputRow]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("URL", DataType::Utf8, true),
        Field::new("TEXT", DataType::Utf8, true),
        Field::new("WIDTH", DataType::Int64, true),
        Field::new("HEIGHT", DataType::Int64, true),
        Field::new("LICENSE", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(rows.iter().map(|r| Some(r.url.as_str())).collect::<StringArray>()),
            Arc::new(rows.iter().map(|r| Some(r.caption.as_str())).collect::<StringArray>()),
            Arc::new(rows.iter().map(|r| Some(r.width)).collect::<Int64Array>()),
            Arc::new(rows.iter().map(|r| Some(r.height)).collect::<Int64Array>()),
            Arc::new(rows.iter().map(|_| Some("?")).collect::<StringArray>()),
        ],
    )
    .unwrap();
    let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

/// Opaque PNG with a smooth gradient
pub fn png_image(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
    });
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Png)
}

/// Half-transparent PNG
pub fn translucent_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([200, 30, 30, 128]));
    encode(DynamicImage::ImageRgba8(img), ImageFormat::Png)
}

pub fn jpeg_image(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, _| Rgb([(x % 256) as u8, 120, 40]));
    encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg)
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    buf
}

/// Test configuration: everything inside `dir`, no spinner, small pool
pub fn test_config(dir: &Path, inputs: Vec<PathBuf>) -> IngestConfig {
    IngestConfig {
        inputs,
        output: dir.join("images.parquet"),
        checkpoint_path: dir.join("processed.txt"),
        workers: 4,
        progress: false,
        ..IngestConfig::default()
    }
}

/// One row of the output dataset
#[derive(Debug, Clone)]
pub struct OutputRow {
    pub content_hash: String,
    pub byte_size: u32,
    pub width: u16,
    pub height: u16,
    pub original_width: u16,
    pub original_height: u16,
    pub source_url: String,
    pub caption: String,
    pub image_bytes: Vec<u8>,
    pub license_tag: String,
}

/// Output rows and the number of row groups
pub fn read_output(path: &Path) -> (Vec<OutputRow>, usize) {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap()).unwrap();
    let row_groups = builder.metadata().num_row_groups();
    let mut rows = Vec::new();
    for batch in builder.build().unwrap() {
        let batch = batch.unwrap();
        let text = |name: &str| batch.column_by_name(name).unwrap().as_string::<i32>().clone();
        let small = |name: &str| {
            batch
                .column_by_name(name)
                .unwrap()
                .as_primitive::<UInt16Type>()
                .clone()
        };
        let hashes = text("content_hash");
        let urls = text("source_url");
        let captions = text("caption");
        let licenses = text("license_tag");
        let widths = small("width");
        let heights = small("height");
        let original_widths = small("original_width");
        let original_heights = small("original_height");
        let sizes = batch
            .column_by_name("byte_size")
            .unwrap()
            .as_primitive::<UInt32Type>()
            .clone();
        let images = batch.column_by_name("image_bytes").unwrap().as_binary::<i32>().clone();

        for i in 0..batch.num_rows() {
            assert!(!hashes.is_null(i));
            rows.push(OutputRow {
                content_hash: hashes.value(i).to_string(),
                byte_size: sizes.value(i),
                width: widths.value(i),
                height: heights.value(i),
                original_width: original_widths.value(i),
                original_height: original_heights.value(i),
                source_url: urls.value(i).to_string(),
                caption: captions.value(i).to_string(),
                image_bytes: images.value(i).to_vec(),
                license_tag: licenses.value(i).to_string(),
            });
        }
    }
    (rows, row_groups)
}

pub fn checkpoint_lines(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}
