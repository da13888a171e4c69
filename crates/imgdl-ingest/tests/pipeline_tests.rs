//! End-to-end ingestion runs against a mock image host
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use common::*;
use futures::stream::{self, StreamExt};
use imgdl_common::types::escape_url;
use imgdl_common::{ContentHash, ImgdlError, SourceRecord};
use imgdl_ingest::source::{RecordReader, RecordStream};
use imgdl_ingest::Pipeline;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve_png(server: &MockServer, route: &str, width: u32, height: u32) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_image(width, height)))
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_matching_row_becomes_one_record() {
    let server = MockServer::start().await;
    serve_png(&server, "/cat.jpg", 300, 300).await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    let url = format!("{}/cat.jpg", server.uri());
    write_input(
        &input,
        &[
            InputRow::new(&url, "a \"cat\" sleeping", 300, 300),
            InputRow::new(format!("{}/dog.jpg", server.uri()), "a dog", 300, 300),
        ],
    );

    let mut config = test_config(dir.path(), vec![input.clone()]);
    config.keywords = vec!["cat".to_string()];
    let summary = Pipeline::new(config).unwrap().run().await.unwrap();

    assert_eq!(summary.items_seen, 1);
    assert_eq!(summary.records_written, 1);
    assert_eq!(summary.files_completed, 1);
    assert!(summary.admission.is_balanced());

    let output = summary.output.clone().unwrap();
    let (rows, _) = read_output(&output);
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!((row.width, row.height), (128, 128));
    assert_eq!((row.original_width, row.original_height), (300, 300));
    assert_eq!(row.content_hash.len(), 32);
    assert_eq!(row.content_hash, ContentHash::of(&row.image_bytes).as_str());
    assert_eq!(row.byte_size as usize, row.image_bytes.len());
    assert_eq!(&row.image_bytes[..2], &[0xFF, 0xD8]);
    assert_eq!(row.source_url, escape_url(&url));
    assert_eq!(row.caption, "a cat sleeping");
    assert_eq!(row.license_tag, "?");

    let done = checkpoint_lines(&dir.path().join("processed.txt"));
    assert_eq!(done, vec![input.to_string_lossy().to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_small_declared_size_is_never_fetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_image(300, 300)))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[InputRow::new(format!("{}/a.png", server.uri()), "tiny", 50, 300)],
    );

    let summary = Pipeline::new(test_config(dir.path(), vec![input]))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.items_seen, 0);
    assert_eq!(summary.records_written, 0);
    assert_eq!(summary.files_completed, 1);
    let (rows, _) = read_output(&summary.output.unwrap());
    assert!(rows.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_fetch_is_retried_then_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.png"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    serve_png(&server, "/good.png", 200, 200).await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[
            InputRow::new(format!("{}/flaky.png", server.uri()), "one", 200, 200),
            InputRow::new(format!("{}/good.png", server.uri()), "two", 200, 200),
        ],
    );

    let mut config = test_config(dir.path(), vec![input.clone()]);
    config.fetch.max_retries = 2;
    let summary = Pipeline::new(config).unwrap().run().await.unwrap();

    assert_eq!(summary.items_seen, 2);
    assert_eq!(summary.records_written, 1);
    assert_eq!(summary.skipped["fetch"], 1);
    assert_eq!(summary.files_completed, 1);
    assert_eq!(checkpoint_lines(&dir.path().join("processed.txt")).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_image_smaller_than_declared_is_skipped() {
    let server = MockServer::start().await;
    serve_png(&server, "/liar.png", 64, 64).await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[InputRow::new(format!("{}/liar.png", server.uri()), "big", 1024, 1024)],
    );

    let summary = Pipeline::new(test_config(dir.path(), vec![input]))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.records_written, 0);
    assert_eq!(summary.skipped["too_small"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_robots_header_and_extension_filters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/private.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Robots-Tag", "noai, noimageai")
                .set_body_bytes(jpeg_image(200, 200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    serve_png(&server, "/anim.gif", 200, 200).await;
    serve_png(&server, "/ok.JPG", 200, 200).await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[
            InputRow::new(format!("{}/private.jpg", server.uri()), "a", 200, 200),
            InputRow::new(format!("{}/anim.gif", server.uri()), "b", 200, 200),
            InputRow::new(format!("{}/ok.JPG", server.uri()), "c", 200, 200),
        ],
    );

    let mut config = test_config(dir.path(), vec![input]);
    config.fetch.disallowed_directives = vec!["noai".to_string()];
    config.fetch.max_retries = 3;
    config.allowed_extensions = vec!["jpg".to_string(), ".png".to_string()];
    let summary = Pipeline::new(config).unwrap().run().await.unwrap();

    assert_eq!(summary.records_written, 1);
    assert_eq!(summary.skipped["disallowed"], 1);
    assert_eq!(summary.skipped["extension_not_allowed"], 1);
    let (rows, _) = read_output(&summary.output.unwrap());
    assert_eq!(rows[0].caption, "c");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_run_skips_checkpointed_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cat.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_image(200, 200)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[InputRow::new(format!("{}/cat.png", server.uri()), "cat", 200, 200)],
    );
    let config = test_config(dir.path(), vec![input]);

    let first = Pipeline::new(config.clone()).unwrap().run().await.unwrap();
    assert_eq!(first.records_written, 1);

    let second = Pipeline::new(config).unwrap().run().await.unwrap();
    assert_eq!(second.files_skipped, 1);
    assert_eq!(second.items_seen, 0);
    assert!(second.output.is_none());
    assert!(second.all_files_completed());
    assert_eq!(checkpoint_lines(&dir.path().join("processed.txt")).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resumed_run_writes_new_output_file() {
    let server = MockServer::start().await;
    serve_png(&server, "/a.png", 200, 200).await;
    serve_png(&server, "/b.png", 200, 200).await;

    let dir = TempDir::new().unwrap();
    let first_input = dir.path().join("part-0.parquet");
    let second_input = dir.path().join("part-1.parquet");
    write_input(
        &first_input,
        &[InputRow::new(format!("{}/a.png", server.uri()), "a", 200, 200)],
    );
    write_input(
        &second_input,
        &[InputRow::new(format!("{}/b.png", server.uri()), "b", 200, 200)],
    );

    let first = Pipeline::new(test_config(dir.path(), vec![first_input.clone()]))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(first.output.as_deref(), Some(dir.path().join("images.parquet").as_path()));

    let second = Pipeline::new(test_config(dir.path(), vec![first_input, second_input]))
        .unwrap()
        .run()
        .await
        .unwrap();
    let resumed = dir.path().join("images-1.parquet");
    assert_eq!(second.output.as_deref(), Some(resumed.as_path()));
    assert_eq!(second.files_skipped, 1);

    let (old_rows, _) = read_output(&dir.path().join("images.parquet"));
    let (new_rows, _) = read_output(&resumed);
    assert_eq!(old_rows[0].caption, "a");
    assert_eq!(new_rows.len(), 1);
    assert_eq!(new_rows[0].caption, "b");
    assert_eq!(checkpoint_lines(&dir.path().join("processed.txt")).len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_continue_starts_over() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_image(200, 200)))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[InputRow::new(format!("{}/a.png", server.uri()), "a", 200, 200)],
    );
    let mut config = test_config(dir.path(), vec![input]);
    Pipeline::new(config.clone()).unwrap().run().await.unwrap();

    config.no_continue = true;
    let summary = Pipeline::new(config).unwrap().run().await.unwrap();
    assert_eq!(summary.files_skipped, 0);
    assert_eq!(summary.records_written, 1);
    assert_eq!(summary.output.as_deref(), Some(dir.path().join("images.parquet").as_path()));
    assert_eq!(checkpoint_lines(&dir.path().join("processed.txt")).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreadable_input_does_not_stop_the_run() {
    let server = MockServer::start().await;
    serve_png(&server, "/a.png", 200, 200).await;

    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.parquet");
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[InputRow::new(format!("{}/a.png", server.uri()), "a", 200, 200)],
    );

    let summary = Pipeline::new(test_config(dir.path(), vec![missing, input.clone()]))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.files_completed, 1);
    assert_eq!(summary.records_written, 1);
    assert!(!summary.all_files_completed());
    assert_eq!(
        checkpoint_lines(&dir.path().join("processed.txt")),
        vec![input.to_string_lossy().to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dry_run_counts_without_fetching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[
            InputRow::new(format!("{}/a.png", server.uri()), "a cat", 300, 300),
            InputRow::new(format!("{}/b.png", server.uri()), "a cat", 100, 300),
            InputRow::new(format!("{}/c.png", server.uri()), "catalog", 300, 300),
            InputRow::new(format!("{}/d.png", server.uri()), "Cat!", 128, 128),
        ],
    );

    let mut config = test_config(dir.path(), vec![input]);
    config.keywords = vec!["cat".to_string()];
    config.dry_run = true;
    let summary = Pipeline::new(config).unwrap().run().await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.items_seen, 2);
    assert!(summary.output.is_none());
    assert!(!dir.path().join("images.parquet").exists());
    assert!(!dir.path().join("processed.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_jobs_never_exceed_workers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/img/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(png_image(160, 160))
                .set_delay(std::time::Duration::from_millis(20)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    let rows: Vec<InputRow> = (0..7)
        .map(|i| InputRow::new(format!("{}/img/{i}.png", server.uri()), "x", 160, 160))
        .collect();
    write_input(&input, &rows);

    let mut config = test_config(dir.path(), vec![input]);
    config.workers = 3;
    config.writer.flush_threshold = 3;
    let summary = Pipeline::new(config).unwrap().run().await.unwrap();

    assert_eq!(summary.admission.capacity, 3);
    assert_eq!(summary.admission.acquired, 7);
    assert!(summary.admission.is_balanced());
    assert!(summary.admission.peak_in_flight <= 3);

    let (rows, row_groups) = read_output(&summary.output.unwrap());
    assert_eq!(rows.len(), 7);
    assert_eq!(row_groups, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_config_error_keeps_previous_output() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(&input, &[InputRow::new("http://127.0.0.1:9/a.png", "a", 200, 200)]);
    let output = dir.path().join("images.parquet");
    std::fs::write(&output, b"PREVIOUS DATASET BYTES").unwrap();

    let mut config = test_config(dir.path(), vec![input]);
    config.fetch.user_agent = "bad\nagent".to_string();
    let err = Pipeline::new(config).err().unwrap();

    assert!(matches!(err, ImgdlError::Configuration(_)));
    assert_eq!(std::fs::read(&output).unwrap(), b"PREVIOUS DATASET BYTES");
    assert!(!dir.path().join("processed.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_body_is_skipped() {
    let server = MockServer::start().await;
    serve_png(&server, "/big.png", 400, 400).await;
    serve_png(&server, "/small.png", 200, 200).await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[
            InputRow::new(format!("{}/big.png", server.uri()), "big", 400, 400),
            InputRow::new(format!("{}/small.png", server.uri()), "small", 200, 200),
        ],
    );

    let mut config = test_config(dir.path(), vec![input]);
    let small_len = png_image(200, 200).len() as u64;
    assert!((png_image(400, 400).len() as u64) > small_len);
    config.fetch.max_body_bytes = small_len;
    let summary = Pipeline::new(config).unwrap().run().await.unwrap();

    assert_eq!(summary.records_written, 1);
    assert_eq!(summary.skipped["fetch"], 1);
    let (rows, _) = read_output(&summary.output.unwrap());
    assert_eq!(rows[0].caption, "small");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_checkpoint_cleared_after_complete_run() {
    let server = MockServer::start().await;
    serve_png(&server, "/a.png", 200, 200).await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[InputRow::new(format!("{}/a.png", server.uri()), "a", 200, 200)],
    );

    let mut config = test_config(dir.path(), vec![input]);
    config.clear_checkpoint_on_success = true;
    let summary = Pipeline::new(config).unwrap().run().await.unwrap();

    assert!(summary.all_files_completed());
    assert!(!dir.path().join("processed.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_run_checkpoints_nothing() {
    let server = MockServer::start().await;
    serve_png(&server, "/a.png", 200, 200).await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    write_input(
        &input,
        &[InputRow::new(format!("{}/a.png", server.uri()), "a", 200, 200)],
    );

    let mut config = test_config(dir.path(), vec![input]);
    config.clear_checkpoint_on_success = true;
    let pipeline = Pipeline::new(config).unwrap();
    pipeline.cancellation_token().cancel();
    let summary = pipeline.run().await.unwrap();

    assert!(summary.interrupted);
    assert!(!summary.all_files_completed());
    assert_eq!(summary.records_written, 0);
    assert!(summary.admission.is_balanced());
    assert!(checkpoint_lines(&dir.path().join("processed.txt")).is_empty());
    let (rows, _) = read_output(&summary.output.unwrap());
    assert!(rows.is_empty());
}

/// Yields its records, then fails
struct BrokenReader {
    records: Vec<SourceRecord>,
}

#[async_trait]
impl RecordReader for BrokenReader {
    async fn open(&self, path: &Path) -> imgdl_common::Result<RecordStream> {
        let mut items: Vec<imgdl_common::Result<SourceRecord>> =
            self.records.iter().cloned().map(Ok).collect();
        items.push(Err(ImgdlError::input_open(path, "truncated row group")));
        Ok(stream::iter(items).boxed())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_error_mid_file_leaves_file_pending() {
    let server = MockServer::start().await;
    serve_png(&server, "/a.png", 200, 200).await;

    let dir = TempDir::new().unwrap();
    let input = dir.path().join("part-0.parquet");
    let reader = BrokenReader {
        records: vec![SourceRecord::new(format!("{}/a.png", server.uri()), "a", 200, 200)],
    };

    let config = test_config(dir.path(), vec![input]);
    let summary = Pipeline::with_reader(config, Arc::new(reader))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.records_written, 1);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.files_completed, 0);
    assert!(summary.admission.is_balanced());
    assert!(checkpoint_lines(&dir.path().join("processed.txt")).is_empty());
}
