//! Integration tests for the full transcription pipeline.
//!
//! A scripted [`VisionProvider`] stands in for the network. Every test image
//! is a tiny file whose bytes are `page-N`; the provider decodes the base64
//! payload to learn which pages it was sent, so the tests can check batching,
//! ordering and cancellation without a real model.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_img2md::provider::{Completion, ProviderRequest};
use edgequake_img2md::{
    progress, transcribe, transcribe_stream, transcribe_to_dir, BatchLimits, ErrorKind,
    Img2MdError, ProgressReporter, ProgressStatus, TranscriptionConfig, TranscriptionConfigBuilder,
    TranscriptionRequest, VisionProvider,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

// ── Test helpers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum RefineMode {
    #[default]
    Garbage,
    Uppercase,
}

struct MockProvider {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Calls that started after `watch` was cancelled.
    late_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    delay: fn(usize) -> Duration,
    fail_page: Option<usize>,
    /// Batches containing this page get a plain-text reply.
    raw_page: Option<usize>,
    chapter_pages: Vec<usize>,
    refine: RefineMode,
    watch: Option<CancellationToken>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            late_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            delay: |_| Duration::ZERO,
            fail_page: None,
            raw_page: None,
            chapter_pages: Vec::new(),
            refine: RefineMode::default(),
            watch: None,
        }
    }
}

impl MockProvider {
    fn page_of(data: &str) -> usize {
        let bytes = STANDARD.decode(data).expect("base64");
        let label = String::from_utf8(bytes).expect("utf8");
        label.trim_start_matches("page-").parse().expect("page label")
    }

    fn page_json(&self, n: usize) -> serde_json::Value {
        if self.chapter_pages.contains(&n) {
            serde_json::json!({
                "text": format!("# Chapter {n}\n\npage-{n}"),
                "has_heading": true,
                "heading_text": format!("Chapter {n}"),
                "heading_level": 1,
                "is_chapter_start": true,
            })
        } else {
            serde_json::json!({ "text": format!("page-{n}") })
        }
    }

    fn refine_reply(&self, prompt: &str) -> String {
        match self.refine {
            RefineMode::Garbage => "I could not do that.".to_string(),
            RefineMode::Uppercase => {
                let pages: Vec<_> = prompt
                    .split("--- Page ")
                    .skip(1)
                    .map(|block| {
                        let text = block.split_once('\n').map_or("", |(_, t)| t).trim();
                        serde_json::json!({ "text": text.to_uppercase() })
                    })
                    .collect();
                serde_json::json!({ "pages": pages }).to_string()
            }
        }
    }
}

#[async_trait]
impl VisionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-vision"
    }

    fn endpoint(&self, model: &str) -> String {
        format!("POST mock://{model}")
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<Completion, Img2MdError> {
        if self.watch.as_ref().is_some_and(CancellationToken::is_cancelled) {
            self.late_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        if request.images.is_empty() {
            let text = self.refine_reply(&request.prompt);
            return Ok(Completion {
                response_bytes: text.len(),
                text,
                tokens: 100,
                status_code: 200,
            });
        }

        let pages: Vec<usize> = request.images.iter().map(|i| Self::page_of(&i.data)).collect();
        self.batch_sizes.lock().unwrap().push(pages.len());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep((self.delay)(pages[0])).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_page.is_some_and(|p| pages.contains(&p)) {
            return Err(Img2MdError::ApiStatus {
                provider: "mock".into(),
                status: 400,
                message: "bad image".into(),
            });
        }

        if self.raw_page.is_some_and(|p| pages.contains(&p)) {
            let text = "Plain transcription without any JSON.".to_string();
            return Ok(Completion {
                response_bytes: text.len(),
                text,
                tokens: 1,
                status_code: 200,
            });
        }

        let body = serde_json::json!({
            "pages": pages.iter().map(|&n| self.page_json(n)).collect::<Vec<_>>()
        });
        let text = format!("```json\n{body}\n```");
        Ok(Completion {
            response_bytes: text.len(),
            text,
            tokens: pages.len() as u64,
            status_code: 200,
        })
    }
}

fn write_pages(dir: &Path, n: usize) -> Vec<PathBuf> {
    (1..=n)
        .map(|i| {
            let path = dir.join(format!("page_{i:03}.png"));
            std::fs::write(&path, format!("page-{i}")).unwrap();
            path
        })
        .collect()
}

fn builder(mock: &Arc<MockProvider>) -> TranscriptionConfigBuilder {
    TranscriptionConfig::builder()
        .provider(Arc::clone(mock) as Arc<dyn VisionProvider>)
        .inter_batch_delay_ms(0)
        .retry_backoff(vec![Duration::from_millis(1)])
}

fn single_image_batches() -> BatchLimits {
    BatchLimits {
        max_images_per_batch: 1,
        ..Default::default()
    }
}

async fn run(
    request: &TranscriptionRequest,
    config: &TranscriptionConfig,
) -> Result<edgequake_img2md::TranscriptionOutput, Img2MdError> {
    transcribe(request, config, ProgressReporter::disabled(), CancellationToken::new()).await
}

// ── Batching and ordering ────────────────────────────────────────────────────

#[tokio::test]
async fn forty_five_pages_in_three_parallel_batches() {
    let tmp = tempfile::tempdir().unwrap();
    let request = TranscriptionRequest::new(write_pages(tmp.path(), 45), tmp.path().join("out"));
    let mock = Arc::new(MockProvider::default());
    let config = builder(&mock).build().unwrap();

    let output = run(&request, &config).await.unwrap();

    let mut sizes = mock.batch_sizes.lock().unwrap().clone();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![5, 20, 20]);
    assert_eq!(output.total_pages, 45);
    assert_eq!(output.tokens_used, 45);
    assert_eq!(output.documents.len(), 45);
    for (i, doc) in output.documents.iter().enumerate() {
        assert_eq!(doc.filename, format!("page_{:03}.md", i + 1));
        assert_eq!(doc.content, format!("page-{}\n", i + 1));
        assert_eq!(doc.page_range, (i + 1, i + 1));
    }
}

#[tokio::test]
async fn output_order_ignores_completion_order() {
    let tmp = tempfile::tempdir().unwrap();
    let mut request = TranscriptionRequest::new(write_pages(tmp.path(), 6), tmp.path());
    request.combine_pages = true;
    // Later pages finish first.
    let mock = Arc::new(MockProvider {
        delay: |page| Duration::from_millis((7 - page as u64) * 15),
        ..Default::default()
    });
    let config = builder(&mock)
        .batch_limits(single_image_batches())
        .concurrency(6)
        .build()
        .unwrap();

    let output = run(&request, &config).await.unwrap();

    assert_eq!(output.documents.len(), 1);
    let expected = (1..=6)
        .map(|i| format!("page-{i}"))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");
    assert_eq!(output.documents[0].content, format!("{expected}\n"));
    assert_eq!(output.documents[0].page_range, (1, 6));
}

#[tokio::test]
async fn in_flight_requests_respect_concurrency() {
    let tmp = tempfile::tempdir().unwrap();
    let request = TranscriptionRequest::new(write_pages(tmp.path(), 12), tmp.path());
    let mock = Arc::new(MockProvider {
        delay: |_| Duration::from_millis(20),
        ..Default::default()
    });
    let config = builder(&mock)
        .batch_limits(single_image_batches())
        .concurrency(2)
        .build()
        .unwrap();

    run(&request, &config).await.unwrap();

    assert_eq!(mock.calls.load(Ordering::SeqCst), 12);
    let peak = mock.max_in_flight.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak in-flight was {peak}");
}

#[tokio::test]
async fn small_jobs_run_sequentially() {
    let tmp = tempfile::tempdir().unwrap();
    let request = TranscriptionRequest::new(write_pages(tmp.path(), 25), tmp.path());
    let mock = Arc::new(MockProvider {
        delay: |_| Duration::from_millis(10),
        ..Default::default()
    });
    let config = builder(&mock).build().unwrap();

    let output = run(&request, &config).await.unwrap();

    assert_eq!(*mock.batch_sizes.lock().unwrap(), vec![20, 5]);
    assert_eq!(mock.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(output.total_pages, 25);
}

// ── Failure and cancellation ─────────────────────────────────────────────────

#[tokio::test]
async fn first_batch_failure_fails_the_job() {
    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("out");
    let request = TranscriptionRequest::new(write_pages(tmp.path(), 10), &out_dir);
    let mock = Arc::new(MockProvider {
        fail_page: Some(1),
        delay: |page| {
            if page == 1 {
                Duration::ZERO
            } else {
                Duration::from_millis(200)
            }
        },
        ..Default::default()
    });
    let config = builder(&mock)
        .batch_limits(single_image_batches())
        .concurrency(2)
        .build()
        .unwrap();

    let (reporter, mut rx) = progress::channel("", "");
    let err = transcribe_to_dir(&request, &config, reporter, CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        Img2MdError::BatchFailed { batch, total, source } => {
            assert_eq!((*batch, *total), (1, 10));
            assert!(matches!(**source, Img2MdError::ApiStatus { status: 400, .. }));
        }
        other => panic!("expected BatchFailed, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Transport);
    let calls = mock.calls.load(Ordering::SeqCst);
    assert!(calls < 10, "remaining batches must not be dispatched, saw {calls} calls");
    assert!(!out_dir.exists(), "nothing is written for a failed job");

    let mut last = None;
    while let Ok(update) = rx.try_recv() {
        last = Some(update.status);
    }
    assert_eq!(last, Some(ProgressStatus::Error));
}

#[tokio::test]
async fn cancellation_stops_dispatch() {
    let tmp = tempfile::tempdir().unwrap();
    let request = TranscriptionRequest::new(write_pages(tmp.path(), 10), tmp.path());
    let cancel = CancellationToken::new();
    let mock = Arc::new(MockProvider {
        delay: |_| Duration::from_millis(100),
        watch: Some(cancel.clone()),
        ..Default::default()
    });
    let config = builder(&mock)
        .batch_limits(single_image_batches())
        .concurrency(2)
        .build()
        .unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let (reporter, mut rx) = progress::channel("", "");
    let err = transcribe(&request, &config, reporter, cancel).await.unwrap_err();
    assert!(matches!(err, Img2MdError::Cancelled));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.late_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mock.calls.load(Ordering::SeqCst), 2);

    let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|u| u.status).collect();
    assert_eq!(statuses.last(), Some(&ProgressStatus::Error));
    assert!(!statuses.contains(&ProgressStatus::Assembling));
}

#[tokio::test]
async fn invalid_input_fails_before_any_call() {
    let tmp = tempfile::tempdir().unwrap();
    let mut images = write_pages(tmp.path(), 2);
    images.push(tmp.path().join("missing.png"));
    let request = TranscriptionRequest::new(images, tmp.path());
    let mock = Arc::new(MockProvider::default());
    let config = builder(&mock).build().unwrap();

    let err = run(&request, &config).await.unwrap_err();
    assert!(matches!(err, Img2MdError::FileNotFound { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unstructured_reply_is_kept_as_raw_text() {
    let tmp = tempfile::tempdir().unwrap();
    let mut request = TranscriptionRequest::new(write_pages(tmp.path(), 3), tmp.path());
    request.combine_pages = true;
    let mock = Arc::new(MockProvider {
        raw_page: Some(2),
        ..Default::default()
    });
    let config = builder(&mock).build().unwrap();

    let output = run(&request, &config).await.unwrap();

    assert_eq!(output.total_pages, 1);
    assert_eq!(output.documents[0].page_range, (1, 1));
    assert_eq!(output.documents[0].content, "Plain transcription without any JSON.\n");
}

// ── Refinement ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn refinement_rewrites_pages_and_counts_tokens() {
    let tmp = tempfile::tempdir().unwrap();
    let request = TranscriptionRequest::new(write_pages(tmp.path(), 3), tmp.path());
    let mock = Arc::new(MockProvider {
        refine: RefineMode::Uppercase,
        ..Default::default()
    });
    let config = builder(&mock).text_model("mock-text").build().unwrap();

    let output = run(&request, &config).await.unwrap();

    assert_eq!(output.tokens_used, 3 + 100);
    let contents: Vec<_> = output.documents.iter().map(|d| d.content.as_str()).collect();
    assert_eq!(contents, vec!["PAGE-1\n", "PAGE-2\n", "PAGE-3\n"]);
    assert_eq!(output.documents[2].page_range, (3, 3));
}

#[tokio::test]
async fn failed_refinement_keeps_transcription() {
    let tmp = tempfile::tempdir().unwrap();
    let request = TranscriptionRequest::new(write_pages(tmp.path(), 3), tmp.path());
    let mock = Arc::new(MockProvider {
        refine: RefineMode::Garbage,
        ..Default::default()
    });
    let config = builder(&mock).text_model("mock-text").build().unwrap();

    let output = run(&request, &config).await.unwrap();

    let contents: Vec<_> = output.documents.iter().map(|d| d.content.as_str()).collect();
    assert_eq!(contents, vec!["page-1\n", "page-2\n", "page-3\n"]);
    assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
}

// ── Assembly and output ──────────────────────────────────────────────────────

#[tokio::test]
async fn chapters_are_written_to_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("book");
    let mut request = TranscriptionRequest::new(write_pages(tmp.path(), 5), &out_dir);
    request.detect_chapters = true;
    request.combine_pages = true;
    let mock = Arc::new(MockProvider {
        chapter_pages: vec![2, 4],
        ..Default::default()
    });
    let config = builder(&mock).build().unwrap();

    let (output, paths) = transcribe_to_dir(
        &request,
        &config,
        ProgressReporter::disabled(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let names: Vec<_> = output.documents.iter().map(|d| d.filename.as_str()).collect();
    assert_eq!(names, vec!["01_chapter_2.md", "02_chapter_4.md"]);
    assert_eq!(output.documents[0].page_range, (1, 3));
    assert_eq!(output.documents[1].page_range, (4, 5));
    assert_eq!(paths, vec![out_dir.join("01_chapter_2.md"), out_dir.join("02_chapter_4.md")]);

    let first = std::fs::read_to_string(&paths[0]).unwrap();
    assert!(first.starts_with("page-1\n\n---\n\n# Chapter 2"));
}

#[tokio::test]
async fn chapter_mode_without_headings_combines() {
    let tmp = tempfile::tempdir().unwrap();
    let mut request = TranscriptionRequest::new(write_pages(tmp.path(), 3), tmp.path());
    request.detect_chapters = true;
    let mock = Arc::new(MockProvider::default());
    let config = builder(&mock).build().unwrap();

    let output = run(&request, &config).await.unwrap();

    assert_eq!(output.documents.len(), 1);
    assert_eq!(output.documents[0].filename, "document.md");
    assert_eq!(output.documents[0].title, "Document");
}

// ── Streaming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_reports_every_stage_and_ends_with_complete() {
    let tmp = tempfile::tempdir().unwrap();
    let request = TranscriptionRequest::new(write_pages(tmp.path(), 3), tmp.path());
    let mock = Arc::new(MockProvider::default());
    let config = builder(&mock).build().unwrap();

    let mut handle = transcribe_stream(request, config, CancellationToken::new());
    let mut updates = Vec::new();
    while let Some(update) = handle.updates.next().await {
        updates.push(update);
    }
    let output = handle.join().await.unwrap();
    assert_eq!(output.total_pages, 3);

    let statuses: Vec<_> = updates.iter().map(|u| u.status).collect();
    assert_eq!(statuses.first(), Some(&ProgressStatus::Validating));
    assert_eq!(statuses.last(), Some(&ProgressStatus::Complete));
    for expected in [
        ProgressStatus::Planning,
        ProgressStatus::Sending,
        ProgressStatus::Received,
        ProgressStatus::Processing,
        ProgressStatus::Assembling,
    ] {
        assert!(statuses.contains(&expected), "missing {expected:?}");
    }
    assert!(updates.iter().all(|u| u.provider == "mock" && u.model == "mock-vision"));

    let sending = updates
        .iter()
        .find(|u| u.status == ProgressStatus::Sending)
        .and_then(|u| u.request_info.clone())
        .unwrap();
    assert_eq!(sending.image_count, 3);
    assert_eq!(sending.endpoint, "POST mock://mock-vision");
}
