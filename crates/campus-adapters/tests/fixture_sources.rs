use std::path::{Path, PathBuf};

use campus_adapters::{
    CalendarFetcher, CalendarInput, DirectoryMailbox, EmailFetcher, FeedInput, FetchContext,
    FetchError, JsonFileExtractor, RssFetcher, SourceFetcher,
};
use campus_core::EventSource;
use campus_storage::{HttpClientConfig, HttpFetcher};
use chrono::Utc;
use uuid::Uuid;

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .canonicalize()
        .expect("fixtures root")
}

fn context() -> FetchContext {
    FetchContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
        http: HttpFetcher::new(HttpClientConfig::default()).expect("http client"),
    }
}

#[tokio::test]
async fn rss_fixture_feed_yields_every_item_and_an_xml_snapshot() {
    let fetcher = RssFetcher::new("hub-rss", FeedInput::File(fixtures_root().join("hub/events.xml")));
    let output = fetcher.fetch(&context()).await.expect("fetch");

    assert_eq!(fetcher.kind(), EventSource::Rss);
    assert_eq!(output.candidates.len(), 3);
    assert_eq!(output.snapshots.len(), 1);
    assert_eq!(output.snapshots[0].extension, "xml");

    let concert = &output.candidates[0];
    assert_eq!(concert.title.as_deref(), Some("Fall Concert"));
    assert_eq!(concert.external_id.as_deref(), Some("10540001"));
    assert_eq!(concert.categories, vec!["Music".to_string(), "Arts".to_string()]);
    assert_eq!(concert.author.as_deref(), Some("music@amherst.edu (Department of Music)"));
}

#[tokio::test]
async fn calendar_fixture_pages_stop_at_the_first_empty_page() {
    let root = fixtures_root();
    let fetcher = CalendarFetcher::new(
        "college-calendar",
        CalendarInput::Files(vec![
            root.join("calendar/page_0.html"),
            root.join("hub/events.xml"),
            root.join("calendar/page_0.html"),
        ]),
    );
    let output = fetcher.fetch(&context()).await.expect("fetch");

    // The second "page" has no event articles, so the third is never read.
    assert_eq!(output.candidates.len(), 2);
    assert_eq!(output.snapshots.len(), 2);
    assert_eq!(
        output.candidates[0].picture_link.as_deref(),
        Some("https://www.amherst.edu/system/files/styles/listing/fall-concert.jpg")
    );
}

#[tokio::test]
async fn email_fixture_runs_mailbox_then_extractor() {
    let root = fixtures_root();
    let fetcher = EmailFetcher::new(
        "daily-mammoth",
        "Daily Mammoth",
        Box::new(DirectoryMailbox::new(root.join("mailbox"))),
        Box::new(JsonFileExtractor::new(root.join("mailbox/extracted.json"))),
    );
    let output = fetcher.fetch(&context()).await.expect("fetch");

    assert_eq!(output.candidates.len(), 2);
    assert_eq!(output.snapshots[0].extension, "json");
    let concert = &output.candidates[0];
    assert_eq!(concert.source, EventSource::Email);
    assert_eq!(concert.start.as_deref(), Some("18:05:00"));
    assert_eq!(concert.published.as_deref(), Some("2024-10-18"));
    assert_eq!(concert.external_id.as_deref(), Some("daily-mammoth-2024-10-18"));
}

#[tokio::test]
async fn unmatched_subject_is_an_empty_fetch() {
    let root = fixtures_root();
    let fetcher = EmailFetcher::new(
        "daily-mammoth",
        "Weekly Digest",
        Box::new(DirectoryMailbox::new(root.join("mailbox"))),
        Box::new(JsonFileExtractor::new(root.join("mailbox/extracted.json"))),
    );
    let output = fetcher.fetch(&context()).await.expect("fetch");
    assert!(output.candidates.is_empty());
    assert!(output.snapshots.is_empty());
}

#[tokio::test]
async fn missing_fixture_is_an_io_error() {
    let fetcher = RssFetcher::new("hub-rss", FeedInput::File(fixtures_root().join("hub/missing.xml")));
    let err = fetcher.fetch(&context()).await.expect_err("missing file");
    assert!(matches!(err, FetchError::Io { .. }));
}
