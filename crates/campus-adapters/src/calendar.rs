//! College calendar listing pages (`article.mm-calendar-event`).

use std::path::PathBuf;

use async_trait::async_trait;
use campus_core::{EventSource, RawCandidate};
use chrono::{DateTime, Utc};
use scraper::Html;
use tracing::{info, warn};

use crate::{
    absolutize, first_attr, first_text, read_source_file, selector, FetchContext, FetchError,
    FetchOutput, RawSnapshot, SourceFetcher,
};

pub const DEFAULT_ASSET_BASE: &str = "https://www.amherst.edu";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarInput {
    /// Paginated listing; pages are `?_page=0`, `?_page=1`, … until one is empty.
    Url { base_url: String, max_pages: usize },
    /// Saved pages, read in order.
    Files(Vec<PathBuf>),
}

#[derive(Debug, Clone)]
pub struct CalendarFetcher {
    source_id: String,
    input: CalendarInput,
    asset_base: String,
}

impl CalendarFetcher {
    pub fn new(source_id: impl Into<String>, input: CalendarInput) -> Self {
        Self {
            source_id: source_id.into(),
            input,
            asset_base: DEFAULT_ASSET_BASE.to_string(),
        }
    }

    pub fn with_asset_base(mut self, asset_base: impl Into<String>) -> Self {
        self.asset_base = asset_base.into();
        self
    }

    async fn fetch_pages(&self, ctx: &FetchContext) -> Result<FetchOutput, FetchError> {
        let mut output = FetchOutput::default();
        match &self.input {
            CalendarInput::Url {
                base_url,
                max_pages,
            } => {
                for page in 0..(*max_pages).max(1) {
                    let url = page_url(base_url, page);
                    let response = match ctx.http.fetch_bytes(ctx.run_id, &self.source_id, &url).await
                    {
                        Ok(response) => response,
                        Err(err) if page > 0 => {
                            warn!(source_id = %self.source_id, page, error = %err, "calendar page failed, stopping");
                            break;
                        }
                        Err(err) => return Err(err.into()),
                    };
                    let html = response.text_lossy();
                    let events =
                        parse_calendar_page(&html, &self.source_id, ctx.fetched_at, &self.asset_base)?;
                    output.snapshots.push(RawSnapshot::new("html", response.body));
                    if events.is_empty() {
                        break;
                    }
                    output.candidates.extend(events);
                }
            }
            CalendarInput::Files(paths) => {
                for path in paths {
                    let body = read_source_file(path).await?;
                    let html = String::from_utf8_lossy(&body);
                    let events =
                        parse_calendar_page(&html, &self.source_id, ctx.fetched_at, &self.asset_base)?;
                    output.snapshots.push(RawSnapshot::new("html", body.clone()));
                    if events.is_empty() {
                        break;
                    }
                    output.candidates.extend(events);
                }
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl SourceFetcher for CalendarFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> EventSource {
        EventSource::Calendar
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutput, FetchError> {
        let output = self.fetch_pages(ctx).await?;
        info!(
            source_id = %self.source_id,
            pages = output.snapshots.len(),
            events = output.candidates.len(),
            "calendar scraped"
        );
        Ok(output)
    }
}

fn page_url(base_url: &str, page: usize) -> String {
    let sep = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{sep}_page={page}")
}

/// Extracts every event article from one listing page. A captcha page yields nothing.
pub fn parse_calendar_page(
    html: &str,
    source_id: &str,
    fetched_at: DateTime<Utc>,
    asset_base: &str,
) -> Result<Vec<RawCandidate>, FetchError> {
    let document = Html::parse_document(html);
    let page_text = document.root_element().text().collect::<String>();
    if page_text.to_lowercase().contains("captcha") {
        warn!(source_id, "captcha detected on calendar page");
        return Ok(Vec::new());
    }

    let article_sel = selector("article.mm-calendar-event")?;
    let title_sel = selector("h2.mm-event-listing-title a")?;
    let start_sel = selector("h3.mm-calendar-period meta[itemprop=\"startDate\"]")?;
    let end_sel = selector("h3.mm-calendar-period meta[itemprop=\"endDate\"]")?;
    let location_sel = selector("p.mm-event-listing-location")?;
    let description_sel = selector("div.mm-event-listing-description")?;
    let image_sel = selector("img[itemprop=\"image\"]")?;

    let mut out = Vec::new();
    for article in document.select(&article_sel) {
        let mut candidate = RawCandidate::new(EventSource::Calendar, source_id, fetched_at);
        candidate.title = first_text(article, &title_sel);
        candidate.link = first_attr(article, &title_sel, "href").map(|href| absolutize(asset_base, &href));
        candidate.start = first_attr(article, &start_sel, "content");
        candidate.end = first_attr(article, &end_sel, "content");
        candidate.location = first_text(article, &location_sel);
        candidate.description = first_text(article, &description_sel);
        candidate.picture_link =
            first_attr(article, &image_sel, "data-src").map(|src| absolutize(asset_base, &src));
        candidate.external_id = candidate.link.clone();
        out.push(candidate);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PAGE: &str = r#"<html><body>
      <article class="mm-calendar-event">
        <h2 class="mm-event-listing-title"><a href="/news/events/calendar/fall-concert">Fall Concert</a></h2>
        <h3 class="mm-calendar-period">
          <meta itemprop="startDate" content="2024-10-18T18:00:00-04:00">
          <meta itemprop="endDate" content="2024-10-18T19:30:00-04:00">
          Friday, October 18, 6:00 pm
        </h3>
        <p class="mm-event-listing-location"> Buckley Recital Hall </p>
        <div class="mm-event-listing-description"><p>Orchestra and choir.</p></div>
        <img itemprop="image" data-src="/system/files/concert.jpg">
      </article>
      <article class="mm-calendar-event">
        <h2 class="mm-event-listing-title"><a href="https://www.amherst.edu/news/events/calendar/lecture">Lecture</a></h2>
        <h3 class="mm-calendar-period"><meta itemprop="startDate" content="2024-10-19T16:00:00-04:00"></h3>
      </article>
    </body></html>"#;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 18, 3, 0, 0).single().unwrap()
    }

    #[test]
    fn parses_event_articles() {
        let events =
            parse_calendar_page(PAGE, "college-calendar", fetched_at(), DEFAULT_ASSET_BASE)
                .expect("parse");
        assert_eq!(events.len(), 2);

        let concert = &events[0];
        assert_eq!(concert.source, EventSource::Calendar);
        assert_eq!(concert.title.as_deref(), Some("Fall Concert"));
        assert_eq!(
            concert.link.as_deref(),
            Some("https://www.amherst.edu/news/events/calendar/fall-concert")
        );
        assert_eq!(concert.start.as_deref(), Some("2024-10-18T18:00:00-04:00"));
        assert_eq!(concert.end.as_deref(), Some("2024-10-18T19:30:00-04:00"));
        assert_eq!(concert.location.as_deref(), Some("Buckley Recital Hall"));
        assert_eq!(concert.description.as_deref(), Some("Orchestra and choir."));
        assert_eq!(
            concert.picture_link.as_deref(),
            Some("https://www.amherst.edu/system/files/concert.jpg")
        );

        let lecture = &events[1];
        assert!(lecture.end.is_none());
        assert!(lecture.location.is_none());
        assert!(lecture.picture_link.is_none());
    }

    #[test]
    fn captcha_pages_yield_nothing() {
        let html = "<html><body><form>Please complete the CAPTCHA</form></body></html>";
        let events =
            parse_calendar_page(html, "college-calendar", fetched_at(), DEFAULT_ASSET_BASE)
                .expect("parse");
        assert!(events.is_empty());
    }

    #[test]
    fn page_urls_append_the_page_parameter() {
        assert_eq!(
            page_url("https://www.amherst.edu/news/events/calendar", 2),
            "https://www.amherst.edu/news/events/calendar?_page=2"
        );
        assert_eq!(page_url("https://x.edu/cal?view=list", 0), "https://x.edu/cal?view=list&_page=0");
    }
}
