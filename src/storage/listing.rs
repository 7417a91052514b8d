//! Backend listing: XML parsing for both listing forms and a lazy,
//! resumable pager over [`ObjectBackend::list_page`].

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::Arc;

use crate::config::ListingMode;
use crate::storage::backend::{
    strip_etag_quotes, BackendError, ListCursor, ListPage, ListedObject, ObjectBackend,
};

// ── XML parsing ─────────────────────────────────────────────────────

#[derive(Default)]
struct RawEntry {
    key: Option<String>,
    size: Option<u64>,
    last_modified: Option<DateTime<Utc>>,
    etag: String,
    version_id: Option<String>,
    is_latest: Option<bool>,
    delete_marker: bool,
}

impl RawEntry {
    fn set(&mut self, field: &str, text: String) -> Result<(), String> {
        match field {
            "Key" => self.key = Some(text),
            "Size" => {
                let size = text
                    .parse()
                    .map_err(|_| format!("invalid Size {text:?}"))?;
                self.size = Some(size);
            }
            "LastModified" => {
                let parsed = DateTime::parse_from_rfc3339(&text)
                    .map_err(|_| format!("invalid LastModified {text:?}"))?;
                self.last_modified = Some(parsed.with_timezone(&Utc));
            }
            "ETag" => self.etag = strip_etag_quotes(&text).to_string(),
            "VersionId" => {
                if text != "null" {
                    self.version_id = Some(text);
                }
            }
            "IsLatest" => self.is_latest = Some(text == "true"),
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<ListedObject, String> {
        let key = self.key.filter(|k| !k.is_empty()).ok_or("entry without Key")?;
        let last_modified = self
            .last_modified
            .ok_or_else(|| format!("entry {key} without LastModified"))?;
        Ok(ListedObject {
            size: self.size.unwrap_or(0),
            last_modified,
            etag: self.etag,
            version_id: self.version_id,
            is_latest: self.is_latest.unwrap_or(true),
            is_delete_marker: self.delete_marker,
            key,
        })
    }
}

fn is_entry_element(name: &str) -> bool {
    matches!(name, "Contents" | "Version" | "DeleteMarker")
}

/// Parse a `ListBucketResult` (v2) or `ListVersionsResult` document.
///
/// Returns the raw entries, current or not, and the cursor for the next
/// page when the listing is truncated.
pub fn parse_listing(xml: &[u8], mode: ListingMode) -> Result<ListPage, String> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<RawEntry> = None;
    let mut entries = Vec::new();

    let mut truncated = false;
    let mut continuation_token = None;
    let mut next_key_marker = None;
    let mut next_version_id_marker = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if stack.len() == 1 && is_entry_element(&name) {
                    current = Some(RawEntry {
                        delete_marker: name == "DeleteMarker",
                        ..RawEntry::default()
                    });
                }
                stack.push(name);
            }
            Ok(Event::End(_)) => {
                let closed = stack.pop();
                if stack.len() == 1 && closed.as_deref().is_some_and(is_entry_element) {
                    if let Some(raw) = current.take() {
                        entries.push(raw.finish()?);
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| format!("bad text in listing: {e}"))?
                    .into_owned();
                match (stack.len(), current.as_mut()) {
                    (3, Some(raw)) => raw.set(&stack[2], text)?,
                    (2, _) => match stack[1].as_str() {
                        "IsTruncated" => truncated = text == "true",
                        "NextContinuationToken" => continuation_token = Some(text),
                        "NextKeyMarker" => next_key_marker = Some(text),
                        "NextVersionIdMarker" => next_version_id_marker = Some(text),
                        _ => {}
                    },
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("malformed listing XML: {e}")),
            _ => {}
        }
        buf.clear();
    }

    let next = if !truncated {
        None
    } else {
        match mode {
            ListingMode::V2 => Some(ListCursor::ContinuationToken(
                continuation_token.ok_or("truncated listing without NextContinuationToken")?,
            )),
            ListingMode::Versions => Some(ListCursor::VersionMarker {
                key_marker: next_key_marker.ok_or("truncated listing without NextKeyMarker")?,
                version_id_marker: next_version_id_marker,
            }),
        }
    };

    Ok(ListPage { entries, next })
}

// ── Pager ───────────────────────────────────────────────────────────

/// Lazy sequence of listing pages for one backend.
///
/// The pager only advances its checkpoint after a page was fetched
/// successfully, so a failed [`next_page`](Self::next_page) can simply be
/// retried and continues where the listing left off.
pub struct ListingPager {
    backend: Arc<dyn ObjectBackend>,
    checkpoint: Option<ListCursor>,
    pages_fetched: usize,
}

impl ListingPager {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self::resume(backend, ListCursor::Start)
    }

    /// Continue a listing from a previously saved cursor.
    pub fn resume(backend: Arc<dyn ObjectBackend>, checkpoint: ListCursor) -> Self {
        Self {
            backend,
            checkpoint: Some(checkpoint),
            pages_fetched: 0,
        }
    }

    /// The cursor the next call will fetch, or `None` once exhausted.
    pub fn checkpoint(&self) -> Option<&ListCursor> {
        self.checkpoint.as_ref()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Fetch the next page, or `Ok(None)` when the listing is complete.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ListedObject>>, BackendError> {
        let Some(cursor) = self.checkpoint.clone() else {
            return Ok(None);
        };
        let page = self.backend.list_page(&cursor).await?;
        if page.next.as_ref() == Some(&cursor) {
            return Err(BackendError::Protocol {
                backend: self.backend.name().to_string(),
                message: "listing cursor did not advance".to_string(),
            });
        }
        self.checkpoint = page.next;
        self.pages_fetched += 1;
        Ok(Some(page.entries))
    }
}
