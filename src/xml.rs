//! S3 XML response rendering.
//!
//! Client-facing responses (errors and the aggregated bucket listing) are
//! XML-encoded with `quick-xml`.  Parsing of backend listings lives in
//! [`crate::storage::listing`].

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

type XmlWriter = Writer<Cursor<Vec<u8>>>;

// ── Error response ──────────────────────────────────────────────────

/// Render an S3 `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>NoSuchKey</Code>
///   <Message>The resource you requested does not exist</Message>
///   <Resource>photos/cat.jpg</Resource>
///   <RequestId>4F2A9C01D3E5B768</RequestId>
/// </Error>
/// ```
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut writer = begin_document();
    write_simple_element_group(
        &mut writer,
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    finish_document(writer)
}

// ── ListBucketResult ────────────────────────────────────────────────

/// A single `<Contents>` row of the aggregated listing.
pub struct ObjectEntry<'a> {
    pub key: &'a str,
    pub last_modified: &'a str,
    /// Unquoted entity tag; quotes are added on output.
    pub etag: &'a str,
    pub size: u64,
}

/// Paging state of one `<ListBucketResult>`.
///
/// `marker`/`next_marker` are written for ListObjects (v1) requests and the
/// continuation tokens for ListObjectsV2 requests.
#[derive(Debug, Default)]
pub struct ListingPage<'a> {
    pub max_keys: u32,
    pub is_truncated: bool,
    pub marker: Option<&'a str>,
    pub next_marker: Option<&'a str>,
    pub continuation_token: Option<&'a str>,
    pub next_continuation_token: Option<&'a str>,
}

/// Render `<ListBucketResult>` for the virtual bucket.
///
/// Rows are written in the order given; the caller is responsible for
/// ordering and for slicing out the page.
pub fn render_list_bucket_result(
    bucket: &str,
    prefix: &str,
    delimiter: &str,
    page: &ListingPage<'_>,
    entries: &[ObjectEntry<'_>],
    common_prefixes: &[&str],
) -> String {
    let mut writer = begin_document();

    let root = BytesStart::new("ListBucketResult").with_attributes([("xmlns", S3_NAMESPACE)]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_text_element(&mut writer, "Name", bucket);
    write_text_element(&mut writer, "Prefix", prefix);
    if !delimiter.is_empty() {
        write_text_element(&mut writer, "Delimiter", delimiter);
    }
    write_text_element(&mut writer, "MaxKeys", &page.max_keys.to_string());
    let key_count = entries.len() + common_prefixes.len();
    write_text_element(&mut writer, "KeyCount", &key_count.to_string());
    write_text_element(
        &mut writer,
        "IsTruncated",
        if page.is_truncated { "true" } else { "false" },
    );
    let markers = [
        ("Marker", page.marker),
        ("NextMarker", page.next_marker),
        ("ContinuationToken", page.continuation_token),
        ("NextContinuationToken", page.next_continuation_token),
    ];
    for (tag, value) in markers {
        if let Some(value) = value {
            write_text_element(&mut writer, tag, value);
        }
    }

    for entry in entries {
        let etag = format!("\"{}\"", entry.etag);
        let size = entry.size.to_string();
        write_simple_element_group(
            &mut writer,
            "Contents",
            &[
                ("Key", entry.key),
                ("LastModified", entry.last_modified),
                ("ETag", &etag),
                ("Size", &size),
                ("StorageClass", "STANDARD"),
            ],
        );
    }

    for cp in common_prefixes {
        write_simple_element_group(&mut writer, "CommonPrefixes", &[("Prefix", cp)]);
    }

    writer
        .write_event(Event::End(BytesEnd::new("ListBucketResult")))
        .expect("end root");

    finish_document(writer)
}

// ── Helpers ─────────────────────────────────────────────────────────

fn begin_document() -> XmlWriter {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");
    writer
}

fn finish_document(writer: XmlWriter) -> String {
    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

/// Write a `<tag>text</tag>` element.
fn write_text_element(writer: &mut XmlWriter, tag: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}

/// Write a parent element containing a flat list of child text elements.
fn write_simple_element_group(writer: &mut XmlWriter, parent: &str, children: &[(&str, &str)]) {
    writer
        .write_event(Event::Start(BytesStart::new(parent)))
        .expect("start parent");
    for (tag, value) in children {
        write_text_element(writer, tag, value);
    }
    writer
        .write_event(Event::End(BytesEnd::new(parent)))
        .expect("end parent");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_escapes_resource() {
        let xml = render_error("NoSuchKey", "missing", "a&b<c>", "REQ1");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<Code>NoSuchKey</Code>"));
        assert!(xml.contains("<Resource>a&amp;b&lt;c&gt;</Resource>"));
        assert!(xml.contains("<RequestId>REQ1</RequestId>"));
    }

    #[test]
    fn test_render_list_bucket_result() {
        let entries = [ObjectEntry {
            key: "photos/2024/a.jpg",
            last_modified: "2024-05-01T10:00:00.000Z",
            etag: "abc123",
            size: 42,
        }];
        let page = ListingPage {
            max_keys: 1000,
            ..Default::default()
        };
        let xml = render_list_bucket_result("vbucket", "photos/", "/", &page, &entries, &["photos/2023/"]);
        assert!(xml.contains("<Name>vbucket</Name>"));
        assert!(xml.contains("<Delimiter>/</Delimiter>"));
        assert!(xml.contains("<KeyCount>2</KeyCount>"));
        assert!(xml.contains("<ETag>&quot;abc123&quot;</ETag>"));
        assert!(xml.contains("<Size>42</Size>"));
        assert!(xml.contains("<CommonPrefixes><Prefix>photos/2023/</Prefix></CommonPrefixes>"));
        assert!(xml.contains("<IsTruncated>false</IsTruncated>"));
        assert!(!xml.contains("Marker>"));
    }

    #[test]
    fn test_empty_delimiter_omitted() {
        let page = ListingPage {
            max_keys: 10,
            is_truncated: true,
            ..Default::default()
        };
        let xml = render_list_bucket_result("b", "", "", &page, &[], &[]);
        assert!(!xml.contains("<Delimiter>"));
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
        assert!(xml.contains("<KeyCount>0</KeyCount>"));
    }

    #[test]
    fn test_page_markers_written_when_present() {
        let page = ListingPage {
            max_keys: 2,
            is_truncated: true,
            continuation_token: Some("2"),
            next_continuation_token: Some("4"),
            ..Default::default()
        };
        let xml = render_list_bucket_result("b", "", "", &page, &[], &[]);
        assert!(xml.contains("<ContinuationToken>2</ContinuationToken>"));
        assert!(xml.contains("<NextContinuationToken>4</NextContinuationToken>"));
        assert!(!xml.contains("<NextMarker>"));
    }
}
