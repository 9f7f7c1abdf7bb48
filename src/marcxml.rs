//! MARC21-slim XML rendering and the uploader that ships it.
//!
//! Queue runs go through [`MarcXmlGenerator::records_to_xml`], which folds the
//! batch with [`simplify`] and turns deletions into deletion records. Initial
//! exports go through [`MarcXmlGenerator::objects_to_xml`]. A generator returns
//! `None` when a batch renders to no records; nothing is uploaded then.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;
use std::fmt::Write as _;
use tracing::debug;

use crate::db;
use crate::model::{LiveObject, ObjectRef, QueueEntry};
use crate::simplify::{simplify, SimpleChange};
use crate::uploader::{Batch, Uploader};

const MARC_NS: &str = "http://www.loc.gov/MARC21/slim";

// Characters XML 1.0 does not allow in text content.
static INVALID_XML_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x{FFFE}\x{FFFF}]").expect("valid regex"));

#[async_trait]
pub trait MarcXmlGenerator: Send + Sync {
    async fn records_to_xml(&self, entries: &[QueueEntry]) -> Result<Option<String>>;

    async fn objects_to_xml(&self, objects: &[LiveObject]) -> Result<Option<String>>;
}

/// Destination for rendered MARCXML documents.
#[async_trait]
pub trait XmlSink: Send + Sync {
    async fn upload_xml(&self, xml: &str) -> Result<()>;
}

/// Generator that resolves queued objects from the local catalog.
#[derive(Debug, Clone)]
pub struct CatalogMarcXml {
    pool: SqlitePool,
}

impl CatalogMarcXml {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MarcXmlGenerator for CatalogMarcXml {
    async fn records_to_xml(&self, entries: &[QueueEntry]) -> Result<Option<String>> {
        let mut doc = MarcDocument::default();
        for (object_ref, change) in simplify(entries) {
            match change {
                SimpleChange::Deleted => doc.push_deletion(object_ref),
                SimpleChange::Created | SimpleChange::Updated => {
                    match db::fetch_object(&self.pool, object_ref).await? {
                        Some(object) => doc.push_object(&object),
                        None => {
                            debug!(object = %object_ref, "object gone from catalog; exporting deletion");
                            doc.push_deletion(object_ref);
                        }
                    }
                }
            }
        }
        Ok(doc.finish())
    }

    async fn objects_to_xml(&self, objects: &[LiveObject]) -> Result<Option<String>> {
        Ok(render_objects(objects))
    }
}

/// Render full records for `objects`; `None` for an empty slice.
pub fn render_objects(objects: &[LiveObject]) -> Option<String> {
    let mut doc = MarcDocument::default();
    for object in objects {
        doc.push_object(object);
    }
    doc.finish()
}

#[derive(Debug, Default)]
struct MarcDocument {
    records: Vec<String>,
}

impl MarcDocument {
    fn push_object(&mut self, object: &LiveObject) {
        let mut rec = String::from("  <record>\n");
        datafield(&mut rec, "970", &[('a', object.object_ref.repository_id())]);
        datafield(&mut rec, "245", &[('a', object.title.clone())]);

        let mut meeting = vec![('a', object.title.clone())];
        if let Some(start) = object.start_dt {
            meeting.push(('9', format_dt(start)));
        }
        if let Some(end) = object.end_dt {
            meeting.push(('z', format_dt(end)));
        }
        if let Some(location) = non_empty(&object.location) {
            meeting.push(('c', location.to_string()));
        }
        datafield(&mut rec, "111", &meeting);

        if let Some(description) = non_empty(&object.description) {
            datafield(&mut rec, "520", &[('a', description.to_string())]);
        }
        if let Some(url) = non_empty(&object.url) {
            datafield(&mut rec, "856", &[('u', url.to_string())]);
        }
        datafield(
            &mut rec,
            "980",
            &[('a', object.object_ref.entry_type().collection().to_string())],
        );
        rec.push_str("  </record>\n");
        self.records.push(rec);
    }

    fn push_deletion(&mut self, object_ref: ObjectRef) {
        let mut rec = String::from("  <record>\n");
        datafield(&mut rec, "970", &[('a', object_ref.repository_id())]);
        datafield(&mut rec, "980", &[('c', "DELETED".to_string())]);
        rec.push_str("  </record>\n");
        self.records.push(rec);
    }

    fn finish(self) -> Option<String> {
        if self.records.is_empty() {
            return None;
        }
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(out, "<collection xmlns=\"{}\">", MARC_NS);
        for rec in self.records {
            out.push_str(&rec);
        }
        out.push_str("</collection>\n");
        Some(out)
    }
}

fn datafield(out: &mut String, tag: &str, subfields: &[(char, String)]) {
    let _ = writeln!(out, "    <datafield tag=\"{}\" ind1=\" \" ind2=\" \">", tag);
    for (code, value) in subfields {
        let _ = writeln!(
            out,
            "      <subfield code=\"{}\">{}</subfield>",
            code,
            xml_escape(value)
        );
    }
    out.push_str("    </datafield>\n");
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn format_dt(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn xml_escape(s: &str) -> String {
    INVALID_XML_CHARS
        .replace_all(s, "")
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Uploader rendering each batch as MARCXML before handing it to a sink.
pub struct MarcXmlUploader<G, S> {
    generator: G,
    sink: S,
}

impl<G: MarcXmlGenerator, S: XmlSink> MarcXmlUploader<G, S> {
    pub fn new(generator: G, sink: S) -> Self {
        Self { generator, sink }
    }
}

#[async_trait]
impl<G: MarcXmlGenerator, S: XmlSink> Uploader for MarcXmlUploader<G, S> {
    fn name(&self) -> &str {
        "marcxml"
    }

    async fn upload_records(&self, batch: Batch<'_>) -> Result<()> {
        let xml = match batch {
            Batch::Queued(entries) => self.generator.records_to_xml(entries).await?,
            Batch::Initial(objects) => self.generator.objects_to_xml(objects).await?,
        };
        let Some(xml) = xml else {
            debug!(size = batch.len(), "batch rendered no records; skipping upload");
            return Ok(());
        };
        self.sink.upload_xml(&xml).await
    }
}
