//! DocumentRecord: one object in the device's flat document store.
//!
//! The device keeps every folder and document as `<id>.metadata` (JSON), an
//! optional `<id>.content` (JSON) and payload files, all in one directory.
//! Hierarchy exists only through the `parent` field. This module holds the
//! serde models for those files and the typed record the tree is built from.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// `parent` value for records living at the top level.
pub const ROOT_PARENT: &str = "";
/// `parent` value for records that were moved to the device's trash.
pub const TRASH_PARENT: &str = "trash";

const COLLECTION_TYPE: &str = "CollectionType";
const DOCUMENT_TYPE: &str = "DocumentType";

/// Extensions removed from a file name to get the document's visible name.
const STRIPPED_EXTENSIONS: [&str; 4] = ["pdf", "djvu", "ps", "epub"];

/// The fixed set of object kinds the device stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Folder,
    Pdf,
    Epub,
    /// Handwritten notebook, exposed as a rendered PDF.
    Notebook,
}

impl DocumentKind {
    pub fn is_folder(self) -> bool {
        matches!(self, Self::Folder)
    }

    /// Extension appended to the visible name to form the file name.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            Self::Folder => None,
            Self::Pdf | Self::Notebook => Some("pdf"),
            Self::Epub => Some("epub"),
        }
    }

    /// Extension of the payload file stored next to the metadata, if the
    /// kind has a single payload file.
    pub fn payload_extension(self) -> Option<&'static str> {
        match self {
            Self::Pdf => Some("pdf"),
            Self::Epub => Some("epub"),
            Self::Folder | Self::Notebook => None,
        }
    }

    /// Value of `fileType` in the `.content` file.
    pub fn file_type(self) -> &'static str {
        match self {
            Self::Folder => "",
            Self::Pdf => "pdf",
            Self::Epub => "epub",
            Self::Notebook => "notebook",
        }
    }

    fn metadata_type(self) -> &'static str {
        match self {
            Self::Folder => COLLECTION_TYPE,
            Self::Pdf | Self::Epub | Self::Notebook => DOCUMENT_TYPE,
        }
    }

    /// Guess the kind of a new file from the name it is created with.
    /// Anything that is not an EPUB is uploaded as PDF (after conversion).
    pub fn for_new_file(file_name: &str) -> Self {
        match split_extension(file_name).1 {
            Some(ext) if ext.eq_ignore_ascii_case("epub") => Self::Epub,
            _ => Self::Pdf,
        }
    }
}

/// Where a record hangs in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Parent {
    Root,
    Trash,
    Folder(String),
}

impl Parent {
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            ROOT_PARENT => Self::Root,
            TRASH_PARENT => Self::Trash,
            id => Self::Folder(id.to_string()),
        }
    }

    pub fn as_raw(&self) -> &str {
        match self {
            Self::Root => ROOT_PARENT,
            Self::Trash => TRASH_PARENT,
            Self::Folder(id) => id,
        }
    }
}

/// Contents of a `<id>.metadata` file.
///
/// Fields the driver does not understand are kept in `extra` so rewriting a
/// record never drops data the device put there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub deleted: bool,
    #[serde(rename = "lastModified", default, with = "millis")]
    pub last_modified: u64,
    #[serde(rename = "metadatamodified", default)]
    pub metadata_modified: bool,
    #[serde(default)]
    pub modified: bool,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub synced: bool,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub version: u64,
    #[serde(rename = "visibleName", default)]
    pub visible_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Contents of a `<id>.content` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(rename = "fileType", default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(rename = "pageCount", default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Content {
    /// Content written for a new folder: an empty object.
    pub fn for_folder() -> Self {
        Self::default()
    }

    /// Content written for a newly uploaded PDF or EPUB.
    pub fn for_document(kind: DocumentKind) -> Self {
        let extra = serde_json::json!({
            "extraMetadata": {},
            "fontName": "",
            "lastOpenedPage": 0,
            "lineHeight": -1,
            "margins": 100,
            "orientation": "portrait",
            "textScale": 1,
            "transform": {
                "m11": 1, "m12": 0, "m13": 0,
                "m21": 0, "m22": 1, "m23": 0,
                "m31": 0, "m32": 0, "m33": 1
            }
        });
        let extra = match extra {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            file_type: Some(kind.file_type().to_string()),
            page_count: Some(1),
            pages: None,
            extra,
        }
    }
}

/// One object as read from the device, before interpretation.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: String,
    pub metadata: Metadata,
    pub content: Option<Content>,
    /// Size of the payload file in bytes (0 when there is none).
    pub payload_size: u64,
}

/// Typed view of one remote object.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub kind: DocumentKind,
    pub visible_name: String,
    pub parent: Parent,
    /// Milliseconds since the Unix epoch.
    pub last_modified: u64,
    pub version: u64,
    pub deleted: bool,
    pub pinned: bool,
    pub synced: bool,
    pub metadata_modified: bool,
    pub modified: bool,
    pub page_count: u32,
    /// Page ids of a notebook, in page order. Empty for older notebooks.
    pub pages: Vec<String>,
    pub payload_size: u64,
    extra: Map<String, Value>,
}

impl DocumentRecord {
    /// Create a record for an object that only exists locally so far.
    pub fn new(id: String, kind: DocumentKind, visible_name: &str, parent: Parent) -> Self {
        Self {
            id,
            kind,
            visible_name: visible_name.to_string(),
            parent,
            last_modified: now_millis(),
            version: 1,
            deleted: false,
            pinned: false,
            synced: false,
            metadata_modified: true,
            modified: true,
            page_count: 0,
            pages: Vec::new(),
            payload_size: 0,
            extra: Map::new(),
        }
    }

    /// The synthetic record backing the tree root.
    pub fn root() -> Self {
        let mut record = Self::new(String::new(), DocumentKind::Folder, "", Parent::Root);
        record.version = 0;
        record.metadata_modified = false;
        record.modified = false;
        record
    }

    /// Interpret a raw record. Returns `None` for objects the driver cannot
    /// show (unknown type or unknown file type).
    pub fn from_raw(raw: RawRecord) -> Option<Self> {
        let RawRecord {
            id,
            metadata,
            content,
            payload_size,
        } = raw;

        let kind = match metadata.node_type.as_str() {
            COLLECTION_TYPE => DocumentKind::Folder,
            DOCUMENT_TYPE => {
                let file_type = content
                    .as_ref()
                    .and_then(|c| c.file_type.as_deref())
                    .unwrap_or("");
                match file_type {
                    "pdf" => DocumentKind::Pdf,
                    "epub" => DocumentKind::Epub,
                    "" | "notebook" => DocumentKind::Notebook,
                    other => {
                        tracing::warn!("Skipping {}: unsupported file type {:?}", id, other);
                        return None;
                    }
                }
            }
            other => {
                tracing::warn!("Skipping {}: unknown record type {:?}", id, other);
                return None;
            }
        };

        let (page_count, pages) = match content {
            Some(content) => {
                let pages = content.pages.unwrap_or_default();
                let count = content.page_count.unwrap_or(pages.len() as u32);
                (count, pages)
            }
            None => (0, Vec::new()),
        };

        Some(Self {
            id,
            kind,
            visible_name: metadata.visible_name,
            parent: Parent::from_raw(&metadata.parent),
            last_modified: metadata.last_modified,
            version: metadata.version,
            deleted: metadata.deleted,
            pinned: metadata.pinned,
            synced: metadata.synced,
            metadata_modified: metadata.metadata_modified,
            modified: metadata.modified,
            page_count,
            pages,
            payload_size,
            extra: metadata.extra,
        })
    }

    /// Build the `.metadata` document for this record.
    pub fn to_metadata(&self) -> Metadata {
        Metadata {
            deleted: self.deleted,
            last_modified: self.last_modified,
            metadata_modified: self.metadata_modified,
            modified: self.modified,
            parent: self.parent.as_raw().to_string(),
            pinned: self.pinned,
            synced: self.synced,
            node_type: self.kind.metadata_type().to_string(),
            version: self.version,
            visible_name: self.visible_name.clone(),
            extra: self.extra.clone(),
        }
    }

    /// Change fingerprint used to compare local and remote copies.
    pub fn fingerprint(&self) -> (u64, u64) {
        (self.version, self.last_modified)
    }

    /// Record a local metadata change the way the device expects it.
    pub fn touch(&mut self) {
        self.version += 1;
        self.last_modified = now_millis();
        self.metadata_modified = true;
        self.synced = false;
    }

    /// File name this record gets in its folder, before disambiguation.
    pub fn file_name(&self) -> String {
        let mut stem = sanitize_name(&self.visible_name);
        if stem.is_empty() || stem == "." || stem == ".." {
            stem = self.id.clone();
        }
        match self.kind.extension() {
            Some(ext) => format!("{}.{}", stem, ext),
            None => stem,
        }
    }
}

/// Replace characters that cannot appear in a file name.
pub fn sanitize_name(name: &str) -> String {
    name.replace(['/', '\0'], "-")
}

/// Split `name` into stem and extension. Dot-files without a further dot
/// have no extension.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(pos) => (&name[..pos], Some(&name[pos + 1..])),
    }
}

/// Remove the extension from a file name if it is a recognised document
/// type, giving the name shown on the device.
pub fn strip_extension(file_name: &str) -> &str {
    match split_extension(file_name) {
        (stem, Some(ext))
            if STRIPPED_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext)) =>
        {
            stem
        }
        _ => file_name,
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `lastModified` is a decimal string on the device; older files use numbers.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        match Value::deserialize(d)? {
            Value::String(s) => s.trim().parse().map_err(D::Error::custom),
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
                .ok_or_else(|| D::Error::custom("invalid timestamp")),
            Value::Null => Ok(0),
            other => Err(D::Error::custom(format!("invalid timestamp: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, metadata: &str, content: Option<&str>) -> RawRecord {
        RawRecord {
            id: id.to_string(),
            metadata: serde_json::from_str(metadata).unwrap(),
            content: content.map(|c| serde_json::from_str(c).unwrap()),
            payload_size: 0,
        }
    }

    #[test]
    fn test_parse_folder_metadata() {
        let record = DocumentRecord::from_raw(raw(
            "a",
            r#"{"deleted":false,"lastModified":"1530000000000","metadatamodified":false,
                "modified":false,"parent":"","pinned":true,"synced":true,
                "type":"CollectionType","version":3,"visibleName":"Notes"}"#,
            Some("{}"),
        ))
        .unwrap();

        assert_eq!(record.kind, DocumentKind::Folder);
        assert_eq!(record.parent, Parent::Root);
        assert_eq!(record.last_modified, 1_530_000_000_000);
        assert_eq!(record.version, 3);
        assert!(record.pinned);
        assert_eq!(record.file_name(), "Notes");
    }

    #[test]
    fn test_document_kinds_from_content() {
        let meta = r#"{"type":"DocumentType","parent":"a","visibleName":"Doc","lastModified":5}"#;

        let pdf = DocumentRecord::from_raw(raw("p", meta, Some(r#"{"fileType":"pdf"}"#))).unwrap();
        assert_eq!(pdf.kind, DocumentKind::Pdf);
        assert_eq!(pdf.file_name(), "Doc.pdf");
        assert_eq!(pdf.parent, Parent::Folder("a".to_string()));
        assert_eq!(pdf.last_modified, 5);

        let epub = DocumentRecord::from_raw(raw("e", meta, Some(r#"{"fileType":"epub"}"#))).unwrap();
        assert_eq!(epub.file_name(), "Doc.epub");

        let notebook = DocumentRecord::from_raw(raw(
            "n",
            meta,
            Some(r#"{"fileType":"notebook","pages":["p1","p2"]}"#),
        ))
        .unwrap();
        assert_eq!(notebook.kind, DocumentKind::Notebook);
        assert_eq!(notebook.page_count, 2);
        assert_eq!(notebook.pages, vec!["p1", "p2"]);
        assert_eq!(notebook.file_name(), "Doc.pdf");

        let legacy = DocumentRecord::from_raw(raw("l", meta, Some(r#"{"fileType":""}"#))).unwrap();
        assert_eq!(legacy.kind, DocumentKind::Notebook);
    }

    #[test]
    fn test_unknown_types_are_skipped() {
        let unknown = raw("x", r#"{"type":"TemplateType"}"#, None);
        assert!(DocumentRecord::from_raw(unknown).is_none());

        let djvu = raw("y", r#"{"type":"DocumentType"}"#, Some(r#"{"fileType":"djvu"}"#));
        assert!(DocumentRecord::from_raw(djvu).is_none());
    }

    #[test]
    fn test_trash_parent() {
        let record = DocumentRecord::from_raw(raw(
            "t",
            r#"{"type":"CollectionType","parent":"trash","visibleName":"Old"}"#,
            None,
        ))
        .unwrap();
        assert_eq!(record.parent, Parent::Trash);
        assert!(!record.deleted);
    }

    #[test]
    fn test_metadata_round_trip_keeps_unknown_fields() {
        let record = DocumentRecord::from_raw(raw(
            "a",
            r#"{"type":"CollectionType","parent":"","visibleName":"X","lastModified":"7",
                "lastOpened":"123","customField":{"nested":true}}"#,
            None,
        ))
        .unwrap();

        let json = serde_json::to_value(record.to_metadata()).unwrap();
        assert_eq!(json["lastModified"], "7");
        assert_eq!(json["lastOpened"], "123");
        assert_eq!(json["customField"]["nested"], true);
        assert_eq!(json["type"], "CollectionType");
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut record = DocumentRecord::new("id".into(), DocumentKind::Pdf, "a", Parent::Root);
        record.synced = true;
        record.metadata_modified = false;
        record.touch();
        assert_eq!(record.version, 2);
        assert!(record.metadata_modified);
        assert!(!record.synced);
    }

    #[test]
    fn test_file_name_sanitizing() {
        let record = DocumentRecord::new("id".into(), DocumentKind::Pdf, "a/b", Parent::Root);
        assert_eq!(record.file_name(), "a-b.pdf");

        let unnamed = DocumentRecord::new("id".into(), DocumentKind::Folder, "", Parent::Root);
        assert_eq!(unnamed.file_name(), "id");
    }

    #[test]
    fn test_strip_extension() {
        assert_eq!(strip_extension("paper.pdf"), "paper");
        assert_eq!(strip_extension("book.EPUB"), "book");
        assert_eq!(strip_extension("scan.djvu"), "scan");
        assert_eq!(strip_extension("notes.txt"), "notes.txt");
        assert_eq!(strip_extension(".hidden"), ".hidden");
    }

    #[test]
    fn test_kind_for_new_file() {
        assert_eq!(DocumentKind::for_new_file("a.epub"), DocumentKind::Epub);
        assert_eq!(DocumentKind::for_new_file("a.pdf"), DocumentKind::Pdf);
        assert_eq!(DocumentKind::for_new_file("a.ps"), DocumentKind::Pdf);
    }

    #[test]
    fn test_new_folder_content_is_empty_object() {
        let json = serde_json::to_string(&Content::for_folder()).unwrap();
        assert_eq!(json, "{}");

        let doc = serde_json::to_value(Content::for_document(DocumentKind::Epub)).unwrap();
        assert_eq!(doc["fileType"], "epub");
        assert_eq!(doc["margins"], 100);
    }
}
