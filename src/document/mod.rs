//! Typed getters/setters over opaque self-describing binary documents.
//!
//! Every higher layer in this crate addresses document fields by path
//! string (e.g. `"peer.rhid"`, `"args.0"`) instead of touching raw bytes;
//! this module is the only place that understands the wire codec
//! (currently `bson::Document`).

use bson::{Binary, Bson, Document};

use crate::error::*;

/// Splits a dotted path into its segments. `"peer.rhid"` becomes
/// `["peer", "rhid"]`; `"args.0"` becomes `["args", "0"]`, where `"0"`
/// indexes into an array.
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

fn resolve<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segs = segments(path);
    let first = segs.next()?;
    let mut current = doc.get(first)?;
    for seg in segs {
        current = match current {
            Bson::Document(d) => d.get(seg)?,
            Bson::Array(a) => {
                let idx: usize = seg.parse().ok()?;
                a.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Returns the string stored at `path`, or `None` if missing or not a string.
pub fn get_str<'a>(doc: &'a Document, path: &str) -> Option<&'a str> {
    resolve(doc, path).and_then(Bson::as_str)
}

/// Returns the binary payload stored at `path`, or `None` if missing or
/// not a binary element.
pub fn get_binary<'a>(doc: &'a Document, path: &str) -> Option<&'a [u8]> {
    match resolve(doc, path)? {
        Bson::Binary(Binary { bytes, .. }) => Some(bytes.as_slice()),
        _ => None,
    }
}

/// Returns the integer stored at `path` (widened to `i64`), or `None` if
/// missing or not numeric.
pub fn get_int(doc: &Document, path: &str) -> Option<i64> {
    match resolve(doc, path)? {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

/// Returns the boolean stored at `path`, or `None` if missing or not a bool.
pub fn get_bool(doc: &Document, path: &str) -> Option<bool> {
    match resolve(doc, path)? {
        Bson::Boolean(b) => Some(*b),
        _ => None,
    }
}

/// Returns the array stored at `path`, or `None` if missing or not an array.
pub fn get_array<'a>(doc: &'a Document, path: &str) -> Option<&'a Vec<Bson>> {
    match resolve(doc, path)? {
        Bson::Array(a) => Some(a),
        _ => None,
    }
}

/// Returns the sub-document stored at `path`, or `None` if missing or not
/// a document.
pub fn get_document<'a>(doc: &'a Document, path: &str) -> Option<&'a Document> {
    match resolve(doc, path)? {
        Bson::Document(d) => Some(d),
        _ => None,
    }
}

fn bin(bytes: &[u8]) -> Bson {
    Bson::Binary(Binary {
        subtype: bson::spec::BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

/// A fixed-capacity builder for outgoing documents.
///
/// Callers build up a document field by field, then call `finish()`,
/// which reports `ErrorKind::Codec` if the serialized document would
/// exceed the capacity given to `new()`. This preserves the "fixed stack
/// buffer" discipline of the original wire codec even though the
/// in-progress document itself lives on the heap.
pub struct DocumentBuilder {
    doc: Document,
    max_len: usize,
}

impl DocumentBuilder {
    pub fn new(max_len: usize) -> Self {
        Self {
            doc: Document::new(),
            max_len,
        }
    }

    pub fn append_str(&mut self, key: &str, value: &str) -> &mut Self {
        self.doc.insert(key, value);
        self
    }

    pub fn append_binary(&mut self, key: &str, value: &[u8]) -> &mut Self {
        self.doc.insert(key, bin(value));
        self
    }

    pub fn append_i32(&mut self, key: &str, value: i32) -> &mut Self {
        self.doc.insert(key, value);
        self
    }

    pub fn append_i64(&mut self, key: &str, value: i64) -> &mut Self {
        self.doc.insert(key, value);
        self
    }

    pub fn append_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.doc.insert(key, value);
        self
    }

    pub fn append_document(&mut self, key: &str, value: Document) -> &mut Self {
        self.doc.insert(key, value);
        self
    }

    pub fn append_array(&mut self, key: &str, value: Vec<Bson>) -> &mut Self {
        self.doc.insert(key, value);
        self
    }

    /// Accesses the document under construction, for handlers that need
    /// to nest builders (e.g. building a `peer` sub-document separately).
    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    /// Consumes the builder, serializing the document into wire bytes.
    /// Fails with `ErrorKind::Codec` if the result exceeds the capacity
    /// passed to `new()`.
    pub fn finish(self) -> Result<Vec<u8>> {
        let bytes = bson::to_vec(&self.doc).wrapped(ErrorKind::Codec)?;
        if bytes.len() > self.max_len {
            return Err(format!(
                "document of {} bytes exceeds the {} byte cap",
                bytes.len(),
                self.max_len
            ))
            .simple(ErrorKind::Codec);
        }
        Ok(bytes)
    }

    /// Consumes the builder, returning the in-progress document without
    /// serializing it. Used when nesting one builder's output into
    /// another via `append_document`.
    pub fn into_document(self) -> Document {
        self.doc
    }
}

/// Decodes a wire frame into a document, reporting malformed input as a
/// recoverable `ErrorKind::Codec` error.
pub fn decode(bytes: &[u8]) -> Result<Document> {
    bson::from_slice(bytes).wrapped(ErrorKind::Codec)
}

/// Encodes a document to wire bytes without a capacity check; used for
/// internal round-trips (e.g. persisted identity documents) where the
/// caller already bounds the input size some other way.
pub fn encode(doc: &Document) -> Result<Vec<u8>> {
    bson::to_vec(doc).wrapped(ErrorKind::Codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn resolves_nested_and_array_paths() {
        let d = doc! {
            "peer": { "rhid": bin(&[1, 2, 3]) },
            "args": ["zero", "one"],
        };
        assert_eq!(get_binary(&d, "peer.rhid"), Some(&[1u8, 2, 3][..]));
        assert_eq!(get_str(&d, "args.0"), Some("zero"));
        assert_eq!(get_str(&d, "args.1"), Some("one"));
        assert_eq!(get_str(&d, "args.2"), None);
        assert_eq!(get_str(&d, "missing.path"), None);
    }

    #[test]
    fn builder_reports_overflow() {
        let mut b = DocumentBuilder::new(8);
        b.append_str("alias", "a very long alias that will not fit");
        assert!(b.finish().is_err());
    }

    #[test]
    fn builder_roundtrips_through_decode() {
        let mut b = DocumentBuilder::new(4096);
        b.append_str("alias", "Alice").append_binary("uid", &[9u8; 32]);
        let bytes = b.finish().unwrap();
        let doc = decode(&bytes).unwrap();
        assert_eq!(get_str(&doc, "alias"), Some("Alice"));
        assert_eq!(get_binary(&doc, "uid"), Some(&[9u8; 32][..]));
    }
}
