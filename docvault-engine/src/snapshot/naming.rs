//! File names for snapshot artifacts.
//!
//! Chunk files are named `<db>__<collection>__<chunkIndex>.chunk`. Name
//! components are percent-escaped so that underscores, path separators and
//! leading dots inside database or collection names can never make two
//! collections share a file name. Nothing ever parses these names back; the
//! manifest is the only source of truth for which file belongs where.

use crate::source::CollectionRef;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const STAGING_DIR: &str = ".partial";
pub const CHUNK_EXTENSION: &str = "chunk";

/// Percent-escape a name component for use inside a file name.
pub fn escape_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Reverse [`escape_component`]. Returns `None` for malformed escapes.
pub fn unescape_component(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// `<db>__<collection>`, escaped.
pub fn collection_key(collection: &CollectionRef) -> String {
    format!(
        "{}__{}",
        escape_component(collection.database()),
        escape_component(collection.collection())
    )
}

/// Published name of chunk `index` of `collection`.
pub fn chunk_file_name(collection: &CollectionRef, index: usize) -> String {
    format!("{}__{}.{}", collection_key(collection), index, CHUNK_EXTENSION)
}

/// Name of a chunk inside a collection's staging directory.
pub fn staged_chunk_name(index: usize) -> String {
    format!("{:06}.{}", index, CHUNK_EXTENSION)
}

/// Parse a staged chunk name back to its index.
pub fn parse_staged_chunk_name(name: &str) -> Option<usize> {
    let stem = name.strip_suffix(".chunk")?;
    if stem.len() != 6 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// A manifest-referenced file name must be a plain file in the snapshot directory.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && name.ends_with(".chunk")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_stay_readable() {
        let coll = CollectionRef::new("shop", "orders");
        assert_eq!(chunk_file_name(&coll, 0), "shop__orders__0.chunk");
    }

    #[test]
    fn test_underscores_cannot_collide() {
        let a = CollectionRef::new("a__b", "c");
        let b = CollectionRef::new("a", "b__c");
        assert_ne!(chunk_file_name(&a, 0), chunk_file_name(&b, 0));
        assert_eq!(chunk_file_name(&a, 3), "a%5F%5Fb__c__3.chunk");
    }

    #[test]
    fn test_escape_round_trip() {
        for name in ["system.version", "../etc", "naïve/coll", "_id", ".hidden", "x%y"] {
            let escaped = escape_component(name);
            assert!(!escaped.contains('/'));
            assert!(!escaped.starts_with('.'));
            assert_eq!(unescape_component(&escaped).as_deref(), Some(name));
        }
        assert_eq!(unescape_component("%G1"), None);
        assert_eq!(unescape_component("abc%"), None);
    }

    #[test]
    fn test_staged_names() {
        assert_eq!(staged_chunk_name(12), "000012.chunk");
        assert_eq!(parse_staged_chunk_name("000012.chunk"), Some(12));
        assert_eq!(parse_staged_chunk_name("000012.chunk.tmp"), None);
        assert_eq!(parse_staged_chunk_name("12.chunk"), None);
    }

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("shop__orders__0.chunk"));
        assert!(!is_safe_file_name("../shop__orders__0.chunk"));
        assert!(!is_safe_file_name("dir/x.chunk"));
        assert!(!is_safe_file_name("manifest.json"));
    }
}
