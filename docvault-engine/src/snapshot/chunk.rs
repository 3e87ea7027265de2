//! Chunk file format.
//!
//! A chunk file is a single JSON header line followed by the body:
//!
//! ```text
//! {"format":1,"database":"shop","collection":"orders","index":0,"docCount":3,...}\n
//! <body: JSON-lines documents, optionally zstd-compressed>
//! ```
//!
//! The header checksum covers the stored body bytes, so corruption is detected
//! before decompression. The header also records where the source cursor
//! stood after the chunk's last document, which is what a resumed backup
//! continues from.

use crate::document::{decode_line, Document, Fidelity};
use crate::snapshot::checksum::{checksum_of, verify_checksum};
use crate::source::{CollectionRef, ResumePoint};
use crate::utils::{ReadError, WriteError};
use serde::{Deserialize, Serialize};

pub const CHUNK_FORMAT: u32 = 1;

/// Body compression for chunk files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Zstd,
    None,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Zstd => f.write_str("zstd"),
            Compression::None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub format: u32,
    pub database: String,
    pub collection: String,
    pub index: usize,
    pub doc_count: u64,
    /// Uncompressed body length.
    pub raw_bytes: u64,
    pub compression: Compression,
    /// Checksum of the stored (possibly compressed) body.
    pub checksum: String,
    /// Cursor position just after the last document of this chunk.
    pub resume: ResumePoint,
}

impl ChunkHeader {
    pub fn collection_ref(&self) -> CollectionRef {
        CollectionRef::new(self.database.clone(), self.collection.clone())
    }
}

/// Build a complete chunk file from an uncompressed JSON-lines body.
pub fn encode_chunk(
    collection: &CollectionRef,
    index: usize,
    doc_count: u64,
    body: &[u8],
    compression: Compression,
    level: i32,
    resume: ResumePoint,
) -> Result<(ChunkHeader, Vec<u8>), WriteError> {
    let stored = match compression {
        Compression::Zstd => zstd::encode_all(body, level)
            .map_err(|e| WriteError::Encode(format!("zstd: {e}")))?,
        Compression::None => body.to_vec(),
    };

    let header = ChunkHeader {
        format: CHUNK_FORMAT,
        database: collection.database().to_string(),
        collection: collection.collection().to_string(),
        index,
        doc_count,
        raw_bytes: body.len() as u64,
        compression,
        checksum: checksum_of(&stored),
        resume,
    };

    let mut bytes =
        serde_json::to_vec(&header).map_err(|e| WriteError::Encode(e.to_string()))?;
    bytes.push(b'\n');
    bytes.extend_from_slice(&stored);
    Ok((header, bytes))
}

fn split_header<'a>(file: &str, bytes: &'a [u8]) -> Result<(ChunkHeader, &'a [u8]), ReadError> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| ReadError::chunk(file, "missing header line"))?;
    let header: ChunkHeader = serde_json::from_slice(&bytes[..newline])
        .map_err(|e| ReadError::chunk(file, format!("invalid header: {e}")))?;
    if header.format != CHUNK_FORMAT {
        return Err(ReadError::chunk(
            file,
            format!("unsupported chunk format {}", header.format),
        ));
    }
    Ok((header, &bytes[newline + 1..]))
}

/// Parse only the header of a chunk file.
pub fn read_header(file: &str, bytes: &[u8]) -> Result<ChunkHeader, ReadError> {
    split_header(file, bytes).map(|(header, _)| header)
}

/// Verify a chunk file and return its header and uncompressed body.
pub fn decode_chunk(file: &str, bytes: &[u8]) -> Result<(ChunkHeader, Vec<u8>), ReadError> {
    let (header, stored) = split_header(file, bytes)?;
    verify_checksum(stored, &header.checksum).map_err(|reason| ReadError::chunk(file, reason))?;

    let body = match header.compression {
        Compression::Zstd => zstd::decode_all(stored)
            .map_err(|e| ReadError::chunk(file, format!("zstd: {e}")))?,
        Compression::None => stored.to_vec(),
    };
    if body.len() as u64 != header.raw_bytes {
        return Err(ReadError::chunk(
            file,
            format!(
                "body is {} bytes, header says {}",
                body.len(),
                header.raw_bytes
            ),
        ));
    }
    Ok((header, body))
}

/// Decode the documents of a verified chunk body.
pub fn parse_documents(
    file: &str,
    header: &ChunkHeader,
    body: &[u8],
    fidelity: Fidelity,
) -> Result<Vec<Document>, ReadError> {
    let mut documents = Vec::with_capacity(header.doc_count as usize);
    for (line_no, line) in body.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let doc = decode_line(line, fidelity)
            .map_err(|e| ReadError::chunk(file, format!("line {}: {}", line_no + 1, e)))?;
        documents.push(doc);
    }
    if documents.len() as u64 != header.doc_count {
        return Err(ReadError::chunk(
            file,
            format!(
                "holds {} documents, header says {}",
                documents.len(),
                header.doc_count
            ),
        ));
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::encode_line;
    use crate::source::CursorToken;

    fn body_of(docs: &[Document]) -> Vec<u8> {
        let mut body = Vec::new();
        for doc in docs {
            body.extend(encode_line(doc, Fidelity::Canonical).unwrap());
            body.push(b'\n');
        }
        body
    }

    fn sample() -> Vec<Document> {
        (0..3)
            .map(|i| Document::new().with("_id", i).with("item", format!("sku-{i}")))
            .collect()
    }

    #[test]
    fn test_encode_decode_both_compressions() {
        let coll = CollectionRef::new("shop", "orders");
        let docs = sample();
        let body = body_of(&docs);
        let resume = ResumePoint {
            token: Some(CursorToken::new("3")),
            skip: 0,
        };

        for compression in [Compression::Zstd, Compression::None] {
            let (header, bytes) =
                encode_chunk(&coll, 0, 3, &body, compression, 3, resume.clone()).unwrap();
            let (decoded, raw) = decode_chunk("x.chunk", &bytes).unwrap();
            assert_eq!(decoded, header);
            assert_eq!(decoded.resume, resume);
            assert_eq!(parse_documents("x.chunk", &decoded, &raw, Fidelity::Canonical).unwrap(), docs);
        }
    }

    #[test]
    fn test_flipped_byte_is_detected() {
        let coll = CollectionRef::new("shop", "orders");
        let body = body_of(&sample());
        let (_, mut bytes) =
            encode_chunk(&coll, 0, 3, &body, Compression::None, 0, ResumePoint::default()).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x20;

        let err = decode_chunk("shop__orders__0.chunk", &bytes).unwrap_err();
        assert!(matches!(err, ReadError::ChunkCorrupt { ref file, .. } if file == "shop__orders__0.chunk"));
    }

    #[test]
    fn test_truncated_chunk_is_rejected() {
        assert!(decode_chunk("t.chunk", b"{\"format\":1").is_err());
        assert!(decode_chunk("t.chunk", b"").is_err());
    }

    #[test]
    fn test_doc_count_mismatch() {
        let coll = CollectionRef::new("shop", "orders");
        let body = body_of(&sample());
        let (_, bytes) =
            encode_chunk(&coll, 0, 5, &body, Compression::None, 0, ResumePoint::default()).unwrap();
        let (header, raw) = decode_chunk("c.chunk", &bytes).unwrap();
        assert!(parse_documents("c.chunk", &header, &raw, Fidelity::Canonical).is_err());
    }
}
