//! Blob module — variable-size values stored through a fixed-size reference:
//! small values inline in the reference itself, large values chunked into
//! dedicated blocks allocated in the owning transaction.

use crate::cache::{Acquisition, Transaction};
use crate::serializer::BlockId;

/// Upper bound on an encoded blob reference.
pub const MAX_REF_SIZE: usize = 251;

/// Largest value stored inline in the reference.
pub const MAX_INLINE_SIZE: usize = MAX_REF_SIZE - INLINE_HEADER_SIZE;

const KIND_INLINE: u8 = 0;
const KIND_INDIRECT: u8 = 1;

/// kind byte + u16 length.
const INLINE_HEADER_SIZE: usize = 3;
/// kind byte + u32 total length + u16 chunk count.
const INDIRECT_HEADER_SIZE: usize = 7;

/// Most chunk ids an indirect reference can carry.
const MAX_CHUNKS: usize = (MAX_REF_SIZE - INDIRECT_HEADER_SIZE) / 8;

/// Encoded reference to a blob, suitable for embedding in a client block.
pub struct BlobRef {
    encoded: Vec<u8>,
}

impl BlobRef {
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded.len()
    }

    /// Size of the reference starting at `buf[0]`, without decoding it fully.
    pub fn ref_size(buf: &[u8]) -> usize {
        match buf[0] {
            KIND_INLINE => {
                let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
                INLINE_HEADER_SIZE + len
            }
            KIND_INDIRECT => {
                let chunks = u16::from_le_bytes([buf[5], buf[6]]) as usize;
                INDIRECT_HEADER_SIZE + chunks * 8
            }
            kind => panic!("corrupt blob reference (kind {kind})"),
        }
    }

    /// Decodes the reference starting at `buf[0]`.
    pub fn parse(buf: &[u8]) -> BlobRef {
        let size = BlobRef::ref_size(buf);
        BlobRef {
            encoded: buf[..size].to_vec(),
        }
    }

    fn inline_payload(&self) -> Option<&[u8]> {
        (self.encoded[0] == KIND_INLINE).then(|| &self.encoded[INLINE_HEADER_SIZE..])
    }

    fn indirect_parts(&self) -> Option<(usize, Vec<BlockId>)> {
        if self.encoded[0] != KIND_INDIRECT {
            return None;
        }
        let total_len = u32::from_le_bytes(self.encoded[1..5].try_into().unwrap()) as usize;
        let chunks = u16::from_le_bytes(self.encoded[5..7].try_into().unwrap()) as usize;
        let ids = (0..chunks)
            .map(|i| {
                let at = INDIRECT_HEADER_SIZE + i * 8;
                u64::from_le_bytes(self.encoded[at..at + 8].try_into().unwrap())
            })
            .collect();
        Some((total_len, ids))
    }
}

/// Stores `value` through `txn` and returns its reference. Small values go
/// inline; larger ones are chunked into freshly created blocks.
pub fn write_blob(txn: &Transaction, value: &[u8]) -> BlobRef {
    if value.len() <= MAX_INLINE_SIZE {
        let mut encoded = Vec::with_capacity(INLINE_HEADER_SIZE + value.len());
        encoded.push(KIND_INLINE);
        encoded.extend_from_slice(&(value.len() as u16).to_le_bytes());
        encoded.extend_from_slice(value);
        return BlobRef { encoded };
    }

    let block_size = txn.block_size();
    let chunk_count = value.len().div_ceil(block_size);
    assert!(
        chunk_count <= MAX_CHUNKS,
        "value of {} bytes exceeds the largest blob ({} bytes)",
        value.len(),
        MAX_CHUNKS * block_size
    );

    let mut encoded = Vec::with_capacity(INDIRECT_HEADER_SIZE + chunk_count * 8);
    encoded.push(KIND_INDIRECT);
    encoded.extend_from_slice(&(value.len() as u32).to_le_bytes());
    encoded.extend_from_slice(&(chunk_count as u16).to_le_bytes());
    for chunk in value.chunks(block_size) {
        let mut acq = Acquisition::create(txn);
        encoded.extend_from_slice(&acq.block_id().to_le_bytes());
        let mut buf = acq.get_buf_write();
        buf[..chunk.len()].copy_from_slice(chunk);
    }
    BlobRef { encoded }
}

/// Exposes the blob's bytes to `viewer`, which must not retain them beyond
/// the call.
pub fn read_blob(txn: &Transaction, blob: &BlobRef, viewer: impl FnOnce(&[u8])) {
    if let Some(payload) = blob.inline_payload() {
        viewer(payload);
        return;
    }
    let (total_len, ids) = blob.indirect_parts().unwrap();
    let block_size = txn.block_size();
    let mut assembled = Vec::with_capacity(total_len);
    for id in ids {
        let acq = Acquisition::read(txn, id);
        let buf = acq.get_buf_read();
        let take = block_size.min(total_len - assembled.len());
        assembled.extend_from_slice(&buf[..take]);
    }
    viewer(&assembled);
}

/// Releases the blob's chunk blocks. Inline references own no blocks.
pub fn free_blob(txn: &Transaction, blob: &BlobRef) {
    let Some((_, ids)) = blob.indirect_parts() else {
        return;
    };
    for id in ids {
        let mut acq = Acquisition::write(txn, id);
        acq.mark_deleted();
    }
}
