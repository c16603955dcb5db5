//! IFF container plumbing for Quetzal files: `FORM` + body length +
//! `IFZS` + chunks, each chunk padded to an even boundary.

use super::{QuetzalError, QuetzalErrorKind};

pub const FORM_TYPE: &[u8; 4] = b"IFZS";

/// Build one chunk: 4-byte id, 4-byte big-endian length, data, pad byte.
pub fn write_chunk(id: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len() + 1);
    out.extend_from_slice(id);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 != 0 {
        out.push(0);
    }
    out
}

/// Wrap chunk bodies in the outer FORM/IFZS container.
pub fn write_form(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + body.len());
    out.extend_from_slice(b"FORM");
    out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(FORM_TYPE);
    out.extend_from_slice(body);
    out
}

/// Validate the container and return `(id, data)` per chunk, in order.
pub fn parse_form(data: &[u8]) -> Result<Vec<([u8; 4], &[u8])>, QuetzalError> {
    if data.len() < 12 {
        return Err(QuetzalError::new(
            QuetzalErrorKind::BadContainer,
            "save file too short for an IFF header",
        ));
    }
    if &data[0..4] != b"FORM" {
        return Err(QuetzalError::new(
            QuetzalErrorKind::BadContainer,
            "not an IFF file (missing FORM)",
        ));
    }
    if &data[8..12] != FORM_TYPE {
        return Err(QuetzalError::new(
            QuetzalErrorKind::BadContainer,
            "not a Quetzal save (missing IFZS)",
        ));
    }

    let mut chunks = Vec::new();
    let mut pos = 12;
    while pos + 8 <= data.len() {
        let mut id = [0u8; 4];
        id.copy_from_slice(&data[pos..pos + 4]);
        let length =
            u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
                as usize;
        if pos + 8 + length > data.len() {
            return Err(QuetzalError::new(
                QuetzalErrorKind::BadContainer,
                format!(
                    "chunk {} claims {} bytes past end of file",
                    String::from_utf8_lossy(&id),
                    length
                ),
            ));
        }
        chunks.push((id, &data[pos + 8..pos + 8 + length]));
        pos += 8 + length;
        if length % 2 != 0 {
            pos += 1;
        }
    }
    Ok(chunks)
}

pub fn find_chunk<'a>(chunks: &[([u8; 4], &'a [u8])], id: &[u8; 4]) -> Option<&'a [u8]> {
    chunks
        .iter()
        .find(|(chunk_id, _)| chunk_id == id)
        .map(|&(_, data)| data)
}
