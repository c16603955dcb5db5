//! CMem payload codec: dynamic memory XORed against the pristine image,
//! trailing zeros trimmed, zero runs length-encoded.
//!
//! Wire form: a non-zero byte passes through; a zero byte is followed by
//! a count of *additional* zeros in the run (0-255).

use super::{QuetzalError, QuetzalErrorKind};

pub fn compress(dynamic: &[u8], original: &[u8]) -> Vec<u8> {
    let mut xor: Vec<u8> = dynamic
        .iter()
        .zip(original.iter())
        .map(|(a, b)| a ^ b)
        .collect();
    while xor.last() == Some(&0) {
        xor.pop();
    }

    let mut out = Vec::new();
    let mut i = 0;
    while i < xor.len() {
        if xor[i] != 0 {
            out.push(xor[i]);
            i += 1;
        } else {
            let mut run = 0u8;
            i += 1;
            while i < xor.len() && xor[i] == 0 && run < 255 {
                run += 1;
                i += 1;
            }
            out.push(0);
            out.push(run);
        }
    }
    out
}

/// Reconstruct dynamic memory from a CMem payload and the pristine
/// image. Data past the original length is a format violation.
pub fn decompress(cmem: &[u8], original: &[u8]) -> Result<Vec<u8>, QuetzalError> {
    let mut xor = vec![0u8; original.len()];
    let mut src = 0;
    let mut dst = 0;
    while src < cmem.len() {
        let byte = cmem[src];
        src += 1;
        let advance = if byte != 0 {
            if dst < xor.len() {
                xor[dst] = byte;
            }
            1
        } else {
            let run = if src < cmem.len() {
                let count = cmem[src] as usize + 1;
                src += 1;
                count
            } else {
                1
            };
            run
        };
        dst += advance;
        if dst > xor.len() {
            return Err(QuetzalError::new(
                QuetzalErrorKind::BadMemory,
                format!(
                    "compressed memory expands past dynamic region ({} > {})",
                    dst,
                    xor.len()
                ),
            ));
        }
    }

    Ok(xor
        .iter()
        .zip(original.iter())
        .map(|(a, b)| a ^ b)
        .collect())
}
