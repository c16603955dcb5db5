//! Quetzal (IFF/IFZS) save files: the standard interchange format for
//! Z-machine state. Byte-exact with other interpreters.
//!
//! `save` serializes to an in-memory buffer; `restore` validates the
//! whole file before touching the machine, so a failed restore leaves
//! state unchanged.

pub mod cmem;
pub mod iff;

use crate::vm::{Frame, ZMachine};
use log::debug;
use std::fmt;

/// Which contract a malformed save file broke. These are recoverable:
/// the opcode handlers report failure to the story and keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuetzalErrorKind {
    BadContainer,
    MissingChunk,
    StoryMismatch,
    BadMemory,
    BadFrames,
}

#[derive(Debug, Clone)]
pub struct QuetzalError {
    pub kind: QuetzalErrorKind,
    pub message: String,
}

impl QuetzalError {
    pub fn new(kind: QuetzalErrorKind, message: impl Into<String>) -> Self {
        QuetzalError {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for QuetzalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for QuetzalError {}

impl From<QuetzalError> for String {
    fn from(error: QuetzalError) -> String {
        error.to_string()
    }
}

/// Serialize machine state. `pc` is the continuation the restored
/// machine should resume at (the caller computes the save instruction's
/// success path).
pub fn save(zm: &ZMachine, pc: usize) -> Vec<u8> {
    let header = zm.header();

    let mut ifhd = Vec::with_capacity(13);
    ifhd.extend_from_slice(&header.release().to_be_bytes());
    ifhd.extend_from_slice(&header.serial_number());
    ifhd.extend_from_slice(&header.checksum().to_be_bytes());
    ifhd.push((pc >> 16) as u8);
    ifhd.push((pc >> 8) as u8);
    ifhd.push(pc as u8);

    let static_addr = header.static_memory_addr();
    let dynamic = zm.memory.slice(0, static_addr);
    let cmem = cmem::compress(dynamic, &zm.original_dynamic);

    let mut stks = Vec::new();
    for frame in &zm.frames {
        stks.extend_from_slice(&frame.to_bytes());
    }

    let body = [
        iff::write_chunk(b"IFhd", &ifhd),
        iff::write_chunk(b"CMem", &cmem),
        iff::write_chunk(b"Stks", &stks),
    ]
    .concat();
    iff::write_form(&body)
}

/// Validate `data` against the loaded story and, if everything checks
/// out, replace dynamic memory, the frame stack and the PC.
pub fn restore(zm: &mut ZMachine, data: &[u8]) -> Result<(), QuetzalError> {
    let chunks = iff::parse_form(data)?;

    let ifhd = iff::find_chunk(&chunks, b"IFhd")
        .ok_or_else(|| QuetzalError::new(QuetzalErrorKind::MissingChunk, "missing IFhd chunk"))?;
    if ifhd.len() < 13 {
        return Err(QuetzalError::new(
            QuetzalErrorKind::BadContainer,
            format!("IFhd chunk too short: {} bytes", ifhd.len()),
        ));
    }

    let release = u16::from_be_bytes([ifhd[0], ifhd[1]]);
    let serial = &ifhd[2..8];
    let checksum = u16::from_be_bytes([ifhd[8], ifhd[9]]);
    let pc = ((ifhd[10] as usize) << 16) | ((ifhd[11] as usize) << 8) | ifhd[12] as usize;

    let header = zm.header();
    if release != header.release() {
        return Err(QuetzalError::new(
            QuetzalErrorKind::StoryMismatch,
            format!("release mismatch: save {}, story {}", release, header.release()),
        ));
    }
    if serial != header.serial_number() {
        return Err(QuetzalError::new(
            QuetzalErrorKind::StoryMismatch,
            "serial number mismatch",
        ));
    }
    if checksum != header.checksum() {
        return Err(QuetzalError::new(
            QuetzalErrorKind::StoryMismatch,
            format!(
                "checksum mismatch: save {:#06x}, story {:#06x}",
                checksum,
                header.checksum()
            ),
        ));
    }

    let static_addr = header.static_memory_addr();
    let dynamic = if let Some(cmem) = iff::find_chunk(&chunks, b"CMem") {
        cmem::decompress(cmem, &zm.original_dynamic)?
    } else if let Some(umem) = iff::find_chunk(&chunks, b"UMem") {
        if umem.len() > static_addr {
            return Err(QuetzalError::new(
                QuetzalErrorKind::BadMemory,
                format!(
                    "UMem payload of {} bytes exceeds dynamic region of {}",
                    umem.len(),
                    static_addr
                ),
            ));
        }
        umem.to_vec()
    } else {
        return Err(QuetzalError::new(
            QuetzalErrorKind::MissingChunk,
            "missing CMem or UMem chunk",
        ));
    };

    let stks = iff::find_chunk(&chunks, b"Stks")
        .ok_or_else(|| QuetzalError::new(QuetzalErrorKind::MissingChunk, "missing Stks chunk"))?;
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < stks.len() {
        let (frame, consumed) = Frame::from_bytes(&stks[pos..])
            .map_err(|e| QuetzalError::new(QuetzalErrorKind::BadFrames, e))?;
        frames.push(frame);
        pos += consumed;
    }
    if frames.is_empty() {
        return Err(QuetzalError::new(
            QuetzalErrorKind::BadFrames,
            "Stks chunk holds no frames",
        ));
    }

    // Everything validated; commit.
    zm.memory
        .write_slice(0, &dynamic)
        .map_err(|e| QuetzalError::new(QuetzalErrorKind::BadMemory, e))?;
    zm.frames = frames;
    zm.pc = pc;
    debug!(
        "restored state: pc {:#06x}, {} frames, {} dynamic bytes",
        pc,
        zm.frames.len(),
        dynamic.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::test_support::{push_test_frame, test_machine};

    #[test]
    fn test_save_produces_iff_form() {
        let zm = test_machine(3);
        let data = save(&zm, zm.pc);
        assert_eq!(&data[0..4], b"FORM");
        assert_eq!(&data[8..12], b"IFZS");
    }

    #[test]
    fn test_save_restore_round_trip() {
        let mut zm = test_machine(3);
        push_test_frame(&mut zm, 3);
        zm.write_variable(2, 0x1234).unwrap();
        zm.stack_push(77);
        zm.write_global(10, 0xABCD).unwrap();
        zm.pc = 0x0543;

        let data = save(&zm, zm.pc);

        // Wreck the live state, then restore
        zm.pc = 0x0100;
        zm.frames.truncate(1);
        zm.write_global(10, 0).unwrap();

        restore(&mut zm, &data).unwrap();
        assert_eq!(zm.pc, 0x0543);
        assert_eq!(zm.frames.len(), 2);
        assert_eq!(zm.read_variable(2).unwrap(), 0x1234);
        assert_eq!(zm.stack_pop().unwrap(), 77);
        assert_eq!(zm.read_global(10).unwrap(), 0xABCD);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let mut zm = test_machine(3);
        let err = restore(&mut zm, b"not a save file").unwrap_err();
        assert_eq!(err.kind, QuetzalErrorKind::BadContainer);
    }

    #[test]
    fn test_restore_rejects_missing_chunks() {
        let mut zm = test_machine(3);

        // No IFhd at all
        let body = iff::write_chunk(b"CMem", &[]);
        let err = restore(&mut zm, &iff::write_form(&body)).unwrap_err();
        assert_eq!(err.kind, QuetzalErrorKind::MissingChunk);

        // Valid IFhd but no memory chunk
        let good = save(&zm, zm.pc);
        let chunks = iff::parse_form(&good).unwrap();
        let ifhd = iff::find_chunk(&chunks, b"IFhd").unwrap().to_vec();
        let body = iff::write_chunk(b"IFhd", &ifhd);
        let err = restore(&mut zm, &iff::write_form(&body)).unwrap_err();
        assert_eq!(err.kind, QuetzalErrorKind::MissingChunk);
    }

    #[test]
    fn test_restore_rejects_story_mismatch() {
        let mut zm = test_machine(3);
        let mut data = save(&zm, zm.pc);
        // IFhd data starts at byte 20 (12 header + 8 chunk header);
        // corrupt the release word
        data[20] = 0xFF;
        let err = restore(&mut zm, &data).unwrap_err();
        assert_eq!(err.kind, QuetzalErrorKind::StoryMismatch);
    }

    #[test]
    fn test_failed_restore_leaves_state_unchanged() {
        let mut zm = test_machine(3);
        zm.write_global(5, 0x5555).unwrap();
        let mut data = save(&zm, zm.pc);
        zm.write_global(5, 0x7777).unwrap();
        zm.pc = 0x0123;

        data[20] = 0xFF; // release mismatch
        assert!(restore(&mut zm, &data).is_err());
        assert_eq!(zm.read_global(5).unwrap(), 0x7777);
        assert_eq!(zm.pc, 0x0123);
    }

    #[test]
    fn test_restore_accepts_umem() {
        let mut zm = test_machine(3);
        zm.write_global(3, 0x9999).unwrap();
        let static_addr = zm.header().static_memory_addr();
        let umem = zm.memory.slice(0, static_addr).to_vec();

        let good = save(&zm, 0x0567);
        let chunks = iff::parse_form(&good).unwrap();
        let ifhd = iff::find_chunk(&chunks, b"IFhd").unwrap().to_vec();
        let stks = iff::find_chunk(&chunks, b"Stks").unwrap().to_vec();

        zm.write_global(3, 0).unwrap();
        let body = [
            iff::write_chunk(b"IFhd", &ifhd),
            iff::write_chunk(b"UMem", &umem),
            iff::write_chunk(b"Stks", &stks),
        ]
        .concat();
        restore(&mut zm, &iff::write_form(&body)).unwrap();
        assert_eq!(zm.read_global(3).unwrap(), 0x9999);
        assert_eq!(zm.pc, 0x0567);
    }

    #[test]
    fn test_restore_rejects_oversize_umem() {
        let mut zm = test_machine(3);
        let static_addr = zm.header().static_memory_addr();

        let good = save(&zm, zm.pc);
        let chunks = iff::parse_form(&good).unwrap();
        let ifhd = iff::find_chunk(&chunks, b"IFhd").unwrap().to_vec();
        let stks = iff::find_chunk(&chunks, b"Stks").unwrap().to_vec();

        let body = [
            iff::write_chunk(b"IFhd", &ifhd),
            iff::write_chunk(b"UMem", &vec![0u8; static_addr + 1]),
            iff::write_chunk(b"Stks", &stks),
        ]
        .concat();
        let err = restore(&mut zm, &iff::write_form(&body)).unwrap_err();
        assert_eq!(err.kind, QuetzalErrorKind::BadMemory);
    }
}
