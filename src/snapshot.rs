//! Whole-machine freeze/thaw as JSON, for embedding hosts that park a
//! running game between requests. Unlike Quetzal this captures the full
//! memory image and the PRNG state; it is not meant to interoperate
//! with other interpreters.

use crate::vm::{Frame, ZMachine};
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Snapshot {
    /// base64 of the entire memory buffer
    memory: String,
    pc: usize,
    /// per-frame byte records in the Quetzal Stks layout
    frames: Vec<Vec<u8>>,
    /// xorshift state as (high word, low word)
    rng_state: [u32; 2],
}

pub fn freeze(zm: &ZMachine) -> Result<String, String> {
    let snapshot = Snapshot {
        memory: base64::engine::general_purpose::STANDARD.encode(zm.memory.as_bytes()),
        pc: zm.pc,
        frames: zm.frames.iter().map(|f| f.to_bytes()).collect(),
        rng_state: zm.rng.state(),
    };
    serde_json::to_string(&snapshot).map_err(|e| format!("snapshot encode failed: {e}"))
}

pub fn thaw(zm: &mut ZMachine, json: &str) -> Result<(), String> {
    let snapshot: Snapshot =
        serde_json::from_str(json).map_err(|e| format!("snapshot parse failed: {e}"))?;
    let memory = base64::engine::general_purpose::STANDARD
        .decode(&snapshot.memory)
        .map_err(|e| format!("snapshot memory not valid base64: {e}"))?;
    if memory.len() != zm.memory.len() {
        return Err(format!(
            "snapshot memory is {} bytes, story is {}",
            memory.len(),
            zm.memory.len()
        ));
    }

    let mut frames = Vec::with_capacity(snapshot.frames.len());
    for record in &snapshot.frames {
        let (frame, consumed) = Frame::from_bytes(record)?;
        if consumed != record.len() {
            return Err("snapshot frame record has trailing bytes".to_string());
        }
        frames.push(frame);
    }
    if frames.is_empty() {
        return Err("snapshot holds no frames".to_string());
    }

    zm.memory.write_slice(0, &memory)?;
    zm.pc = snapshot.pc;
    zm.frames = frames;
    zm.rng.set_state(snapshot.rng_state);
    Ok(())
}
