#![crate_name = "lantern"]

//! A Z-machine interpreter: loads an Infocom-format story file and runs
//! it against a pluggable UI boundary. Versions 1-5, 7 and 8 are
//! supported; the v6 screen model is not.

pub mod dictionary;
pub mod header;
pub mod instruction;
pub mod memory;
pub mod object;
pub mod ops;
pub mod quetzal;
pub mod snapshot;
pub mod text;
pub mod ui;
pub mod vm;
pub mod zrand;
