//! Build-time configuration constants.
//!
//! Values come from `lfkit.toml` (or the file named by the `LFKIT_CONFIG`
//! environment variable) and are validated and emitted by `build.rs`.
//! Semantic constants that the data-structure layouts depend on (pin slot
//! count, node width, tag bit positions) are *not* configurable and live
//! next to the types that own them.

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
