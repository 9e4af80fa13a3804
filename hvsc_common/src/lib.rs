//! HVSC Common Library
//!
//! Shared types and configuration loading for all HVSC workspace crates.
//!
//! # Module Structure
//!
//! - [`flags`] - Channel status word and related masks
//! - [`cache`] - Last-known channel/device readings (poll-updated)
//! - [`error`] - Core error taxonomy shared by all control paths
//! - [`config`] - TOML-backed configuration (checks file, supervisor file)

pub mod cache;
pub mod config;
pub mod error;
pub mod flags;

/// Normalize a channel display name into its condition key.
///
/// Spaces are elided so that `"gem top"` and `gemtop.vset` refer to the
/// same channel in condition text and override maps.
pub fn condition_key(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_key_elides_spaces() {
        assert_eq!(condition_key("gem top"), "gemtop");
        assert_eq!(condition_key("mesh  left"), "meshleft");
        assert_eq!(condition_key("cathode"), "cathode");
    }
}
