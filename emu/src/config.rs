use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Emulator configuration, typically deserialized from the host's config
/// file.
#[derive(Default, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Boot directly into the cartridge with the post-BIOS register state
    /// instead of running the BIOS intro.
    pub skip_bios: bool,
    /// Where the cartridge backup image is persisted. Defaults to the ROM
    /// path with an `.sav` extension.
    pub save_path: Option<PathBuf>,
}
