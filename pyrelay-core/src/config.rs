//! Bridge configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Options consulted when the peer is started and when values are encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Interpreter program followed by any extra arguments (e.g. `["python3", "-X", "utf8"]`).
    pub interpreter: Vec<String>,
    /// Arrays with more elements than this are exchanged through a file,
    /// provided `array_file_dir` is also set.
    pub array_file_threshold: Option<usize>,
    /// Directory both processes can read and write for array exchange.
    pub array_file_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            interpreter: vec![default_python().to_string()],
            array_file_threshold: None,
            array_file_dir: None,
        }
    }
}

fn default_python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

impl BridgeConfig {
    /// Defaults overridden by `PYRELAY_PYTHON`, `PYRELAY_ARRAY_FILE_THRESHOLD`
    /// and `PYRELAY_ARRAY_FILE_DIR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(python) = std::env::var("PYRELAY_PYTHON") {
            let parts: Vec<String> = python.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                config.interpreter = parts;
            }
        }

        if let Ok(threshold) = std::env::var("PYRELAY_ARRAY_FILE_THRESHOLD") {
            match threshold.trim().parse() {
                Ok(n) => config.array_file_threshold = Some(n),
                Err(e) => log::warn!(
                    "Ignoring PYRELAY_ARRAY_FILE_THRESHOLD={:?}: {}",
                    threshold,
                    e
                ),
            }
        }

        if let Ok(dir) = std::env::var("PYRELAY_ARRAY_FILE_DIR") {
            if !dir.is_empty() {
                config.array_file_dir = Some(PathBuf::from(dir));
            }
        }

        config
    }

    pub fn with_interpreter<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interpreter = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_array_files(mut self, dir: impl Into<PathBuf>, threshold: usize) -> Self {
        self.array_file_dir = Some(dir.into());
        self.array_file_threshold = Some(threshold);
        self
    }

    /// Directory to use for an array of `len` elements, if it must go through a file.
    pub fn array_file_target(&self, len: usize) -> Option<&PathBuf> {
        match (&self.array_file_dir, self.array_file_threshold) {
            (Some(dir), Some(threshold)) if len > threshold => Some(dir),
            _ => None,
        }
    }

    /// The part of the configuration the peer runtime needs.
    pub fn peer_settings(&self) -> PeerSettings {
        PeerSettings {
            array_file_threshold: self.array_file_threshold,
            array_file_dir: self
                .array_file_dir
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        }
    }
}

/// Settings shipped to the peer as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSettings {
    pub array_file_threshold: Option<usize>,
    pub array_file_dir: Option<String>,
}
