//! Pins file management (depot.resolved)
//!
//! The pins file records the checkout state every resolved package was bound
//! to. Entries are kept sorted by identity so the document is stable across
//! saves and friendly to version control.

use crate::fsutil;
use crate::identity::{PackageIdentity, PackageReference};
use crate::state::CheckoutState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Pins file name at the workspace root
pub const PINS_FILE_NAME: &str = "depot.resolved";

/// Pins file format version
pub const PINS_VERSION: u32 = 1;

/// Errors that can occur during pins file operations
#[derive(Debug, Error)]
pub enum PinsError {
    #[error("Failed to read pins file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse pins file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize pins file: {0}")]
    SerializeError(String),

    #[error("Invalid pins file: {0}")]
    ValidationError(String),
}

/// A pinned package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    pub package: PackageReference,
    pub state: CheckoutState,
}

#[derive(Debug, Serialize, Deserialize)]
struct PinsDocument {
    version: u32,
    #[serde(default)]
    pins: Vec<Pin>,
}

/// In-memory pins bound to their file
#[derive(Debug, Clone, PartialEq)]
pub struct PinsStore {
    path: PathBuf,
    pins: BTreeMap<PackageIdentity, Pin>,
}

impl PinsStore {
    /// Load pins from `path`; a missing file yields an empty store
    pub fn load(path: &Path) -> Result<Self, PinsError> {
        let mut store = PinsStore {
            path: path.to_path_buf(),
            pins: BTreeMap::new(),
        };
        if !path.exists() {
            return Ok(store);
        }
        let content = std::fs::read_to_string(path)?;
        let document: PinsDocument = toml::from_str(&content)?;
        if document.version != PINS_VERSION {
            return Err(PinsError::ValidationError(format!(
                "Unsupported pins file version: {} (expected {})",
                document.version, PINS_VERSION
            )));
        }
        for pin in document.pins {
            if store.pins.contains_key(&pin.package.identity) {
                return Err(PinsError::ValidationError(format!(
                    "'{}' is pinned more than once",
                    pin.package.identity
                )));
            }
            store.pins.insert(pin.package.identity.clone(), pin);
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the pins file exists on disk
    pub fn file_exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the pins; an empty store removes the file
    pub fn save(&self) -> Result<(), PinsError> {
        if self.pins.is_empty() {
            fsutil::remove_path(&self.path)?;
            return Ok(());
        }
        let document = PinsDocument {
            version: PINS_VERSION,
            pins: self.pins.values().cloned().collect(),
        };
        let content =
            toml::to_string_pretty(&document).map_err(|e| PinsError::SerializeError(e.to_string()))?;
        fsutil::write_atomic(&self.path, content.as_bytes())?;
        Ok(())
    }

    pub fn pin(&mut self, package: PackageReference, state: CheckoutState) {
        self.pins
            .insert(package.identity.clone(), Pin { package, state });
    }

    pub fn unpin(&mut self, identity: &PackageIdentity) -> Option<Pin> {
        self.pins.remove(identity)
    }

    pub fn get(&self, identity: &PackageIdentity) -> Option<&Pin> {
        self.pins.get(identity)
    }

    /// Pins ordered by identity
    pub fn iter(&self) -> impl Iterator<Item = &Pin> {
        self.pins.values()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn clear(&mut self) {
        self.pins.clear();
    }

    /// Checkout states by identity, used as resolver hints
    pub fn states(&self) -> BTreeMap<PackageIdentity, CheckoutState> {
        self.pins
            .iter()
            .map(|(identity, pin)| (identity.clone(), pin.state.clone()))
            .collect()
    }
}
