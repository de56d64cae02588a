//! Pending imaging metadata and the settings-file catalog.
//!
//! The device contract requires metadata to be posted before a trigger. At
//! most one entry is pending at a time; a later POST replaces the earlier one
//! (last write wins). The trigger path reads the last-set instance without
//! consuming it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

/// Group metadata of a plant, supplied ahead of a trigger call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingMetadata {
    #[serde(rename = "PlantId")]
    pub plant_id: String,
    #[serde(rename = "ExperimentId")]
    pub experiment_id: String,
    #[serde(rename = "TreatmentId")]
    pub treatment_id: String,
    /// Height at which the plant is elevated
    #[serde(rename = "Height")]
    pub height: f64,
    /// Angle at which the plant is rotated for imaging
    #[serde(rename = "Angle")]
    pub angle: f64,
}

/// At-most-one pending metadata entry, last write wins.
#[derive(Debug, Default)]
pub struct MetadataSlot {
    inner: Mutex<Option<ImagingMetadata>>,
}

impl MetadataSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending entry.
    pub fn set(&self, metadata: ImagingMetadata) {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(metadata);
    }

    /// The last-set entry, if any.
    pub fn current(&self) -> Option<ImagingMetadata> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Static list of imaging settings files plus the current selection.
///
/// The list is scanned once at startup; `PUT /settings/{name}` is a key
/// lookup over it.
#[derive(Debug, Default)]
pub struct SettingsCatalog {
    names: Vec<String>,
    selected: Mutex<Option<String>>,
}

impl SettingsCatalog {
    /// Build a catalog from an explicit name list.
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            selected: Mutex::new(None),
        }
    }

    /// Scan a directory for settings files, taking the file stems.
    pub fn from_dir(dir: &Path) -> Self {
        let mut names = Vec::new();
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let is_settings = matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("yaml" | "yml" | "toml")
                    );
                    if is_settings {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            names.push(stem.to_string());
                        }
                    }
                }
                names.sort();
                info!(dir = %dir.display(), count = names.len(), "Loaded settings files");
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Settings directory not readable");
            }
        }
        Self::new(names)
    }

    /// All known settings file names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Select a settings file by name. Returns false if the name is unknown.
    pub fn select(&self, name: &str) -> bool {
        if !self.names.iter().any(|n| n == name) {
            return false;
        }
        let mut selected = self.selected.lock().unwrap_or_else(|e| e.into_inner());
        *selected = Some(name.to_string());
        true
    }

    /// The currently selected settings file, if any.
    pub fn selected(&self) -> Option<String> {
        self.selected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(plant: &str) -> ImagingMetadata {
        ImagingMetadata {
            plant_id: plant.into(),
            experiment_id: "E".into(),
            treatment_id: "T".into(),
            height: 0.0,
            angle: 0.0,
        }
    }

    #[test]
    fn test_slot_last_write_wins() {
        let slot = MetadataSlot::new();
        assert!(slot.current().is_none());
        slot.set(metadata("A"));
        slot.set(metadata("B"));
        assert_eq!(slot.current().map(|m| m.plant_id).as_deref(), Some("B"));
    }

    #[test]
    fn test_current_does_not_consume() {
        let slot = MetadataSlot::new();
        slot.set(metadata("A"));
        assert!(slot.current().is_some());
        assert!(slot.current().is_some());
    }

    #[test]
    fn test_catalog_select_known_and_unknown() {
        let catalog = SettingsCatalog::new(vec!["fast".into(), "full".into()]);
        assert!(catalog.selected().is_none());
        assert!(catalog.select("full"));
        assert_eq!(catalog.selected().as_deref(), Some("full"));
        assert!(!catalog.select("missing"));
        // Failed select leaves the previous selection intact
        assert_eq!(catalog.selected().as_deref(), Some("full"));
    }

    #[test]
    fn test_catalog_from_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("fast.yaml"), "a: 1").expect("write");
        std::fs::write(dir.path().join("full.toml"), "a = 1").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "skip me").expect("write");

        let catalog = SettingsCatalog::from_dir(dir.path());
        assert_eq!(catalog.names(), &["fast".to_string(), "full".to_string()]);
    }

    #[test]
    fn test_catalog_from_missing_dir_is_empty() {
        let catalog = SettingsCatalog::from_dir(Path::new("no/such/dir"));
        assert!(catalog.names().is_empty());
    }
}
