//! Wake-word model catalog exposed over the serial link.
//!
//! Scans the model directory for `*.tflite` files, keeps up to 16 entries
//! and maintains the 16-bit enable mask (bit `i` ⇔ entry `i` enabled).

use std::path::{Path, PathBuf};

use serial_protocol::{WwConf, WwEntryStatus};

use crate::error::{Result, VozError};

pub const MAX_ENTRIES: usize = 16;
const NAME_BYTES: usize = 32;
const DEFAULT_THRESHOLD: f32 = 0.5;
const DEFAULT_PATIENCE: u8 = 1;

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub path: PathBuf,
    pub name: String,
    pub enabled: bool,
    pub threshold: f32,
    pub patience: u8,
}

#[derive(Debug, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    mask: u16,
}

impl Catalog {
    /// Scans `dir` for models. Entry 0 is enabled by default so a freshly
    /// booted bridge can enter wake-word mode without configuration.
    pub fn load(dir: &Path) -> Result<Catalog> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| {
                VozError::Config(format!("cannot read model directory {}: {}", dir.display(), e))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "tflite"))
            .collect();
        paths.sort();

        if paths.len() > MAX_ENTRIES {
            log::warn!(
                "model directory holds {} models, keeping the first {}",
                paths.len(),
                MAX_ENTRIES
            );
            paths.truncate(MAX_ENTRIES);
        }

        let entries: Vec<CatalogEntry> = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                CatalogEntry {
                    name: truncate_name(&stem),
                    path,
                    enabled: i == 0,
                    threshold: DEFAULT_THRESHOLD,
                    patience: DEFAULT_PATIENCE,
                }
            })
            .collect();

        let mut catalog = Catalog { entries, mask: 0 };
        catalog.recompute_mask();
        log::info!("wake-word catalog: {} entries, mask {:#06x}", catalog.len(), catalog.mask);
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn mask(&self) -> u16 {
        self.mask
    }

    /// Applies a host configuration to the referenced entry and returns the
    /// status echo.
    pub fn apply(&mut self, conf: &WwConf) -> Result<WwEntryStatus> {
        let index = conf.index as usize;
        let entry = self.entries.get_mut(index).ok_or_else(|| {
            VozError::Config(format!("no catalog entry {}", conf.index))
        })?;
        entry.enabled = conf.enabled != 0;
        entry.threshold = conf.threshold.clamp(0.0, 1.0);
        entry.patience = conf.patience.max(1);
        self.recompute_mask();
        Ok(self.status_of(index))
    }

    pub fn clear_enabled(&mut self) {
        for entry in &mut self.entries {
            entry.enabled = false;
        }
        self.recompute_mask();
    }

    pub fn status_of(&self, index: usize) -> WwEntryStatus {
        let entry = &self.entries[index];
        WwEntryStatus::new(
            &entry.name,
            WwConf {
                index: index as u8,
                enabled: u8::from(entry.enabled),
                threshold: entry.threshold,
                patience: entry.patience,
            },
        )
    }

    pub fn statuses(&self) -> Vec<WwEntryStatus> {
        (0..self.entries.len()).map(|i| self.status_of(i)).collect()
    }

    /// Model specs for the detector's command line, enabled entries only.
    /// The entry index doubles as the reported wake-word name so matches
    /// can be translated back without a lookup table.
    pub fn enabled_specs(&self) -> Vec<String> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.enabled)
            .map(|(i, e)| {
                format!("{}:{}:{}:{}", e.path.display(), i, e.threshold, e.patience)
            })
            .collect()
    }

    fn recompute_mask(&mut self) {
        self.mask = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.enabled)
            .fold(0u16, |mask, (i, _)| mask | (1 << i));
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() <= NAME_BYTES {
        return name.to_string();
    }
    let mut end = NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn model_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            File::create(dir.path().join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn scans_only_tflite_files_and_enables_entry_zero() {
        let dir = model_dir(&["beta.tflite", "alpha.tflite", "notes.txt"]);
        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.len(), 2);
        // Sorted scan: alpha first, and enabled by default.
        assert_eq!(catalog.entries()[0].name, "alpha");
        assert!(catalog.entries()[0].enabled);
        assert!(!catalog.entries()[1].enabled);
        assert_eq!(catalog.mask(), 0b01);
    }

    #[test]
    fn apply_updates_entry_and_mask() {
        let dir = model_dir(&["a.tflite", "b.tflite"]);
        let mut catalog = Catalog::load(dir.path()).unwrap();

        let echo = catalog
            .apply(&WwConf { index: 1, enabled: 1, threshold: 0.6, patience: 2 })
            .unwrap();
        assert_eq!(echo.name(), "b");
        assert_eq!(echo.conf.enabled, 1);
        assert_eq!(catalog.mask(), 0b11);

        catalog.apply(&WwConf { index: 0, enabled: 0, threshold: 0.5, patience: 1 }).unwrap();
        assert_eq!(catalog.mask(), 0b10);

        assert!(catalog.apply(&WwConf { index: 9, ..WwConf::default() }).is_err());
    }

    #[test]
    fn apply_clamps_threshold_and_patience() {
        let dir = model_dir(&["a.tflite"]);
        let mut catalog = Catalog::load(dir.path()).unwrap();
        let echo = catalog
            .apply(&WwConf { index: 0, enabled: 1, threshold: 7.5, patience: 0 })
            .unwrap();
        assert_eq!(echo.conf.threshold, 1.0);
        assert_eq!(echo.conf.patience, 1);
    }

    #[test]
    fn clear_disables_everything() {
        let dir = model_dir(&["a.tflite", "b.tflite"]);
        let mut catalog = Catalog::load(dir.path()).unwrap();
        catalog.clear_enabled();
        assert_eq!(catalog.mask(), 0);
        assert!(catalog.entries().iter().all(|e| !e.enabled));
    }

    #[test]
    fn enabled_specs_use_the_entry_index_as_name() {
        let dir = model_dir(&["a.tflite", "b.tflite"]);
        let mut catalog = Catalog::load(dir.path()).unwrap();
        catalog.apply(&WwConf { index: 1, enabled: 1, threshold: 0.25, patience: 3 }).unwrap();
        let specs = catalog.enabled_specs();
        assert_eq!(specs.len(), 2);
        assert!(specs[0].ends_with("a.tflite:0:0.5:1"));
        assert!(specs[1].ends_with("b.tflite:1:0.25:3"));
    }

    #[test]
    fn long_names_truncate_on_byte_budget() {
        let long = "w".repeat(40);
        assert_eq!(truncate_name(&long).len(), 32);
        assert_eq!(truncate_name("short"), "short");
    }
}
