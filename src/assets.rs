use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use anyhow::{anyhow, Context};
use image::DynamicImage;
use log::{debug, info, warn};
use crate::detect::{Detection, SlotDetector};
use crate::util::retry_io;

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// A bracket template for a fixed number of participants, with its analysis.
pub struct BracketTemplate {
    pub slots: usize,
    pub path: PathBuf,
    pub image: DynamicImage,
    pub detection: Detection,
}

/// Templates named by participant count (`4.png` holds the bracket for 4),
/// loaded and analysed on first use.
pub struct TemplateAssets {
    dir: PathBuf,
    detector: SlotDetector,
    cache: Mutex<HashMap<usize, Option<Arc<BracketTemplate>>>>,
}

impl TemplateAssets {
    pub fn new(dir: impl Into<PathBuf>, detector: SlotDetector) -> Self {
        Self { dir: dir.into(), detector, cache: Default::default() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, count: usize) -> Option<PathBuf> {
        EXTENSIONS.iter()
            .map(|ext| self.dir.join(format!("{count}.{ext}")))
            .find(|p| p.is_file())
    }

    /// Participant counts a template exists for.
    pub fn available(&self) -> Vec<usize> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut counts = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e.to_lowercase().as_str())))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<usize>().ok()))
            .collect::<Vec<_>>();
        counts.sort();
        counts.dedup();
        counts
    }

    /// `Ok(None)` when no template exists for `count`.
    pub fn get(&self, count: usize) -> anyhow::Result<Option<Arc<BracketTemplate>>> {
        if let Some(cached) = self.lock()?.get(&count) {
            return Ok(cached.clone());
        }
        let template = match self.path_for(count) {
            None => {
                warn!("No bracket template for {count} participants in {}", self.dir.to_string_lossy());
                None
            }
            Some(path) => Some(Arc::new(self.load(count, path)?)),
        };
        let mut cache = self.lock()?;
        Ok(cache.entry(count).or_insert(template).clone())
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<usize, Option<Arc<BracketTemplate>>>>> {
        self.cache.lock().map_err(|e| anyhow!("Template cache poisoned: {e}"))
    }

    fn load(&self, count: usize, path: PathBuf) -> anyhow::Result<BracketTemplate> {
        let data = retry_io(&format!("Reading template {}", path.to_string_lossy()), || std::fs::read(&path))
            .with_context(|| format!("Cannot read template {}", path.to_string_lossy()))?;
        let image = image::load_from_memory(&data)
            .with_context(|| format!("Cannot decode template {}", path.to_string_lossy()))?;
        let detection = self.detector.detect(&image);
        info!("Template {} analysed: {} markers, {} lines", path.to_string_lossy(), detection.markers.len(), detection.lines.len());
        if detection.markers.len().max(detection.lines.len()) < count {
            warn!("Template {} shows fewer slots than {count}", path.to_string_lossy());
        }
        debug!("Template {count} markers: {:?}", detection.markers);
        Ok(BracketTemplate { slots: count, path, image, detection })
    }
}
