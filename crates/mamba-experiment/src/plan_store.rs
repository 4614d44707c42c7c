//! Scan plans persisted as `<dir>/plan_<name>.yaml`.
//!
//! ```yaml
//! name: overview
//! detectors: [det]
//! motors:
//!   - { name: my, start: 0, stop: 2, point_num: 2 }
//!   - { name: mx, start: 0, stop: 1, point_num: 3 }
//! ```
//!
//! Motors are listed slowest first. Malformed files are skipped with a
//! warning when listing.

use mamba_core::{MambaError, MambaResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

static PLAN_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^plan_(?P<name>.+)\.(yaml|yml)$").expect("Invalid plan file regex")
});
static PLAN_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").expect("Invalid plan name regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorRange {
    pub name: String,
    pub start: f64,
    pub stop: f64,
    pub point_num: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    pub name: String,
    #[serde(default)]
    pub detectors: Vec<String>,
    #[serde(default)]
    pub motors: Vec<MotorRange>,
    #[serde(default)]
    pub snake: bool,
}

impl ScanPlan {
    pub fn num_points(&self) -> u64 {
        self.motors.iter().map(|m| m.point_num).product()
    }
}

/// Directory of plan files.
#[derive(Debug, Clone)]
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn validate(name: &str) -> MambaResult<()> {
        if PLAN_NAME.is_match(name) {
            Ok(())
        } else {
            Err(MambaError::Syntax(format!("invalid plan name '{}'", name)))
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("plan_{}.yaml", name))
    }

    fn find(&self, name: &str) -> Option<PathBuf> {
        ["yaml", "yml"]
            .iter()
            .map(|ext| self.dir.join(format!("plan_{}.{}", name, ext)))
            .find(|p| p.is_file())
    }

    fn load(path: &Path) -> MambaResult<ScanPlan> {
        let text = fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| MambaError::Syntax(format!("{}: {}", path.display(), e)))
    }

    /// Every well-formed plan, by name.
    pub fn load_all(&self) -> MambaResult<BTreeMap<String, ScanPlan>> {
        let mut plans = BTreeMap::new();
        if !self.dir.is_dir() {
            debug!(dir = %self.dir.display(), "plan directory does not exist");
            return Ok(plans);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(file) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            let Some(caps) = PLAN_FILE.captures(file) else {
                continue;
            };
            let name = caps["name"].to_string();
            match Self::load(&path) {
                Ok(plan) => {
                    plans.insert(name, plan);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "skipping malformed plan"),
            }
        }
        Ok(plans)
    }

    pub fn list(&self) -> MambaResult<Vec<String>> {
        Ok(self.load_all()?.into_keys().collect())
    }

    pub fn get_plan(&self, name: &str) -> MambaResult<ScanPlan> {
        Self::validate(name)?;
        let path = self
            .find(name)
            .ok_or_else(|| MambaError::Key(format!("no plan named '{}'", name)))?;
        Self::load(&path)
    }

    /// Store `plan` under `name`, replacing any previous version.
    pub fn set_plan(&self, name: &str, plan: &ScanPlan) -> MambaResult<()> {
        Self::validate(name)?;
        fs::create_dir_all(&self.dir)?;
        let text = serde_yaml::to_string(plan)
            .map_err(|e| MambaError::Syntax(format!("cannot encode plan: {}", e)))?;
        if let Some(old) = self.find(name) {
            fs::remove_file(old)?;
        }
        fs::write(self.path(name), text)?;
        debug!(plan = %name, "plan stored");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> MambaResult<()> {
        Self::validate(name)?;
        let path = self
            .find(name)
            .ok_or_else(|| MambaError::Key(format!("no plan named '{}'", name)))?;
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ScanPlan {
        ScanPlan {
            name: "overview".into(),
            detectors: vec!["det".into()],
            motors: vec![
                MotorRange {
                    name: "my".into(),
                    start: 0.0,
                    stop: 2.0,
                    point_num: 2,
                },
                MotorRange {
                    name: "mx".into(),
                    start: 0.0,
                    stop: 1.0,
                    point_num: 3,
                },
            ],
            snake: true,
        }
    }

    #[test]
    fn set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path());
        store.set_plan("overview", &sample()).unwrap();
        assert_eq!(store.get_plan("overview").unwrap(), sample());
        assert_eq!(store.list().unwrap(), vec!["overview"]);
        assert_eq!(sample().num_points(), 6);
    }

    #[test]
    fn malformed_and_foreign_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plan_broken.yml"), "name: [unclosed").unwrap();
        fs::write(dir.path().join("notes.yaml"), "name: x").unwrap();
        fs::write(dir.path().join("plan_short.yml"), "name: short\n").unwrap();
        let store = PlanStore::new(dir.path());
        assert_eq!(store.list().unwrap(), vec!["short"]);
        assert!(store.get_plan("broken").is_err());
    }

    #[test]
    fn names_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let store = PlanStore::new(dir.path());
        let err = store.set_plan("../escape", &sample()).unwrap_err();
        assert_eq!(err.kind(), mamba_core::ErrorKind::Syntax);
        assert_eq!(
            store.get_plan("missing").unwrap_err().kind(),
            mamba_core::ErrorKind::Key
        );
        store.set_plan("a", &sample()).unwrap();
        store.remove("a").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let store = PlanStore::new("/nonexistent/mamba/plans");
        assert!(store.list().unwrap().is_empty());
    }
}
