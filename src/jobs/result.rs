//! Typed calculation results read from a completed job's work path.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of batch calculation. Decides which result shape is expected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CalcKind {
    Relaxation,
    Scf,
    Nscf,
    Other(String),
}

impl CalcKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Relaxation => "relaxation",
            Self::Scf => "scf",
            Self::Nscf => "nscf",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for CalcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for CalcKind {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "relaxation" | "relax" => Self::Relaxation,
            "scf" => Self::Scf,
            "nscf" => Self::Nscf,
            _ => Self::Other(s.trim().to_string()),
        }
    }
}

impl Serialize for CalcKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CalcKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Band gap as reported by the electronic-structure code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandGap {
    pub energy: f64,
    pub direct: bool,
    #[serde(default)]
    pub transition: Option<String>,
}

/// Result of a completed calculation, one variant per known shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "fields", rename_all = "snake_case")]
pub enum CalcResult {
    Relaxation {
        total_energy: f64,
        max_force: f64,
        stress: Vec<Vec<f64>>,
        ionic_steps: u32,
    },
    Scf {
        total_energy: f64,
        efermi: f64,
        band_gap: BandGap,
        is_metal: bool,
    },
    Nscf {
        efermi: f64,
        band_gap: BandGap,
        is_metal: bool,
    },
    Unknown(serde_json::Value),
}

#[derive(Deserialize)]
struct RelaxationFields {
    total_energy: f64,
    max_force: f64,
    stress: Vec<Vec<f64>>,
    ionic_steps: u32,
}

#[derive(Deserialize)]
struct ScfFields {
    total_energy: f64,
    efermi: f64,
    band_gap: BandGap,
    is_metal: bool,
}

#[derive(Deserialize)]
struct NscfFields {
    efermi: f64,
    band_gap: BandGap,
    is_metal: bool,
}

impl CalcResult {
    /// Decode a raw artifact according to `kind`.
    pub fn decode(kind: &CalcKind, raw: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            CalcKind::Relaxation => {
                let f: RelaxationFields = serde_json::from_value(raw)?;
                Self::Relaxation {
                    total_energy: f.total_energy,
                    max_force: f.max_force,
                    stress: f.stress,
                    ionic_steps: f.ionic_steps,
                }
            }
            CalcKind::Scf => {
                let f: ScfFields = serde_json::from_value(raw)?;
                Self::Scf {
                    total_energy: f.total_energy,
                    efermi: f.efermi,
                    band_gap: f.band_gap,
                    is_metal: f.is_metal,
                }
            }
            CalcKind::Nscf => {
                let f: NscfFields = serde_json::from_value(raw)?;
                Self::Nscf {
                    efermi: f.efermi,
                    band_gap: f.band_gap,
                    is_metal: f.is_metal,
                }
            }
            CalcKind::Other(_) => Self::Unknown(raw),
        })
    }

    /// Flat field map, merged into job records when they are logged.
    pub fn fields(&self) -> serde_json::Map<String, serde_json::Value> {
        let value = match serde_json::to_value(self) {
            Ok(v) => v,
            Err(_) => return serde_json::Map::new(),
        };
        match value.get("fields") {
            Some(serde_json::Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("result".to_string(), other.clone());
                map
            }
            None => serde_json::Map::new(),
        }
    }
}

/// Reads the output artifacts of a completed job.
#[async_trait]
pub trait ResultReader: Send + Sync {
    async fn read(&self, kind: &CalcKind, work_path: &Path) -> Result<CalcResult, String>;
}

/// Reads `<work_path>/<file_name>` as JSON.
pub struct JsonArtifactReader {
    file_name: String,
}

impl JsonArtifactReader {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

#[async_trait]
impl ResultReader for JsonArtifactReader {
    async fn read(&self, kind: &CalcKind, work_path: &Path) -> Result<CalcResult, String> {
        let path = work_path.join(&self.file_name);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| format!("Invalid JSON in {}: {e}", path.display()))?;
        CalcResult::decode(kind, value)
            .map_err(|e| format!("Unexpected {kind} result in {}: {e}", path.display()))
    }
}
