use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the store and its driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub pool: PoolConfig,
    pub simulation: SimulationConfig,
}

impl StoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Configuration specific to the frame pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of frames preallocated by the pool.
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { capacity: 8 }
    }
}

/// Parameters of the pipeline simulation run by the command line driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Frames pushed through the pipeline.
    pub frames: u64,
    /// Every n-th frame is a dummy frame; 0 disables dummies.
    pub dummy_every: u64,
    /// Frames whose id is a multiple of this are deep cloned for
    /// reprocessing; 0 disables reprocessing.
    pub reprocess_every: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            frames: 32,
            dummy_every: 0,
            reprocess_every: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = StoreConfig::from_json_str(r#"{ "pool": { "capacity": 3 } }"#).unwrap();
        assert_eq!(config.pool.capacity, 3);
        assert_eq!(config.simulation, SimulationConfig::default());
    }

    #[test]
    fn simulation_intervals_are_read_and_partial_fields_default() {
        let config = StoreConfig::from_json_str(
            r#"{ "simulation": { "dummy_every": 4, "reprocess_every": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.simulation.frames, SimulationConfig::default().frames);
        assert_eq!(config.simulation.dummy_every, 4);
        assert_eq!(config.simulation.reprocess_every, 5);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = StoreConfig::from_json_str("{ pool: ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = StoreConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
