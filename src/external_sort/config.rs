use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use anyhow::Result;
use crate::constants::{BYTES_PER_KB, PERCENT_100};
use crate::external_sort::constants::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalSortConfig {
    /// Upper bound on the raw input bytes held in memory for one run.
    pub chunk_byte_budget: usize,
    pub memory_usage_percent: f64,
    pub io_buffer_size_kb: usize,
    pub merge_buffer_size_kb: usize,
    /// Most runs read at once by one merge; more than this triggers intermediate passes.
    pub max_merge_fan_in: usize,
    pub temp_directory: PathBuf,
    /// Where the staged output is written; next to the target when unset.
    pub staging_directory: Option<PathBuf>,
    pub deduplicate: bool,
    pub delete_sources: bool,
    pub parallel_sort: bool,
    pub verbose: bool,
}

impl Default for ExternalSortConfig {
    fn default() -> Self {
        Self {
            chunk_byte_budget: DEFAULT_CHUNK_BYTE_BUDGET,
            memory_usage_percent: DEFAULT_MEMORY_USAGE_PERCENT,
            io_buffer_size_kb: DEFAULT_IO_BUFFER_SIZE_KB,
            merge_buffer_size_kb: DEFAULT_MERGE_BUFFER_SIZE_KB,
            max_merge_fan_in: DEFAULT_MAX_MERGE_FAN_IN,
            temp_directory: std::env::temp_dir().join(TEMP_DIR_NAME),
            staging_directory: None,
            deduplicate: true,
            delete_sources: false,
            parallel_sort: true,
            verbose: false,
        }
    }
}

impl ExternalSortConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &std::path::Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_byte_budget < MIN_CHUNK_BYTE_BUDGET
            || self.chunk_byte_budget > MAX_CHUNK_BYTE_BUDGET {
            return Err(anyhow::anyhow!(
                "Chunk byte budget must be between {} and {} bytes",
                MIN_CHUNK_BYTE_BUDGET, MAX_CHUNK_BYTE_BUDGET
            ));
        }

        if self.memory_usage_percent < MIN_MEMORY_USAGE_PERCENT
            || self.memory_usage_percent > MAX_MEMORY_USAGE_PERCENT {
            return Err(anyhow::anyhow!(
                "Memory usage percent must be between {} and {}",
                MIN_MEMORY_USAGE_PERCENT, MAX_MEMORY_USAGE_PERCENT
            ));
        }

        for (name, value) in [
            ("IO buffer size", self.io_buffer_size_kb),
            ("Merge buffer size", self.merge_buffer_size_kb),
        ] {
            if value < MIN_BUFFER_SIZE_KB || value > MAX_BUFFER_SIZE_KB {
                return Err(anyhow::anyhow!(
                    "{} must be between {} and {} KB",
                    name, MIN_BUFFER_SIZE_KB, MAX_BUFFER_SIZE_KB
                ));
            }
        }

        if self.max_merge_fan_in < MIN_MERGE_FAN_IN {
            return Err(anyhow::anyhow!(
                "Merge fan-in must be at least {}",
                MIN_MERGE_FAN_IN
            ));
        }

        if self.temp_directory.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("Temp directory must not be empty"));
        }

        Ok(())
    }

    pub fn memory_limit_bytes(&self) -> usize {
        use sysinfo::System;
        let mut system = System::new();
        system.refresh_memory();

        let total_memory = system.total_memory() as f64;
        (total_memory * self.memory_usage_percent / PERCENT_100) as usize
    }

    /// The configured budget, capped by the share of RAM we are allowed to use. An unknown
    /// memory size leaves the budget as configured.
    pub fn effective_chunk_budget(&self) -> usize {
        match self.memory_limit_bytes() {
            0 => self.chunk_byte_budget,
            limit => self.chunk_byte_budget.min(limit),
        }
    }

    pub fn io_buffer_size_bytes(&self) -> usize {
        self.io_buffer_size_kb * BYTES_PER_KB
    }

    pub fn merge_buffer_size_bytes(&self) -> usize {
        self.merge_buffer_size_kb * BYTES_PER_KB
    }
}
