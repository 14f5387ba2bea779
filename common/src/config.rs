//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress all log output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics on shutdown
    pub print_summary: bool,
}

impl OutputConfig {
    /// Default filter directive implied by the verbosity level.
    pub fn level(&self) -> &'static str {
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Limits applied to every inbound message before anything touches the filesystem
#[derive(Debug, Clone, Copy)]
pub struct MessageLimits {
    /// Longest accepted file name or path, in bytes
    pub max_name_len: usize,
    /// Largest accepted file body, in bytes
    pub max_body_size: u64,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_name_len: crate::filename::DEFAULT_MAX_NAME_LEN,
            max_body_size: 1024 * 1024 * 1024,
        }
    }
}

impl MessageLimits {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.max_name_len == 0 {
            return Err("max_name_len must be at least 1".to_string());
        }
        if self.max_name_len > u32::MAX as usize {
            return Err("max_name_len must fit in the 32-bit length field".to_string());
        }
        Ok(())
    }
}
