//! Run configuration
//!
//! A [`RunConfig`] comes from an optional TOML file, then `BATCHLOOP_*`
//! environment variables override individual fields.

use crate::error::{LoopError, LoopResult};
use crate::parallel::ParallelMode;
use crate::unit::{limit_from, SplitPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the worker binary looked up next to the current executable
pub const WORKER_PROGRAM_NAME: &str = "batchloop-worker";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub quiet: bool,
    pub parallel_mode: ParallelMode,
    /// Worker threads of the in-process pool
    pub processes: usize,
    /// Concurrent detached workers; unlimited when absent
    pub max_workers: Option<usize>,
    /// Files and directories shipped to workers in the runtime-module archive
    pub user_modules: Vec<PathBuf>,
    /// Extra lines appended to every HTCondor submit description
    pub htcondor_job_desc_extra: Vec<String>,
    pub max_events_per_dataset: i64,
    pub max_events_per_process: i64,
    pub max_files_per_dataset: i64,
    pub max_files_per_process: i64,
    pub working_area_root: Option<PathBuf>,
    pub worker_program: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub collect_timeout_secs: Option<u64>,
    pub lock_timeout_secs: u64,
    pub profile: bool,
    pub profile_out_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            quiet: false,
            parallel_mode: ParallelMode::InProcess,
            processes: 8,
            max_workers: None,
            user_modules: Vec::new(),
            htcondor_job_desc_extra: Vec::new(),
            max_events_per_dataset: -1,
            max_events_per_process: -1,
            max_files_per_dataset: -1,
            max_files_per_process: 1,
            working_area_root: None,
            worker_program: None,
            poll_interval_ms: 500,
            collect_timeout_secs: None,
            lock_timeout_secs: 600,
            profile: false,
            profile_out_path: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a TOML file; missing keys keep their defaults
    pub fn load(path: &Path) -> LoopResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| LoopError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn merge_env_vars(&mut self) -> LoopResult<()> {
        if let Ok(mode) = std::env::var("BATCHLOOP_PARALLEL_MODE") {
            self.parallel_mode = mode.parse()?;
        }

        if let Ok(quiet) = std::env::var("BATCHLOOP_QUIET") {
            if let Ok(value) = quiet.parse::<bool>() {
                self.quiet = value;
            }
        }

        if let Ok(processes) = std::env::var("BATCHLOOP_PROCESSES") {
            self.processes = parse_env("BATCHLOOP_PROCESSES", &processes)?;
        }

        if let Ok(max_workers) = std::env::var("BATCHLOOP_MAX_WORKERS") {
            self.max_workers = Some(parse_env("BATCHLOOP_MAX_WORKERS", &max_workers)?);
        }

        if let Ok(root) = std::env::var("BATCHLOOP_WORKING_AREA") {
            self.working_area_root = Some(PathBuf::from(root));
        }

        if let Ok(worker) = std::env::var("BATCHLOOP_WORKER") {
            self.worker_program = Some(PathBuf::from(worker));
        }

        if let Ok(timeout) = std::env::var("BATCHLOOP_LOCK_TIMEOUT_SECS") {
            self.lock_timeout_secs = parse_env("BATCHLOOP_LOCK_TIMEOUT_SECS", &timeout)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> LoopResult<()> {
        if self.processes == 0 {
            return Err(LoopError::Config("processes must be at least 1".to_string()));
        }
        if self.max_workers == Some(0) {
            return Err(LoopError::Config(
                "max_workers must be at least 1 when set".to_string(),
            ));
        }
        if self.max_files_per_process == 0 {
            return Err(LoopError::Config(
                "max_files_per_process must be positive, or negative for no limit".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(LoopError::Config(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn split_policy(&self) -> SplitPolicy {
        SplitPolicy {
            max_files_per_dataset: limit_from(self.max_files_per_dataset),
            max_files_per_process: limit_from(self.max_files_per_process),
            max_events_per_dataset: limit_from(self.max_events_per_dataset),
            max_events_per_process: limit_from(self.max_events_per_process),
        }
    }

    pub fn working_area_root(&self) -> PathBuf {
        self.working_area_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Configured worker binary, else `batchloop-worker` beside this executable
    pub fn worker_program(&self) -> LoopResult<PathBuf> {
        if let Some(program) = &self.worker_program {
            return Ok(program.clone());
        }
        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| {
            LoopError::Config(format!("cannot locate {} next to {}", WORKER_PROGRAM_NAME, exe.display()))
        })?;
        Ok(dir.join(WORKER_PROGRAM_NAME))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn collect_timeout(&self) -> Option<Duration> {
        self.collect_timeout_secs.map(Duration::from_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> LoopResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LoopError::Config(format!("{name}={value} is not a valid value")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_framework_options() {
        let config = RunConfig::new();
        assert_eq!(config.parallel_mode, ParallelMode::InProcess);
        assert_eq!(config.processes, 8);
        assert_eq!(config.lock_timeout(), Duration::from_secs(600));
        assert_eq!(config.split_policy(), SplitPolicy::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batchloop.toml");
        std::fs::write(
            &path,
            r#"
parallel_mode = "htcondor"
max_files_per_process = 5
max_events_per_process = 10000
htcondor_job_desc_extra = ["request_memory = 900"]
"#,
        )
        .unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.parallel_mode, ParallelMode::Htcondor);
        assert_eq!(config.processes, 8);
        let policy = config.split_policy();
        assert_eq!(policy.max_files_per_process, Some(5));
        assert_eq!(policy.max_events_per_process, Some(10000));
        assert_eq!(policy.max_files_per_dataset, None);
        assert_eq!(config.htcondor_job_desc_extra.len(), 1);
    }

    #[test]
    fn test_load_rejects_unknown_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batchloop.toml");
        std::fs::write(&path, "parallel_mode = \"grid\"\n").unwrap();
        let err = RunConfig::load(&path).unwrap_err();
        assert!(matches!(err, LoopError::Config(_)));
    }

    #[test]
    fn test_merge_env_vars() {
        let mut config = RunConfig::new();

        std::env::set_var("BATCHLOOP_PROCESSES", "3");
        std::env::set_var("BATCHLOOP_LOCK_TIMEOUT_SECS", "15");
        config.merge_env_vars().unwrap();
        assert_eq!(config.processes, 3);
        assert_eq!(config.lock_timeout(), Duration::from_secs(15));

        std::env::remove_var("BATCHLOOP_PROCESSES");
        std::env::remove_var("BATCHLOOP_LOCK_TIMEOUT_SECS");
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let config = RunConfig {
            processes: 0,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            max_workers: Some(0),
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
