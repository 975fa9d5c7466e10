use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use super::ProcessCommand;

/// Fluent construction of a [`ProcessCommand`]
///
/// Program and arguments are kept as strings so that scheduler commands can
/// be matched by name in tests.
pub struct ProcessCommandBuilder {
    command: ProcessCommand,
}

impl ProcessCommandBuilder {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            command: ProcessCommand {
                program: program.as_ref().to_string(),
                args: Vec::new(),
                working_dir: None,
                env: Vec::new(),
                timeout: None,
            },
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.command.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.command
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.command.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.command
            .env
            .push((key.into(), value.as_ref().to_os_string()));
        self
    }

    /// Kill the command if it has not exited after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ProcessCommand {
        self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_scheduler_command() {
        let ids = vec!["41".to_string(), "42".to_string()];
        let command = ProcessCommandBuilder::new("condor_q")
            .args(&ids)
            .args(["-af", "ClusterId"])
            .current_dir("/scratch/wa")
            .timeout(Duration::from_secs(5))
            .build();

        assert_eq!(command.display(), "condor_q 41 42 -af ClusterId");
        assert_eq!(command.working_dir.as_deref(), Some(Path::new("/scratch/wa")));
        assert_eq!(command.timeout, Some(Duration::from_secs(5)));
    }
}
