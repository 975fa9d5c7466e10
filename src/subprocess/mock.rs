use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::error::ProcessError;
use super::runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner};

type ArgsMatcher = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

/// Scripted [`ProcessRunner`] standing in for the HTCondor command-line tools
///
/// Expectations are tried in registration order; the first one whose program
/// and argument predicate match, and which has calls left, answers. Every
/// call is recorded whether or not it matched.
#[derive(Clone, Default)]
pub struct MockProcessRunner {
    expectations: Arc<Mutex<Vec<Expectation>>>,
    calls: Arc<Mutex<Vec<ProcessCommand>>>,
}

struct Expectation {
    program: String,
    matcher: Option<ArgsMatcher>,
    response: ProcessOutput,
    remaining: Option<usize>,
}

/// One pending expectation; registered by [`MockCommandConfig::finish`]
pub struct MockCommandConfig {
    runner: MockProcessRunner,
    expectation: Expectation,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start describing how calls to `program` are answered
    pub fn expect_command(&self, program: &str) -> MockCommandConfig {
        MockCommandConfig {
            runner: self.clone(),
            expectation: Expectation {
                program: program.to_string(),
                matcher: None,
                response: ProcessOutput {
                    status: ExitStatus::Success,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::ZERO,
                },
                remaining: None,
            },
        }
    }

    pub fn verify_called(&self, program: &str, times: usize) -> bool {
        self.calls_to(program) == times
    }

    pub fn calls_to(&self, program: &str) -> usize {
        locked(&self.calls)
            .iter()
            .filter(|cmd| cmd.program == program)
            .count()
    }

    pub fn calls(&self) -> Vec<ProcessCommand> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        locked(&self.calls).push(command.clone());

        let mut expectations = locked(&self.expectations);
        let answer = expectations.iter_mut().find(|e| {
            e.program == command.program
                && e.remaining != Some(0)
                && e.matcher.as_ref().map_or(true, |m| m(&command.args))
        });
        match answer {
            Some(expectation) => {
                if let Some(remaining) = expectation.remaining.as_mut() {
                    *remaining -= 1;
                }
                Ok(expectation.response.clone())
            }
            None => Err(ProcessError::MockExpectationNotMet(format!(
                "no expectation for {}",
                command.display()
            ))),
        }
    }
}

impl MockCommandConfig {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.expectation.matcher = Some(Box::new(matcher));
        self
    }

    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        self.expectation.response.stdout = stdout.to_string();
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        self.expectation.response.stderr = stderr.to_string();
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.expectation.response.status = match code {
            0 => ExitStatus::Success,
            code => ExitStatus::Error(code),
        };
        self
    }

    /// Answer at most `n` calls; later calls fall through to the next expectation
    pub fn times(mut self, n: usize) -> Self {
        self.expectation.remaining = Some(n);
        self
    }

    pub fn finish(self) {
        locked(&self.runner.expectations).push(self.expectation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::ProcessCommandBuilder;

    #[tokio::test]
    async fn test_expectations_match_in_order() {
        let mock = MockProcessRunner::new();
        mock.expect_command("condor_submit")
            .returns_stdout("1 job(s) submitted to cluster 10.")
            .times(1)
            .finish();
        mock.expect_command("condor_submit")
            .returns_stdout("1 job(s) submitted to cluster 11.")
            .finish();

        let cmd = ProcessCommandBuilder::new("condor_submit").build();
        let first = mock.run(cmd.clone()).await.unwrap();
        let second = mock.run(cmd).await.unwrap();
        assert!(first.stdout.contains("10"));
        assert!(second.stdout.contains("11"));
        assert!(mock.verify_called("condor_submit", 2));
    }

    #[tokio::test]
    async fn test_args_matcher_filters_calls() {
        let mock = MockProcessRunner::new();
        mock.expect_command("condor_rm")
            .with_args(|args| args == ["7"])
            .finish();

        let wrong = ProcessCommandBuilder::new("condor_rm").arg("8").build();
        let right = ProcessCommandBuilder::new("condor_rm").arg("7").build();
        assert!(mock.run(wrong).await.is_err());
        assert!(mock.run(right).await.is_ok());
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unexpected_command_fails() {
        let mock = MockProcessRunner::new();
        let err = mock
            .run(ProcessCommandBuilder::new("condor_rm").build())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::MockExpectationNotMet(_)));
    }
}
