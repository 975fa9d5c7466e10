//! Operator interaction: the interrupt signal and the yes/no prompt

use crate::error::{LoopError, LoopResult};
use async_trait::async_trait;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::VecDeque;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Trait for asking the operator a question
#[async_trait]
pub trait UserPrompter: Send + Sync {
    /// Ask a yes/no question; an empty answer picks `default`
    async fn prompt_yes_no(&self, message: &str, default: bool) -> LoopResult<bool>;
}

/// Prompts on the controlling terminal
///
/// Without a terminal on stdin nobody can answer, so the default is taken.
#[derive(Debug, Default)]
pub struct StdinPrompter;

impl StdinPrompter {
    pub fn new() -> Self {
        Self
    }

    /// Interpret an answer; `None` for anything that is not yes or no
    pub fn parse_answer(input: &str, default: bool) -> Option<bool> {
        match input.trim().to_lowercase().as_str() {
            "" => Some(default),
            "y" | "yes" => Some(true),
            "n" | "no" => Some(false),
            _ => None,
        }
    }

    fn read_line() -> io::Result<String> {
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input)
    }
}

#[async_trait]
impl UserPrompter for StdinPrompter {
    async fn prompt_yes_no(&self, message: &str, default: bool) -> LoopResult<bool> {
        if !io::stdin().is_terminal() {
            debug!("No terminal to ask '{}', answering {}", message, default);
            return Ok(default);
        }

        let hint = if default { "Y/n" } else { "y/N" };
        loop {
            print!("{message} [{hint}]: ");
            io::stdout().flush()?;
            let input = tokio::task::spawn_blocking(Self::read_line)
                .await
                .map_err(io::Error::other)??;
            match Self::parse_answer(&input, default) {
                Some(answer) => return Ok(answer),
                None => println!("Please respond with 'yes' or 'no' (or 'y' or 'n')."),
            }
        }
    }
}

/// Prompter that replays canned answers, then falls back to the default
#[derive(Debug, Default, Clone)]
pub struct ScriptedPrompter {
    answers: Arc<Mutex<VecDeque<bool>>>,
    asked: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.into_iter().collect())),
            asked: Arc::default(),
        }
    }

    /// Questions asked so far
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl UserPrompter for ScriptedPrompter {
    async fn prompt_yes_no(&self, message: &str, default: bool) -> LoopResult<bool> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(message.to_string());
        }
        let answer = self
            .answers
            .lock()
            .map_err(|_| LoopError::Config("scripted answers poisoned".to_string()))?
            .pop_front();
        Ok(answer.unwrap_or(default))
    }
}

/// Level-triggered interrupt flag observed by the orchestrating loop
///
/// Workers never see it; only the top-level loop reacts.
#[derive(Debug, Clone)]
pub struct InterruptSignal {
    flag: Arc<watch::Sender<bool>>,
}

impl Default for InterruptSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSignal {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub fn trigger(&self) {
        self.flag.send_replace(true);
    }

    /// Clear the flag after the interrupt has been handled
    pub fn reset(&self) {
        self.flag.send_replace(false);
    }

    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the flag is set
    pub async fn triggered(&self) {
        let mut receiver = self.flag.subscribe();
        let _ = receiver.wait_for(|set| *set).await;
    }

    /// Route SIGINT and SIGTERM to this flag instead of killing the process
    pub fn install_os_handler(&self) -> LoopResult<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let signal = self.clone();

        thread::spawn(move || {
            for sig in signals.forever() {
                warn!("Caught signal {}", sig);
                signal.trigger();
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_answer_defaults_on_empty() {
        assert_eq!(StdinPrompter::parse_answer("\n", false), Some(false));
        assert_eq!(StdinPrompter::parse_answer("", true), Some(true));
        assert_eq!(StdinPrompter::parse_answer("YES\n", false), Some(true));
        assert_eq!(StdinPrompter::parse_answer(" n ", true), Some(false));
        assert_eq!(StdinPrompter::parse_answer("maybe", false), None);
    }

    #[tokio::test]
    async fn test_scripted_prompter_falls_back_to_default() {
        let prompter = ScriptedPrompter::new([true]);
        assert!(prompter.prompt_yes_no("terminate running jobs", false).await.unwrap());
        assert!(!prompter.prompt_yes_no("terminate running jobs", false).await.unwrap());
        assert_eq!(prompter.asked().len(), 2);
    }

    #[tokio::test]
    async fn test_interrupt_signal_wakes_waiter() {
        let signal = InterruptSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signal.is_triggered());
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();

        signal.reset();
        assert!(!signal.is_triggered());
    }
}
