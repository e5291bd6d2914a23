use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Input};

use crate::{error::Error, host::Interrupt, operator::Operator};

/// Asks questions on the terminal
pub struct TerminalOperator {
    interrupt: Interrupt,
}

impl TerminalOperator {
    pub fn new(interrupt: Interrupt) -> Self {
        Self { interrupt }
    }
}

impl Operator for TerminalOperator {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool, Error> {
        let answer = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(default)
            .interact_opt()?;

        // Ctrl-C while the prompt was up
        self.interrupt.check()?;
        answer.ok_or(Error::Cancelled)
    }

    fn acknowledge(&self, prompt: &str) -> Result<(), Error> {
        Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()?;

        self.interrupt.check()
    }

    fn info(&self, message: &str) {
        println!("{message}");
    }

    fn warn(&self, message: &str) {
        eprintln!("{} {message}", "warning:".yellow().bold());
    }

    fn error(&self, message: &str) {
        eprintln!("{} {message}", "error:".red().bold());
    }
}
