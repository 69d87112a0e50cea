//! Terminal confirmation prompt for resets.

use inquire::{InquireError, Text};

use sql_watch_core::error::SqlWatchError;
use sql_watch_core::{Prompt, Result};

/// Reads the answer from the terminal.
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn ask(&mut self, message: &str) -> Result<String> {
        answer_from(Text::new(message).prompt())
    }
}

/// Escape and a missing terminal both count as declining.
fn answer_from(result: std::result::Result<String, InquireError>) -> Result<String> {
    match result {
        Ok(answer) => Ok(answer),
        Err(InquireError::OperationCanceled) | Err(InquireError::NotTTY) => Ok(String::new()),
        Err(e) => Err(SqlWatchError::PromptError(format!(
            "Failed to read confirmation: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_is_passed_through() {
        assert_eq!(
            answer_from(Ok("DESTROY IT ALL".to_string())).unwrap(),
            "DESTROY IT ALL"
        );
    }

    #[test]
    fn test_no_terminal_declines() {
        assert_eq!(answer_from(Err(InquireError::NotTTY)).unwrap(), "");
    }

    #[test]
    fn test_escape_declines() {
        assert_eq!(
            answer_from(Err(InquireError::OperationCanceled)).unwrap(),
            ""
        );
    }

    #[test]
    fn test_interrupt_is_an_error() {
        let err = answer_from(Err(InquireError::OperationInterrupted)).unwrap_err();
        assert!(matches!(err, SqlWatchError::PromptError(_)));
    }
}
