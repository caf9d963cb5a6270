//! Console modes and prompt classification.

use std::fmt;

use crate::channel::PromptShapes;

/// Mode the console was last observed in.
///
/// Not tracked between operations: every operation probes the console and
/// classifies the prompt it answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Bootloader command prompt.
    Bootloader,

    /// Login or password prompt.
    LoginPrompt,

    /// Logged-in shell.
    AuthenticatedShell,

    /// No known prompt.
    Unknown,
}

impl SessionState {
    /// Classify a console line by prompt shape.
    ///
    /// Login-phase shapes are checked first, then the shell, then the
    /// bootloader.
    pub fn classify(line: &str, prompts: &PromptShapes) -> Self {
        if prompts.login.is_match(line) || prompts.password.is_match(line) {
            SessionState::LoginPrompt
        } else if prompts.shell.is_match(line) {
            SessionState::AuthenticatedShell
        } else if prompts.bootloader.is_match(line) {
            SessionState::Bootloader
        } else {
            SessionState::Unknown
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Bootloader => "bootloader",
            SessionState::LoginPrompt => "login prompt",
            SessionState::AuthenticatedShell => "shell",
            SessionState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_prompts() {
        let prompts = PromptShapes::for_host("ui43").unwrap();
        assert_eq!(SessionState::classify("=> ", &prompts), SessionState::Bootloader);
        assert_eq!(SessionState::classify("ui43 login: ", &prompts), SessionState::LoginPrompt);
        assert_eq!(SessionState::classify("Password: ", &prompts), SessionState::LoginPrompt);
        assert_eq!(
            SessionState::classify("root@ui43:/tmp# ", &prompts),
            SessionState::AuthenticatedShell
        );
    }

    #[test]
    fn test_classify_other_lines() {
        let prompts = PromptShapes::for_host("ui43").unwrap();
        assert_eq!(SessionState::classify("Starting kernel ...", &prompts), SessionState::Unknown);
        assert_eq!(SessionState::classify("other login: ", &prompts), SessionState::Unknown);
        assert_eq!(SessionState::classify("", &prompts), SessionState::Unknown);
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionState::AuthenticatedShell.to_string(), "shell");
        assert_eq!(SessionState::LoginPrompt.to_string(), "login prompt");
    }
}
