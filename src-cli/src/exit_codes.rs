//! Exit codes for the CLI.
//!
//! These codes enable scripting integration by providing structured
//! feedback about recording results.

/// Exit codes for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Recording completed successfully
    Success = 0,
    /// General/unspecified failure
    GeneralError = 1,
    /// The emergency watchdog killed the process
    WatchdogKill = 2,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCode::Success => write!(f, "success"),
            ExitCode::GeneralError => write!(f, "general error"),
            ExitCode::WatchdogKill => write!(f, "watchdog kill"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_documented_contract() {
        assert_eq!(ExitCode::Success.as_i32(), 0);
        assert_eq!(ExitCode::GeneralError.as_i32(), 1);
        assert_eq!(ExitCode::WatchdogKill.as_i32(), 2);
        assert_eq!(
            ExitCode::WatchdogKill.as_i32(),
            deskmux_core::WATCHDOG_EXIT_CODE
        );
    }
}
