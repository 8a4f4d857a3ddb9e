/// Events and inputs driving the update workflow
///
/// `Event` is what a state handler dispatches on. `Input` is what the
/// orchestrator's event loop receives: observer commands and settings,
/// timer firings and adapter completions, each delivered as a separate
/// message so no handler is ever re-entered.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use devadapter::{CommandOutput, FileOutcome, SessionError};

/// Workflow commands sent by the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Continue,
    Retry,
    Restart,
    Install,
    Connect,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Continue => "continue",
            Command::Retry => "retry",
            Command::Restart => "restart",
            Command::Install => "install",
            Command::Connect => "connect",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(Command::Continue),
            "retry" => Ok(Command::Retry),
            "restart" => Ok(Command::Restart),
            "install" => Ok(Command::Install),
            "connect" => Ok(Command::Connect),
            _ => Err(s.to_string()),
        }
    }
}

/// Adapter outcomes, already interpreted by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Index keys found in the repository (possibly none)
    IndexListed(Vec<String>),
    CheckSucceeded,
    CheckFailed,
    DiscoverySucceeded,
    DiscoveryFailed,
    VersionsRead,
    VersionQueryFailed,
    /// Every component image is on disk
    ComponentsReady(Vec<PathBuf>),
    ReprogramProgress(u8),
    ReprogramSucceeded,
    ReprogramFailed,
}

/// Event dispatched to the current state's handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Enter,
    Exit,
    Timeout,
    Control(Control),
    Command(Command),
}

/// Out-of-band configuration from the observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    /// Target device for the gateway and the debug session
    Device(Option<String>),
}

/// Raw adapter result delivered back to the event loop
#[derive(Debug)]
pub enum Completion {
    UtilityVersion(CommandOutput),
    DeviceList(CommandOutput),
    IndexListing(Option<Vec<String>>),
    IndexDownload(FileOutcome),
    Discovery(CommandOutput),
    FirmwareVersions(Result<Vec<String>, SessionError>),
    ComponentDownload(FileOutcome),
    ReprogramOutput { chunk: String, status: Option<i32> },
}

/// Message consumed by the orchestrator's event loop
#[derive(Debug)]
pub enum Input {
    Command(Command),
    Setting(Setting),
    /// A timer armed by a state handler fired
    Timeout,
    Completion(Completion),
    /// Outcome the orchestrator posts to itself when an adapter refused work
    Control(Control),
    /// Stop the event loop
    Shutdown,
}

impl From<Command> for Input {
    fn from(command: Command) -> Self {
        Input::Command(command)
    }
}

impl From<Completion> for Input {
    fn from(completion: Completion) -> Self {
        Input::Completion(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names_parse_case_insensitively() {
        assert_eq!("Continue".parse::<Command>(), Ok(Command::Continue));
        assert_eq!("INSTALL".parse::<Command>(), Ok(Command::Install));
        assert_eq!("reboot".parse::<Command>(), Err("reboot".to_string()));
    }

    #[test]
    fn test_command_display_matches_parse() {
        for command in [
            Command::Continue,
            Command::Retry,
            Command::Restart,
            Command::Install,
            Command::Connect,
        ] {
            assert_eq!(command.to_string().parse::<Command>(), Ok(command));
        }
    }
}
