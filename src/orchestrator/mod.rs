//! Orchestrator - ties game detection to the replay buffer

mod service;

pub use service::{create_orchestrator_channels, Orchestrator};

use std::path::PathBuf;

use crate::capture::{AudioProfile, EncodingProfile, MicrophoneProfile};

/// Commands that can be sent to the orchestrator
#[derive(Debug, Clone)]
pub enum Command {
    /// Switch clipping mode on (await a game) or off
    ToggleClipping,
    /// Save the buffer to a clip
    SaveClip,
    SetEncoding(EncodingProfile),
    SetAudio(AudioProfile),
    SetMicrophone(MicrophoneProfile),
    SetBufferDuration(u32),
    SetOutputFolder(PathBuf),
    /// Start monitoring an executable
    AddGame(String),
    RemoveGame(String),
    /// Log a one-line status summary
    ReportStatus,
    /// Stop everything and exit the loop
    Shutdown,
}

/// Clipping mode as seen by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClippingState {
    Disabled,
    AwaitingGame,
    Active,
}

/// Status updates from the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    StateChanged(ClippingState),
    GameDetected(String),
    /// Replay buffer started or stopped buffering
    BufferRunning(bool),
    SaveStarted(String),
    ClipSaved(PathBuf),
    SaveFailed(String),
    Error(String),
}

/// A line typed on the console
#[derive(Debug, Clone)]
pub enum ConsoleInput {
    Send(Command),
    /// Print the last N log lines
    ShowLog(usize),
    Help,
}

pub const CONSOLE_HELP: &str = "\
commands:
  save                 save a clip
  toggle               switch clipping mode on/off
  status               log current status
  duration <secs>      set buffer duration
  folder <path>        set clip output folder
  add-game <exe>       monitor an executable
  remove-game <exe>    stop monitoring an executable
  log [lines]          show recent log lines
  quit                 exit";

/// Parse one console line. `None` for blank or unrecognised input.
pub fn parse_console_line(line: &str) -> Option<ConsoleInput> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "save" | "s" => Command::SaveClip,
        "toggle" | "t" => Command::ToggleClipping,
        "status" => Command::ReportStatus,
        "quit" | "exit" | "q" => Command::Shutdown,
        "duration" => Command::SetBufferDuration(rest.parse().ok()?),
        "folder" if !rest.is_empty() => Command::SetOutputFolder(PathBuf::from(rest)),
        "add-game" if !rest.is_empty() => Command::AddGame(rest.to_string()),
        "remove-game" if !rest.is_empty() => Command::RemoveGame(rest.to_string()),
        "log" => {
            let lines = if rest.is_empty() { 20 } else { rest.parse().ok()? };
            return Some(ConsoleInput::ShowLog(lines));
        }
        "help" | "?" => return Some(ConsoleInput::Help),
        _ => return None,
    };
    Some(ConsoleInput::Send(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_console_commands() {
        assert!(matches!(
            parse_console_line("  save "),
            Some(ConsoleInput::Send(Command::SaveClip))
        ));
        assert!(matches!(
            parse_console_line("TOGGLE"),
            Some(ConsoleInput::Send(Command::ToggleClipping))
        ));
        assert!(matches!(
            parse_console_line("duration 90"),
            Some(ConsoleInput::Send(Command::SetBufferDuration(90)))
        ));
        assert!(matches!(
            parse_console_line("log"),
            Some(ConsoleInput::ShowLog(20))
        ));
        match parse_console_line("add-game Elden Ring.exe") {
            Some(ConsoleInput::Send(Command::AddGame(exe))) => assert_eq!(exe, "Elden Ring.exe"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_console_line("").is_none());
        assert!(parse_console_line("duration soon").is_none());
        assert!(parse_console_line("folder").is_none());
        assert!(parse_console_line("dance").is_none());
    }
}
