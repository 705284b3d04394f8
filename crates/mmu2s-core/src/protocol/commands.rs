//! Protocol commands
//!
//! Defines the commands understood by the MMU2S firmware. Every command is a
//! single letter followed by an integer, terminated by `\n`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::MmuError;

/// Symbolic MMU commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MmuCommand {
    /// Select a tool ('T' command)
    SetTool,

    /// Load filament into the selector ('L' command)
    LoadFilament,

    /// Switch the TMC drivers between normal and stealth mode ('M' command)
    SetTmcMode,

    /// Unload filament ('U' command)
    UnloadFilament,

    /// Soft reset ('X0')
    Reset,

    /// Read the Finda sensor ('P0')
    ReadFinda,

    /// Acknowledge test ('S0')
    CheckAck,

    /// Firmware version ('S1')
    GetVersion,

    /// Firmware build number ('S2')
    GetBuildNumber,

    /// Drive error counter ('S3')
    GetDriveErrors,

    /// Set filament type ('F' command), accepted but ignored by the firmware
    SetFilament,

    /// Continue loading into the extruder gears ('C0')
    ContinueLoad,

    /// Eject filament ('E' command)
    EjectFilament,

    /// Recover after eject ('R0')
    Recover,

    /// Wait for user click ('W0')
    WaitForUser,

    /// Cut filament ('K0')
    CutFilament,
}

/// Response wait class of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Quick sensor read, answered almost immediately
    Probe,
    /// Anything that may move hardware
    Default,
}

impl MmuCommand {
    /// Every command, in table order
    pub const ALL: [MmuCommand; 16] = [
        MmuCommand::SetTool,
        MmuCommand::LoadFilament,
        MmuCommand::SetTmcMode,
        MmuCommand::UnloadFilament,
        MmuCommand::Reset,
        MmuCommand::ReadFinda,
        MmuCommand::CheckAck,
        MmuCommand::GetVersion,
        MmuCommand::GetBuildNumber,
        MmuCommand::GetDriveErrors,
        MmuCommand::SetFilament,
        MmuCommand::ContinueLoad,
        MmuCommand::EjectFilament,
        MmuCommand::Recover,
        MmuCommand::WaitForUser,
        MmuCommand::CutFilament,
    ];

    /// Symbolic name as used by host commands (e.g. `READ_FINDA`)
    pub fn name(&self) -> &'static str {
        match self {
            MmuCommand::SetTool => "SET_TOOL",
            MmuCommand::LoadFilament => "LOAD_FILAMENT",
            MmuCommand::SetTmcMode => "SET_TMC_MODE",
            MmuCommand::UnloadFilament => "UNLOAD_FILAMENT",
            MmuCommand::Reset => "RESET",
            MmuCommand::ReadFinda => "READ_FINDA",
            MmuCommand::CheckAck => "CHECK_ACK",
            MmuCommand::GetVersion => "GET_VERSION",
            MmuCommand::GetBuildNumber => "GET_BUILD_NUMBER",
            MmuCommand::GetDriveErrors => "GET_DRIVE_ERRORS",
            MmuCommand::SetFilament => "SET_FILAMENT",
            MmuCommand::ContinueLoad => "CONTINUE_LOAD",
            MmuCommand::EjectFilament => "EJECT_FILAMENT",
            MmuCommand::Recover => "RECOVER",
            MmuCommand::WaitForUser => "WAIT_FOR_USER",
            MmuCommand::CutFilament => "CUT_FILAMENT",
        }
    }

    /// Look up a command by its symbolic name
    pub fn from_name(name: &str) -> Result<Self, MmuError> {
        Self::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.name() == name)
            .ok_or_else(|| MmuError::InvalidCommand(name.to_string()))
    }

    /// Command letter on the wire
    pub fn letter(&self) -> char {
        match self {
            MmuCommand::SetTool => 'T',
            MmuCommand::LoadFilament => 'L',
            MmuCommand::SetTmcMode => 'M',
            MmuCommand::UnloadFilament => 'U',
            MmuCommand::Reset => 'X',
            MmuCommand::ReadFinda => 'P',
            MmuCommand::CheckAck
            | MmuCommand::GetVersion
            | MmuCommand::GetBuildNumber
            | MmuCommand::GetDriveErrors => 'S',
            MmuCommand::SetFilament => 'F',
            MmuCommand::ContinueLoad => 'C',
            MmuCommand::EjectFilament => 'E',
            MmuCommand::Recover => 'R',
            MmuCommand::WaitForUser => 'W',
            MmuCommand::CutFilament => 'K',
        }
    }

    /// Fixed argument for commands that take none from the caller
    fn fixed_arg(&self) -> Option<u32> {
        match self {
            MmuCommand::SetTool
            | MmuCommand::LoadFilament
            | MmuCommand::SetTmcMode
            | MmuCommand::UnloadFilament
            | MmuCommand::SetFilament
            | MmuCommand::EjectFilament => None,
            MmuCommand::GetVersion => Some(1),
            MmuCommand::GetBuildNumber => Some(2),
            MmuCommand::GetDriveErrors => Some(3),
            _ => Some(0),
        }
    }

    /// Check if the caller must supply the integer argument
    pub fn takes_argument(&self) -> bool {
        self.fixed_arg().is_none()
    }

    /// Response wait class
    pub fn timeout_class(&self) -> TimeoutClass {
        if self.letter() == 'P' {
            TimeoutClass::Probe
        } else {
            TimeoutClass::Default
        }
    }

    /// Format the command as it is written to the MMU (without terminator)
    ///
    /// Fixed commands ignore `arg`; parameterised ones require it.
    pub fn format(&self, arg: Option<u32>) -> Result<String, MmuError> {
        let value = match (self.fixed_arg(), arg) {
            (Some(fixed), _) => fixed,
            (None, Some(value)) => value,
            (None, None) => {
                return Err(MmuError::InvalidArgument(format!(
                    "{} requires an integer argument",
                    self.name()
                )))
            }
        };
        Ok(format!("{}{}", self.letter(), value))
    }
}

/// Timeouts for the two response classes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandTimeouts {
    /// Used for [`TimeoutClass::Probe`] commands
    pub probe: Duration,
    /// Used for everything else
    pub default: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(3),
            default: Duration::from_secs(45),
        }
    }
}

impl CommandTimeouts {
    /// Timeout for a particular command
    pub fn for_command(&self, cmd: MmuCommand) -> Duration {
        match cmd.timeout_class() {
            TimeoutClass::Probe => self.probe,
            TimeoutClass::Default => self.default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for cmd in MmuCommand::ALL {
            assert_eq!(MmuCommand::from_name(cmd.name()).unwrap(), cmd);
        }
    }

    #[test]
    fn test_unknown_name() {
        let err = MmuCommand::from_name("LOAD_EVERYTHING").unwrap_err();
        assert!(matches!(err, MmuError::InvalidCommand(name) if name == "LOAD_EVERYTHING"));
    }

    #[test]
    fn test_format_fixed_and_parameterised() {
        assert_eq!(MmuCommand::ReadFinda.format(None).unwrap(), "P0");
        assert_eq!(MmuCommand::Reset.format(Some(7)).unwrap(), "X0");
        assert_eq!(MmuCommand::GetDriveErrors.format(None).unwrap(), "S3");
        assert_eq!(MmuCommand::SetTool.format(Some(4)).unwrap(), "T4");
        assert_eq!(MmuCommand::SetTmcMode.format(Some(1)).unwrap(), "M1");
        assert!(MmuCommand::LoadFilament.format(None).is_err());
    }

    #[test]
    fn test_only_finda_read_is_a_probe() {
        let probes: Vec<_> = MmuCommand::ALL
            .iter()
            .filter(|c| c.timeout_class() == TimeoutClass::Probe)
            .collect();
        assert_eq!(probes, vec![&MmuCommand::ReadFinda]);

        let timeouts = CommandTimeouts::default();
        assert_eq!(timeouts.for_command(MmuCommand::ReadFinda), Duration::from_secs(3));
        assert_eq!(timeouts.for_command(MmuCommand::LoadFilament), Duration::from_secs(45));
    }
}
