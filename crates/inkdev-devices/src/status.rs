/*!
 * Device status and the client-visible handshake state machine.
 *
 * A device moves from `Idle` through `Connecting` and any of the
 * confirmation states to one of the ready states (`Idle`, `Syncing`,
 * `CapturingRealTimeInk`). The `NotAuthorized*` states are terminal: the
 * session is over and a fresh connect attempt is required.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

use inkdev_core::types::Id;

/// Status reported by a device during and after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Connected and idle, or not yet connected
    Idle,
    /// Opening the link
    Connecting,
    /// Re-establishing a dropped link
    Reconnecting,
    /// Waiting for the user to tap the device to confirm a new connection
    ExpectingConnectionConfirmation,
    /// Waiting for the user to tap the device to restore a connection
    ExpectingReconnect,
    /// Waiting for the user to put the device into confirmation mode
    ExpectingUserConfirmationMode,
    /// Transferring stored pages
    Syncing,
    /// Streaming real-time ink
    CapturingRealTimeInk,
    /// The confirmation period expired
    NotAuthorizedConnectionNotConfirmed,
    /// Another host owns the device
    NotAuthorizedDeviceInUseByAnotherHost,
    /// Authorization failed for any other reason
    NotAuthorizedGeneralError,
}

impl DeviceStatus {
    /// Terminal failure states of the handshake
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeviceStatus::NotAuthorizedConnectionNotConfirmed
                | DeviceStatus::NotAuthorizedDeviceInUseByAnotherHost
                | DeviceStatus::NotAuthorizedGeneralError
        )
    }

    /// States in which the connection is usable
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            DeviceStatus::Idle | DeviceStatus::Syncing | DeviceStatus::CapturingRealTimeInk
        )
    }

    /// States that wait on a physical action and are bounded by the confirmation timeout
    pub fn awaits_confirmation(self) -> bool {
        matches!(
            self,
            DeviceStatus::ExpectingConnectionConfirmation
                | DeviceStatus::ExpectingReconnect
                | DeviceStatus::ExpectingUserConfirmationMode
        )
    }

    /// Whether a device may report `next` while in `self`
    ///
    /// Re-reporting the current status is always allowed. Nothing leaves a
    /// terminal state, `Idle` only fails through `Connecting`, and a ready
    /// connection never goes back to its first-time confirmation.
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;

        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match self {
            Idle => !next.is_terminal() && next != ExpectingConnectionConfirmation,
            Connecting | Reconnecting => true,
            ExpectingConnectionConfirmation | ExpectingReconnect | ExpectingUserConfirmationMode => {
                true
            }
            Syncing | CapturingRealTimeInk => {
                !matches!(next, Connecting | ExpectingConnectionConfirmation)
            }
            NotAuthorizedConnectionNotConfirmed
            | NotAuthorizedDeviceInUseByAnotherHost
            | NotAuthorizedGeneralError => false,
        }
    }

    /// User-facing guidance for this status, empty when nothing needs saying
    pub fn prompt(self) -> &'static str {
        match self {
            DeviceStatus::Idle => "",
            DeviceStatus::Connecting | DeviceStatus::Reconnecting => "Connecting...",
            DeviceStatus::Syncing => "Syncing...",
            DeviceStatus::CapturingRealTimeInk => "Real time ink mode enabled.",
            DeviceStatus::ExpectingConnectionConfirmation => {
                "Tap the Central Button to confirm the connection."
            }
            DeviceStatus::ExpectingReconnect => "Tap the Central Button to restore the connection.",
            DeviceStatus::ExpectingUserConfirmationMode => {
                "Press and hold the Central Button to enter user confirmation mode."
            }
            DeviceStatus::NotAuthorizedConnectionNotConfirmed => {
                "The connection confirmation period expired."
            }
            DeviceStatus::NotAuthorizedDeviceInUseByAnotherHost => {
                "The device is in use by another host."
            }
            DeviceStatus::NotAuthorizedGeneralError => "The device authorization failed.",
        }
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Idle
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A status change observed on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// The descriptor id of the device
    pub device_id: Id,
    /// The previous status
    pub old_status: DeviceStatus,
    /// The new status
    pub new_status: DeviceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeviceStatus::*;

    const ALL: [DeviceStatus; 11] = [
        Idle,
        Connecting,
        Reconnecting,
        ExpectingConnectionConfirmation,
        ExpectingReconnect,
        ExpectingUserConfirmationMode,
        Syncing,
        CapturingRealTimeInk,
        NotAuthorizedConnectionNotConfirmed,
        NotAuthorizedDeviceInUseByAnotherHost,
        NotAuthorizedGeneralError,
    ];

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in ALL.iter().copied().filter(|s| s.is_terminal()) {
            for to in ALL.iter().copied().filter(|s| *s != from) {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_handshake_paths() {
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(ExpectingConnectionConfirmation));
        assert!(ExpectingConnectionConfirmation.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(CapturingRealTimeInk));
        assert!(CapturingRealTimeInk.can_transition_to(Idle));
        assert!(ExpectingReconnect.can_transition_to(NotAuthorizedConnectionNotConfirmed));
        assert!(Connecting.can_transition_to(NotAuthorizedDeviceInUseByAnotherHost));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Idle.can_transition_to(NotAuthorizedGeneralError));
        assert!(!Idle.can_transition_to(ExpectingConnectionConfirmation));
        assert!(!Syncing.can_transition_to(Connecting));
        assert!(!NotAuthorizedGeneralError.can_transition_to(Idle));
    }

    #[test]
    fn test_classification() {
        assert_eq!(ALL.iter().filter(|s| s.is_terminal()).count(), 3);
        assert_eq!(ALL.iter().filter(|s| s.is_ready()).count(), 3);
        assert_eq!(ALL.iter().filter(|s| s.awaits_confirmation()).count(), 3);
        assert!(ALL.iter().all(|s| !(s.is_ready() && s.is_terminal())));
    }

    #[test]
    fn test_prompts() {
        assert_eq!(Idle.prompt(), "");
        assert_eq!(Reconnecting.prompt(), "Connecting...");
        assert_eq!(
            ExpectingConnectionConfirmation.prompt(),
            "Tap the Central Button to confirm the connection."
        );
        assert!(ALL.iter().filter(|s| **s != Idle).all(|s| !s.prompt().is_empty()));
    }
}
