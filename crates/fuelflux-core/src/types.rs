//! Domain types shared across the controller.

use serde::{Deserialize, Serialize};

/// Card or PIN holder identifier, as read from the NFC reader or keypad.
pub type UserId = String;
/// Server-side tank identifier.
pub type TankNumber = i32;
/// Fuel volume in liters.
pub type Volume = f64;
/// Price per liter.
pub type Price = f64;

/// Generic operator-facing message for device-side failures.
///
/// The device has four short text lines and an untrained audience, so
/// user-visible errors collapse into two generic strings; diagnostics go
/// to the logs.
pub const STD_CONTROLLER_ERROR: &str = "Ошибка контроллера";
/// Generic operator-facing message for portal-side failures.
pub const STD_BACKEND_ERROR: &str = "Ошибка портала";

/// Role assigned by the portal at authorization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRole {
    Unknown,
    Customer,
    Operator,
    Controller,
}

impl UserRole {
    /// Map a portal `RoleId` onto a role. Unrecognized ids are `Unknown`.
    pub fn from_id(id: i64) -> Self {
        match id {
            1 => UserRole::Customer,
            2 => UserRole::Operator,
            3 => UserRole::Controller,
            _ => UserRole::Unknown,
        }
    }

    /// Portal `RoleId` for this role (`Unknown` maps to 0).
    pub fn id(self) -> i64 {
        match self {
            UserRole::Unknown => 0,
            UserRole::Customer => 1,
            UserRole::Operator => 2,
            UserRole::Controller => 3,
        }
    }
}

/// Direction of a fuel intake operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeDirection {
    In,
    Out,
}

impl IntakeDirection {
    /// Wire encoding: In = 1, Out = 2.
    pub fn wire_value(self) -> i32 {
        match self {
            IntakeDirection::In => 1,
            IntakeDirection::Out => 2,
        }
    }
}

/// States of the transaction Mealy machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemState {
    Waiting,
    PinEntry,
    Authorization,
    NotAuthorized,
    TankSelection,
    VolumeEntry,
    Refueling,
    RefuelDataTransmission,
    RefuelingComplete,
    IntakeDirectionSelection,
    IntakeVolumeEntry,
    IntakeDataTransmission,
    IntakeComplete,
    Error,
}

impl SystemState {
    /// Every state, for exhaustive table checks.
    pub const ALL: [SystemState; 14] = [
        SystemState::Waiting,
        SystemState::PinEntry,
        SystemState::Authorization,
        SystemState::NotAuthorized,
        SystemState::TankSelection,
        SystemState::VolumeEntry,
        SystemState::Refueling,
        SystemState::RefuelDataTransmission,
        SystemState::RefuelingComplete,
        SystemState::IntakeDirectionSelection,
        SystemState::IntakeVolumeEntry,
        SystemState::IntakeDataTransmission,
        SystemState::IntakeComplete,
        SystemState::Error,
    ];
}

/// Events fed into the state machine through the controller's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    CardPresented,
    PinEntryStarted,
    PinEntered,
    InputUpdated,
    AuthorizationSuccess,
    AuthorizationFailed,
    TankSelected,
    VolumeEntered,
    AmountEntered,
    RefuelingStarted,
    RefuelingStopped,
    DataTransmissionComplete,
    IntakeSelected,
    IntakeDirectionSelected,
    IntakeVolumeEntered,
    IntakeComplete,
    CancelPressed,
    CancelNoFuel,
    Timeout,
    DisplayReset,
    Error,
    ErrorRecovery,
}

impl Event {
    /// Every event, for exhaustive table checks.
    pub const ALL: [Event; 22] = [
        Event::CardPresented,
        Event::PinEntryStarted,
        Event::PinEntered,
        Event::InputUpdated,
        Event::AuthorizationSuccess,
        Event::AuthorizationFailed,
        Event::TankSelected,
        Event::VolumeEntered,
        Event::AmountEntered,
        Event::RefuelingStarted,
        Event::RefuelingStopped,
        Event::DataTransmissionComplete,
        Event::IntakeSelected,
        Event::IntakeDirectionSelected,
        Event::IntakeVolumeEntered,
        Event::IntakeComplete,
        Event::CancelPressed,
        Event::CancelNoFuel,
        Event::Timeout,
        Event::DisplayReset,
        Event::Error,
        Event::ErrorRecovery,
    ];
}

/// Keys on the 4x4 keypad the controller understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCode {
    Key0,
    Key1,
    Key2,
    Key3,
    Key4,
    Key5,
    Key6,
    Key7,
    Key8,
    Key9,
    /// `*`: maximum volume shortcut.
    Max,
    /// `#`: erase the last digit.
    Clear,
    /// `A`: confirm the current input.
    Start,
    /// `B`: cancel.
    Stop,
    /// Service key that forces a display re-initialization.
    DisplayReset,
}

impl KeyCode {
    /// The digit character for numeric keys, `None` otherwise.
    pub fn digit(self) -> Option<char> {
        match self {
            KeyCode::Key0 => Some('0'),
            KeyCode::Key1 => Some('1'),
            KeyCode::Key2 => Some('2'),
            KeyCode::Key3 => Some('3'),
            KeyCode::Key4 => Some('4'),
            KeyCode::Key5 => Some('5'),
            KeyCode::Key6 => Some('6'),
            KeyCode::Key7 => Some('7'),
            KeyCode::Key8 => Some('8'),
            KeyCode::Key9 => Some('9'),
            _ => None,
        }
    }
}

/// The authorized user of the current session.
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub uid: UserId,
    pub role: UserRole,
    /// Remaining liters a customer may dispense.
    pub allowance: Volume,
    /// Price per liter, when the portal provides one.
    pub price: Price,
}

impl Default for UserRole {
    fn default() -> Self {
        UserRole::Unknown
    }
}

/// A tank the current session is authorized to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TankInfo {
    pub number: TankNumber,
    pub name: String,
}

/// Four lines of UTF-8 text shown on the device display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayMessage {
    pub line1: String,
    pub line2: String,
    pub line3: String,
    pub line4: String,
}

impl DisplayMessage {
    pub fn new(
        line1: impl Into<String>,
        line2: impl Into<String>,
        line3: impl Into<String>,
        line4: impl Into<String>,
    ) -> Self {
        Self {
            line1: line1.into(),
            line2: line2.into(),
            line3: line3.into(),
            line4: line4.into(),
        }
    }
}

/// A completed refuel, ready for reporting.
#[derive(Debug, Clone)]
pub struct RefuelTransaction {
    pub user_id: UserId,
    pub tank_number: TankNumber,
    pub volume: Volume,
    pub timestamp_ms: i64,
}

/// A completed intake operation, ready for reporting.
#[derive(Debug, Clone)]
pub struct IntakeTransaction {
    pub operator_id: UserId,
    pub tank_number: TankNumber,
    pub volume: Volume,
    pub direction: IntakeDirection,
    pub timestamp_ms: i64,
}

/// Method tag of a stored reportable transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageMethod {
    Refuel,
    Intake,
}

impl MessageMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageMethod::Refuel => "Refuel",
            MessageMethod::Intake => "Intake",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Refuel" => Some(MessageMethod::Refuel),
            "Intake" => Some(MessageMethod::Intake),
            _ => None,
        }
    }
}

/// One row of the local user allowance cache.
#[derive(Debug, Clone, PartialEq)]
pub struct UserCacheEntry {
    pub uid: UserId,
    pub allowance: Volume,
    pub role_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_id_round_trip() {
        for role in [
            UserRole::Unknown,
            UserRole::Customer,
            UserRole::Operator,
            UserRole::Controller,
        ] {
            assert_eq!(UserRole::from_id(role.id()), role);
        }
    }

    #[test]
    fn unknown_role_ids_map_to_unknown() {
        assert_eq!(UserRole::from_id(-1), UserRole::Unknown);
        assert_eq!(UserRole::from_id(4), UserRole::Unknown);
        assert_eq!(UserRole::from_id(99), UserRole::Unknown);
    }

    #[test]
    fn intake_direction_wire_values() {
        assert_eq!(IntakeDirection::In.wire_value(), 1);
        assert_eq!(IntakeDirection::Out.wire_value(), 2);
    }

    #[test]
    fn key_digits() {
        assert_eq!(KeyCode::Key0.digit(), Some('0'));
        assert_eq!(KeyCode::Key9.digit(), Some('9'));
        assert_eq!(KeyCode::Max.digit(), None);
        assert_eq!(KeyCode::Start.digit(), None);
    }

    #[test]
    fn message_method_round_trip() {
        assert_eq!(
            MessageMethod::parse(MessageMethod::Refuel.as_str()),
            Some(MessageMethod::Refuel)
        );
        assert_eq!(
            MessageMethod::parse(MessageMethod::Intake.as_str()),
            Some(MessageMethod::Intake)
        );
        assert_eq!(MessageMethod::parse("Unknown"), None);
    }
}
