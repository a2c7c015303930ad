//! Display content for every state.
//!
//! [`display_message`] is a pure function of the state and a snapshot of
//! the session; the controller renders exactly what it returns. Texts
//! are the deployment's Russian prompts.

use fuelflux_core::{
    DisplayMessage, IntakeDirection, SystemState, TankInfo, TankNumber, UserInfo, UserRole, Volume,
};

/// Session snapshot the display content is derived from.
#[derive(Debug, Clone)]
pub struct DisplayContext<'a> {
    pub user: &'a UserInfo,
    pub available_tanks: &'a [TankInfo],
    pub selected_tank: TankNumber,
    pub entered_volume: Volume,
    pub current_input: &'a str,
    pub intake_direction: IntakeDirection,
    pub current_refuel_volume: Volume,
    pub last_error: &'a str,
    pub time_string: &'a str,
    pub device_serial: &'a str,
}

/// Format a volume the way the display shows it: `12.34 л`.
pub fn format_volume(volume: Volume) -> String {
    format!("{volume:.2} л")
}

fn direction_label(direction: IntakeDirection) -> &'static str {
    match direction {
        IntakeDirection::In => "Приём топлива",
        IntakeDirection::Out => "Слив топлива",
    }
}

/// Compute the four display lines for a state.
pub fn display_message(state: SystemState, ctx: &DisplayContext<'_>) -> DisplayMessage {
    match state {
        SystemState::Waiting => DisplayMessage::new(
            "Поднесите карту или введите PIN",
            ctx.time_string,
            "",
            ctx.device_serial,
        ),

        SystemState::PinEntry => DisplayMessage::new(
            "Введите PIN и нажмите Старт (A)",
            "*".repeat(ctx.current_input.chars().count()),
            ctx.time_string,
            "",
        ),

        SystemState::Authorization => DisplayMessage::new(
            "Авторизация...",
            "Пожалуйста, подождите",
            "",
            ctx.device_serial,
        ),

        SystemState::NotAuthorized => DisplayMessage::new(
            "Авторизация отклонена",
            ctx.last_error,
            "Нажмите Отмена (B)",
            ctx.time_string,
        ),

        SystemState::TankSelection => {
            let mut tanks_line = String::from("Доступные цистерны: ");
            for tank in ctx.available_tanks {
                tanks_line.push_str(&tank.number.to_string());
                tanks_line.push(' ');
            }
            DisplayMessage::new(
                "Выберите цистерну и нажмите Старт (A)",
                ctx.current_input,
                tanks_line,
                "",
            )
        }

        SystemState::VolumeEntry => {
            let max_line = if ctx.user.role == UserRole::Customer {
                format!("Макс: {}", format_volume(ctx.user.allowance))
            } else {
                String::new()
            };
            DisplayMessage::new(
                "Введите объём и нажмите Старт (A)",
                ctx.current_input,
                max_line,
                "Нажмите * для макс, # для очистки",
            )
        }

        SystemState::Refueling => DisplayMessage::new(
            format!("Заправка {}", format_volume(ctx.entered_volume)),
            format_volume(ctx.current_refuel_volume),
            "",
            "",
        ),

        SystemState::RefuelDataTransmission | SystemState::IntakeDataTransmission => {
            DisplayMessage::new(
                "Передача данных",
                "Пожалуйста, подождите",
                "",
                ctx.device_serial,
            )
        }

        SystemState::RefuelingComplete => DisplayMessage::new(
            "Заправка завершена",
            format_volume(ctx.current_refuel_volume),
            "",
            "Поднесите карту или введите PIN",
        ),

        SystemState::IntakeDirectionSelection => DisplayMessage::new(
            "Выберите направление (1/2) и нажмите Старт (A)",
            "1 - Приём топлива",
            "2 - Слив топлива",
            format!("Цистерна {}", ctx.selected_tank),
        ),

        SystemState::IntakeVolumeEntry => DisplayMessage::new(
            "Введите объём приёма и нажмите Старт (A)",
            ctx.current_input,
            format!("Цистерна {}", ctx.selected_tank),
            direction_label(ctx.intake_direction),
        ),

        SystemState::IntakeComplete => DisplayMessage::new(
            "Приём завершён",
            format_volume(ctx.entered_volume),
            format!("Цистерна {}", ctx.selected_tank),
            direction_label(ctx.intake_direction),
        ),

        SystemState::Error => DisplayMessage::new(
            "ОШИБКА",
            ctx.last_error,
            "Нажмите Отмена (B) для продолжения",
            ctx.time_string,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(user: &'a UserInfo, tanks: &'a [TankInfo]) -> DisplayContext<'a> {
        DisplayContext {
            user,
            available_tanks: tanks,
            selected_tank: 2,
            entered_volume: 50.0,
            current_input: "123",
            intake_direction: IntakeDirection::Out,
            current_refuel_volume: 3.7,
            last_error: "Ошибка портала",
            time_string: "12:00 01.08.2026",
            device_serial: "SER-42",
        }
    }

    #[test]
    fn format_volume_two_decimals() {
        assert_eq!(format_volume(3.7), "3.70 л");
        assert_eq!(format_volume(0.0), "0.00 л");
        assert_eq!(format_volume(100.0), "100.00 л");
    }

    #[test]
    fn message_is_pure() {
        let user = UserInfo::default();
        let tanks = vec![];
        let a = display_message(SystemState::Waiting, &ctx(&user, &tanks));
        let b = display_message(SystemState::Waiting, &ctx(&user, &tanks));
        assert_eq!(a, b);
    }

    #[test]
    fn pin_entry_masks_input() {
        let user = UserInfo::default();
        let tanks = vec![];
        let message = display_message(SystemState::PinEntry, &ctx(&user, &tanks));
        assert_eq!(message.line2, "***");
    }

    #[test]
    fn tank_selection_lists_tanks() {
        let user = UserInfo::default();
        let tanks = vec![
            TankInfo {
                number: 1,
                name: "A".into(),
            },
            TankInfo {
                number: 3,
                name: "B".into(),
            },
        ];
        let message = display_message(SystemState::TankSelection, &ctx(&user, &tanks));
        assert_eq!(message.line3, "Доступные цистерны: 1 3 ");
    }

    #[test]
    fn volume_entry_shows_allowance_for_customers_only() {
        let customer = UserInfo {
            role: UserRole::Customer,
            allowance: 100.0,
            ..UserInfo::default()
        };
        let tanks = vec![];
        let message = display_message(SystemState::VolumeEntry, &ctx(&customer, &tanks));
        assert_eq!(message.line3, "Макс: 100.00 л");

        let operator = UserInfo {
            role: UserRole::Operator,
            ..UserInfo::default()
        };
        let message = display_message(SystemState::VolumeEntry, &ctx(&operator, &tanks));
        assert_eq!(message.line3, "");
    }

    #[test]
    fn refueling_complete_shows_dispensed_volume() {
        let user = UserInfo::default();
        let tanks = vec![];
        let message = display_message(SystemState::RefuelingComplete, &ctx(&user, &tanks));
        assert_eq!(message.line2, "3.70 л");
    }

    #[test]
    fn intake_lines_carry_direction_and_tank() {
        let user = UserInfo::default();
        let tanks = vec![];
        let message = display_message(SystemState::IntakeVolumeEntry, &ctx(&user, &tanks));
        assert_eq!(message.line3, "Цистерна 2");
        assert_eq!(message.line4, "Слив топлива");

        let message = display_message(SystemState::IntakeComplete, &ctx(&user, &tanks));
        assert_eq!(message.line2, "50.00 л");
    }

    #[test]
    fn error_state_shows_last_error() {
        let user = UserInfo::default();
        let tanks = vec![];
        let message = display_message(SystemState::Error, &ctx(&user, &tanks));
        assert_eq!(message.line1, "ОШИБКА");
        assert_eq!(message.line2, "Ошибка портала");
    }

    #[test]
    fn every_state_renders() {
        let user = UserInfo::default();
        let tanks = vec![];
        for &state in SystemState::ALL.iter() {
            let message = display_message(state, &ctx(&user, &tanks));
            assert!(!message.line1.is_empty(), "state {state:?} has no headline");
        }
    }
}
