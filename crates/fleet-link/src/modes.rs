//! ArduPilot custom-mode tables.

use crate::dialect::{MavModeFlag, MavType, HEARTBEAT_DATA};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleClass {
    Copter,
    Plane,
    Rover,
}

impl VehicleClass {
    pub fn from_mav_type(t: MavType) -> Self {
        match t {
            MavType::MAV_TYPE_FIXED_WING => VehicleClass::Plane,
            MavType::MAV_TYPE_GROUND_ROVER | MavType::MAV_TYPE_SURFACE_BOAT => VehicleClass::Rover,
            _ => VehicleClass::Copter,
        }
    }

    pub fn modes(self) -> &'static [(&'static str, u32)] {
        match self {
            VehicleClass::Copter => COPTER,
            VehicleClass::Plane => PLANE,
            VehicleClass::Rover => ROVER,
        }
    }
}

const COPTER: &[(&str, u32)] = &[
    ("STABILIZE", 0),
    ("ACRO", 1),
    ("ALT_HOLD", 2),
    ("AUTO", 3),
    ("GUIDED", 4),
    ("LOITER", 5),
    ("RTL", 6),
    ("CIRCLE", 7),
    ("LAND", 9),
    ("DRIFT", 11),
    ("SPORT", 13),
    ("FLIP", 14),
    ("AUTOTUNE", 15),
    ("POSHOLD", 16),
    ("BRAKE", 17),
    ("THROW", 18),
    ("AVOID_ADSB", 19),
    ("GUIDED_NOGPS", 20),
    ("SMART_RTL", 21),
    ("FLOWHOLD", 22),
    ("FOLLOW", 23),
    ("ZIGZAG", 24),
    ("SYSTEMID", 25),
    ("AUTOROTATE", 26),
    ("AUTO_RTL", 27),
];

const PLANE: &[(&str, u32)] = &[
    ("MANUAL", 0),
    ("CIRCLE", 1),
    ("STABILIZE", 2),
    ("TRAINING", 3),
    ("ACRO", 4),
    ("FBWA", 5),
    ("FBWB", 6),
    ("CRUISE", 7),
    ("AUTOTUNE", 8),
    ("AUTO", 10),
    ("RTL", 11),
    ("LOITER", 12),
    ("TAKEOFF", 13),
    ("AVOID_ADSB", 14),
    ("GUIDED", 15),
    ("INITIALISING", 16),
    ("QSTABILIZE", 17),
    ("QHOVER", 18),
    ("QLOITER", 19),
    ("QLAND", 20),
    ("QRTL", 21),
    ("QAUTOTUNE", 22),
    ("QACRO", 23),
    ("THERMAL", 24),
];

const ROVER: &[(&str, u32)] = &[
    ("MANUAL", 0),
    ("ACRO", 1),
    ("LEARNING", 2),
    ("STEERING", 3),
    ("HOLD", 4),
    ("LOITER", 5),
    ("FOLLOW", 6),
    ("SIMPLE", 7),
    ("AUTO", 10),
    ("RTL", 11),
    ("SMART_RTL", 12),
    ("GUIDED", 15),
    ("INITIALISING", 16),
];

/// Case-insensitive lookup of a mode name.
pub fn mode_id(class: VehicleClass, name: &str) -> Option<u32> {
    let name = name.trim();
    class
        .modes()
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, id)| *id)
}

pub fn mode_name(class: VehicleClass, id: u32) -> Option<&'static str> {
    class.modes().iter().find(|(_, i)| *i == id).map(|(n, _)| *n)
}

/// Comma-separated names, for error messages.
pub fn known_modes(class: VehicleClass) -> String {
    class.modes().iter().map(|(n, _)| *n).collect::<Vec<_>>().join(",")
}

pub fn is_armed(hb: &HEARTBEAT_DATA) -> bool {
    hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED)
}

/// Human name of the mode a heartbeat reports; `Mode(n)` when unknown.
pub fn mode_string(hb: &HEARTBEAT_DATA) -> String {
    let class = VehicleClass::from_mav_type(hb.mavtype);
    match mode_name(class, hb.custom_mode) {
        Some(n) if hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED) => n.to_string(),
        _ => format!("Mode({})", hb.custom_mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::MavMessage;
    use crate::sim;

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(mode_id(VehicleClass::Copter, "loiter"), Some(5));
        assert_eq!(mode_id(VehicleClass::Copter, " Auto "), Some(3));
        assert_eq!(mode_id(VehicleClass::Plane, "AUTO"), Some(10));
        assert_eq!(mode_id(VehicleClass::Plane, "LAND"), None);
        assert_eq!(mode_id(VehicleClass::Rover, "hold"), Some(4));
    }

    #[test]
    fn heartbeat_mode_names() {
        let MavMessage::HEARTBEAT(mut hb) = sim::heartbeat(true, 6) else { unreachable!() };
        assert_eq!(mode_string(&hb), "RTL");
        assert!(is_armed(&hb));
        hb.custom_mode = 99;
        assert_eq!(mode_string(&hb), "Mode(99)");
    }

    #[test]
    fn class_from_frame_type() {
        assert_eq!(VehicleClass::from_mav_type(MavType::MAV_TYPE_HEXAROTOR), VehicleClass::Copter);
        assert_eq!(VehicleClass::from_mav_type(MavType::MAV_TYPE_FIXED_WING), VehicleClass::Plane);
        assert_eq!(VehicleClass::from_mav_type(MavType::MAV_TYPE_GROUND_ROVER), VehicleClass::Rover);
        assert!(known_modes(VehicleClass::Rover).starts_with("MANUAL,ACRO"));
    }
}
