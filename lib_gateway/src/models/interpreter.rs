//! # State Interpreter
//!
//! Turns the raw status codes of one status read into unified enumerations.
//! Every table is total: a code that is not listed maps to an explicit
//! `Unknown` (serialised as `"UNKNOWN"`) instead of failing.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::resolver::ModelFamily;
use crate::driver::{RawAlarm, RawStatus};

/// Declares a status enum whose variants serialise to the controller's own
/// labels, plus a catch-all `Unknown`.
macro_rules! coded_status {
    ($(#[$meta:meta])* $name:ident { $($code:literal => $variant:ident = $label:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant,)+
            #[serde(rename = "UNKNOWN")]
            Unknown,
        }

        impl $name {
            pub fn from_code(code: i16) -> Self {
                match code {
                    $($code => $name::$variant,)+
                    _ => $name::Unknown,
                }
            }

            pub fn label(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                    $name::Unknown => UNKNOWN,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

pub const UNKNOWN: &str = "UNKNOWN";

coded_status!(
    /// T (lathe) or M (mill) mode.
    TmMode {
        0 => Turning = "T",
        1 => Milling = "M",
    }
);

coded_status!(
    /// Automatic/manual mode selection (`aut`).
    ProgramMode {
        0 => Mdi = "MDI",
        1 => Memory = "MEMory",
        2 => NoSelection = "No Selection",
        3 => Edit = "EDIT",
        4 => Handle = "HaNDle",
        5 => Jog = "JOG",
        6 => TeachInJog = "Teach in JOG",
        7 => TeachInHandle = "Teach in HaNDle",
        8 => IncFeed = "INC·feed",
        9 => Reference = "REFerence",
        10 => Remote = "ReMoTe",
    }
);

coded_status!(
    /// Automatic operation state (`run`).
    MachineState {
        0 => Reset = "Reset",
        1 => Stop = "STOP",
        2 => Hold = "HOLD",
        3 => Start = "START",
        4 => Mstr = "MSTR",
    }
);

coded_status!(
    AxisMovement {
        0 => Idle = "None",
        1 => Motion = "Motion",
        2 => Dwell = "Dwell",
    }
);

coded_status!(
    EmergencyStatus {
        0 => NotEmergency = "Not Emergency",
        1 => Emergency = "EMerGency",
        2 => Reset = "ReSET",
        3 => Wait = "WAIT",
    }
);

coded_status!(
    /// Alarm class reported in the status word.
    AlarmStatus {
        0 => Others = "Others",
        1 => Alarm = "ALarM",
        2 => BatteryLow = "BATtery Low",
        3 => Fan = "FAN",
        4 => PsWarning = "PS Warning",
        5 => FssbWarning = "FSsB Warning",
        6 => InsulateWarning = "INSulate Warning",
        7 => EncoderWarning = "ENCoder Warning",
        8 => PmcAlarm = "PMC Alarm",
    }
);

impl AlarmStatus {
    /// Anything other than the quiet `Others` state or an unreadable code.
    pub fn is_active(&self) -> bool {
        !matches!(self, AlarmStatus::Others | AlarmStatus::Unknown)
    }
}

/// M-function finish signal. Only code 1 is meaningful; everything else is
/// reported as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MstbStatus {
    #[serde(rename = "FIN")]
    Fin,
    #[serde(rename = "Other")]
    Other,
}

impl MstbStatus {
    pub fn from_code(code: i16) -> Self {
        if code == 1 {
            MstbStatus::Fin
        } else {
            MstbStatus::Other
        }
    }
}

const EDIT_COMMON: &[(i16, &str)] = &[
    (0, "Not Editing"),
    (1, "EDIT"),
    (2, "SEARCH"),
    (3, "OUTPUT"),
    (4, "INPUT"),
    (5, "COMPARE"),
    (10, "RVRS"),
    (11, "RTRY"),
    (12, "RVED"),
    (16, "AICC"),
    (23, "NANO HP"),
    (25, "5-AXIS"),
    (28, "WZR"),
    (39, "TCP"),
    (40, "TWP"),
    (41, "TCP+TWP"),
    (42, "APC"),
    (43, "PRG-CHK"),
    (44, "APC"),
    (45, "S-TCP"),
    (59, "ALLSAVE"),
    (60, "NOTSAVE"),
];

const EDIT_TURNING: &[(i16, &str)] = &[
    (6, "OFFSET"),
    (7, "Work Shift"),
    (9, "Restart"),
    (14, "PTRR"),
    (21, "HPCC"),
    (26, "OFSX"),
    (27, "OFSZ"),
    (29, "OFSY"),
    (31, "TOFS"),
];

const EDIT_MILLING: &[(i16, &str)] = &[
    (6, "Label Skip"),
    (7, "Restart"),
    (8, "HPCC"),
    (9, "PTRR"),
    (13, "HANDLE"),
    (14, "OFFSET"),
    (15, "Work Offset"),
    (17, "Memory Check"),
    (21, "AI APC"),
    (22, "MBL APC"),
    (24, "AI HPCC"),
    (26, "LEN"),
    (27, "RAD"),
];

fn lookup(table: &[(i16, &'static str)], code: i16) -> Option<&'static str> {
    table.iter().find(|(c, _)| *c == code).map(|(_, label)| *label)
}

/// Edit state depends on the T/M mode; an unknown mode makes it unknown too.
pub fn edit_status(tm_mode: TmMode, code: i16) -> &'static str {
    let specific = match tm_mode {
        TmMode::Turning => EDIT_TURNING,
        TmMode::Milling => EDIT_MILLING,
        TmMode::Unknown => return UNKNOWN,
    };
    lookup(EDIT_COMMON, code)
        .or_else(|| lookup(specific, code))
        .unwrap_or(UNKNOWN)
}

/// Alarm type code to its short class name.
pub fn alarm_type_description(kind: i16) -> &'static str {
    match kind {
        0 => "SW",
        1 => "PW",
        2 => "IO",
        3 => "PS",
        4 => "OT",
        5 => "OH",
        6 => "SV",
        7 => "SR",
        8 => "MC",
        9 => "SP",
        10 => "DS",
        11 => "IE",
        12 => "BG",
        13 => "SN",
        14 => "reserved",
        15 => "EX",
        19 => "PC",
        _ => UNKNOWN,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmDetail {
    pub error_code: String,
    pub error_type_description: String,
    pub error_message: String,
}

impl AlarmDetail {
    /// `None` for slots without a message.
    pub fn from_raw(raw: &RawAlarm) -> Option<Self> {
        let message = raw.message.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if message.is_empty() {
            return None;
        }
        Some(Self {
            error_code: raw.number.to_string(),
            error_type_description: alarm_type_description(raw.kind).to_string(),
            error_message: message.to_string(),
        })
    }
}

/// The unified view of one status read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedState {
    pub tm_mode: TmMode,
    pub program_mode: ProgramMode,
    pub machine_state: MachineState,
    pub axis_movement_status: AxisMovement,
    pub mstb_status: MstbStatus,
    pub emergency_status: EmergencyStatus,
    pub alarm_status: AlarmStatus,
    pub edit_status: String,
}

impl UnifiedState {
    /// Jog and handwheel modes, taught or not.
    pub fn is_manual_mode(&self) -> bool {
        matches!(
            self.program_mode,
            ProgramMode::Handle | ProgramMode::Jog | ProgramMode::TeachInJog | ProgramMode::TeachInHandle
        )
    }
}

/// Interprets status reads for one model family. All known families share
/// the standard tables today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpreter {
    family: ModelFamily,
}

impl Interpreter {
    pub fn for_family(family: ModelFamily) -> Self {
        Self { family }
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn interpret_state(&self, raw: &RawStatus) -> UnifiedState {
        let tm_mode = TmMode::from_code(raw.tmmode);
        UnifiedState {
            tm_mode,
            program_mode: ProgramMode::from_code(raw.aut),
            machine_state: MachineState::from_code(raw.run),
            axis_movement_status: AxisMovement::from_code(raw.motion),
            mstb_status: MstbStatus::from_code(raw.mstb),
            emergency_status: EmergencyStatus::from_code(raw.emergency),
            alarm_status: AlarmStatus::from_code(raw.alarm),
            edit_status: edit_status(tm_mode, raw.edit).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_codes_to_controller_labels() {
        let interp = Interpreter::for_family(ModelFamily::Series0i);
        let state = interp.interpret_state(&RawStatus {
            tmmode: 1,
            aut: 1,
            run: 3,
            motion: 1,
            mstb: 1,
            emergency: 0,
            alarm: 2,
            edit: 15,
        });
        assert_eq!(state.tm_mode, TmMode::Milling);
        assert_eq!(state.program_mode.label(), "MEMory");
        assert_eq!(state.machine_state, MachineState::Start);
        assert_eq!(state.axis_movement_status, AxisMovement::Motion);
        assert_eq!(state.mstb_status, MstbStatus::Fin);
        assert_eq!(state.emergency_status, EmergencyStatus::NotEmergency);
        assert_eq!(state.alarm_status, AlarmStatus::BatteryLow);
        assert_eq!(state.edit_status, "Work Offset");
    }

    #[test]
    fn every_code_resolves_without_failing() {
        let interp = Interpreter::for_family(ModelFamily::Unknown);
        for code in [i16::MIN, -1, 11, 99, i16::MAX] {
            let state = interp.interpret_state(&RawStatus {
                tmmode: code,
                aut: code,
                run: code,
                motion: code,
                mstb: code,
                emergency: code,
                alarm: code,
                edit: code,
            });
            assert_eq!(state.program_mode, ProgramMode::Unknown);
            assert_eq!(state.machine_state, MachineState::Unknown);
            assert_eq!(state.emergency_status, EmergencyStatus::Unknown);
            assert_eq!(state.mstb_status, MstbStatus::Other);
            assert_eq!(state.edit_status, UNKNOWN);
        }
    }

    #[test]
    fn edit_status_depends_on_tm_mode() {
        assert_eq!(edit_status(TmMode::Turning, 7), "Work Shift");
        assert_eq!(edit_status(TmMode::Milling, 7), "Restart");
        assert_eq!(edit_status(TmMode::Turning, 44), "APC");
        assert_eq!(edit_status(TmMode::Milling, 30), UNKNOWN);
    }

    #[test]
    fn unknown_serialises_as_sentinel() {
        let json = serde_json::to_string(&MachineState::Unknown).unwrap();
        assert_eq!(json, "\"UNKNOWN\"");
        let back: ProgramMode = serde_json::from_str("\"Teach in HaNDle\"").unwrap();
        assert_eq!(back, ProgramMode::TeachInHandle);
    }

    #[test]
    fn alarms_without_message_are_dropped() {
        let blank = RawAlarm {
            number: 1,
            kind: 3,
            axis: 0,
            message: "\0\0 ".to_string(),
        };
        assert!(AlarmDetail::from_raw(&blank).is_none());

        let real = RawAlarm {
            number: 1001,
            kind: 19,
            axis: 0,
            message: "DOOR OPEN".to_string(),
        };
        let detail = AlarmDetail::from_raw(&real).unwrap();
        assert_eq!(detail.error_type_description, "PC");
        assert_eq!(detail.error_code, "1001");
    }
}
