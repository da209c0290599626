//! # Snapshot Aggregator
//!
//! Performs the battery of reads for one poll and merges them into a single
//! timestamped `Snapshot`. The machine-state read is mandatory; every other
//! read that fails is defaulted to zero and recorded in `warnings`.
//!
//! All reads for one handle are issued one after another. Whether the vendor
//! transport tolerates concurrent calls on a single handle is not established.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::executor::ResilientExecutor;
use crate::driver::{DataValue, DeviceDriver, DiagKind, DriverError, Handle, SystemInfo};
use crate::error::{GatewayError, GatewayResult};
use crate::models::program::number_from_name;
use crate::models::{AlarmDetail, AlarmStatus, EmergencyStatus, ModelStrategy, UnifiedState};

/// Alarms requested per read.
pub const MAX_ALARMS: usize = 10;

/// Position slots read when the controller never reported its axis count.
pub const FALLBACK_MAX_AXES: i16 = 8;

/// Full scale of the raw spindle override value.
const SPINDLE_OVERRIDE_FULL_SCALE: f64 = 16383.0;

pub const PARAM_PARTS_COUNT: i16 = 6711;
pub const PARAM_POWER_ON_TIME: i16 = 6750;
pub const PARAM_OPERATING_TIME: i16 = 6751;
pub const PARAM_CUTTING_TIME: i16 = 6753;
pub const PARAM_CYCLE_TIME: i16 = 6757;

pub const DIAG_AXIS_301: i16 = 301;
pub const DIAG_SERVO_TEMPERATURE: i16 = 308;
pub const DIAG_CODER_TEMPERATURE: i16 = 309;
pub const DIAG_POWER_CONSUMPTION: i16 = 4901;
pub const DIAG_SPINDLE_411: i16 = 411;

/// Which payload a poll tick publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollProfile {
    /// The complete `Snapshot`.
    #[default]
    Full,
    /// The lighter `StatusView`.
    Status,
}

impl FromStr for PollProfile {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(PollProfile::Full),
            "status" => Ok(PollProfile::Status),
            other => Err(GatewayError::Validation(format!("unknown poll profile {other:?}"))),
        }
    }
}

impl fmt::Display for PollProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PollProfile::Full => "full",
            PollProfile::Status => "status",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisInfo {
    pub name: String,
    pub position: f64,
    pub servo_temperature: i32,
    pub coder_temperature: i32,
    pub power_consumption: i32,
    pub diag_301: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpindleInfo {
    pub number: i16,
    pub speed_rpm: i32,
    pub load_percent: f64,
    pub override_percent: i16,
    pub diag_411_value: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CurrentProgram {
    pub program_name: String,
    pub program_number: i64,
    pub g_code_line: String,
}

/// One complete poll result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub session_id: String,
    pub machine_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_enabled: bool,
    pub is_emergency: bool,
    pub has_alarms: bool,
    pub state: UnifiedState,
    pub alarms: Vec<AlarmDetail>,
    pub axes: Vec<AxisInfo>,
    pub spindles: Vec<SpindleInfo>,
    pub current_program: CurrentProgram,
    pub contour_feed_rate: i32,
    pub actual_feed_rate: f64,
    pub feed_override: i32,
    pub jog_override: i32,
    pub parts_count: i64,
    pub power_on_time: String,
    pub operating_time: String,
    pub cutting_time: String,
    pub cycle_time: String,
    /// Optional reads that failed and were defaulted.
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub name: String,
    pub number: i64,
}

/// The lighter per-tick payload: unified state plus derived flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub session_id: String,
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    pub system_info: SystemInfo,
    pub program_info: Option<ProgramInfo>,
    pub status_info: UnifiedState,
    pub has_alarms: bool,
    pub is_emergency: bool,
    pub manual_mode: bool,
    pub battery_low: bool,
    pub warning_status: String,
}

/// Seconds as `HH:MM:SS`; hours are not wrapped.
pub fn format_hms(seconds: i64) -> String {
    let s = seconds.max(0);
    format!("{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60)
}

/// Reads one session's controller through its executor.
pub struct Aggregator<'a> {
    session_id: &'a str,
    executor: &'a ResilientExecutor,
    strategy: ModelStrategy,
    system: &'a SystemInfo,
}

impl<'a> Aggregator<'a> {
    pub fn new(
        session_id: &'a str,
        executor: &'a ResilientExecutor,
        strategy: ModelStrategy,
        system: &'a SystemInfo,
    ) -> Self {
        Self {
            session_id,
            executor,
            strategy,
            system,
        }
    }

    /// The mandatory read. Its failure aborts aggregation.
    pub async fn read_machine_state(&self) -> GatewayResult<UnifiedState> {
        let raw = self
            .executor
            .execute(|d, h| async move { d.read_status(h).await })
            .await?;
        Ok(self.strategy.interpreter.interpret_state(&raw))
    }

    pub async fn aggregate(&self) -> GatewayResult<Snapshot> {
        let state = self.read_machine_state().await?;
        let mut warnings = Vec::new();

        let alarms = self.read_alarms(&mut warnings).await;
        let axes = self.read_axes(&mut warnings).await;
        let spindles = self.read_spindles(&mut warnings).await;
        let current_program = self.read_current_program(&mut warnings).await;

        let actual_feed_rate = self
            .optional(&mut warnings, "actual feed rate", |d, h| async move { d.read_actual_feed(h).await })
            .await
            .map(|v| v.as_f64())
            .unwrap_or_default();
        let feed_override = self
            .optional(&mut warnings, "feed override", |d, h| async move { d.read_feed_override(h).await })
            .await
            .unwrap_or_default();
        let contour_feed_rate = self
            .optional(&mut warnings, "contour feed rate", |d, h| async move { d.read_contour_feed(h).await })
            .await
            .unwrap_or_default();
        let jog_override = self
            .optional(&mut warnings, "jog override", |d, h| async move { d.read_jog_override(h).await })
            .await
            .unwrap_or_default();

        let parts_count = self.read_param(&mut warnings, PARAM_PARTS_COUNT, "parts count").await;
        let power_on_time = self.read_param(&mut warnings, PARAM_POWER_ON_TIME, "power-on time").await;
        let operating_time = self.read_param(&mut warnings, PARAM_OPERATING_TIME, "operating time").await;
        let cutting_time = self.read_param(&mut warnings, PARAM_CUTTING_TIME, "cutting time").await;
        let cycle_time = self.read_param(&mut warnings, PARAM_CYCLE_TIME, "cycle time").await;

        let is_emergency = state.emergency_status != EmergencyStatus::NotEmergency;
        let has_alarms = !alarms.is_empty() || state.alarm_status.is_active();

        Ok(Snapshot {
            session_id: self.session_id.to_string(),
            machine_id: self.executor.endpoint().to_string(),
            timestamp: Utc::now(),
            is_enabled: true,
            is_emergency,
            has_alarms,
            state,
            alarms,
            axes,
            spindles,
            current_program,
            contour_feed_rate,
            actual_feed_rate,
            feed_override,
            jog_override,
            parts_count,
            power_on_time: format_hms(power_on_time),
            operating_time: format_hms(operating_time),
            cutting_time: format_hms(cutting_time),
            cycle_time: format_hms(cycle_time),
            warnings,
        })
    }

    /// Unified state and program only. The state read stays mandatory.
    pub async fn status_view(&self) -> GatewayResult<StatusView> {
        let program_info = match self.executor.execute(|d, h| async move { d.read_program_name(h).await }).await {
            Ok(p) => Some(ProgramInfo {
                number: number_from_name(&p.name).unwrap_or(p.number),
                name: p.name,
            }),
            Err(e) => {
                warn!(session_id = self.session_id, error = %e, "program info unavailable");
                None
            }
        };

        let state = self.read_machine_state().await?;
        let has_alarms = state.alarm_status.is_active();

        Ok(StatusView {
            session_id: self.session_id.to_string(),
            endpoint: self.executor.endpoint().to_string(),
            timestamp: Utc::now(),
            system_info: self.system.clone(),
            program_info,
            has_alarms,
            is_emergency: state.emergency_status == EmergencyStatus::Emergency,
            manual_mode: state.is_manual_mode(),
            battery_low: state.alarm_status == AlarmStatus::BatteryLow,
            warning_status: if has_alarms { "ACTIVE" } else { "NORMAL" }.to_string(),
            status_info: state,
        })
    }

    /// Runs an optional read; on failure logs, records a warning and returns
    /// `None`.
    async fn optional<T, F, Fut>(&self, warnings: &mut Vec<String>, what: &str, op: F) -> Option<T>
    where
        F: FnMut(Arc<dyn DeviceDriver>, Handle) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        match self.executor.execute(op).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(session_id = self.session_id, error = %e, "failed to read {what}, using default");
                warnings.push(format!("{what}: {e}"));
                None
            }
        }
    }

    async fn read_alarms(&self, warnings: &mut Vec<String>) -> Vec<AlarmDetail> {
        self.optional(warnings, "alarms", |d, h| async move { d.read_alarms(h, MAX_ALARMS).await })
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(AlarmDetail::from_raw)
            .collect()
    }

    async fn read_diag(&self, warnings: &mut Vec<String>, number: i16, index: i16, kind: DiagKind) -> Option<DataValue> {
        let what = format!("diagnosis {number} #{index}");
        self.optional(warnings, &what, |d, h| async move { d.read_diagnosis(h, number, index, kind).await })
            .await
    }

    async fn read_axes(&self, warnings: &mut Vec<String>) -> Vec<AxisInfo> {
        // An empty series means system info was never read.
        let max_axes = if self.system.series.is_empty() {
            warnings.push(format!("axis count unknown, reading up to {FALLBACK_MAX_AXES} axes"));
            FALLBACK_MAX_AXES
        } else if self.system.controlled_axes <= 0 {
            return Vec::new();
        } else if self.system.max_axes > 0 {
            self.system.max_axes
        } else {
            FALLBACK_MAX_AXES
        };
        let Some(positions) = self
            .optional(warnings, "axis positions", |d, h| async move { d.read_positions(h, max_axes).await })
            .await
        else {
            return Vec::new();
        };

        let mut axes = Vec::with_capacity(positions.len());
        for (i, slot) in positions.iter().enumerate() {
            let name = slot.name.trim_matches('\0').trim();
            if name.is_empty() {
                continue;
            }
            let axis = i16::try_from(i + 1).unwrap_or(i16::MAX);

            let diag_301 = self.read_diag(warnings, DIAG_AXIS_301, axis, DiagKind::Real).await;
            let servo = self.read_diag(warnings, DIAG_SERVO_TEMPERATURE, axis, DiagKind::Byte).await;
            let coder = self.read_diag(warnings, DIAG_CODER_TEMPERATURE, axis, DiagKind::Byte).await;
            let power = self.read_diag(warnings, DIAG_POWER_CONSUMPTION, axis, DiagKind::DoubleWord).await;

            axes.push(AxisInfo {
                name: name.to_string(),
                position: slot.position.as_f64(),
                diag_301: diag_301.map(|v| v.as_f64()).unwrap_or_default(),
                servo_temperature: servo.map(|v| v.as_i64() as i32).unwrap_or_default(),
                coder_temperature: coder.map(|v| v.as_i64() as i32).unwrap_or_default(),
                power_consumption: power.map(|v| v.as_i64() as i32).unwrap_or_default(),
            });
        }
        axes
    }

    async fn read_spindles(&self, warnings: &mut Vec<String>) -> Vec<SpindleInfo> {
        let Some(meters) = self
            .optional(warnings, "spindle meters", |d, h| async move { d.read_spindle_meters(h).await })
            .await
        else {
            return Vec::new();
        };
        if meters.is_empty() {
            return Vec::new();
        }
        let overrides = self
            .optional(warnings, "spindle overrides", |d, h| async move { d.read_spindle_overrides(h).await })
            .await
            .unwrap_or_default();

        let mut spindles = Vec::with_capacity(meters.len());
        for (i, meter) in meters.iter().enumerate() {
            let number = i16::try_from(i + 1).unwrap_or(i16::MAX);
            let override_percent = overrides
                .get(i)
                .map(|raw| (f64::from(*raw) / SPINDLE_OVERRIDE_FULL_SCALE * 100.0).round() as i16)
                .unwrap_or_default();
            let diag_411 = self.read_diag(warnings, DIAG_SPINDLE_411, number, DiagKind::Word).await;

            spindles.push(SpindleInfo {
                number,
                speed_rpm: meter.speed.as_f64().round() as i32,
                load_percent: meter.load.as_f64(),
                override_percent,
                diag_411_value: diag_411.map(|v| v.as_i64() as i32).unwrap_or_default(),
            });
        }
        spindles
    }

    async fn read_current_program(&self, warnings: &mut Vec<String>) -> CurrentProgram {
        let Some(info) = self
            .optional(warnings, "program name", |d, h| async move { d.read_program_name(h).await })
            .await
        else {
            return CurrentProgram::default();
        };
        let block = self
            .optional(warnings, "executing block", |d, h| async move { d.read_executing_block(h).await })
            .await
            .unwrap_or_default();

        let name = info.name.trim_matches('\0').trim().to_string();
        CurrentProgram {
            program_number: number_from_name(&name).unwrap_or(info.number),
            program_name: name,
            g_code_line: block
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or_default()
                .to_string(),
        }
    }

    async fn read_param(&self, warnings: &mut Vec<String>, number: i16, what: &str) -> i64 {
        self.optional(warnings, what, |d, h| async move { d.read_parameter(h, number, 0).await })
            .await
            .map(|v| v.as_i64())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_render_as_clock_time() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(95), "00:01:35");
        assert_eq!(format_hms(3_600 * 210 + 61), "210:01:01");
        assert_eq!(format_hms(-5), "00:00:00");
    }

    #[test]
    fn poll_profile_parses_case_insensitively() {
        assert_eq!("Status".parse::<PollProfile>().unwrap(), PollProfile::Status);
        assert_eq!("full".parse::<PollProfile>().unwrap(), PollProfile::Full);
        assert!("verbose".parse::<PollProfile>().is_err());
    }
}
