//! # Simulated Driver
//!
//! An in-process controller farm implementing `DeviceDriver`. The server runs
//! on it in simulation mode and the test suites use it for fault injection:
//! per-call error queues, reachability switches, handle invalidation and call
//! counters.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::codes::{EW_BUSY, EW_DATA, EW_HANDLE, EW_NUMBER, EW_SOCKET};
use super::{
    DataValue, DeviceDriver, DiagKind, DriverError, Endpoint, Handle, RawAlarm, RawAxisPosition,
    RawProgramName, RawSpindleMeter, RawStatus, ScaledValue, SystemInfo,
};

/// The observable state of one simulated controller.
#[derive(Debug, Clone)]
pub struct SimMachine {
    pub system: SystemInfo,
    pub status: RawStatus,
    pub alarms: Vec<RawAlarm>,
    pub axes: Vec<RawAxisPosition>,
    /// Keyed by `(diagnosis number, axis or spindle)`.
    pub diagnostics: HashMap<(i16, i16), DataValue>,
    pub spindles: Vec<RawSpindleMeter>,
    pub spindle_overrides: Vec<i32>,
    pub program: RawProgramName,
    pub executing_block: String,
    /// Raw text returned by a program upload, artifacts included.
    pub program_text: String,
    pub path: i16,
    pub actual_feed: ScaledValue,
    pub contour_feed: i32,
    pub feed_override: i32,
    pub jog_override: i32,
    pub parameters: HashMap<i16, DataValue>,
    /// Number of `EW_BUSY` answers an upload gives before data flows.
    pub upload_busy_signals: u32,
}

impl SimMachine {
    /// A three-axis mill with one spindle running program O1234.
    pub fn new(series: &str) -> Self {
        let axes = ["X", "Y", "Z"]
            .iter()
            .enumerate()
            .map(|(i, name)| RawAxisPosition {
                name: (*name).to_string(),
                position: ScaledValue::new(12_500 * (i as i32 + 1), 3),
            })
            .collect::<Vec<_>>();

        let mut diagnostics = HashMap::new();
        for axis in 1..=3 {
            diagnostics.insert((301, axis), DataValue::Real(0.5 * f64::from(axis)));
            diagnostics.insert((308, axis), DataValue::Integer(35 + i64::from(axis)));
            diagnostics.insert((309, axis), DataValue::Integer(30 + i64::from(axis)));
            diagnostics.insert((4901, axis), DataValue::Integer(120 * i64::from(axis)));
        }
        diagnostics.insert((411, 1), DataValue::Integer(42));

        let parameters = HashMap::from([
            (6711, DataValue::Integer(1520)),
            (6750, DataValue::Integer(3_600 * 1_000 + 125)),
            (6751, DataValue::Integer(3_600 * 420)),
            (6753, DataValue::Integer(3_600 * 210 + 61)),
            (6757, DataValue::Integer(95)),
        ]);

        Self {
            system: SystemInfo {
                manufacturer: "FANUC".to_string(),
                model: format!("Series {series}"),
                series: series.to_string(),
                version: "A1.0".to_string(),
                max_axes: 8,
                controlled_axes: 3,
            },
            status: RawStatus {
                tmmode: 1,
                aut: 1,
                run: 3,
                motion: 1,
                mstb: 0,
                emergency: 0,
                alarm: 0,
                edit: 0,
            },
            alarms: Vec::new(),
            axes,
            diagnostics,
            spindles: vec![RawSpindleMeter {
                load: ScaledValue::new(125, 1),
                speed: ScaledValue::new(8_000, 0),
            }],
            spindle_overrides: vec![16_383],
            program: RawProgramName {
                name: "O1234".to_string(),
                number: 1234,
            },
            executing_block: "N10 G01 X10. Y20. F500\nN20 G00 Z50.".to_string(),
            program_text: "%\nO1234\nG21\nG00 X0 Y0\nM30\n%\0\0\0".to_string(),
            path: 1,
            actual_feed: ScaledValue::new(5_000, 1),
            contour_feed: 480,
            feed_override: 100,
            jog_override: 50,
            parameters,
            upload_busy_signals: 0,
        }
    }

    /// The number an upload by O-number accepts, if the name carries one.
    fn display_number(&self) -> Option<i64> {
        self.program
            .name
            .strip_prefix('O')
            .and_then(|digits| digits.parse().ok())
    }
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::new("0i-F")
    }
}

struct MachineSlot {
    machine: SimMachine,
    reachable: bool,
    faults: HashMap<&'static str, VecDeque<i16>>,
}

struct Upload {
    data: Vec<u8>,
    pos: usize,
    busy_left: u32,
}

#[derive(Default)]
struct SimState {
    machines: HashMap<String, MachineSlot>,
    handles: HashMap<u16, String>,
    uploads: HashMap<u16, Upload>,
    next_handle: u16,
    calls: HashMap<&'static str, u64>,
    startups: u32,
    startup_failure: Option<i16>,
}

/// A `DeviceDriver` backed by in-memory `SimMachine`s.
#[derive(Default)]
pub struct SimulatedDriver {
    state: Mutex<SimState>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the controller answering at `endpoint`.
    pub fn add_machine(&self, endpoint: &str, machine: SimMachine) {
        let mut state = self.lock();
        state.machines.insert(
            endpoint.to_string(),
            MachineSlot {
                machine,
                reachable: true,
                faults: HashMap::new(),
            },
        );
    }

    /// Makes an endpoint (un)reachable. Taking it down also kills its live
    /// handles, so in-flight sessions see socket errors.
    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        let mut state = self.lock();
        if let Some(slot) = state.machines.get_mut(endpoint) {
            slot.reachable = reachable;
        }
        if !reachable {
            state.handles.retain(|_, ep| ep != endpoint);
        }
    }

    /// Invalidates every live handle for `endpoint` without taking it down.
    pub fn drop_connections(&self, endpoint: &str) {
        self.lock().handles.retain(|_, ep| ep != endpoint);
    }

    /// Queues `times` failures with status `code` for the next calls of `op`
    /// against `endpoint`.
    pub fn inject(&self, endpoint: &str, op: &'static str, code: i16, times: usize) {
        let mut state = self.lock();
        if let Some(slot) = state.machines.get_mut(endpoint) {
            slot.faults
                .entry(op)
                .or_default()
                .extend(std::iter::repeat(code).take(times));
        }
    }

    /// Mutates a registered controller in place.
    pub fn update_machine(&self, endpoint: &str, f: impl FnOnce(&mut SimMachine)) {
        if let Some(slot) = self.lock().machines.get_mut(endpoint) {
            f(&mut slot.machine);
        }
    }

    /// Makes the next `startup` fail with `code`.
    pub fn fail_startup(&self, code: i16) {
        self.lock().startup_failure = Some(code);
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: &str) -> u64 {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.calls("connect")
    }

    pub fn startups(&self) -> u32 {
        self.lock().startups
    }

    /// Live handles currently open against `endpoint`.
    pub fn live_handles(&self, endpoint: &str) -> usize {
        self.lock().handles.values().filter(|ep| *ep == endpoint).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("simulator lock poisoned")
    }

    /// Common path of every handle-based call: count it, resolve the handle,
    /// honour reachability and injected faults, then run `f` on the machine.
    fn with_machine<T>(
        &self,
        op: &'static str,
        handle: Handle,
        f: impl FnOnce(&mut SimMachine) -> Result<T, i16>,
    ) -> Result<T, DriverError> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;

        let endpoint = state
            .handles
            .get(&handle.0)
            .cloned()
            .ok_or(DriverError::new(op, EW_HANDLE))?;
        let slot = state
            .machines
            .get_mut(&endpoint)
            .ok_or(DriverError::new(op, EW_HANDLE))?;
        if !slot.reachable {
            return Err(DriverError::new(op, EW_SOCKET));
        }
        if let Some(code) = slot.faults.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(DriverError::new(op, code));
        }
        f(&mut slot.machine).map_err(|code| DriverError::new(op, code))
    }

    fn begin_upload(&self, op: &'static str, handle: Handle, accept: impl FnOnce(&SimMachine) -> bool) -> Result<(), DriverError> {
        let (data, busy_left) = self.with_machine(op, handle, |m| {
            if accept(m) {
                Ok((m.program_text.clone().into_bytes(), m.upload_busy_signals))
            } else {
                Err(EW_DATA)
            }
        })?;
        self.lock().uploads.insert(
            handle.0,
            Upload {
                data,
                pos: 0,
                busy_left,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDriver {
    async fn startup(&self, _mode: u16, _log_path: &str) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.startups += 1;
        match state.startup_failure.take() {
            Some(code) => Err(DriverError::new("startup", code)),
            None => Ok(()),
        }
    }

    async fn connect(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<Handle, DriverError> {
        let key = endpoint.to_string();
        let mut state = self.lock();
        *state.calls.entry("connect").or_default() += 1;

        let slot = state
            .machines
            .get_mut(&key)
            .ok_or(DriverError::new("connect", EW_SOCKET))?;
        if !slot.reachable {
            return Err(DriverError::new("connect", EW_SOCKET));
        }
        if let Some(code) = slot.faults.get_mut("connect").and_then(VecDeque::pop_front) {
            return Err(DriverError::new("connect", code));
        }

        // Handle 0 is reserved for "no connection".
        loop {
            state.next_handle = state.next_handle.wrapping_add(1);
            let candidate = state.next_handle;
            if candidate != 0 && !state.handles.contains_key(&candidate) {
                state.handles.insert(candidate, key);
                return Ok(Handle(candidate));
            }
        }
    }

    async fn disconnect(&self, handle: Handle) -> Result<(), DriverError> {
        let mut state = self.lock();
        *state.calls.entry("disconnect").or_default() += 1;
        state.uploads.remove(&handle.0);
        match state.handles.remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(DriverError::new("disconnect", EW_HANDLE)),
        }
    }

    async fn read_system_info(&self, handle: Handle) -> Result<SystemInfo, DriverError> {
        self.with_machine("read_system_info", handle, |m| Ok(m.system.clone()))
    }

    async fn read_status(&self, handle: Handle) -> Result<RawStatus, DriverError> {
        self.with_machine("read_status", handle, |m| Ok(m.status))
    }

    async fn read_alarms(&self, handle: Handle, max: usize) -> Result<Vec<RawAlarm>, DriverError> {
        self.with_machine("read_alarms", handle, |m| {
            Ok(m.alarms.iter().take(max).cloned().collect())
        })
    }

    async fn read_positions(&self, handle: Handle, max_axes: i16) -> Result<Vec<RawAxisPosition>, DriverError> {
        self.with_machine("read_positions", handle, |m| {
            let limit = usize::try_from(max_axes).unwrap_or(0);
            Ok(m.axes.iter().take(limit).cloned().collect())
        })
    }

    async fn read_diagnosis(
        &self,
        handle: Handle,
        number: i16,
        axis: i16,
        _kind: DiagKind,
    ) -> Result<DataValue, DriverError> {
        self.with_machine("read_diagnosis", handle, |m| {
            m.diagnostics.get(&(number, axis)).copied().ok_or(EW_NUMBER)
        })
    }

    async fn read_spindle_meters(&self, handle: Handle) -> Result<Vec<RawSpindleMeter>, DriverError> {
        self.with_machine("read_spindle_meters", handle, |m| Ok(m.spindles.clone()))
    }

    async fn read_spindle_overrides(&self, handle: Handle) -> Result<Vec<i32>, DriverError> {
        self.with_machine("read_spindle_overrides", handle, |m| Ok(m.spindle_overrides.clone()))
    }

    async fn read_program_name(&self, handle: Handle) -> Result<RawProgramName, DriverError> {
        self.with_machine("read_program_name", handle, |m| Ok(m.program.clone()))
    }

    async fn read_executing_block(&self, handle: Handle) -> Result<String, DriverError> {
        self.with_machine("read_executing_block", handle, |m| Ok(m.executing_block.clone()))
    }

    async fn read_actual_feed(&self, handle: Handle) -> Result<ScaledValue, DriverError> {
        self.with_machine("read_actual_feed", handle, |m| Ok(m.actual_feed))
    }

    async fn read_contour_feed(&self, handle: Handle) -> Result<i32, DriverError> {
        self.with_machine("read_contour_feed", handle, |m| Ok(m.contour_feed))
    }

    async fn read_feed_override(&self, handle: Handle) -> Result<i32, DriverError> {
        self.with_machine("read_feed_override", handle, |m| Ok(m.feed_override))
    }

    async fn read_jog_override(&self, handle: Handle) -> Result<i32, DriverError> {
        self.with_machine("read_jog_override", handle, |m| Ok(m.jog_override))
    }

    async fn read_parameter(&self, handle: Handle, number: i16, _axis: i16) -> Result<DataValue, DriverError> {
        self.with_machine("read_parameter", handle, |m| {
            m.parameters.get(&number).copied().ok_or(EW_NUMBER)
        })
    }

    async fn read_path(&self, handle: Handle) -> Result<i16, DriverError> {
        self.with_machine("read_path", handle, |m| Ok(m.path))
    }

    async fn upload_start(&self, handle: Handle, number: i64) -> Result<(), DriverError> {
        self.begin_upload("upload_start", handle, |m| m.display_number() == Some(number))
    }

    async fn upload_start_path(&self, handle: Handle, path: &str) -> Result<(), DriverError> {
        self.begin_upload("upload_start_path", handle, |m| {
            path.rsplit('/').next() == Some(m.program.name.as_str())
        })
    }

    async fn upload_read(&self, handle: Handle, max_len: usize) -> Result<Vec<u8>, DriverError> {
        self.with_machine("upload_read", handle, |_| Ok(()))?;
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(&handle.0)
            .ok_or(DriverError::new("upload_read", EW_DATA))?;
        if upload.busy_left > 0 {
            upload.busy_left -= 1;
            return Err(DriverError::new("upload_read", EW_BUSY));
        }
        let end = (upload.pos + max_len).min(upload.data.len());
        let chunk = upload.data[upload.pos..end].to_vec();
        upload.pos = end;
        Ok(chunk)
    }

    async fn upload_end(&self, handle: Handle) -> Result<(), DriverError> {
        let result = self.with_machine("upload_end", handle, |_| Ok(()));
        self.lock().uploads.remove(&handle.0);
        result
    }
}
