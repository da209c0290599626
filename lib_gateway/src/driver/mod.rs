//! # Device Driver Boundary
//!
//! Everything the engine knows about a controller goes through `DeviceDriver`.
//! Implementations own the vendor record layouts and hand back decoded values;
//! the engine only ever sees typed results and a `DriverError` carrying the
//! vendor status code.
//!
//! ## Contained Modules
//!
//! - **`runtime`**: one-shot, process-wide driver startup.
//! - **`simulated`**: an in-process controller farm with fault injection.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod runtime;
pub mod simulated;

pub use runtime::DriverRuntime;
pub use simulated::{SimMachine, SimulatedDriver};

/// Vendor status codes returned by FOCAS calls.
pub mod codes {
    pub const EW_PROTOCOL: i16 = -17;
    pub const EW_SOCKET: i16 = -16;
    pub const EW_NODLL: i16 = -15;
    pub const EW_HANDLE: i16 = -8;
    pub const EW_VERSION: i16 = -7;
    pub const EW_UNEXP: i16 = -6;
    pub const EW_SYSTEM: i16 = -5;
    pub const EW_RESET: i16 = -2;
    pub const EW_BUSY: i16 = -1;
    pub const EW_OK: i16 = 0;
    pub const EW_FUNC: i16 = 1;
    pub const EW_LENGTH: i16 = 2;
    pub const EW_NUMBER: i16 = 3;
    pub const EW_ATTRIB: i16 = 4;
    pub const EW_DATA: i16 = 5;
    pub const EW_NOOPT: i16 = 6;
    pub const EW_PARAM: i16 = 9;
    pub const EW_BUFFER: i16 = 10;
    pub const EW_MODE: i16 = 12;
    pub const EW_REJECT: i16 = 13;
}

/// A failed driver call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} failed: rc={code}")]
pub struct DriverError {
    /// Name of the driver call, for logs.
    pub op: &'static str,
    /// Vendor status code.
    pub code: i16,
}

impl DriverError {
    pub fn new(op: &'static str, code: i16) -> Self {
        Self { op, code }
    }

    /// The connection itself is unusable: the handle was invalidated or the
    /// socket dropped.
    pub fn is_transport(&self) -> bool {
        matches!(self.code, codes::EW_HANDLE | codes::EW_SOCKET)
    }

    pub fn is_busy(&self) -> bool {
        self.code == codes::EW_BUSY
    }

    pub fn is_reset(&self) -> bool {
        self.code == codes::EW_RESET
    }

    /// More data is pending in an upload transfer.
    pub fn is_buffer(&self) -> bool {
        self.code == codes::EW_BUFFER
    }
}

/// Opaque token for a live transport connection. Zero means "no connection".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(pub u16);

impl Handle {
    pub const NONE: Handle = Handle(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// A validated `host:port` controller address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Why an endpoint string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("missing port in address {0:?}")]
    MissingPort(String),
    #[error("missing host in address {0:?}")]
    MissingHost(String),
    #[error("invalid port in address {0:?}")]
    InvalidPort(String),
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

        // Bracketed IPv6 literal, e.g. "[fe80::1]:8193".
        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| EndpointError::MissingHost(s.to_string()))?,
            None if host.contains(':') => return Err(EndpointError::MissingPort(s.to_string())),
            None => host,
        };
        if host.is_empty() {
            return Err(EndpointError::MissingHost(s.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;
        if port == 0 {
            return Err(EndpointError::InvalidPort(s.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A fixed-point reading as reported by the controller: `value / 10^decimals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScaledValue {
    pub value: i32,
    pub decimals: i16,
}

impl ScaledValue {
    pub fn new(value: i32, decimals: i16) -> Self {
        Self { value, decimals }
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.value) / 10f64.powi(i32::from(self.decimals))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub manufacturer: String,
    pub model: String,
    pub series: String,
    pub version: String,
    pub max_axes: i16,
    pub controlled_axes: i16,
}

/// Raw status codes as returned by the status read. Interpretation lives in
/// `models::interpreter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawStatus {
    pub tmmode: i16,
    pub aut: i16,
    pub run: i16,
    pub motion: i16,
    pub mstb: i16,
    pub emergency: i16,
    pub alarm: i16,
    pub edit: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawAlarm {
    pub number: i32,
    pub kind: i16,
    pub axis: i16,
    pub message: String,
}

/// One slot of the absolute position table. Slots with an empty name are
/// unused axes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawAxisPosition {
    pub name: String,
    pub position: ScaledValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawSpindleMeter {
    pub load: ScaledValue,
    pub speed: ScaledValue,
}

/// How a diagnosis value is laid out on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagKind {
    Byte,
    Word,
    DoubleWord,
    Real,
}

/// A decoded diagnosis or parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataValue {
    Integer(i64),
    Real(f64),
}

impl DataValue {
    pub fn as_i64(&self) -> i64 {
        match *self {
            DataValue::Integer(v) => v,
            DataValue::Real(v) => v.round() as i64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            DataValue::Integer(v) => v as f64,
            DataValue::Real(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawProgramName {
    pub name: String,
    /// Internal program id as reported by the controller. On path-based
    /// controllers this may not be the display number.
    pub number: i64,
}

/// Opaque capability over one vendor transport.
///
/// Every read takes the handle it should run on; the driver never retries.
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Process-wide initialisation. Called once by `DriverRuntime`.
    async fn startup(&self, mode: u16, log_path: &str) -> Result<(), DriverError>;

    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Handle, DriverError>;

    async fn disconnect(&self, handle: Handle) -> Result<(), DriverError>;

    async fn read_system_info(&self, handle: Handle) -> Result<SystemInfo, DriverError>;

    async fn read_status(&self, handle: Handle) -> Result<RawStatus, DriverError>;

    /// Up to `max` active alarms.
    async fn read_alarms(&self, handle: Handle, max: usize) -> Result<Vec<RawAlarm>, DriverError>;

    /// Absolute positions for up to `max_axes` slots.
    async fn read_positions(
        &self,
        handle: Handle,
        max_axes: i16,
    ) -> Result<Vec<RawAxisPosition>, DriverError>;

    async fn read_diagnosis(
        &self,
        handle: Handle,
        number: i16,
        axis: i16,
        kind: DiagKind,
    ) -> Result<DataValue, DriverError>;

    async fn read_spindle_meters(&self, handle: Handle) -> Result<Vec<RawSpindleMeter>, DriverError>;

    /// Raw spindle override values, one per spindle, full scale 16383.
    async fn read_spindle_overrides(&self, handle: Handle) -> Result<Vec<i32>, DriverError>;

    async fn read_program_name(&self, handle: Handle) -> Result<RawProgramName, DriverError>;

    /// The block currently being executed.
    async fn read_executing_block(&self, handle: Handle) -> Result<String, DriverError>;

    async fn read_actual_feed(&self, handle: Handle) -> Result<ScaledValue, DriverError>;

    async fn read_contour_feed(&self, handle: Handle) -> Result<i32, DriverError>;

    async fn read_feed_override(&self, handle: Handle) -> Result<i32, DriverError>;

    async fn read_jog_override(&self, handle: Handle) -> Result<i32, DriverError>;

    async fn read_parameter(&self, handle: Handle, number: i16, axis: i16) -> Result<DataValue, DriverError>;

    /// Current path number on multi-path controllers.
    async fn read_path(&self, handle: Handle) -> Result<i16, DriverError>;

    async fn upload_start(&self, handle: Handle, number: i64) -> Result<(), DriverError>;

    async fn upload_start_path(&self, handle: Handle, path: &str) -> Result<(), DriverError>;

    /// Next chunk of at most `max_len` bytes. A full buffer is returned as
    /// `Ok` and more data follows. An empty chunk or `EW_RESET` ends the
    /// transfer. A bare `EW_BUFFER` carries no data and the read is repeated.
    async fn upload_read(&self, handle: Handle, max_len: usize) -> Result<Vec<u8>, DriverError>;

    async fn upload_end(&self, handle: Handle) -> Result<(), DriverError>;
}
