//! # Program Reader
//!
//! Uploads the active control program. The program number is taken from the
//! numeric suffix of the program name ("O1234" -> 1234) whenever there is one,
//! because the raw number field may hold an internal id instead of the display
//! number. When no number can be resolved, path-aware controllers upload by
//! file path instead.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::resolver::ModelFamily;
use crate::core::executor::ResilientExecutor;
use crate::driver::{DeviceDriver, DriverError, Handle};
use crate::error::{GatewayError, GatewayResult};

/// Bytes requested per upload read.
pub const UPLOAD_CHUNK_LEN: usize = 256;
/// Pause after a busy answer before reading again.
pub const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Consecutive busy answers tolerated before the upload is abandoned.
pub const MAX_BUSY_RETRIES: u32 = 100;
/// Consecutive empty `EW_BUFFER` answers tolerated before the upload is abandoned.
pub const MAX_BUFFER_RETRIES: u32 = 1000;

const PROGRAM_MARKER: char = '%';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlProgram {
    pub name: String,
    pub number: i64,
    /// Normalised text, delimited by `%` at both ends.
    pub g_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum UploadTarget {
    Number(i64),
    Path(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramReader {
    /// Upload by O-number only.
    NumberOnly,
    /// Upload by O-number, falling back to the file path in CNC memory.
    PathAware,
}

impl ProgramReader {
    pub fn for_family(family: ModelFamily) -> Self {
        match family {
            ModelFamily::Series0i
            | ModelFamily::Series15
            | ModelFamily::Series15i
            | ModelFamily::Series16
            | ModelFamily::Series16i
            | ModelFamily::Series18i
            | ModelFamily::Series21 => ProgramReader::NumberOnly,
            ModelFamily::Series30 | ModelFamily::Series31 | ModelFamily::Series32 | ModelFamily::Unknown => {
                ProgramReader::PathAware
            }
        }
    }

    /// Reads the active program through `executor`. The whole transfer
    /// (start, chunk loop, end) is one executor operation, so a transport
    /// failure mid-transfer restarts it from the beginning on the new handle.
    pub async fn get_control_program(&self, executor: &ResilientExecutor) -> GatewayResult<ControlProgram> {
        let info = executor
            .execute(|d, h| async move { d.read_program_name(h).await })
            .await?;

        let name = info.name.trim_matches('\0').trim().to_string();
        let parsed = number_from_name(&name);

        let (target, number) = match (*self, parsed) {
            (_, Some(n)) => (UploadTarget::Number(n), n),
            (ProgramReader::NumberOnly, None) if info.number > 0 => (UploadTarget::Number(info.number), info.number),
            (ProgramReader::NumberOnly, None) => {
                return Err(GatewayError::Data(format!(
                    "cannot resolve a program number from name {name:?} or id {}",
                    info.number
                )));
            }
            (ProgramReader::PathAware, None) => {
                if name.is_empty() {
                    return Err(GatewayError::Data("controller reports no active program".to_string()));
                }
                let path_no = executor
                    .execute(|d, h| async move { d.read_path(h).await })
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "path number unavailable, assuming path 1");
                        1
                    });
                (UploadTarget::Path(format!("//CNC_MEM/USER/PATH{path_no}/{name}")), info.number)
            }
        };

        debug!(program = %name, ?target, "uploading control program");
        let raw = executor
            .execute(|d, h| {
                let target = target.clone();
                async move { upload(d, h, target).await }
            })
            .await?;

        Ok(ControlProgram {
            name,
            number,
            g_code: normalize_program(&raw),
        })
    }
}

/// "O1234" -> 1234. Names without the `O` prefix carry no number.
pub(crate) fn number_from_name(name: &str) -> Option<i64> {
    name.strip_prefix('O')
        .and_then(|digits| digits.parse::<i64>().ok())
        .filter(|n| *n > 0)
}

async fn upload(driver: Arc<dyn DeviceDriver>, handle: Handle, target: UploadTarget) -> Result<Vec<u8>, DriverError> {
    match &target {
        UploadTarget::Number(n) => driver.upload_start(handle, *n).await?,
        UploadTarget::Path(p) => driver.upload_start_path(handle, p).await?,
    }

    let result = read_chunks(driver.as_ref(), handle).await;

    // The transfer must be closed whatever happened during the reads.
    if let Err(e) = driver.upload_end(handle).await {
        warn!(error = %e, "upload_end failed");
    }
    result
}

async fn read_chunks(driver: &dyn DeviceDriver, handle: Handle) -> Result<Vec<u8>, DriverError> {
    let mut buf = Vec::new();
    let mut stalls = 0u32;
    let mut refills = 0u32;
    loop {
        match driver.upload_read(handle, UPLOAD_CHUNK_LEN).await {
            Ok(chunk) if chunk.is_empty() => return Ok(buf),
            Ok(chunk) => {
                stalls = 0;
                refills = 0;
                buf.extend_from_slice(&chunk);
            }
            Err(e) if e.is_reset() => return Ok(buf),
            // Read again right away.
            Err(e) if e.is_buffer() => {
                refills += 1;
                if refills > MAX_BUFFER_RETRIES {
                    return Err(e);
                }
                tokio::task::yield_now().await;
            }
            Err(e) if e.is_busy() => {
                stalls += 1;
                if stalls > MAX_BUSY_RETRIES {
                    return Err(e);
                }
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drops NUL padding, trims blanks and stray markers, and re-frames the text
/// with exactly one `%` line at each end.
pub fn normalize_program(raw: &[u8]) -> String {
    let text: String = String::from_utf8_lossy(raw).chars().filter(|c| *c != '\0').collect();
    let body = text.trim_matches(|c: char| c == PROGRAM_MARKER || c.is_ascii_whitespace());
    format!("{PROGRAM_MARKER}\n{body}\n{PROGRAM_MARKER}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::codes::{EW_BUFFER, EW_BUSY};
    use crate::driver::{SimMachine, SimulatedDriver};

    const EP: &str = "10.0.0.5:8193";

    #[test]
    fn normalisation_frames_the_program() {
        let raw = b"%\nO1234\nG00 X0\nM30\n%\0\0\0";
        assert_eq!(normalize_program(raw), "%\nO1234\nG00 X0\nM30\n%");

        let bare = b"  O1\r\nM30  ";
        assert_eq!(normalize_program(bare), "%\nO1\r\nM30\n%");

        assert_eq!(normalize_program(b""), "%\n\n%");
    }

    async fn sim_upload() -> (Arc<SimulatedDriver>, Handle) {
        let sim = Arc::new(SimulatedDriver::new());
        sim.add_machine(EP, SimMachine::default());
        let handle = sim.connect(&EP.parse().unwrap(), Duration::from_secs(1)).await.unwrap();
        (sim, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_answers_are_reread_without_waiting() {
        let (sim, handle) = sim_upload().await;
        sim.inject(EP, "upload_read", EW_BUFFER, 3);
        let started = tokio::time::Instant::now();

        let raw = upload(sim.clone(), handle, UploadTarget::Number(1234)).await.unwrap();

        assert_eq!(normalize_program(&raw), "%\nO1234\nG21\nG00 X0 Y0\nM30\n%");
        assert_eq!(started.elapsed(), Duration::ZERO);
        // three empty answers, one chunk, then the closing empty read
        assert_eq!(sim.calls("upload_read"), 5);
        assert_eq!(sim.calls("upload_end"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_answers_back_off_between_reads() {
        let (sim, handle) = sim_upload().await;
        sim.inject(EP, "upload_read", EW_BUSY, 2);
        let started = tokio::time::Instant::now();

        let raw = upload(sim.clone(), handle, UploadTarget::Number(1234)).await.unwrap();

        assert!(!raw.is_empty());
        assert_eq!(started.elapsed(), BUSY_RETRY_DELAY * 2);
    }

    #[test]
    fn program_number_comes_from_name_suffix() {
        assert_eq!(number_from_name("O1234"), Some(1234));
        assert_eq!(number_from_name("O0000"), None);
        assert_eq!(number_from_name("MAIN.NC"), None);
        assert_eq!(number_from_name("O12AB"), None);
    }
}
