//! # Model Strategies
//!
//! A controller reports its series string once per session; everything that
//! depends on the model family hangs off the `ModelStrategy` resolved from it.
//!
//! ## Contained Modules
//!
//! - **`resolver`**: the ordered prefix table and `resolve()`.
//! - **`interpreter`**: raw status codes to unified, human-readable states.
//! - **`program`**: active control program upload and normalisation.

pub mod interpreter;
pub mod program;
pub mod resolver;

pub use interpreter::{
    AlarmDetail, AlarmStatus, AxisMovement, EmergencyStatus, Interpreter, MachineState, MstbStatus,
    ProgramMode, TmMode, UnifiedState,
};
pub use program::{ControlProgram, ProgramReader};
pub use resolver::{resolve, ModelFamily, ModelStrategy};
