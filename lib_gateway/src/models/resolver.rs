//! Series string to model family. Matching is a case-insensitive prefix test
//! over an ordered table in which every longer prefix precedes any shorter
//! prefix it extends ("15I" before "15"), so the first hit is the longest
//! applicable one.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::interpreter::Interpreter;
use super::program::ProgramReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "0i")]
    Series0i,
    #[serde(rename = "15")]
    Series15,
    #[serde(rename = "15i")]
    Series15i,
    #[serde(rename = "16")]
    Series16,
    #[serde(rename = "16i")]
    Series16i,
    #[serde(rename = "18i")]
    Series18i,
    #[serde(rename = "21")]
    Series21,
    #[serde(rename = "30")]
    Series30,
    #[serde(rename = "31")]
    Series31,
    #[serde(rename = "32")]
    Series32,
    #[serde(rename = "unknown")]
    Unknown,
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelFamily::Series0i => "0i",
            ModelFamily::Series15 => "15",
            ModelFamily::Series15i => "15i",
            ModelFamily::Series16 => "16",
            ModelFamily::Series16i => "16i",
            ModelFamily::Series18i => "18i",
            ModelFamily::Series21 => "21",
            ModelFamily::Series30 => "30",
            ModelFamily::Series31 => "31",
            ModelFamily::Series32 => "32",
            ModelFamily::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Uppercase series prefixes, first match wins.
const PREFIX_TABLE: &[(&str, ModelFamily)] = &[
    ("0I", ModelFamily::Series0i),
    ("15I", ModelFamily::Series15i),
    ("15", ModelFamily::Series15),
    ("16I", ModelFamily::Series16i),
    ("16", ModelFamily::Series16),
    ("18I", ModelFamily::Series18i),
    ("21", ModelFamily::Series21),
    ("30", ModelFamily::Series30),
    ("31", ModelFamily::Series31),
    ("32", ModelFamily::Series32),
];

/// The family-specific behaviour chosen once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelStrategy {
    pub family: ModelFamily,
    pub interpreter: Interpreter,
    pub program_reader: ProgramReader,
}

impl ModelStrategy {
    pub fn for_family(family: ModelFamily) -> Self {
        Self {
            family,
            interpreter: Interpreter::for_family(family),
            program_reader: ProgramReader::for_family(family),
        }
    }
}

impl Default for ModelStrategy {
    fn default() -> Self {
        Self::for_family(ModelFamily::Unknown)
    }
}

/// Never fails: an unrecognised series yields the `Unknown` strategy.
pub fn resolve(series: &str) -> ModelStrategy {
    let upper = series.trim().to_ascii_uppercase();
    let family = PREFIX_TABLE
        .iter()
        .find(|(prefix, _)| upper.starts_with(prefix))
        .map(|(_, family)| *family)
        .unwrap_or(ModelFamily::Unknown);
    ModelStrategy::for_family(family)
}
