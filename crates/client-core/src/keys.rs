//! Object-store key conventions shared with the remote function runtimes.
//!
//! The key layout is a wire contract: the runtimes write their status and
//! output records under exactly these paths, so any change here breaks every
//! already-deployed runtime.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Prefix under which all job records live in the object store.
pub const JOBS_PREFIX: &str = "pywren.jobs";

/// Index of a call within its job, rendered as a zero-padded 5-digit string.
///
/// The string form (`00042`) participates in object-store key construction
/// and in the invoke payload, so it is fixed-width by contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u32);

impl CallId {
    /// Wrap a call index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// The call index as a queue/slice position.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

impl From<u32> for CallId {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

impl FromStr for CallId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Self)
    }
}

impl Serialize for CallId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Key under which the runtime stores the pickled output of one call.
pub fn output_key(prefix: &str, executor_id: &str, job_id: &str, call_id: CallId) -> String {
    format!("{prefix}/{executor_id}/{job_id}/{call_id}/output.pickle")
}

/// Key under which the runtime stores the status record of one call.
pub fn status_key(prefix: &str, executor_id: &str, job_id: &str, call_id: CallId) -> String {
    format!("{prefix}/{executor_id}/{job_id}/{call_id}/status.json")
}
