//! Remote-control surface
//!
//! A front end (telnet console, ZMQ bridge, web UI) discovers controllable
//! objects, lists their parameters and gets/sets them as strings. The output
//! stage implements [`RemoteControllable`]; everything here is transport
//! agnostic.

use crate::error::ParameterError;
use crate::types::RunStatistics;

/// Description of one remotely controllable or readable parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter {
    pub name: &'static str,
    pub description: &'static str,
}

impl Parameter {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }
}

/// An object whose parameters can be read and written at runtime
pub trait RemoteControllable: Send + Sync {
    /// Name under which this controllable is addressed
    fn rc_name(&self) -> &str;

    /// Parameters exposed by this controllable
    fn parameters(&self) -> Vec<Parameter>;

    /// Set a parameter from its string representation
    fn set_parameter(&self, parameter: &str, value: &str) -> Result<(), ParameterError>;

    /// Read a parameter as a string
    fn get_parameter(&self, parameter: &str) -> Result<String, ParameterError>;

    /// All readable values in one map, for telemetry exporters
    fn get_all_values(&self) -> RunStatistics;
}
