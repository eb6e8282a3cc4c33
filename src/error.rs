//! Error classification shared by every subsystem

use std::fmt;

/// How an error is recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recovered locally: full-state resync or the unit of work is discarded.
    Transient,
    /// Anti-cheat rule violation: the command is clamped or dropped.
    Validation,
    /// Malformed traffic or version mismatch: the session is disconnected.
    Protocol,
    /// Broken internal invariant: the whole match is terminated.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Transient => "transient",
            Severity::Validation => "validation",
            Severity::Protocol => "protocol",
            Severity::Fatal => "fatal",
        };
        f.write_str(name)
    }
}
