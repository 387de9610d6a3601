//! Small value types shared across the codec, table, and filter pipeline.

use std::fmt::Display;

/// The transport a query arrived on (and must be replied on).
///
/// Maps to spec.md's `dynamic dispatch on protocol` design note §9: a
/// tagged variant instead of branching on `IPPROTO_UDP`/`IPPROTO_TCP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Which policy list a lookup is evaluating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyListKind {
    Allow,
    Deny,
}

impl PolicyListKind {
    /// The table-name fragment used to build the per-query SQL (`policy_allow`
    /// / `policy_deny`), per spec.md §6.1.
    pub fn table_name(self) -> &'static str {
        match self {
            PolicyListKind::Allow => "policy_allow",
            PolicyListKind::Deny => "policy_deny",
        }
    }
}

impl Display for PolicyListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyListKind::Allow => write!(f, "allow"),
            PolicyListKind::Deny => write!(f, "deny"),
        }
    }
}

/// The record types this proxy actually needs to reason about. Everything
/// else passes through the query bytes untouched on the forward path; this
/// enum only matters for the parsed `OutstandingQuery.q_type`/`q_class`
/// fields and for building the synthetic block answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Other(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            other => RecordType::Other(other),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::Other(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    Internet,
    Other(u16),
}

impl From<u16> for RecordClass {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordClass::Internet,
            other => RecordClass::Other(other),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::Internet => 1,
            RecordClass::Other(v) => v,
        }
    }
}
