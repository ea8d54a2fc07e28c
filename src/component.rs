//! The observability capability interface (§9.E). Replaces the
//! "ReflectiveModule" base-class pattern named in the source with a plain
//! trait — no inheritance hierarchy, every component implements it
//! directly over its own state.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unavailable,
}

pub trait Component {
    fn status(&self) -> ComponentStatus;

    fn healthy(&self) -> bool {
        matches!(self.status(), ComponentStatus::Healthy)
    }

    /// Small set of key/value diagnostics an embedder can surface as-is
    /// (log fields, a status page row) without reaching into internals.
    fn health_indicators(&self) -> Vec<(&'static str, String)>;
}
