use derive_more::Display;

pub const TARGET: &str = "notarizer_probe";

/// The Kind of the Probe.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// When the Lifecycle of the Notarizer changes, like starting or
    /// shutting down.
    #[display(fmt = "lifecycle")]
    Lifecycle,
    /// Capture of a network event into the request cache.
    #[display(fmt = "capture")]
    Capture,
    /// A notarization attempt state change.
    #[display(fmt = "notarize")]
    Notarize,
    /// Publishing an encrypted proof to the external endpoint.
    #[display(fmt = "publish")]
    Publish,
}
