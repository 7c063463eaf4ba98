//! Progress and log reporting callbacks.

/// Observer of a flashing session.
///
/// Both methods are fire-and-forget: implementations must not fail and must
/// not block, since they are invoked from the session's own thread between
/// protocol operations.
pub trait ProgressSink {
    /// Report overall progress of the current operation, 0 to 100.
    fn emit_progress(&mut self, percent: u8, message: &str);

    /// Report a human-readable session event.
    fn emit_log(&mut self, message: &str);
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit_progress(&mut self, _percent: u8, _message: &str) {}

    fn emit_log(&mut self, _message: &str) {}
}
