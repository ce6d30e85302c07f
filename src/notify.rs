//! User-facing failure notifications.
//!
//! Services report capture, upload and storage failures through the
//! [`Notifier`] trait; the `notify_on_*` configuration booleans decide
//! per call site whether a report is made at all.

/// Sink for user-facing failure reports.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, title: &str, body: &str);
}

/// Default notifier, reports through the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        tracing::warn!("{}: {}", title, body);
    }
}
