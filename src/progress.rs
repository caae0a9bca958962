/// A single progress report handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub status: String,
    /// Overall completion in `[0.0, 1.0]`.
    pub fraction: f64,
    pub detail: String,
}

/// Progress sink supplied by the host. Called from the worker thread running
/// the update; it must be cheap and do its own marshaling onto a UI context.
pub type ProgressCallback = Box<dyn Fn(&Progress) + Send + Sync>;

/// The slice of the overall bar a phase reports into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRange {
    pub start: f64,
    pub end: f64,
}

impl ProgressRange {
    pub const FULL: ProgressRange = ProgressRange::new(0.0, 1.0);
    pub const DOWNLOAD: ProgressRange = ProgressRange::new(0.0, 0.4);
    pub const APPLY: ProgressRange = ProgressRange::new(0.4, 0.8);
    pub const FINISH: ProgressRange = ProgressRange::new(0.8, 1.0);

    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Map a phase-local fraction onto the overall bar.
    pub fn scale(&self, local: f64) -> f64 {
        let local = if local.is_nan() { 0.0 } else { local.clamp(0.0, 1.0) };
        self.start + (self.end - self.start) * local
    }
}

/// Wraps the optional host callback.
#[derive(Default)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(callback: ProgressCallback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn report(&self, status: &str, fraction: f64, detail: impl Into<String>) {
        if let Some(callback) = &self.callback {
            callback(&Progress {
                status: status.to_string(),
                fraction: fraction.clamp(0.0, 1.0),
                detail: detail.into(),
            });
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
