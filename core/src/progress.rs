use std::sync::Arc;

/// Per-file events reported by backup and restore runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Enumeration or planning finished with this many entries.
    Planned { entries: usize },
    FileDone { path: String, bytes: u64 },
    FileFailed { path: String },
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

pub(crate) fn report(progress: &Option<ProgressFn>, event: Progress) {
    if let Some(f) = progress {
        f(event);
    }
}
