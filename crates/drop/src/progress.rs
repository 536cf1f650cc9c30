//! Upload progress display with one bar per file.

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tftp::{UploadEvent, WorkerId};

const BAR_TEMPLATE: &str = "{prefix:>20} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} blocks {msg}";
const SPINNER_TEMPLATE: &str = "{prefix:>20} [{elapsed_precise}] {spinner:.green} {pos} blocks {msg}";

/// Progress bars for a set of concurrent uploads
pub struct UploadProgress {
    multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl Default for UploadProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadProgress {
    #[must_use]
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Vec::new(),
        }
    }

    /// Update the display for one supervisor event
    pub fn handle(&mut self, event: &UploadEvent) {
        match event {
            UploadEvent::Started { worker, filename } => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(spinner_style());
                bar.set_prefix(filename.clone());
                bar.enable_steady_tick(Duration::from_millis(120));
                self.insert(*worker, bar);
            }
            UploadEvent::Progress { worker, progress } => {
                let Some(bar) = self.bars.get(*worker) else {
                    return;
                };
                if progress.block_count_hint > 0 && bar.length() != Some(u64::from(progress.block_count_hint)) {
                    bar.set_style(bar_style());
                    bar.set_length(u64::from(progress.block_count_hint));
                }
                bar.inc(1);
            }
            UploadEvent::Finished { worker, result } => {
                let Some(bar) = self.bars.get(*worker) else {
                    return;
                };
                match result {
                    Ok(summary) => bar.finish_with_message(format!("done, {}", format_bytes(summary.bytes))),
                    Err(message) => bar.abandon_with_message(format!("failed: {message}")),
                }
            }
        }
    }

    fn insert(&mut self, worker: WorkerId, bar: ProgressBar) {
        if worker >= self.bars.len() {
            self.bars.resize_with(worker + 1, ProgressBar::hidden);
        }
        self.bars[worker] = bar;
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Format bytes in human-readable format
///
/// # Example
///
/// ```
/// use drop::progress::format_bytes;
///
/// assert_eq!(format_bytes(1000), "1000 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}
