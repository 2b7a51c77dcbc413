//! Terminal progress bars for downloads.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tilefetch::acquire::ProgressFactory;
use tilefetch::download::ProgressCallback;

const BAR_TEMPLATE: &str =
    "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// A factory creating one stderr progress bar per downloaded file.
pub fn progress_bars() -> ProgressFactory {
    Arc::new(|label: &str| -> ProgressCallback {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        bar.set_style(bar_style());
        bar.set_message(label.to_string());

        Arc::new(move |bytes: u64, total: u64| {
            if bar.length() != Some(total) {
                bar.set_length(total);
            }
            bar.set_position(bytes);
            if total > 0 && bytes >= total && !bar.is_finished() {
                bar.finish();
            }
        })
    })
}
