//! Progress bar reporting engine passes

use colored::Colorize;
use declarative::{Phase, ProgressCallback, State};
use indicatif::{ProgressBar, ProgressStyle};

/// One bar per phase pass; failures are printed above the bar
pub struct PassProgress {
    bar: ProgressBar,
}

impl PassProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::hidden();
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{prefix:>22.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self { bar }
    }
}

impl ProgressCallback for PassProgress {
    fn on_phase_start(&mut self, phase: Phase, count: usize) {
        self.bar = ProgressBar::new(count as u64).with_style(self.bar.style());
        self.bar.set_prefix(phase.to_string());
    }

    fn on_resource_start(&mut self, uid: &str, _phase: Phase) {
        self.bar.set_message(uid.to_string());
    }

    fn on_resource_complete(&mut self, uid: &str, phase: Phase, state: &State) {
        if let State::Failed(failure) = state
            && phase != Phase::Cleanup
        {
            self.bar.suspend(|| {
                println!("  {} {} ({}): {}", "✗".red(), uid, phase, failure);
            });
        }
        self.bar.inc(1);
    }

    fn on_phase_complete(&mut self, _phase: Phase) {
        self.bar.finish_and_clear();
    }
}

impl Default for PassProgress {
    fn default() -> Self {
        Self::new()
    }
}
