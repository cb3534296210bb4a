use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Controls how step output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners + ring-buffer logs, clear logs on completion.
    Normal,
    /// Like Normal but keeps log lines after step completion.
    Verbose,
    /// No ANSI, plain println output (for piped/non-TTY).
    Plain,
    /// Nothing at all.
    Silent,
}

impl OutputMode {
    pub fn detect(verbose: bool, is_terminal: bool) -> Self {
        match (is_terminal, verbose) {
            (false, _) => OutputMode::Plain,
            (true, true) => OutputMode::Verbose,
            (true, false) => OutputMode::Normal,
        }
    }

    fn draws_bars(self) -> bool {
        matches!(self, OutputMode::Normal | OutputMode::Verbose)
    }
}

/// Numbered provisioning steps with spinners and check/cross marks.
pub struct StepProgress {
    multi: MultiProgress,
    total_steps: usize,
    current_step: usize,
    mode: OutputMode,
}

struct StepState {
    log_lines: VecDeque<String>,
    done_label: Option<String>,
}

/// Handle passed into the step closure for logging during execution.
///
/// Log lines are appended to the spinner bar's message rather than added as
/// separate bars, which keeps indicatif's terminal line count accurate.
pub struct Step {
    bar: ProgressBar,
    state: Arc<Mutex<StepState>>,
    label: String,
    mode: OutputMode,
}

fn template_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn spinner_style() -> ProgressStyle {
    template_style("[{prefix}] {spinner:.cyan} {msg}")
}

fn done_style() -> ProgressStyle {
    template_style("[{prefix}] \u{2713} {msg:.green}")
}

fn failed_style() -> ProgressStyle {
    template_style("[{prefix}] \u{2717} {msg:.red}")
}

fn lock(state: &Mutex<StepState>) -> MutexGuard<'_, StepState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const MAX_LOG_LINES: usize = 10;

impl StepProgress {
    pub fn new(total_steps: usize, mode: OutputMode) -> Self {
        let multi = if mode.draws_bars() {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi,
            total_steps,
            current_step: 0,
            mode,
        }
    }

    /// Progress that renders nothing.
    pub fn silent() -> Self {
        Self::new(0, OutputMode::Silent)
    }

    /// Grow the step total once the number of machines is known.
    pub fn add_steps(&mut self, n: usize) {
        self.total_steps += n;
    }

    fn next_prefix(&mut self) -> String {
        self.current_step += 1;
        format!("{}/{}", self.current_step, self.total_steps)
    }

    /// Run an async step. Shows a spinner while running, then a checkmark on
    /// `Ok` or a cross on `Err`. The closure receives a [`Step`] for logging.
    pub async fn run<F, Fut, T, E>(&mut self, label: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(Step) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let prefix = self.next_prefix();

        if self.mode == OutputMode::Plain {
            println!("[{prefix}] {label}");
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(prefix.clone());
        bar.set_message(label.to_string());
        if self.mode.draws_bars() {
            bar.enable_steady_tick(std::time::Duration::from_millis(80));
        }

        let state = Arc::new(Mutex::new(StepState {
            log_lines: VecDeque::new(),
            done_label: None,
        }));

        let step = Step {
            bar: bar.clone(),
            state: state.clone(),
            label: label.to_string(),
            mode: self.mode,
        };

        let result = f(step).await;

        let st = lock(&state);
        if self.mode == OutputMode::Verbose {
            for line in &st.log_lines {
                self.multi.println(format!("        {line}")).ok();
            }
        }
        let done_label = st.done_label.clone().unwrap_or_else(|| label.to_string());
        drop(st);

        let ok = result.is_ok();
        if self.mode == OutputMode::Plain {
            let mark = if ok { '\u{2713}' } else { '\u{2717}' };
            println!("[{prefix}] {mark} {done_label}");
        }

        bar.set_style(if ok { done_style() } else { failed_style() });
        bar.finish_with_message(done_label);

        result
    }

    /// Print a note under the current step.
    pub fn info(&self, text: &str) {
        match self.mode {
            OutputMode::Plain => println!("      \u{2192} {text}"),
            OutputMode::Silent => {}
            OutputMode::Normal | OutputMode::Verbose => {
                self.multi.println(format!("      \u{2192} {text}")).ok();
            }
        }
    }

    pub fn println(&self, text: &str) {
        match self.mode {
            OutputMode::Plain => println!("{text}"),
            OutputMode::Silent => {}
            OutputMode::Normal | OutputMode::Verbose => {
                self.multi.println(text).ok();
            }
        }
    }
}

impl Step {
    /// Add a log line under this step (ring buffer of ~10).
    pub fn log(&self, line: &str) {
        match self.mode {
            OutputMode::Silent => return,
            OutputMode::Plain => {
                for sub in line.split('\n') {
                    println!("        {sub}");
                }
                return;
            }
            OutputMode::Normal | OutputMode::Verbose => {}
        }

        let mut state = lock(&self.state);
        for sub in line.split('\n') {
            if state.log_lines.len() >= MAX_LOG_LINES {
                state.log_lines.pop_front();
            }
            state.log_lines.push_back(sub.to_string());
        }

        let mut msg = self.label.clone();
        for log_line in &state.log_lines {
            msg.push_str("\n        ");
            msg.push_str(log_line);
        }
        self.bar.set_message(msg);
    }

    /// Override the completion label shown with the mark.
    pub fn set_done_label(&self, label: impl Into<String>) {
        lock(&self.state).done_label = Some(label.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_detection() {
        assert_eq!(OutputMode::detect(false, false), OutputMode::Plain);
        assert_eq!(OutputMode::detect(true, false), OutputMode::Plain);
        assert_eq!(OutputMode::detect(false, true), OutputMode::Normal);
        assert_eq!(OutputMode::detect(true, true), OutputMode::Verbose);
    }

    #[tokio::test]
    async fn run_passes_results_through() {
        let mut progress = StepProgress::silent();
        progress.add_steps(2);
        let ok: Result<u32, String> = progress
            .run("first", |step| async move {
                step.log("working");
                step.set_done_label("first done");
                Ok(7)
            })
            .await;
        assert_eq!(ok, Ok(7));

        let err: Result<(), String> = progress
            .run("second", |_| async { Err("boom".to_string()) })
            .await;
        assert_eq!(err, Err("boom".to_string()));
        assert_eq!(progress.current_step, 2);
    }
}
