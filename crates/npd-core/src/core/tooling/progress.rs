use std::env;
use std::io::{self, IsTerminal, Write};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) fn progress_enabled() -> bool {
    match env::var("NPD_PROGRESS") {
        Ok(value) => value != "0",
        // CI logs are line-oriented; a redrawing spinner just pollutes them.
        Err(_) => io::stderr().is_terminal() && env::var_os("CI").is_none(),
    }
}

static OUTPUT_LOCK: Mutex<()> = Mutex::new(());
static MANAGER: OnceLock<ProgressManager> = OnceLock::new();

fn manager() -> &'static ProgressManager {
    MANAGER.get_or_init(ProgressManager::new)
}

fn clear_progress_line() {
    let _guard = OUTPUT_LOCK.lock().ok();
    let _ = io::stderr().write_all(b"\r\x1b[2K");
    let _ = io::stderr().flush();
}

#[derive(Clone)]
struct ProgressTask {
    id: u64,
    label: String,
    started_at: Instant,
}

struct ProgressManager {
    state: Mutex<ProgressState>,
}

struct ProgressState {
    next_id: u64,
    tasks: Vec<ProgressTask>,
    renderer_started: bool,
}

impl ProgressManager {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                next_id: 1,
                tasks: Vec::new(),
                renderer_started: false,
            }),
        }
    }

    fn start_renderer(&self) {
        let mut state = self.state.lock().expect("progress lock");
        if state.renderer_started {
            return;
        }
        state.renderer_started = true;
        drop(state);

        thread::spawn(|| {
            const FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
            const TICK: Duration = Duration::from_millis(80);
            const START_DELAY: Duration = Duration::from_millis(120);
            let mut idx = 0usize;
            let mut rendered = false;
            loop {
                let task = {
                    let state = manager().state.lock().expect("progress lock");
                    state.tasks.last().cloned()
                };

                let Some(task) = task else {
                    if rendered {
                        clear_progress_line();
                        rendered = false;
                    }
                    thread::sleep(TICK);
                    continue;
                };

                let elapsed = Instant::now().saturating_duration_since(task.started_at);
                if elapsed < START_DELAY {
                    thread::sleep(TICK);
                    continue;
                }

                let frame = FRAMES[idx % FRAMES.len()];
                idx = idx.wrapping_add(1);
                let line = format!("\r\x1b[2Knpd ▸ {} {frame}", task.label);
                {
                    let _guard = OUTPUT_LOCK.lock().ok();
                    let _ = io::stderr().write_all(line.as_bytes());
                    let _ = io::stderr().flush();
                }
                rendered = true;
                thread::sleep(TICK);
            }
        });
    }

    fn push_task(&self, label: String) -> u64 {
        let mut state = self.state.lock().expect("progress lock");
        let id = state.next_id;
        state.next_id = state.next_id.saturating_add(1);
        state.tasks.push(ProgressTask {
            id,
            label,
            started_at: Instant::now(),
        });
        id
    }

    fn remove_task(&self, id: u64) {
        let mut state = self.state.lock().expect("progress lock");
        if let Some(pos) = state.tasks.iter().position(|task| task.id == id) {
            state.tasks.remove(pos);
        }
    }
}

/// Spinner handle for one pipeline step. Dropping it clears the line;
/// `finish` additionally prints a completion message.
pub(crate) struct StepReporter {
    id: Option<u64>,
    enabled: bool,
}

impl StepReporter {
    pub(crate) fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        if !progress_enabled() {
            return Self {
                id: None,
                enabled: false,
            };
        }
        manager().start_renderer();
        let id = manager().push_task(label);
        Self {
            id: Some(id),
            enabled: true,
        }
    }

    pub(crate) fn finish(mut self, message: impl Into<String>) {
        let enabled = self.enabled;
        self.stop();
        if enabled {
            eprintln!("npd ▸ {}", message.into());
        }
    }

    fn stop(&mut self) {
        if self.enabled {
            if let Some(id) = self.id.take() {
                manager().remove_task(id);
                clear_progress_line();
            }
            self.enabled = false;
        }
    }
}

impl Drop for StepReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
