//! A terminal spinner/status line shown during the parallel analysis
//! phase, printed only when stdout is a tty — mirroring the reference
//! tool's habit of a background thread ticking a spinner glyph while
//! atomic counters accumulate, just on a plain OS thread instead of an
//! async runtime (this driver has no asynchronous I/O requirement).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use console::Term;

const TICK: Duration = Duration::from_millis(120);

fn spinner_glyph(i: usize) -> char {
    match i % 4 {
        0 => '|',
        1 => '/',
        2 => '-',
        _ => '\\',
    }
}

/// Shared counters the spinner thread reads and the worker threads
/// bump as they go.
#[derive(Default)]
pub struct ProgressCounters {
    pub walked: AtomicUsize,
    pub processed: AtomicUsize,
    pub errors: AtomicUsize,
}

/// A background thread printing a one-line spinner to stderr until
/// dropped or explicitly stopped. A no-op (never spawns a thread) when
/// stdout isn't a terminal, so piped/redirected runs stay clean.
pub struct Spinner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    pub fn start(total: usize, counters: Arc<ProgressCounters>) -> Spinner {
        let stop = Arc::new(AtomicBool::new(false));
        if !Term::stdout().features().is_attended() {
            return Spinner { stop, handle: None };
        }

        let thread_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            let term = Term::stderr();
            let mut tick = 0usize;
            loop {
                let walked = counters.walked.load(Ordering::Relaxed);
                let processed = counters.processed.load(Ordering::Relaxed);
                let errors = counters.errors.load(Ordering::Relaxed);
                let _ = term.clear_line();
                let _ = term.write_str(&format!(
                    "\r{} {walked}/{total} walked, {processed}/{total} photos analysed ({errors} errors)",
                    spinner_glyph(tick),
                ));
                if thread_stop.load(Ordering::Relaxed) {
                    break;
                }
                tick += 1;
                std::thread::sleep(TICK);
            }
            let _ = term.clear_line();
        });

        Spinner { stop, handle: Some(handle) }
    }

    pub fn stop(self) {
        // Dropping runs the same logic; named for readability at call sites.
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
