use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::env::Environment;

/// A view stops itself after this long without a page request.
const MAX_UNUSED_TIME: Duration = Duration::from_secs(30);

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Brief pause after spawning the follower so the first page has content.
const WARMUP: Duration = Duration::from_millis(500);

/// Number of historical lines requested when a view starts.
const TAIL_LINES: u32 = 1000;

pub const PAGE_LIMIT: usize = 500;

#[derive(Error, Debug)]
pub enum LogViewError {
    #[error("failed to spawn log follower for `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, PartialEq)]
pub struct LogPage {
    pub lines: Vec<String>,
    pub next: usize,
    pub count: usize,
    pub start: usize,
    pub limit: usize,
}

/// Live tail of one container's logs. The runtime writes container output to
/// stderr in follow mode; the reader task collects it into an unbounded
/// in-memory sequence until the view is stopped.
pub struct LogView {
    name: String,
    lines: Arc<Mutex<Vec<String>>>,
    accessed: Arc<Mutex<Instant>>,
    stopped: AtomicBool,
    child: Mutex<Option<tokio::process::Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl LogView {
    async fn start(
        name: &str,
        env: &Environment,
        views: Arc<Mutex<HashMap<String, Arc<LogView>>>>,
    ) -> Result<Arc<Self>, LogViewError> {
        let tail = TAIL_LINES.to_string();
        let mut child = Command::new("docker")
            .args(["logs", name, "-f", "-n", tail.as_str()])
            .current_dir(&env.compose_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LogViewError::Spawn {
                name: name.to_string(),
                source,
            })?;

        let stderr = child.stderr.take();

        let view = Arc::new(Self {
            name: name.to_string(),
            lines: Arc::new(Mutex::new(Vec::new())),
            accessed: Arc::new(Mutex::new(Instant::now())),
            stopped: AtomicBool::new(false),
            child: Mutex::new(Some(child)),
            reader: Mutex::new(None),
            watcher: Mutex::new(None),
        });

        if let Some(stderr) = stderr {
            let lines = Arc::clone(&view.lines);
            let reader = tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                loop {
                    match reader.next_line().await {
                        Ok(Some(line)) => lines
                            .lock()
                            .expect("log lines lock")
                            .push(line),
                        Ok(None) => break,
                        Err(err) => {
                            lines
                                .lock()
                                .expect("log lines lock")
                                .push(format!("decoding error: {err}"));
                            break;
                        }
                    }
                }
            });
            *view.reader.lock().expect("reader lock") = Some(reader);
        }

        let watcher = {
            let weak = Arc::downgrade(&view);
            let name = name.to_string();
            tokio::spawn(async move {
                loop {
                    sleep(WATCH_INTERVAL).await;
                    let Some(view) = weak.upgrade() else {
                        return;
                    };
                    let idle = view.accessed.lock().expect("accessed lock").elapsed();
                    if idle > MAX_UNUSED_TIME {
                        break;
                    }
                }
                debug!(container = %name, "log view expired");
                let removed = views.lock().expect("log views lock").remove(&name);
                if let Some(view) = removed {
                    view.stop();
                }
            })
        };
        *view.watcher.lock().expect("watcher lock") = Some(watcher);

        sleep(WARMUP).await;
        Ok(view)
    }

    /// One page of collected lines starting at `start`; an out-of-range
    /// `start` restarts from the beginning. Reading keeps the view alive.
    pub fn get_lines(&self, start: usize, limit: usize) -> LogPage {
        *self.accessed.lock().expect("accessed lock") = Instant::now();

        let lines = self.lines.lock().expect("log lines lock");
        let count = lines.len();
        let start = if start > count { 0 } else { start };
        let next = count.min(start + limit);
        LogPage {
            lines: lines[start..next].to_vec(),
            next,
            count,
            start,
            limit,
        }
    }

    /// Cancels the reader and watcher and kills the follower subprocess.
    /// Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.reader.lock().expect("reader lock").take() {
            reader.abort();
        }
        if let Some(watcher) = self.watcher.lock().expect("watcher lock").take() {
            watcher.abort();
        }
        if let Some(mut child) = self.child.lock().expect("child lock").take() {
            if let Err(err) = child.start_kill() {
                error!(container = %self.name, %err, "failed to kill log follower");
            }
        }
    }
}

impl Drop for LogView {
    fn drop(&mut self) {
        self.stop();
    }
}

/// All live views, keyed by container name.
#[derive(Clone, Default)]
pub struct LogViews {
    inner: Arc<Mutex<HashMap<String, Arc<LogView>>>>,
}

impl LogViews {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<LogView>> {
        self.inner.lock().expect("log views lock").get(name).cloned()
    }

    /// Spawns a new follower for `name`. The caller is responsible for
    /// holding the runtime mutation gate and for checking that the container
    /// is running.
    pub async fn start(
        &self,
        name: &str,
        env: &Environment,
    ) -> Result<Arc<LogView>, LogViewError> {
        let view = LogView::start(name, env, Arc::clone(&self.inner)).await?;
        self.inner
            .lock()
            .expect("log views lock")
            .insert(name.to_string(), Arc::clone(&view));
        Ok(view)
    }

    pub fn stop(&self, name: &str) {
        if let Some(view) = self.inner.lock().expect("log views lock").remove(name) {
            view.stop();
        }
    }

    /// Drops every view; used when containers may have been replaced.
    pub fn stop_all(&self) {
        let views: Vec<Arc<LogView>> = {
            let mut inner = self.inner.lock().expect("log views lock");
            inner.drain().map(|(_, view)| view).collect()
        };
        for view in views {
            view.stop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("log views lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_with_lines(lines: Vec<String>) -> LogView {
        LogView {
            name: "test".to_string(),
            lines: Arc::new(Mutex::new(lines)),
            accessed: Arc::new(Mutex::new(Instant::now())),
            stopped: AtomicBool::new(false),
            child: Mutex::new(None),
            reader: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    fn numbered(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("line {i}")).collect()
    }

    #[test]
    fn paging_within_range() {
        let view = view_with_lines(numbered(10));
        let page = view.get_lines(2, 4);
        assert_eq!(page.lines, numbered(10)[2..6].to_vec());
        assert_eq!(page.next, 6);
        assert_eq!(page.count, 10);
        assert_eq!(page.start, 2);
        assert_eq!(page.limit, 4);
    }

    #[test]
    fn start_beyond_count_resets_to_zero() {
        let view = view_with_lines(numbered(3));
        let page = view.get_lines(10, PAGE_LIMIT);
        assert_eq!(page.start, 0);
        assert_eq!(page.lines.len(), 3);
        assert_eq!(page.next, 3);
    }

    #[test]
    fn start_at_count_yields_empty_page() {
        let view = view_with_lines(numbered(3));
        let page = view.get_lines(3, PAGE_LIMIT);
        assert_eq!(page.start, 3);
        assert!(page.lines.is_empty());
        assert_eq!(page.next, 3);
    }

    #[test]
    fn limit_caps_page_size() {
        let view = view_with_lines(numbered(PAGE_LIMIT + 100));
        let page = view.get_lines(0, PAGE_LIMIT);
        assert_eq!(page.lines.len(), PAGE_LIMIT);
        assert_eq!(page.next, PAGE_LIMIT);
        assert_eq!(page.count, PAGE_LIMIT + 100);
    }

    #[test]
    fn stop_is_idempotent() {
        let view = view_with_lines(Vec::new());
        view.stop();
        view.stop();
        assert!(view.stopped.load(Ordering::SeqCst));
    }
}
