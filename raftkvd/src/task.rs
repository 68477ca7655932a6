use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::{fmt, io, thread};

use tracing::{error, warn};

/// Named thread, joined when dropped
pub struct AutoJoinHandle {
    name: String,
    join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    /// Spawn a thread running `f`, logging the error it might return
    pub fn spawn_res<F, E>(name: impl Into<String>, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        F: Send + 'static,
        E: fmt::Display + 'static,
    {
        let name = name.into();
        let join_handle = thread::Builder::new().name(name.clone()).spawn({
            let name = name.clone();
            move || {
                if let Err(e) = f() {
                    error!(task = %name, error = %e, "Task failed");
                }
            }
        })?;
        Ok(Self {
            name,
            join_handle: Some(join_handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };
        if join_handle.join().is_err() && !thread::panicking() {
            panic!("Task {} thread panicked", self.name);
        }
    }
}

/// Raise `flag` if the task exits without calling [`PanicGuard::done`]
pub struct PanicGuard {
    name: String,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: impl Into<String>, flag: Arc<AtomicBool>) -> Self {
        Self {
            name: name.into(),
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!(task = %self.name, "Task panic detected via PanicGuard");
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn panic_guard_raises_flag() {
    let flag = Arc::new(AtomicBool::new(false));
    PanicGuard::new("ok", flag.clone()).done();
    assert!(!flag.load(Ordering::SeqCst));

    let handle = AutoJoinHandle::spawn_res("failing", {
        let flag = flag.clone();
        move || {
            let _guard = PanicGuard::new("failing", flag);
            Err::<(), _>("boom")
        }
    })
    .expect("spawn");
    assert_eq!(handle.name(), "failing");
    drop(handle);
    assert!(flag.load(Ordering::SeqCst));
}
