//! Graceful shutdown: callback registry and signal monitor.
//!
//! Object-layer callbacks run before generic callbacks; each returns an
//! exit code, and the first non-zero code exits the process immediately. A
//! restart request re-execs the binary with its original arguments.

use parking_lot::RwLock;
use std::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info};

/// A cleanup step executed on shutdown; returns an exit code.
pub type CleanupFn = Box<dyn Fn() -> i32 + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSignal {
    Halt,
    Restart,
}

/// Collection of callbacks executed on a shutdown signal.
#[derive(Default)]
pub struct ShutdownCallbacks {
    object_layer: RwLock<Vec<CleanupFn>>,
    generic: RwLock<Vec<CleanupFn>>,
}

impl ShutdownCallbacks {
    /// Register a callback that quiesces the object layer; these run first.
    pub fn add_object_layer_cb(&self, callback: CleanupFn) {
        self.object_layer.write().push(callback);
    }

    pub fn add_generic_cb(&self, callback: CleanupFn) {
        self.generic.write().push(callback);
    }

    /// Run every callback in order; returns the first non-zero exit code.
    pub fn run(&self) -> i32 {
        for callback in self.object_layer.read().iter() {
            let code = callback();
            if code != 0 {
                return code;
            }
        }
        for callback in self.generic.read().iter() {
            let code = callback();
            if code != 0 {
                return code;
            }
        }
        0
    }
}

/// Install signal traps and return the channel shutdown requests arrive on.
/// SIGINT and SIGTERM request a halt; SIGHUP requests a restart (the
/// process re-execs itself after the shutdown callbacks run).
pub fn trap_signals() -> mpsc::Receiver<ShutdownSignal> {
    let (tx, rx) = mpsc::channel(1);

    let interrupt_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupt_tx.send(ShutdownSignal::Halt).await;
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            return;
        };
        let requested = tokio::select! {
            _ = term.recv() => ShutdownSignal::Halt,
            _ = hangup.recv() => ShutdownSignal::Restart,
        };
        let _ = tx.send(requested).await;
    });

    rx
}

/// Wait for a shutdown request, run the callbacks and exit. An emergency
/// (non-zero) callback code exits immediately with that code; a restart
/// re-execs the binary before exiting.
pub async fn monitor_shutdown(
    callbacks: std::sync::Arc<ShutdownCallbacks>,
    mut signals: mpsc::Receiver<ShutdownSignal>,
) {
    let signal = signals.recv().await.unwrap_or(ShutdownSignal::Halt);
    info!(?signal, "shutting down");

    let code = callbacks.run();
    if code != 0 {
        error!(code, "shutdown callback failed, emergency exit");
        std::process::exit(code);
    }

    if signal == ShutdownSignal::Restart {
        match std::env::current_exe() {
            Ok(path) => {
                let args: Vec<String> = std::env::args().skip(1).collect();
                if let Err(err) = Command::new(path).args(args).spawn() {
                    error!(%err, "unable to restart");
                }
            }
            Err(err) => error!(%err, "unable to locate binary for restart"),
        }
    }
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn object_layer_callbacks_run_before_generic() {
        let order = Arc::new(RwLock::new(Vec::new()));
        let callbacks = ShutdownCallbacks::default();

        let order_obj = order.clone();
        callbacks.add_object_layer_cb(Box::new(move || {
            order_obj.write().push("object");
            0
        }));
        let order_gen = order.clone();
        callbacks.add_generic_cb(Box::new(move || {
            order_gen.write().push("generic");
            0
        }));

        assert_eq!(callbacks.run(), 0);
        assert_eq!(*order.read(), vec!["object", "generic"]);
    }

    #[test]
    fn first_failure_short_circuits() {
        let ran = Arc::new(AtomicUsize::new(0));
        let callbacks = ShutdownCallbacks::default();

        callbacks.add_object_layer_cb(Box::new(|| 3));
        let ran2 = ran.clone();
        callbacks.add_generic_cb(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            0
        }));

        assert_eq!(callbacks.run(), 3);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
