//! Daemon lifecycle: wiring, startup recovery, background loops, and
//! shutdown.
//!
//! [`Daemon::start`] composes the whole core (store, registry, planner,
//! engine, reconciler, handlers), runs startup recovery before anything
//! can touch the tables, writes the PID file, and spawns the background
//! loops (periodic sweep, passive observer, optional health monitor, and
//! the persister that turns save nudges into state writes). The transport
//! shell drives [`Daemon::handlers`]; it is out of scope here.

pub mod handlers;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use crate::audit::{AuditAction, AuditLog};
use crate::engine::AllocationEngine;
use crate::error::Result;
use crate::grant::Instance;
use crate::planner::RangePlanner;
use crate::probe::{PortProbe, SystemProbe};
use crate::reconcile::{Reconciler, SweepPolicy};
use crate::registry::ServiceRegistry;
use crate::store::{StateStore, StorePaths};

pub use handlers::{ErrorBody, Handlers, InstanceTable};

/// Hard ceiling on total shutdown time.
pub const SHUTDOWN_CEILING: Duration = Duration::from_secs(30);

struct BackgroundLoop {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// The assembled daemon core.
pub struct Daemon {
    handlers: Arc<Handlers>,
    engine: Arc<AllocationEngine>,
    store: Arc<StateStore>,
    instances: InstanceTable,
    audit: Arc<AuditLog>,
    paths: StorePaths,
    loops: Vec<BackgroundLoop>,
    persist_stop: Arc<AtomicBool>,
    persist_handle: Option<JoinHandle<()>>,
}

impl Daemon {
    /// Starts the core under `config_root` with the system probe.
    ///
    /// # Errors
    ///
    /// Fails when the config root cannot be prepared or startup recovery
    /// hits a genuine I/O error; state corruption does not fail startup.
    pub fn start(config_root: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::start_with_probe(config_root, Arc::new(SystemProbe))
    }

    /// Starts the core with an explicit probe (tests inject a mock).
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::start`].
    pub fn start_with_probe(
        config_root: impl Into<std::path::PathBuf>,
        probe: Arc<dyn PortProbe>,
    ) -> Result<Self> {
        let store = Arc::new(StateStore::open(config_root)?);
        let paths = store.paths().clone();

        let registry = Arc::new(ServiceRegistry::load(paths.user_config())?);
        let audit = Arc::new(AuditLog::new(paths.audit_log()));
        let planner = Arc::new(
            RangePlanner::new(Arc::clone(&registry), paths.clone())
                .with_audit(Arc::clone(&audit)),
        );
        let engine = Arc::new(
            AllocationEngine::new(Arc::clone(&registry), Arc::clone(&probe))
                .with_planner(planner),
        );
        let reconciler = Arc::new(
            Reconciler::new(
                Arc::clone(&engine),
                Arc::clone(&registry),
                Arc::clone(&probe),
            )
            .with_audit(Arc::clone(&audit)),
        );

        let options = registry.daemon_options();

        // Recovery runs to completion before the first request can be
        // served; nothing else holds the engine yet.
        let recovery = reconciler.recover(&store, options.stale_after_secs)?;
        let mut warnings = registry.warnings();
        warnings.extend(recovery.warnings.clone());
        if recovery.orphans_released + recovery.singletons_released > 0 {
            log::debug!(
                "startup recovery: {} restored, {} orphans released, {} singleton(s) pruned",
                recovery.restored,
                recovery.orphans_released,
                recovery.singletons_released
            );
        }

        write_pid_file(&paths)?;
        ensure_auth_token(&paths)?;

        let instances: InstanceTable = Arc::new(Mutex::new(BTreeMap::new()));
        for instance in store.load()?.document.instances {
            instances
                .lock()
                .insert(instance.instance_id.clone(), instance);
        }

        let handlers = Arc::new(
            Handlers::new(
                Arc::clone(&engine),
                Arc::clone(&registry),
                Arc::clone(&reconciler),
                Arc::clone(&instances),
            )
            .with_audit(Arc::clone(&audit))
            .with_warnings(warnings),
        );

        let mut daemon = Self {
            handlers,
            engine: Arc::clone(&engine),
            store: Arc::clone(&store),
            instances: Arc::clone(&instances),
            audit: Arc::clone(&audit),
            paths,
            loops: Vec::new(),
            persist_stop: Arc::new(AtomicBool::new(false)),
            persist_handle: None,
        };

        daemon.spawn_persister()?;
        daemon.spawn_loop(
            "sweep",
            Duration::from_secs(options.cleanup_interval_secs.max(1)),
            {
                let reconciler = Arc::clone(&reconciler);
                let stale_after = options.stale_after_secs;
                move || {
                    reconciler.sweep(SweepPolicy::periodic(stale_after));
                }
            },
        )?;
        daemon.spawn_loop(
            "observer",
            Duration::from_secs(options.observe_interval_secs.max(1)),
            {
                let reconciler = Arc::clone(&reconciler);
                move || {
                    reconciler.observe_once();
                }
            },
        )?;
        if options.health_monitor.enabled {
            daemon.spawn_loop(
                "health-monitor",
                Duration::from_secs(options.health_monitor.interval_secs.max(1)),
                {
                    let reconciler = Arc::clone(&reconciler);
                    let stale_after = options.stale_after_secs;
                    let max_failures = options.health_monitor.max_failures.max(1);
                    move || {
                        reconciler.monitor_pass(
                            SweepPolicy::periodic(stale_after),
                            max_failures,
                        );
                    }
                },
            )?;
        }

        let _ = daemon
            .audit
            .append(AuditAction::Lifecycle, json!({"event": "started"}));
        Ok(daemon)
    }

    /// The operation surface the transport shell drives.
    #[must_use]
    pub fn handlers(&self) -> Arc<Handlers> {
        Arc::clone(&self.handlers)
    }

    /// The resolved file layout.
    #[must_use]
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Stops intake-independent background work, drains in-flight
    /// allocations, performs the final state save, and removes the PID
    /// file, all under the 30-second ceiling. The transport shell must
    /// have stopped accepting requests before calling this.
    ///
    /// # Errors
    ///
    /// Returns the final save's error, if any; shutdown proceeds through
    /// the remaining steps regardless.
    pub fn shutdown(mut self) -> Result<()> {
        let deadline = Instant::now() + SHUTDOWN_CEILING;

        // Stop periodic timers.
        for background in self.loops.drain(..) {
            let _ = background.stop.send(());
            let _ = background.handle.join();
        }

        // Drain in-flight allocations; each leaves the set within its own
        // probe budget, so this converges quickly.
        while self.engine.in_flight_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        // Stop the persister, then write the final state ourselves.
        self.persist_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.persist_handle.take() {
            let _ = handle.join();
        }
        let final_save = self
            .store
            .save(&self.engine.to_document(snapshot_instances(&self.instances)));

        let _ = std::fs::remove_file(self.paths.pid_file());
        let _ = self
            .audit
            .append(AuditAction::Lifecycle, json!({"event": "stopped"}));
        final_save
    }

    /// Spawns a fixed-interval loop that stops when its channel receives a
    /// unit or disconnects.
    fn spawn_loop<F>(&mut self, name: &str, interval: Duration, mut tick: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = mpsc::channel();
        let thread_name = format!("portreeve-{name}");
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        self.loops.push(BackgroundLoop {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// Spawns the persister: save nudges from the engine coalesce into
    /// whole-document writes, serialized on this one thread.
    fn spawn_persister(&mut self) -> Result<()> {
        let (save_tx, save_rx): (Sender<()>, Receiver<()>) = mpsc::channel();
        self.engine.set_save_signal(save_tx);

        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let instances = Arc::clone(&self.instances);
        let stop = Arc::clone(&self.persist_stop);

        let handle = std::thread::Builder::new()
            .name("portreeve-persister".to_string())
            .spawn(move || loop {
                match save_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(()) => {
                        // Coalesce a burst of nudges into one write.
                        while save_rx.try_recv().is_ok() {}
                        let document = engine.to_document(snapshot_instances(&instances));
                        if let Err(e) = store.save(&document) {
                            log::warn!("state save failed (will retry on next mutation): {e}");
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        self.persist_handle = Some(handle);
        Ok(())
    }
}

fn snapshot_instances(instances: &InstanceTable) -> Vec<Instance> {
    instances.lock().values().cloned().collect()
}

/// Writes the daemon PID (mode `0600`).
fn write_pid_file(paths: &StorePaths) -> Result<()> {
    let pid_path = paths.pid_file();
    std::fs::write(&pid_path, format!("{}\n", std::process::id()))?;
    crate::store::paths::set_file_private(&pid_path)?;
    Ok(())
}

/// Creates the bearer-token file consumed by the transport shell when it
/// does not exist yet. The token value is opaque to the core.
fn ensure_auth_token(paths: &StorePaths) -> Result<()> {
    let token_path = paths.auth_token();
    if token_path.exists() {
        return Ok(());
    }
    std::fs::write(&token_path, format!("{}\n", uuid::Uuid::new_v4()))?;
    crate::store::paths::set_file_private(&token_path)?;
    Ok(())
}
