//! The worker-thread runtime.
//!
//! Connections are partitioned across N OS threads, each pinned to a CPU
//! and running its own event loop: commands arrive over a channel, and
//! every loop turn sweeps the thread's own connections for keep-alive
//! expiry. Worker 0 additionally runs the broker-wide maintenance
//! schedule: password-file reload, session expiry, snapshot saves.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::context::BrokerContext;
use crate::error::{MqttError, Result};
use crate::session::Connection;
use crate::types::{ConnectionId, HashMap};

const TICK: Duration = Duration::from_millis(500);

pub enum WorkerCommand {
    /// Take ownership of a freshly accepted connection.
    Attach(Arc<Connection>),
    /// The transport saw the connection close.
    Detach(ConnectionId),
    Quit,
}

struct WorkerHandle {
    tx: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

pub struct Workers {
    handles: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl Workers {
    /// Spawns `n` worker threads; 0 means one per available CPU.
    pub fn start(ctx: BrokerContext, n: usize) -> Result<Workers> {
        let n = if n == 0 {
            std::thread::available_parallelism().map(|p| p.get()).unwrap_or(1)
        } else {
            n
        };
        let cores = core_affinity::get_core_ids().unwrap_or_default();

        let mut handles = Vec::with_capacity(n);
        for id in 0..n {
            let (tx, rx) = crossbeam::channel::unbounded();
            let core = if cores.is_empty() { None } else { Some(cores[id % cores.len()]) };
            let ctx = ctx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("embermq-w{id}"))
                .spawn(move || worker_main(ctx, id, core, rx))
                .map_err(MqttError::IoError)?;
            handles.push(WorkerHandle { tx, thread: Some(thread) });
        }
        Ok(Workers { handles, next: AtomicUsize::new(0) })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Round-robins a new connection onto a worker, which owns it from
    /// here on.
    pub fn assign(&self, conn: Arc<Connection>) -> Result<()> {
        let id = self.next.fetch_add(1, Ordering::SeqCst) % self.handles.len();
        conn.set_worker(id);
        self.handles[id]
            .tx
            .send(WorkerCommand::Attach(conn))
            .map_err(|_| MqttError::Msg("worker channel closed".into()))
    }

    /// Tells the owning worker that the transport closed this connection.
    pub fn detach(&self, worker: usize, conn_id: ConnectionId) -> Result<()> {
        let handle = self
            .handles
            .get(worker)
            .ok_or_else(|| MqttError::Msg(format!("no worker {worker}")))?;
        handle
            .tx
            .send(WorkerCommand::Detach(conn_id))
            .map_err(|_| MqttError::Msg("worker channel closed".into()))
    }

    /// Stops every worker and joins the threads.
    pub fn shutdown(mut self) {
        for handle in &self.handles {
            let _ = handle.tx.send(WorkerCommand::Quit);
        }
        for handle in &mut self.handles {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    log::error!("worker thread panicked during shutdown");
                }
            }
        }
    }
}

fn worker_main(
    ctx: BrokerContext,
    id: usize,
    core: Option<core_affinity::CoreId>,
    rx: Receiver<WorkerCommand>,
) {
    if let Some(core) = core {
        if core_affinity::set_for_current(core) {
            log::info!("thread 'embermq-w{id}' pinned to CPU {}", core.id);
        }
    }

    let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("worker {id}: cannot build runtime: {e}");
            return;
        }
    };

    let mut clients: HashMap<ConnectionId, Arc<Connection>> = HashMap::default();
    let mut maintenance = Maintenance::new(&ctx);
    let mut running = true;

    while running {
        match rx.recv_timeout(TICK) {
            Ok(cmd) => running &= apply(&ctx, &mut clients, cmd),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => running = false,
        }
        // Drain whatever else queued up before the periodic work.
        loop {
            match rx.try_recv() {
                Ok(cmd) => running &= apply(&ctx, &mut clients, cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    running = false;
                    break;
                }
            }
        }

        keep_alive_check(&ctx, &mut clients);
        if id == 0 {
            maintenance.run(&ctx, &rt);
        }
    }

    for (_, conn) in clients.drain() {
        conn.mark_disconnecting();
        ctx.stats.connections.dec();
    }
}

fn apply(
    ctx: &BrokerContext,
    clients: &mut HashMap<ConnectionId, Arc<Connection>>,
    cmd: WorkerCommand,
) -> bool {
    match cmd {
        WorkerCommand::Attach(conn) => {
            conn.touch();
            ctx.stats.connections.inc();
            clients.insert(conn.id, conn);
            true
        }
        WorkerCommand::Detach(conn_id) => {
            if let Some(conn) = clients.remove(&conn_id) {
                conn.mark_disconnecting();
                ctx.stats.connections.dec();
            }
            true
        }
        WorkerCommand::Quit => false,
    }
}

/// Drops connections that were evicted elsewhere and gracefully disconnects
/// those whose keep-alive ran out.
fn keep_alive_check(ctx: &BrokerContext, clients: &mut HashMap<ConnectionId, Arc<Connection>>) {
    clients.retain(|_, conn| {
        if conn.is_disconnecting() {
            ctx.stats.connections.dec();
            return false;
        }
        if conn.keep_alive_expired() {
            log::info!("keep-alive expired for '{}', disconnecting", conn.client_id);
            conn.kick();
            ctx.stats.connections.dec();
            return false;
        }
        true
    });
}

/// Broker-wide periodic work, run by worker 0 only.
struct Maintenance {
    next_credentials: Instant,
    next_expire: Instant,
    next_save: Instant,
}

impl Maintenance {
    fn new(ctx: &BrokerContext) -> Maintenance {
        let now = Instant::now();
        Maintenance {
            next_credentials: now + ctx.settings.auth.password_reload_interval,
            next_expire: now + ctx.settings.mqtt.expire_check_interval,
            next_save: now + ctx.settings.persistence.save_interval,
        }
    }

    fn run(&mut self, ctx: &BrokerContext, rt: &tokio::runtime::Runtime) {
        let now = Instant::now();

        if now >= self.next_credentials {
            self.next_credentials = now + ctx.settings.auth.password_reload_interval;
            if ctx.auth.credentials().enabled() {
                if let Err(e) = ctx.auth.reload_credentials() {
                    log::error!("password file reload failed: {e}");
                }
            }
        }

        if now >= self.next_expire {
            self.next_expire = now + ctx.settings.mqtt.expire_check_interval;
            rt.block_on(ctx.expire_sessions());
        }

        if ctx.settings.persistence.enable && now >= self.next_save {
            self.next_save = now + ctx.settings.persistence.save_interval;
            if let Err(e) = rt.block_on(ctx.save_state()) {
                // Retried on the next schedule.
                log::error!("error saving snapshots: {e}");
            }
        }
    }
}
