//! 后台请求队列（WorkQueue）。
//!
//! 单个专用工作线程依次执行"先做这件事，再回调我"的请求，回调通过
//! [`Marshaller`] 回到创建队列时所在的上下文。两级优先级：普通请求总是先于
//! 低优先级请求；两个队列都清空后，发出一次 `TasksCompleted` 通知。

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel as channel;
use tracing::{debug, error, warn};

use crate::dispatch::Marshaller;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("work queue is not running")]
    NotRunning,
    #[error("unable to start work queue thread: {0}")]
    Spawn(#[from] io::Error),
}

/// 排队任务的失败，只交给该任务自己的回调。
#[derive(Debug, thiserror::Error)]
pub enum WorkFailure {
    #[error("{0:#}")]
    Failed(anyhow::Error),
    #[error("work panicked: {0}")]
    Panicked(String),
}

pub type WorkResult<T> = Result<T, WorkFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Low,
}

impl Priority {
    const fn slot(self) -> usize {
        match self {
            Self::Normal => 0,
            Self::Low => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Created,
    Running,
    Stopped,
}

type Delivery = Box<dyn FnOnce() + Send>;
type Job = Box<dyn FnOnce() -> Delivery + Send>;
type Listener = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    // index 0 = normal, 1 = low
    pending: Mutex<[VecDeque<Job>; 2]>,
    listeners: Mutex<Vec<Listener>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, [VecDeque<Job>; 2]> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_job(&self) -> Option<Job> {
        let mut pending = self.pending();
        let [normal, low] = &mut *pending;
        normal.pop_front().or_else(|| low.pop_front())
    }
}

struct Worker {
    handle: JoinHandle<()>,
    stop_tx: channel::Sender<()>,
    wake_tx: channel::Sender<()>,
    alive: Arc<AtomicBool>,
}

struct Control {
    state: QueueState,
    worker: Option<Worker>,
}

pub struct WorkQueue {
    home: Marshaller,
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl WorkQueue {
    /// 创建队列，回调投递到调用方所在的上下文。
    pub fn new() -> Self {
        Self::with_marshaller(Marshaller::capture())
    }

    pub fn with_marshaller(home: Marshaller) -> Self {
        Self {
            home,
            shared: Arc::new(Shared {
                pending: Mutex::new([VecDeque::new(), VecDeque::new()]),
                listeners: Mutex::new(Vec::new()),
            }),
            control: Mutex::new(Control {
                state: QueueState::Created,
                worker: None,
            }),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> QueueState {
        self.control().state
    }

    /// 等待后台线程取走的任务数。
    pub fn pending_len(&self) -> usize {
        self.shared.pending().iter().map(VecDeque::len).sum()
    }

    /// 注册空闲通知监听器，在主上下文上执行。
    pub fn on_tasks_completed<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// 启动后台线程；已在运行时不做任何事。
    pub fn initialize(&self) -> Result<(), QueueError> {
        let mut control = self.control();
        if control.state == QueueState::Running {
            return Ok(());
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (wake_tx, wake_rx) = channel::bounded::<()>(1);
        let alive = Arc::new(AtomicBool::new(true));

        let shared = self.shared.clone();
        let home = self.home.clone();
        let alive_worker = alive.clone();
        let handle = thread::Builder::new()
            .name("work-queue".to_string())
            .spawn(move || worker_loop(&shared, &home, &stop_rx, &wake_rx, &alive_worker))
            .map_err(|err| {
                error!(target: "queue", "unable to start work queue thread: {err}");
                QueueError::Spawn(err)
            })?;

        control.worker = Some(Worker {
            handle,
            stop_tx,
            wake_tx,
            alive,
        });
        control.state = QueueState::Running;
        debug!(target: "queue", "work queue started");
        Ok(())
    }

    /// 停止后台线程并等待其退出。
    ///
    /// 仍在排队的任务被丢弃，回调不会执行；已投递到主上下文但尚未执行的回调也不会执行。
    pub fn stop(&self) {
        let worker = {
            let mut control = self.control();
            let Some(worker) = control.worker.take() else {
                return;
            };
            control.state = QueueState::Stopped;
            worker
        };

        worker.alive.store(false, Ordering::SeqCst);
        let _ = worker.stop_tx.try_send(());

        if worker.handle.thread().id() == thread::current().id() {
            warn!(target: "queue", "stop() called from the worker thread, not joining");
        } else if worker.handle.join().is_err() {
            error!(target: "queue", "work queue thread terminated abnormally");
        }

        let abandoned = {
            let mut pending = self.shared.pending();
            let n = pending.iter().map(VecDeque::len).sum::<usize>();
            pending.iter_mut().for_each(VecDeque::clear);
            n
        };
        debug!(target: "queue", abandoned, "work queue stopped");
    }

    /// 以普通优先级排入 `work`，结果交给 `callback`。
    pub fn add<T, W, C>(&self, work: W, callback: C) -> Result<(), QueueError>
    where
        T: Send + 'static,
        W: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(WorkResult<T>) + Send + 'static,
    {
        self.enqueue(Priority::Normal, work, callback)
    }

    /// 排入 `work`，排在所有普通优先级任务之后。
    pub fn add_low_priority<T, W, C>(&self, work: W, callback: C) -> Result<(), QueueError>
    where
        T: Send + 'static,
        W: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(WorkResult<T>) + Send + 'static,
    {
        self.enqueue(Priority::Low, work, callback)
    }

    fn enqueue<T, W, C>(&self, priority: Priority, work: W, callback: C) -> Result<(), QueueError>
    where
        T: Send + 'static,
        W: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(WorkResult<T>) + Send + 'static,
    {
        let control = self.control();
        let Some(worker) = control.worker.as_ref() else {
            return Err(QueueError::NotRunning);
        };

        let job: Job = Box::new(move || {
            let outcome = run_guarded(work);
            Box::new(move || callback(outcome)) as Delivery
        });
        self.shared.pending()[priority.slot()].push_back(job);

        // auto-reset: one pending wake-up is enough
        let _ = worker.wake_tx.try_send(());
        Ok(())
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    shared: &Arc<Shared>,
    home: &Marshaller,
    stop_rx: &channel::Receiver<()>,
    wake_rx: &channel::Receiver<()>,
    alive: &Arc<AtomicBool>,
) {
    loop {
        if !alive.load(Ordering::SeqCst) {
            debug!(target: "queue", "received stop signal, exiting");
            return;
        }
        channel::select! {
            recv(stop_rx) -> _ => {
                debug!(target: "queue", "received stop signal, exiting");
                return;
            }
            recv(wake_rx) -> msg => {
                if msg.is_err() {
                    return;
                }
                let processed = drain(shared, home, alive);
                if !alive.load(Ordering::SeqCst) {
                    return;
                }
                if processed > 0 {
                    post_tasks_completed(shared, home, alive);
                }
            }
        }
    }
}

fn drain(shared: &Shared, home: &Marshaller, alive: &Arc<AtomicBool>) -> usize {
    let mut processed = 0;
    while alive.load(Ordering::SeqCst) {
        let Some(job) = shared.next_job() else {
            break;
        };
        let delivery = job();
        processed += 1;

        let alive = alive.clone();
        home.post(move || {
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(delivery)) {
                error!(target: "queue", "unable to invoke callback: {}", panic_message(&*payload));
            }
        });
    }
    processed
}

fn post_tasks_completed(shared: &Arc<Shared>, home: &Marshaller, alive: &Arc<AtomicBool>) {
    let shared = shared.clone();
    let alive = alive.clone();
    home.post(move || {
        if !alive.load(Ordering::SeqCst) {
            return;
        }
        let listeners: Vec<Listener> = shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener())) {
                error!(target: "queue", "TasksCompleted listener failed: {}", panic_message(&*payload));
            }
        }
    });
}

fn run_guarded<T, W>(work: W) -> WorkResult<T>
where
    W: FnOnce() -> anyhow::Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            error!(target: "queue", "call to requested method failed: {err:#}");
            Err(WorkFailure::Failed(err))
        }
        Err(payload) => {
            let msg = panic_message(&*payload);
            error!(target: "queue", "call to requested method panicked: {msg}");
            Err(WorkFailure::Panicked(msg))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HomeLoop;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn running_queue() -> (HomeLoop, Arc<WorkQueue>) {
        let home = HomeLoop::install();
        let queue = Arc::new(WorkQueue::new());
        queue.initialize().unwrap();
        (home, queue)
    }

    #[test]
    fn test_add_before_initialize_fails() {
        let queue = WorkQueue::with_marshaller(Marshaller::inline());
        assert_eq!(queue.state(), QueueState::Created);
        let err = queue.add(|| Ok(1), |_| {}).unwrap_err();
        assert!(matches!(err, QueueError::NotRunning));
    }

    #[test]
    fn test_add_after_stop_fails_and_reinitialize_works() {
        let queue = WorkQueue::with_marshaller(Marshaller::inline());
        queue.initialize().unwrap();
        queue.stop();
        assert_eq!(queue.state(), QueueState::Stopped);
        assert!(matches!(
            queue.add_low_priority(|| Ok(()), |_| {}),
            Err(QueueError::NotRunning)
        ));

        queue.initialize().unwrap();
        assert_eq!(queue.state(), QueueState::Running);
        let (tx, rx) = channel::bounded(1);
        queue.add(|| Ok(7), move |r| tx.send(r.unwrap()).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let queue = WorkQueue::with_marshaller(Marshaller::inline());
        queue.initialize().unwrap();
        queue.initialize().unwrap();
        let (tx, rx) = channel::unbounded();
        for i in 0..3 {
            let tx = tx.clone();
            queue
                .add(
                    move || Ok(thread::current().name().map(str::to_string)),
                    move |r| tx.send((i, r.unwrap())).unwrap(),
                )
                .unwrap();
        }
        for _ in 0..3 {
            let (_, name) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(name.as_deref(), Some("work-queue"));
        }
    }

    #[test]
    fn test_every_callback_fires_once_with_result_or_error() {
        let (home, queue) = running_queue();
        let results = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20u32 {
            let results = results.clone();
            let work = move || {
                if i % 3 == 0 {
                    Err(anyhow!("item {i} failed"))
                } else if i % 7 == 0 {
                    panic!("item {i} exploded")
                } else {
                    Ok(i)
                }
            };
            let cb = move |r: WorkResult<u32>| results.lock().unwrap().push((i, r.is_ok()));
            if i % 2 == 0 {
                queue.add(work, cb).unwrap();
            } else {
                queue.add_low_priority(work, cb).unwrap();
            }
        }

        assert!(home.run_until(|| results.lock().unwrap().len() == 20, WAIT));
        home.run_for(Duration::from_millis(50));

        let mut results = results.lock().unwrap().clone();
        assert_eq!(results.len(), 20);
        results.sort();
        for (i, ok) in results {
            let expect_ok = !(i % 3 == 0 || i % 7 == 0);
            assert_eq!(ok, expect_ok, "item {i}");
        }
    }

    #[test]
    fn test_callbacks_run_on_home_thread() {
        let (home, queue) = running_queue();
        let home_id = thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        queue
            .add(
                || Ok(thread::current().id()),
                move |r| *seen2.lock().unwrap() = Some((r.unwrap(), thread::current().id())),
            )
            .unwrap();
        assert!(home.run_until(|| seen.lock().unwrap().is_some(), WAIT));
        let (work_thread, cb_thread) = seen.lock().unwrap().unwrap();
        assert_ne!(work_thread, home_id);
        assert_eq!(cb_thread, home_id);
    }

    #[test]
    fn test_normal_items_never_wait_behind_earlier_low_items() {
        let queue = WorkQueue::with_marshaller(Marshaller::inline());
        queue.initialize().unwrap();

        // hold the worker so everything below is queued before draining
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = channel::unbounded();

        queue
            .add(move || gate_rx.recv().map_err(anyhow::Error::from), |_| {})
            .unwrap();
        for name in ["low-1", "low-2"] {
            let order = order.clone();
            let done_tx = done_tx.clone();
            queue
                .add_low_priority(
                    move || {
                        order.lock().unwrap().push(name);
                        Ok(())
                    },
                    move |_| done_tx.send(()).unwrap(),
                )
                .unwrap();
        }
        for name in ["normal-1", "normal-2"] {
            let order = order.clone();
            let done_tx = done_tx.clone();
            queue
                .add(
                    move || {
                        order.lock().unwrap().push(name);
                        Ok(())
                    },
                    move |_| done_tx.send(()).unwrap(),
                )
                .unwrap();
        }
        gate_tx.send(()).unwrap();
        for _ in 0..4 {
            done_rx.recv_timeout(WAIT).unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec!["normal-1", "normal-2", "low-1", "low-2"]
        );
    }

    #[test]
    fn test_normal_item_added_during_low_drain_runs_next() {
        let queue = Arc::new(WorkQueue::with_marshaller(Marshaller::inline()));
        queue.initialize().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = channel::unbounded();

        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        {
            let order = order.clone();
            queue
                .add_low_priority(
                    move || {
                        started_tx.send(())?;
                        gate_rx.recv()?;
                        order.lock().unwrap().push("low-1");
                        Ok(())
                    },
                    {
                        let done_tx = done_tx.clone();
                        move |_| done_tx.send(()).unwrap()
                    },
                )
                .unwrap();
        }
        started_rx.recv_timeout(WAIT).unwrap();
        {
            let order = order.clone();
            let done_tx = done_tx.clone();
            queue
                .add_low_priority(
                    move || {
                        order.lock().unwrap().push("low-2");
                        Ok(())
                    },
                    move |_| done_tx.send(()).unwrap(),
                )
                .unwrap();
        }
        {
            let order = order.clone();
            let done_tx = done_tx.clone();
            queue
                .add(
                    move || {
                        order.lock().unwrap().push("normal");
                        Ok(())
                    },
                    move |_| done_tx.send(()).unwrap(),
                )
                .unwrap();
        }
        gate_tx.send(()).unwrap();
        for _ in 0..3 {
            done_rx.recv_timeout(WAIT).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["low-1", "normal", "low-2"]);
    }

    #[test]
    fn test_tasks_completed_fires_once_per_drain() {
        let (home, queue) = running_queue();
        let idle = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));
        {
            let idle = idle.clone();
            let delivered = delivered.clone();
            queue.on_tasks_completed(move || {
                // every callback of the cycle precedes the idle signal
                assert_eq!(delivered.load(Ordering::SeqCst) % 3, 0);
                idle.fetch_add(1, Ordering::SeqCst);
            });
        }

        for round in 1..=2 {
            let (gate_tx, gate_rx) = channel::bounded::<()>(0);
            {
                let delivered = delivered.clone();
                queue
                    .add(
                        move || gate_rx.recv().map_err(anyhow::Error::from),
                        move |_| {
                            delivered.fetch_add(1, Ordering::SeqCst);
                        },
                    )
                    .unwrap();
            }
            for _ in 0..2 {
                let delivered = delivered.clone();
                queue
                    .add(
                        || Ok(()),
                        move |_| {
                            delivered.fetch_add(1, Ordering::SeqCst);
                        },
                    )
                    .unwrap();
            }
            gate_tx.send(()).unwrap();
            assert!(home.run_until(|| idle.load(Ordering::SeqCst) == round, WAIT));
            home.run_for(Duration::from_millis(50));
            assert_eq!(idle.load(Ordering::SeqCst), round);
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_panicking_callback_does_not_kill_worker() {
        let (home, queue) = running_queue();
        queue
            .add(|| Ok(()), |_| panic!("callback blew up"))
            .unwrap();
        let ok = Arc::new(AtomicBool::new(false));
        let ok2 = ok.clone();
        queue
            .add(|| Ok(5), move |r| ok2.store(r.unwrap() == 5, Ordering::SeqCst))
            .unwrap();
        assert!(home.run_until(|| ok.load(Ordering::SeqCst), WAIT));
    }

    #[test]
    fn test_stop_abandons_queued_items() {
        let (home, queue) = running_queue();
        let fired = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let (gate_tx, gate_rx) = channel::bounded::<()>(1);

        queue
            .add(
                move || {
                    started_tx.send(())?;
                    gate_rx.recv()?;
                    Ok(())
                },
                |_| {},
            )
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        for _ in 0..3 {
            let fired = fired.clone();
            queue
                .add(
                    || Ok(()),
                    move |_| {
                        fired.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap();
        }
        assert_eq!(queue.pending_len(), 3);

        let stopper = {
            let queue = queue.clone();
            thread::spawn(move || queue.stop())
        };
        thread::sleep(Duration::from_millis(50));
        // the worker is still busy with the first item, so stop() is still blocked
        assert!(!stopper.is_finished());
        gate_tx.send(()).unwrap();
        stopper.join().unwrap();

        assert_eq!(queue.state(), QueueState::Stopped);
        assert_eq!(queue.pending_len(), 0);
        home.run_for(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_work_error_is_delivered_to_its_own_callback() {
        let (home, queue) = running_queue();
        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        queue
            .add(
                || -> anyhow::Result<()> { Err(anyhow!("no such manga")) },
                move |r| *got2.lock().unwrap() = Some(r.unwrap_err().to_string()),
            )
            .unwrap();
        assert!(home.run_until(|| got.lock().unwrap().is_some(), WAIT));
        assert_eq!(got.lock().unwrap().as_deref(), Some("no such manga"));
    }
}
