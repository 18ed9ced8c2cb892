//! 主线程（home context）调度。
//!
//! `Marshaller::capture()` 记录调用方所在的上下文；之后在任意线程上调用
//! `post()`，闭包都会回到该上下文执行。若调用方本就处于该上下文，则同步执行。
//!
//! - `HomeLoop`：基于 channel 的事件循环，由所属线程主动泵取（生产用）。
//! - 空上下文：没有安装 `HomeLoop` 的线程，`post()` 直接在调用线程执行（测试/无界面）。

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use tracing::warn;

/// 投递到主上下文的一个任务。
pub type Action = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
}

/// [`HomeLoop`] 的发送端，可廉价克隆并跨线程移动。
#[derive(Clone)]
pub struct LoopHandle {
    id: ContextId,
    tx: channel::Sender<Action>,
}

impl LoopHandle {
    pub fn id(&self) -> ContextId {
        self.id
    }

    fn is_current(&self) -> bool {
        CURRENT.with(|c| c.borrow().as_ref().map(|h| h.id) == Some(self.id))
    }

    fn send(&self, action: Action) -> bool {
        self.tx.send(action).is_ok()
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("id", &self.id).finish()
    }
}

/// 单线程事件循环，归安装它的线程所有。
///
/// 投递的任务按投递顺序执行，且只在所有者泵取循环时执行。
pub struct HomeLoop {
    handle: LoopHandle,
    rx: channel::Receiver<Action>,
    _not_send: PhantomData<Rc<()>>,
}

impl HomeLoop {
    /// 创建事件循环并设为当前线程的主上下文。
    pub fn install() -> Self {
        let (tx, rx) = channel::unbounded();
        let handle = LoopHandle {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            tx,
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(handle.clone()));
        Self {
            handle,
            rx,
            _not_send: PhantomData,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// 非阻塞地执行已排队的全部任务，返回执行数量。
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(action) = self.rx.try_recv() {
            action();
            ran += 1;
        }
        ran
    }

    /// 泵取循环直到 `timeout` 到期。
    pub fn run_for(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        while let Ok(action) = self.rx.recv_deadline(deadline) {
            action();
            ran += 1;
        }
        ran
    }

    /// 泵取循环，直到 `done` 返回 true 或 `timeout` 到期。
    ///
    /// 每次阻塞等待前都会检查 `done`，改变条件的任务执行后立即可见。
    pub fn run_until<F>(&self, mut done: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            match self.rx.recv_deadline(deadline) {
                Ok(action) => action(),
                Err(_) => return done(),
            }
        }
    }
}

impl Drop for HomeLoop {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            let mut cur = c.borrow_mut();
            if cur.as_ref().map(|h| h.id) == Some(self.handle.id) {
                cur.take();
            }
        });
    }
}

/// 已捕获的主上下文句柄。
#[derive(Clone, Debug, Default)]
pub struct Marshaller {
    target: Option<LoopHandle>,
}

impl Marshaller {
    /// 捕获“当前位置”：本线程安装的 HomeLoop，没有则为空上下文。
    pub fn capture() -> Self {
        CURRENT.with(|c| Self {
            target: c.borrow().clone(),
        })
    }

    /// 空上下文：`post` 总是在调用线程上直接执行。
    pub fn inline() -> Self {
        Self { target: None }
    }

    pub fn to(handle: LoopHandle) -> Self {
        Self {
            target: Some(handle),
        }
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.target.as_ref().map(LoopHandle::id)
    }

    /// 调用线程是否已处于捕获的上下文。
    pub fn is_home(&self) -> bool {
        self.target.as_ref().is_none_or(LoopHandle::is_current)
    }

    /// 在捕获的上下文上执行 `action`；已在该上下文时同步执行。
    ///
    /// 只投递不等待；目标循环已销毁时任务被丢弃。
    pub fn post<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.target {
            Some(handle) if !handle.is_current() => {
                if !handle.send(Box::new(action)) {
                    warn!(target: "dispatch", "home context {:?} is gone, action dropped", handle.id);
                }
            }
            _ => action(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_null_context_runs_inline() {
        let m = Marshaller::inline();
        let here = thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        m.post(move || *seen2.lock().unwrap() = Some(thread::current().id()));
        assert_eq!(*seen.lock().unwrap(), Some(here));
        assert!(m.is_home());
    }

    #[test]
    fn test_capture_without_loop_is_null_context() {
        let m = Marshaller::capture();
        assert!(m.context_id().is_none());
    }

    #[test]
    fn test_post_from_home_runs_synchronously() {
        let home = HomeLoop::install();
        let m = Marshaller::capture();
        assert_eq!(m.context_id(), Some(home.handle().id()));

        let hit = Arc::new(Mutex::new(false));
        let hit2 = hit.clone();
        m.post(move || *hit2.lock().unwrap() = true);
        assert!(*hit.lock().unwrap());
        assert_eq!(home.run_pending(), 0);
    }

    #[test]
    fn test_post_from_other_thread_runs_on_home_in_order() {
        let home = HomeLoop::install();
        let m = Marshaller::capture();
        let home_thread = thread::current().id();
        let log = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let m = m.clone();
            let log = log.clone();
            thread::spawn(move || {
                assert!(!m.is_home());
                for i in 0..5 {
                    let log = log.clone();
                    m.post(move || log.lock().unwrap().push((i, thread::current().id())));
                }
            })
        };
        worker.join().unwrap();

        // nothing runs until the home thread pumps
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(home.run_pending(), 5);

        let log = log.lock().unwrap();
        let order: Vec<i32> = log.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(log.iter().all(|(_, t)| *t == home_thread));
    }

    #[test]
    fn test_run_until_stops_when_condition_met() {
        let home = HomeLoop::install();
        let m = Marshaller::capture();
        let flag = Arc::new(Mutex::new(false));
        let flag2 = flag.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            m.post(move || *flag2.lock().unwrap() = true);
        });
        assert!(home.run_until(|| *flag.lock().unwrap(), Duration::from_secs(5)));
    }

    #[test]
    fn test_dropped_loop_uninstalls_itself() {
        {
            let _home = HomeLoop::install();
            assert!(Marshaller::capture().context_id().is_some());
        }
        assert!(Marshaller::capture().context_id().is_none());
    }
}
