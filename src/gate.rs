//! 公平下载闸门（FairGate）。
//!
//! 计数型准入控制：同时持有许可的票据数不超过 `capacity`，等待者严格按
//! 申请顺序（序号递增）获得许可。仍在等待的票据可以被取消，且不占用名额。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel as channel;
use tracing::{debug, warn};

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("gate capacity must be at least 1")]
    ZeroCapacity,
    #[error("ticket #{0} was never granted")]
    NotGranted(u64),
    #[error("ticket #{0} was already released")]
    AlreadyReleased(u64),
    #[error("ticket #{0} belongs to another gate")]
    ForeignTicket(u64),
}

/// 等待票据的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Waiting,
    Granted,
    Cancelled,
    Released,
}

impl TicketStatus {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::Granted => 1,
            Self::Cancelled => 2,
            Self::Released => 3,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Granted,
            2 => Self::Cancelled,
            3 => Self::Released,
            _ => Self::Waiting,
        }
    }
}

/// 票据标识，可在任意线程用于取消或释放。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketId {
    gate: u64,
    seq: u64,
}

impl TicketId {
    pub fn seq(self) -> u64 {
        self.seq
    }
}

/// 一次名额申请；状态只在闸门锁内改变。
#[derive(Debug, Clone)]
pub struct GateTicket {
    id: TicketId,
    status: Arc<AtomicU8>,
    // the sender side is dropped once the request is decided
    decided: channel::Receiver<Admission>,
}

impl GateTicket {
    pub fn id(&self) -> TicketId {
        self.id
    }

    pub fn seq(&self) -> u64 {
        self.id.seq
    }

    pub fn status(&self) -> TicketStatus {
        TicketStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// 阻塞直到票据获得名额或被取消。
    ///
    /// 可重复调用，也可在同一票据的克隆上调用。
    pub fn wait(&self) -> Admission {
        let _ = self.decided.recv();
        match self.status() {
            TicketStatus::Granted | TicketStatus::Released => Admission::Granted,
            // a gate dropped with waiters behaves like a cancellation
            TicketStatus::Cancelled | TicketStatus::Waiting => Admission::Cancelled,
        }
    }
}

struct Waiter {
    seq: u64,
    status: Arc<AtomicU8>,
    tx: channel::Sender<Admission>,
}

impl Waiter {
    fn decide(self, admission: Admission) {
        let status = match admission {
            Admission::Granted => TicketStatus::Granted,
            Admission::Cancelled => TicketStatus::Cancelled,
        };
        self.status.store(status.to_u8(), Ordering::SeqCst);
        let _ = self.tx.try_send(admission);
    }
}

struct GateState {
    next_seq: u64,
    granted: usize,
    waiting: VecDeque<Waiter>,
}

pub struct FairGate {
    id: u64,
    capacity: usize,
    state: Mutex<GateState>,
}

impl FairGate {
    pub fn new(capacity: usize) -> Result<Self, GateError> {
        if capacity == 0 {
            return Err(GateError::ZeroCapacity);
        }
        Ok(Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            state: Mutex::new(GateState {
                next_seq: 0,
                granted: 0,
                waiting: VecDeque::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn granted(&self) -> usize {
        self.state().granted
    }

    pub fn waiting(&self) -> usize {
        self.state().waiting.len()
    }

    pub fn available(&self) -> usize {
        self.capacity - self.granted()
    }

    /// 提交名额申请并立即返回票据，不阻塞。
    ///
    /// 有空闲名额且前面无人排队时票据直接获得名额，否则按顺序等待。
    pub fn request(&self) -> GateTicket {
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;

        let (tx, rx) = channel::bounded(1);
        let status = Arc::new(AtomicU8::new(TicketStatus::Waiting.to_u8()));
        let ticket = GateTicket {
            id: TicketId { gate: self.id, seq },
            status: status.clone(),
            decided: rx,
        };
        let waiter = Waiter { seq, status, tx };

        if state.granted < self.capacity && state.waiting.is_empty() {
            state.granted += 1;
            waiter.decide(Admission::Granted);
            debug!(target: "gate", seq, granted = state.granted, "ticket granted immediately");
        } else {
            state.waiting.push_back(waiter);
            debug!(target: "gate", seq, waiting = state.waiting.len(), "ticket queued");
        }
        ticket
    }

    /// 申请名额并阻塞直到获得。
    pub fn acquire(&self) -> GateTicket {
        let ticket = self.request();
        ticket.wait();
        ticket
    }

    /// 撤回排队中的票据；票据不在排队（已获得、已取消或已释放）时返回 false。
    /// 已获得名额的票据仍须由持有者释放。
    pub fn cancel(&self, ticket: TicketId) -> bool {
        if ticket.gate != self.id {
            return false;
        }
        let mut state = self.state();
        let Some(pos) = state.waiting.iter().position(|w| w.seq == ticket.seq) else {
            return false;
        };
        if let Some(waiter) = state.waiting.remove(pos) {
            waiter.decide(Admission::Cancelled);
        }
        debug!(target: "gate", seq = ticket.seq, "waiting ticket cancelled");
        true
    }

    /// 归还名额，并放行最早排队的申请（如有）。
    pub fn release(&self, ticket: &GateTicket) -> Result<(), GateError> {
        if ticket.id.gate != self.id {
            return Err(GateError::ForeignTicket(ticket.id.seq));
        }
        let mut state = self.state();
        match ticket.status() {
            TicketStatus::Granted => {}
            TicketStatus::Released => {
                warn!(target: "gate", seq = ticket.id.seq, "double release rejected");
                return Err(GateError::AlreadyReleased(ticket.id.seq));
            }
            TicketStatus::Waiting | TicketStatus::Cancelled => {
                warn!(target: "gate", seq = ticket.id.seq, "release of a ticket that was never granted");
                return Err(GateError::NotGranted(ticket.id.seq));
            }
        }

        ticket
            .status
            .store(TicketStatus::Released.to_u8(), Ordering::SeqCst);
        state.granted -= 1;

        while state.granted < self.capacity {
            let Some(next) = state.waiting.pop_front() else {
                break;
            };
            state.granted += 1;
            debug!(target: "gate", seq = next.seq, "ticket granted after release");
            next.decide(Admission::Granted);
        }
        Ok(())
    }
}

impl std::fmt::Debug for FairGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("FairGate")
            .field("capacity", &self.capacity)
            .field("granted", &state.granted)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(FairGate::new(0).unwrap_err(), GateError::ZeroCapacity);
    }

    #[test]
    fn test_grants_up_to_capacity_then_queues() {
        let gate = FairGate::new(2).unwrap();
        let a = gate.request();
        let b = gate.request();
        let c = gate.request();
        assert_eq!(a.status(), TicketStatus::Granted);
        assert_eq!(b.status(), TicketStatus::Granted);
        assert_eq!(c.status(), TicketStatus::Waiting);
        assert_eq!(gate.granted(), 2);
        assert_eq!(gate.waiting(), 1);
        assert_eq!(gate.available(), 0);
    }

    #[test]
    fn test_release_grants_oldest_waiter_first() {
        let gate = FairGate::new(2).unwrap();
        let a = gate.request();
        let _b = gate.request();
        let c = gate.request();
        let d = gate.request();

        gate.release(&a).unwrap();
        assert_eq!(c.status(), TicketStatus::Granted);
        assert_eq!(d.status(), TicketStatus::Waiting);
        assert_eq!(c.wait(), Admission::Granted);
        assert_eq!(gate.granted(), 2);
    }

    #[test]
    fn test_cancel_waiting_ticket_keeps_capacity() {
        let gate = FairGate::new(2).unwrap();
        let a = gate.request();
        let b = gate.request();
        let c = gate.request();

        assert!(gate.cancel(c.id()));
        assert_eq!(c.wait(), Admission::Cancelled);
        assert_eq!(c.status(), TicketStatus::Cancelled);
        assert_eq!(gate.granted(), 2);
        assert_eq!(gate.waiting(), 0);

        gate.release(&a).unwrap();
        gate.release(&b).unwrap();
        assert_eq!(gate.available(), 2);
        // cancelled tickets never get a grant afterwards
        assert_eq!(c.status(), TicketStatus::Cancelled);
    }

    #[test]
    fn test_cancel_granted_ticket_is_noop() {
        let gate = FairGate::new(1).unwrap();
        let a = gate.request();
        assert!(!gate.cancel(a.id()));
        assert_eq!(a.status(), TicketStatus::Granted);
        assert_eq!(gate.granted(), 1);
        gate.release(&a).unwrap();
        assert_eq!(gate.granted(), 0);
    }

    #[test]
    fn test_double_release_rejected_without_corruption() {
        let gate = FairGate::new(1).unwrap();
        let a = gate.request();
        let b = gate.request();
        gate.release(&a).unwrap();
        assert_eq!(gate.release(&a), Err(GateError::AlreadyReleased(a.seq())));
        assert_eq!(gate.granted(), 1);
        assert_eq!(b.status(), TicketStatus::Granted);

        let c = gate.request();
        assert_eq!(c.status(), TicketStatus::Waiting);
        assert_eq!(gate.release(&c), Err(GateError::NotGranted(c.seq())));
        gate.release(&b).unwrap();
        assert_eq!(c.status(), TicketStatus::Granted);
        assert_eq!(gate.granted(), 1);
    }

    #[test]
    fn test_release_of_cancelled_ticket_rejected() {
        let gate = FairGate::new(1).unwrap();
        let _a = gate.request();
        let b = gate.request();
        gate.cancel(b.id());
        assert_eq!(gate.release(&b), Err(GateError::NotGranted(b.seq())));
        assert_eq!(gate.granted(), 1);
    }

    #[test]
    fn test_foreign_ticket_rejected() {
        let one = FairGate::new(1).unwrap();
        let two = FairGate::new(1).unwrap();
        let t = one.request();
        assert_eq!(two.release(&t), Err(GateError::ForeignTicket(t.seq())));
        assert!(!two.cancel(t.id()));
        assert_eq!(one.granted(), 1);
    }

    #[test]
    fn test_blocked_threads_admitted_in_arrival_order() {
        let gate = Arc::new(FairGate::new(1).unwrap());
        let first = gate.acquire();
        let (tx, rx) = channel::unbounded();

        let mut handles = Vec::new();
        for i in 0..4 {
            // tickets are filed here, in order, before any thread blocks
            let ticket = gate.request();
            let gate = gate.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                assert_eq!(ticket.wait(), Admission::Granted);
                tx.send(i).unwrap();
                thread::sleep(Duration::from_millis(5));
                gate.release(&ticket).unwrap();
            }));
        }
        gate.release(&first).unwrap();
        for h in handles {
            h.join().unwrap();
        }
        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(gate.granted(), 0);
    }

    #[test]
    fn test_cancel_wakes_blocked_waiter() {
        let gate = Arc::new(FairGate::new(1).unwrap());
        let _held = gate.acquire();
        let ticket = gate.request();
        let waiter = {
            let ticket = ticket.clone();
            thread::spawn(move || ticket.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(gate.cancel(ticket.id()));
        assert_eq!(waiter.join().unwrap(), Admission::Cancelled);
        assert_eq!(gate.granted(), 1);
    }

    // xorshift keeps the interleavings reproducible without extra dev-deps
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn test_interleaved_acquire_cancel_release_invariants() {
        for seed in 1..=40u64 {
            let capacity = (seed % 4 + 1) as usize;
            let gate = FairGate::new(capacity).unwrap();
            let mut rng = Rng(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let mut live: Vec<GateTicket> = Vec::new();
            let mut grant_order: Vec<u64> = Vec::new();
            let mut seen_granted = std::collections::HashSet::new();

            for _ in 0..300 {
                match rng.next() % 3 {
                    0 => live.push(gate.request()),
                    1 if !live.is_empty() => {
                        let idx = (rng.next() as usize) % live.len();
                        let t = &live[idx];
                        let was_waiting = t.status() == TicketStatus::Waiting;
                        let before = gate.granted();
                        assert_eq!(gate.cancel(t.id()), was_waiting);
                        assert_eq!(gate.granted(), before);
                        if was_waiting {
                            live.remove(idx);
                        }
                    }
                    2 => {
                        if let Some(idx) = live.iter().position(|t| t.status() == TicketStatus::Granted) {
                            let t = live.remove(idx);
                            gate.release(&t).unwrap();
                            assert!(gate.release(&t).is_err());
                        }
                    }
                    _ => {}
                }

                let granted_now = live
                    .iter()
                    .filter(|t| t.status() == TicketStatus::Granted)
                    .count();
                assert_eq!(granted_now, gate.granted());
                assert!(gate.granted() <= capacity);

                for t in &live {
                    if t.status() == TicketStatus::Granted && seen_granted.insert(t.seq()) {
                        grant_order.push(t.seq());
                    }
                }
                // nobody waits while a slot is free
                if gate.waiting() > 0 {
                    assert_eq!(gate.granted(), capacity);
                }
                // every waiting ticket is younger than every granted one
                let oldest_waiting = live
                    .iter()
                    .filter(|t| t.status() == TicketStatus::Waiting)
                    .map(GateTicket::seq)
                    .min();
                if let Some(w) = oldest_waiting {
                    assert!(grant_order.iter().all(|g| *g < w));
                }
            }

            let mut sorted = grant_order.clone();
            sorted.sort_unstable();
            assert_eq!(grant_order, sorted, "grants out of order for seed {seed}");
        }
    }
}
