use crate::{
    clock::{Clock, WallClock},
    error::{ConfigError, RunError, SubmitError},
    request::Request,
    scheduler::{Discipline, Entry, Progress, RequestKey, Scheduler},
    stats::ServerStats,
};
use flume::{Receiver, Selector, Sender};
use log::{debug, info, trace, warn};
use slab::Slab;
use static_assertions::assert_impl_all;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// A submission on its way to the worker. `release` is set when the
/// request was submitted ahead of its arrival time.
struct Arrival {
    request: Arc<Request>,
    release: Option<u64>,
}

/// Worker-local record of a request between admission and completion.
struct Inflight {
    request: Arc<Request>,
    seq: u64,
}

/// Everything the dispatch loop owns. Producers never touch it.
struct Floor {
    scheduler: Box<dyn Scheduler>,
    inflight: Slab<Inflight>,
    // (release, owner, admission order, key) of requests not yet arrived
    held: BinaryHeap<Reverse<(u64, usize, u64, RequestKey)>>,
    next_seq: u64,
    next_held: u64,
}

impl Floor {
    fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            inflight: Slab::new(),
            held: BinaryHeap::new(),
            next_seq: 0,
            next_held: 0,
        }
    }

    fn next_release(&self) -> Option<u64> {
        self.held.peek().map(|Reverse((at, ..))| *at)
    }

    /// Hand an admitted request to the discipline. Sequence numbers follow
    /// the order requests become pending.
    fn make_pending(&mut self, key: RequestKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = &mut self.inflight[key];
        entry.seq = seq;
        let service = entry.request.remaining();
        self.scheduler.push(Entry { key, seq, service });
    }
}

enum Wake {
    Submitted(Arrival),
    Due(u64),
    ShutDown,
}

/// Builds a `Server`. Every setting is validated in `build`, so a bad
/// discipline selector fails before anything runs.
pub struct ServerBuilder {
    discipline: Discipline,
    selector: Option<(u8, u64)>,
    capacity: Option<usize>,
    clock: Option<Arc<dyn Clock>>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            discipline: Discipline::default(),
            selector: None,
            capacity: None,
            clock: None,
        }
    }

    pub fn discipline(mut self, discipline: Discipline) -> Self {
        self.discipline = discipline;
        self.selector = None;
        self
    }

    /// Numeric selector (0 = FCFS, 1 = SJF, 2 = RR), decoded at `build`.
    pub fn selector(mut self, selector: u8, quantum: u64) -> Self {
        self.selector = Some((selector, quantum));
        self
    }

    /// Bound the submission queue. `submit` blocks while it is full.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Defaults to a `WallClock` with one unit per millisecond.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Arc<Server>, ConfigError> {
        let discipline = match self.selector {
            Some((selector, quantum)) => Discipline::from_selector(selector, quantum)?,
            None => self.discipline,
        };
        let (ingress_tx, ingress_rx) = match self.capacity {
            Some(0) => return Err(ConfigError::ZeroCapacity),
            Some(cap) => flume::bounded(cap),
            None => flume::unbounded(),
        };
        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(WallClock::millis()) as Arc<dyn Clock>);

        Ok(Arc::new(Server {
            discipline,
            bounded: self.capacity.is_some(),
            clock,
            ingress_tx,
            ingress_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            shut_down: AtomicBool::new(false),
            running: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            stats: Mutex::new(ServerStats::new()),
        }))
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A single server that services submitted requests one at a time under a
/// queue discipline.
///
/// Producers call `submit` from any thread; exactly one worker runs the
/// dispatch loop (`run` or `spawn`). The ingress channel is the only
/// structure shared between them: the discipline's pending set and the
/// in-flight table live on the worker thread.
pub struct Server {
    discipline: Discipline,
    bounded: bool,
    clock: Arc<dyn Clock>,

    ingress_tx: Sender<Arrival>,
    ingress_rx: Receiver<Arrival>,

    // never carries a message; dropping the sender wakes every waiter
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    // ground truth for shutdown
    shut_down: AtomicBool,
    running: AtomicBool,

    submitted: AtomicU64,
    stats: Mutex<ServerStats>,
}
assert_impl_all!(Server: Send, Sync);
assert_impl_all!(Request: Send, Sync);

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Current time on the server's clock.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Snapshot of the server's stats.
    pub fn stats(&self) -> ServerStats {
        let mut stats = self.lock_stats().clone();
        stats.submitted = self.submitted.load(Ordering::Acquire);
        stats
    }

    /// Queue a request for service and stamp its queue entry time.
    ///
    /// Safe to call from many threads. Only blocks when the server was
    /// built with a capacity and the submission queue is full; shutdown
    /// releases a blocked caller with `SubmitError::ShutDown`.
    pub fn submit(&self, request: Arc<Request>) -> Result<(), SubmitError> {
        self.enqueue(request, None)
    }

    /// Submit now a request that arrives at time `at`.
    ///
    /// The worker holds it until its clock reaches `at`, then queues it with
    /// `at` as its queue entry time. An idle worker skips a `SimClock`
    /// straight to the next held arrival. A time already past behaves like
    /// `submit`.
    pub fn submit_at(&self, request: Arc<Request>, at: u64) -> Result<(), SubmitError> {
        self.enqueue(request, Some(at))
    }

    fn enqueue(&self, request: Arc<Request>, at: Option<u64>) -> Result<(), SubmitError> {
        if self.is_shut_down() {
            return Err(SubmitError::ShutDown);
        }
        if !request.claim_submission() {
            return Err(SubmitError::AlreadySubmitted);
        }
        let now = self.clock.now();
        let release = match at {
            Some(at) if at > now => {
                trace!("order placed by {} for {}", request, at);
                Some(at)
            }
            _ => {
                request.stamp_queue_entry(now);
                trace!("order placed by {}", request);
                None
            }
        };
        self.send_ingress(Arrival { request, release })?;
        self.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn send_ingress(&self, arrival: Arrival) -> Result<(), SubmitError> {
        if !self.bounded {
            return self
                .ingress_tx
                .send(arrival)
                .map_err(|_| SubmitError::ShutDown);
        }
        Selector::new()
            .send(&self.ingress_tx, arrival, |r| {
                r.map_err(|_| SubmitError::ShutDown)
            })
            .recv(&self.shutdown_rx, |_| Err(SubmitError::ShutDown))
            .wait()
    }

    /// Stop the dispatch loop. Pending and in-service requests are
    /// abandoned, not completed. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // disconnecting wakes a parked worker, an elapsing clock and any
        // producer blocked on a full queue
        drop(
            self.shutdown_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        info!("shutdown requested");
    }

    /// Run `run` on a dedicated thread. With a `gate`, the worker waits at
    /// the barrier before dispatching anything.
    pub fn spawn(self: &Arc<Self>, gate: Option<Arc<Barrier>>) -> std::io::Result<Worker> {
        let server = self.clone();
        let thread = thread::Builder::new()
            .name("barkeep-server".to_string())
            .spawn(move || {
                if let Some(gate) = gate {
                    gate.wait();
                }
                server.run()
            })?;
        Ok(Worker {
            server: self.clone(),
            thread,
        })
    }

    /// Run the dispatch loop on the calling thread until shutdown.
    pub fn run(&self) -> Result<(), RunError> {
        self.run_with(self.discipline.scheduler())
    }

    pub(crate) fn run_with(&self, scheduler: Box<dyn Scheduler>) -> Result<(), RunError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(RunError::AlreadyRunning);
        }
        let mut floor = Floor::new(scheduler);
        self.lock_stats().record_start(self.clock.now());
        info!("server open, discipline {}", self.discipline);

        loop {
            if self.is_shut_down() {
                break;
            }
            // Always ingest submissions and due arrivals first.
            self.intake(&mut floor);

            // If nothing runnable, park until a submission, the next held
            // arrival or shutdown.
            if !floor.scheduler.is_runnable() {
                match self.park(floor.next_release()) {
                    Wake::Submitted(arrival) => {
                        self.admit(arrival, &mut floor);
                        continue;
                    }
                    Wake::Due(at) => {
                        self.clock.advance_to(at);
                        continue;
                    }
                    Wake::ShutDown => break,
                }
            }

            let Some(dispatch) = floor.scheduler.pop() else {
                continue;
            };
            let Some(entry) = floor.inflight.get(dispatch.key) else {
                // stale key; drop whatever state the policy kept for it
                floor.scheduler.clear_state(dispatch.key);
                continue;
            };
            let request = entry.request.clone();
            let seq = entry.seq;

            let queued = request.begin_slice(self.clock.now());
            {
                let mut stats = self.lock_stats();
                stats.record_dispatch(queued, dispatch.slice);
                stats.sample_pending(floor.scheduler.len() as u64);
            }
            debug!(
                "preparing order for patron {} (slice {}, remaining {})",
                request,
                dispatch.slice,
                request.remaining()
            );

            if self.clock.elapse(dispatch.slice, &self.shutdown_rx).is_err() {
                // interrupted mid-service: abandoned along with the rest
                break;
            }
            let left = request.end_slice(dispatch.slice);
            self.lock_stats().record_served(dispatch.slice);

            match floor.scheduler.observe(dispatch.key, dispatch.slice) {
                Progress::Done => {
                    debug_assert_eq!(left, 0);
                    floor.inflight.remove(dispatch.key);
                    floor.scheduler.clear_state(dispatch.key);
                    request.finish(self.clock.now());
                    self.lock_stats().record_completion();
                    debug!("made order for patron {}", request);
                }
                Progress::Remaining(remaining) => {
                    debug_assert_eq!(left, remaining);
                    // arrivals during the slice queue ahead of the preempted request
                    self.intake(&mut floor);
                    request.requeue(self.clock.now());
                    floor.scheduler.push(Entry {
                        key: dispatch.key,
                        seq,
                        service: remaining,
                    });
                    self.lock_stats().record_requeue();
                    trace!("requeued {} with {} left", request, remaining);
                }
            }
        }

        let abandoned = floor.inflight.len() + self.ingress_rx.drain().count();
        self.lock_stats()
            .record_stop(self.clock.now(), abandoned as u64);
        if abandoned > 0 {
            warn!("packing up with {} unfinished requests", abandoned);
        } else {
            info!("packing up");
        }
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    fn intake(&self, floor: &mut Floor) {
        while let Ok(arrival) = self.ingress_rx.try_recv() {
            self.admit(arrival, floor);
        }
        self.release_due(floor);
    }

    /// Take a submission off ingress. Requests submitted ahead of their
    /// arrival wait in `held`, ordered by arrival then owner then admission,
    /// so concurrent producers cannot reorder a simulated run.
    fn admit(&self, arrival: Arrival, floor: &mut Floor) {
        let Arrival { request, release } = arrival;
        let owner = request.owner();
        let key = floor.inflight.insert(Inflight { request, seq: 0 });
        match release {
            Some(at) if at > self.clock.now() => {
                floor.held.push(Reverse((at, owner, floor.next_held, key)));
                floor.next_held += 1;
            }
            Some(at) => {
                floor.inflight[key].request.stamp_queue_entry(at);
                floor.make_pending(key);
            }
            None => floor.make_pending(key),
        }
    }

    fn release_due(&self, floor: &mut Floor) {
        let now = self.clock.now();
        while let Some(&Reverse((at, _, _, key))) = floor.held.peek() {
            if at > now {
                break;
            }
            floor.held.pop();
            let request = &floor.inflight[key].request;
            request.stamp_queue_entry(at);
            trace!("{} arrived at {}", request, at);
            floor.make_pending(key);
        }
    }

    fn park(&self, next_release: Option<u64>) -> Wake {
        let selector = Selector::new()
            .recv(&self.ingress_rx, |r| r.map_or(Wake::ShutDown, Wake::Submitted))
            .recv(&self.shutdown_rx, |_| Wake::ShutDown);
        match next_release {
            None => selector.wait(),
            Some(at) => {
                let idle = at.saturating_sub(self.clock.now());
                selector
                    .wait_timeout(self.clock.span(idle))
                    .unwrap_or(Wake::Due(at))
            }
        }
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, ServerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a server's worker thread.
pub struct Worker {
    server: Arc<Server>,
    thread: JoinHandle<Result<(), RunError>>,
}

impl Worker {
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the loop to exit; only returns after someone calls
    /// `Server::shutdown`.
    pub fn join(self) -> thread::Result<Result<(), RunError>> {
        self.thread.join()
    }

    pub fn shutdown_and_join(self) -> thread::Result<Result<(), RunError>> {
        self.server.shutdown();
        self.thread.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::scheduler::Dispatch;
    use std::time::{Duration, Instant};

    fn sim_server(discipline: Discipline) -> (Arc<Server>, Arc<SimClock>) {
        let clock = Arc::new(SimClock::new());
        let server = Server::builder()
            .discipline(discipline)
            .clock(clock.clone())
            .build()
            .unwrap();
        (server, clock)
    }

    fn submit_all(server: &Server, services: &[u64]) -> Vec<Arc<Request>> {
        services
            .iter()
            .enumerate()
            .map(|(owner, &service)| {
                let req = Arc::new(Request::new(owner, service));
                server.submit(req.clone()).unwrap();
                req
            })
            .collect()
    }

    fn wait_all(reqs: &[Arc<Request>]) {
        for req in reqs {
            assert!(
                req.wait_timeout(Duration::from_secs(5)),
                "request {} never completed",
                req
            );
        }
    }

    /// Wraps a policy and records every dispatch it hands out.
    struct Tracker {
        inner: Box<dyn Scheduler>,
        picked: Arc<Mutex<Vec<Dispatch>>>,
    }

    impl Scheduler for Tracker {
        fn push(&mut self, entry: Entry) {
            self.inner.push(entry);
        }
        fn pop(&mut self) -> Option<Dispatch> {
            let d = self.inner.pop();
            if let Some(d) = d {
                self.picked.lock().unwrap().push(d);
            }
            d
        }
        fn observe(&mut self, key: RequestKey, served: u64) -> Progress {
            self.inner.observe(key, served)
        }
        fn clear_state(&mut self, key: RequestKey) {
            self.inner.clear_state(key);
        }
        fn is_runnable(&self) -> bool {
            self.inner.is_runnable()
        }
        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[test]
    fn test_config_errors() {
        assert!(matches!(
            Server::builder().selector(7, 25).build(),
            Err(ConfigError::UnsupportedDiscipline(7))
        ));
        assert!(matches!(
            Server::builder().selector(2, 0).build(),
            Err(ConfigError::ZeroQuantum)
        ));
        assert!(matches!(
            Server::builder().capacity(0).build(),
            Err(ConfigError::ZeroCapacity)
        ));
        let server = Server::builder().selector(1, 0).build().unwrap();
        assert_eq!(server.discipline(), Discipline::Sjf);
    }

    #[test]
    fn test_fcfs_completes_in_submission_order() {
        let (server, clock) = sim_server(Discipline::Fcfs);
        let reqs = submit_all(&server, &[90, 10, 500, 30, 10]);
        let worker = server.spawn(None).unwrap();
        wait_all(&reqs);

        let completions: Vec<_> = reqs.iter().map(|r| r.completion_time().unwrap()).collect();
        assert_eq!(completions, vec![90, 100, 600, 630, 640]);
        let starts: Vec<_> = reqs.iter().map(|r| r.start_time().unwrap()).collect();
        assert_eq!(starts, vec![0, 90, 100, 600, 630]);
        assert_eq!(clock.now(), 640);
        for req in &reqs {
            assert_eq!(req.queue_entry_time(), Some(0));
            assert_eq!(req.slices(), 1);
            assert_eq!(req.remaining(), 0);
        }
        assert_eq!(worker.shutdown_and_join().unwrap(), Ok(()));
    }

    #[test]
    fn test_sjf_shortest_first() {
        let (server, _clock) = sim_server(Discipline::Sjf);
        let reqs = submit_all(&server, &[50, 10, 30]);
        let worker = server.spawn(None).unwrap();
        wait_all(&reqs);

        // dispatch order 10, 30, 50
        assert_eq!(reqs[1].start_time(), Some(0));
        assert_eq!(reqs[2].start_time(), Some(10));
        assert_eq!(reqs[0].start_time(), Some(40));
        assert_eq!(reqs[0].completion_time(), Some(90));
        worker.shutdown_and_join().unwrap().unwrap();
    }

    #[test]
    fn test_sjf_ties_keep_submission_order() {
        let (server, _clock) = sim_server(Discipline::Sjf);
        let reqs = submit_all(&server, &[30, 10, 30, 10, 30]);
        let worker = server.spawn(None).unwrap();
        wait_all(&reqs);

        let mut order: Vec<_> = (0..reqs.len()).collect();
        order.sort_by_key(|&i| reqs[i].start_time().unwrap());
        assert_eq!(order, vec![1, 3, 0, 2, 4]);
        worker.shutdown_and_join().unwrap().unwrap();
    }

    #[test]
    fn test_round_robin_two_requests() {
        let (server, clock) = sim_server(Discipline::round_robin(25).unwrap());
        let reqs = submit_all(&server, &[60, 20]);
        let picked = Arc::new(Mutex::new(Vec::new()));
        let tracker = Tracker {
            inner: server.discipline().scheduler(),
            picked: picked.clone(),
        };
        let worker = {
            let server = server.clone();
            thread::spawn(move || server.run_with(Box::new(tracker)))
        };
        wait_all(&reqs);

        // A(25) -> B(20) -> A(25) -> A(10)
        let trace: Vec<_> = picked
            .lock()
            .unwrap()
            .iter()
            .map(|d| (d.key, d.slice))
            .collect();
        assert_eq!(trace, vec![(0, 25), (1, 20), (0, 25), (0, 10)]);

        let (a, b) = (&reqs[0], &reqs[1]);
        assert_eq!(a.start_time(), Some(0));
        assert_eq!(b.start_time(), Some(25));
        assert_eq!(b.completion_time(), Some(45));
        assert_eq!(a.completion_time(), Some(80));
        assert_eq!(a.slices(), 3);
        assert_eq!(b.slices(), 1);
        // A queued 0..0, then 25..45
        assert_eq!(a.waiting_time(), 20);
        assert_eq!(b.waiting_time(), 25);
        assert_eq!(clock.now(), 80);

        server.shutdown();
        assert_eq!(worker.join().unwrap(), Ok(()));
        let stats = server.stats();
        assert_eq!(stats.dispatches, 4);
        assert_eq!(stats.requeues, 2);
        assert_eq!(stats.completions, 2);
        assert_eq!(stats.busy, 80);
    }

    /// Run the server's own discipline wrapped in a `Tracker`.
    fn spawn_tracked(
        server: &Arc<Server>,
    ) -> (thread::JoinHandle<Result<(), RunError>>, Arc<Mutex<Vec<Dispatch>>>) {
        let picked = Arc::new(Mutex::new(Vec::new()));
        let tracker = Tracker {
            inner: server.discipline().scheduler(),
            picked: picked.clone(),
        };
        let server = server.clone();
        (thread::spawn(move || server.run_with(Box::new(tracker))), picked)
    }

    fn trace(picked: &Mutex<Vec<Dispatch>>) -> Vec<(RequestKey, u64)> {
        picked.lock().unwrap().iter().map(|d| (d.key, d.slice)).collect()
    }

    #[test]
    fn test_held_arrival_skips_idle_time() {
        let (server, clock) = sim_server(Discipline::Fcfs);
        let late = Arc::new(Request::new(0, 10));
        server.submit_at(late.clone(), 100).unwrap();
        assert_eq!(late.queue_entry_time(), None);
        let worker = server.spawn(None).unwrap();
        wait_all(&[late.clone()]);

        assert_eq!(late.queue_entry_time(), Some(100));
        assert_eq!(late.start_time(), Some(100));
        assert_eq!(late.completion_time(), Some(110));
        assert_eq!(late.waiting_time(), 0);
        assert_eq!(clock.now(), 110);
        worker.shutdown_and_join().unwrap().unwrap();
        assert_eq!(server.stats().busy, 10);
    }

    #[test]
    fn test_held_arrivals_order_by_time_then_owner() {
        let (server, _clock) = sim_server(Discipline::Fcfs);
        // submitted out of arrival order
        let reqs = [(3, 50), (1, 50), (2, 20)]
            .map(|(owner, at)| {
                let req = Arc::new(Request::new(owner, 5));
                server.submit_at(req.clone(), at).unwrap();
                req
            });
        let worker = server.spawn(None).unwrap();
        wait_all(&reqs);

        assert_eq!(reqs[2].start_time(), Some(20));
        assert_eq!(reqs[1].start_time(), Some(50));
        assert_eq!(reqs[0].start_time(), Some(55));
        assert_eq!(reqs[0].waiting_time(), 5);
        worker.shutdown_and_join().unwrap().unwrap();
    }

    #[test]
    fn test_round_robin_arrival_during_slice_goes_first() {
        let (server, clock) = sim_server(Discipline::round_robin(25).unwrap());
        let a = Arc::new(Request::new(0, 60));
        let b = Arc::new(Request::new(1, 20));
        server.submit(a.clone()).unwrap();
        server.submit_at(b.clone(), 7).unwrap();
        let (worker, picked) = spawn_tracked(&server);
        wait_all(&[a.clone(), b.clone()]);

        // B arrives inside A's first slice and is queued before A's requeue
        assert_eq!(trace(&picked), vec![(0, 25), (1, 20), (0, 25), (0, 10)]);
        assert_eq!(b.queue_entry_time(), Some(7));
        assert_eq!(b.start_time(), Some(25));
        assert_eq!(b.completion_time(), Some(45));
        assert_eq!(b.waiting_time(), 18);
        assert_eq!(a.completion_time(), Some(80));
        assert_eq!(clock.now(), 80);

        server.shutdown();
        assert_eq!(worker.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_round_robin_submission_during_slice_goes_first() {
        let clock = Arc::new(WallClock::new(Duration::from_millis(10)).unwrap());
        let server = Server::builder()
            .discipline(Discipline::round_robin(25).unwrap())
            .clock(clock)
            .build()
            .unwrap();
        let a = Arc::new(Request::new(0, 60));
        let b = Arc::new(Request::new(1, 20));
        server.submit(a.clone()).unwrap();
        let (worker, picked) = spawn_tracked(&server);

        // A's first slice runs for 250ms; submit B inside it
        let deadline = Instant::now() + Duration::from_secs(5);
        while a.start_time().is_none() {
            assert!(Instant::now() < deadline, "A never started");
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(30));
        server.submit(b.clone()).unwrap();
        wait_all(&[a.clone(), b.clone()]);

        assert_eq!(trace(&picked), vec![(0, 25), (1, 20), (0, 25), (0, 10)]);
        assert!(b.queue_entry_time().unwrap() < 25);
        assert!(b.start_time().unwrap() >= 25);
        assert!(b.completion_time().unwrap() >= 45);
        assert!(b.completion_time() < a.completion_time());
        assert!(a.completion_time().unwrap() >= 80);
        assert_eq!(a.slices(), 3);
        assert_eq!(b.slices(), 1);

        server.shutdown();
        assert_eq!(worker.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_round_robin_single_long_request() {
        let (server, _clock) = sim_server(Discipline::round_robin(25).unwrap());
        let reqs = submit_all(&server, &[90]);
        let worker = server.spawn(None).unwrap();
        wait_all(&reqs);

        let req = &reqs[0];
        assert_eq!(req.slices(), 4);
        assert_eq!(req.start_time(), Some(0));
        assert_eq!(req.queue_entry_time(), Some(0));
        assert_eq!(req.completion_time(), Some(90));
        assert_eq!(req.remaining(), 0);
        let stats = worker.server().stats();
        assert_eq!(stats.slice.max, 25);
        assert_eq!(stats.slice.sum, 90);
        worker.shutdown_and_join().unwrap().unwrap();
    }

    #[test]
    fn test_concurrent_producers() {
        for discipline in [
            Discipline::Fcfs,
            Discipline::Sjf,
            Discipline::round_robin(25).unwrap(),
        ] {
            let (server, _clock) = sim_server(discipline);
            let worker = server.spawn(None).unwrap();
            let producers: Vec<_> = (0..8)
                .map(|owner| {
                    let server = server.clone();
                    thread::spawn(move || {
                        let reqs: Vec<_> = (0..20)
                            .map(|i| Arc::new(Request::new(owner, 5 + (i * 7 + owner as u64) % 60)))
                            .collect();
                        for req in &reqs {
                            server.submit(req.clone()).unwrap();
                        }
                        for req in &reqs {
                            req.wait();
                        }
                        reqs
                    })
                })
                .collect();

            for p in producers {
                for req in p.join().unwrap() {
                    let entry = req.queue_entry_time().unwrap();
                    let start = req.start_time().unwrap();
                    let done = req.completion_time().unwrap();
                    assert!(entry <= start && start <= done, "{}: {entry} {start} {done}", discipline);
                    assert_eq!(req.remaining(), 0);
                }
            }
            worker.shutdown_and_join().unwrap().unwrap();
            let stats = server.stats();
            assert_eq!(stats.submitted, 160);
            assert_eq!(stats.completions, 160);
            assert_eq!(stats.abandoned, 0);
        }
    }

    #[test]
    fn test_fcfs_per_producer_order_under_concurrency() {
        let (server, _clock) = sim_server(Discipline::Fcfs);
        let worker = server.spawn(None).unwrap();
        let producers: Vec<_> = (0..4)
            .map(|owner| {
                let server = server.clone();
                thread::spawn(move || {
                    let reqs: Vec<_> = (0..10)
                        .map(|i| Arc::new(Request::new(owner, 1 + i % 3)))
                        .collect();
                    for req in &reqs {
                        server.submit(req.clone()).unwrap();
                    }
                    wait_all(&reqs);
                    let done: Vec<_> = reqs.iter().map(|r| r.completion_time().unwrap()).collect();
                    assert!(done.windows(2).all(|w| w[0] < w[1]));
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        worker.shutdown_and_join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_idle_worker() {
        let (server, _clock) = sim_server(Discipline::Fcfs);
        let worker = server.spawn(None).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());
        let start = Instant::now();
        assert_eq!(worker.shutdown_and_join().unwrap(), Ok(()));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(server.stats().stopped_at.is_some());
    }

    #[test]
    fn test_shutdown_abandons_in_flight() {
        let clock = Arc::new(WallClock::new(Duration::from_millis(1)).unwrap());
        let server = Server::builder().clock(clock).build().unwrap();
        let long = Arc::new(Request::new(0, 600_000));
        let next = Arc::new(Request::new(1, 10));
        server.submit(long.clone()).unwrap();
        server.submit(next.clone()).unwrap();
        let worker = server.spawn(None).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(long.start_time().is_some());
        let start = Instant::now();
        worker.shutdown_and_join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        assert!(!long.is_completed());
        assert!(!next.is_completed());
        assert!(!long.wait_timeout(Duration::from_millis(10)));
        assert_eq!(server.stats().abandoned, 2);
    }

    #[test]
    fn test_submit_errors() {
        let (server, _clock) = sim_server(Discipline::Fcfs);
        let req = Arc::new(Request::new(0, 10));
        server.submit(req.clone()).unwrap();
        assert_eq!(server.submit(req.clone()), Err(SubmitError::AlreadySubmitted));
        server.shutdown();
        server.shutdown();
        assert_eq!(
            server.submit(Arc::new(Request::new(0, 10))),
            Err(SubmitError::ShutDown)
        );
        assert_eq!(server.stats().submitted, 1);
    }

    #[test]
    fn test_run_twice() {
        let (server, _clock) = sim_server(Discipline::Fcfs);
        let worker = server.spawn(None).unwrap();
        let req = Arc::new(Request::new(0, 10));
        server.submit(req.clone()).unwrap();
        // once the request is done the worker is certainly inside its loop
        req.wait();
        assert_eq!(server.run(), Err(RunError::AlreadyRunning));
        worker.shutdown_and_join().unwrap().unwrap();
    }

    #[test]
    fn test_worker_waits_for_gate() {
        let (server, _clock) = sim_server(Discipline::Fcfs);
        let gate = Arc::new(Barrier::new(2));
        let worker = server.spawn(Some(gate.clone())).unwrap();
        let req = Arc::new(Request::new(0, 10));
        server.submit(req.clone()).unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(req.start_time().is_none(), "dispatched before the gate opened");
        gate.wait();
        assert!(req.wait_timeout(Duration::from_secs(5)));
        worker.shutdown_and_join().unwrap().unwrap();
    }

    #[test]
    fn test_bounded_submit_released_by_shutdown() {
        let clock = Arc::new(SimClock::new());
        let server = Server::builder()
            .capacity(1)
            .clock(clock)
            .build()
            .unwrap();
        server.submit(Arc::new(Request::new(0, 10))).unwrap();

        let blocked = {
            let server = server.clone();
            thread::spawn(move || server.submit(Arc::new(Request::new(1, 10))))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished(), "submit should block on a full queue");
        server.shutdown();
        assert_eq!(blocked.join().unwrap(), Err(SubmitError::ShutDown));
    }

    #[test]
    fn test_bounded_submit_proceeds_once_drained() {
        let server = Server::builder()
            .capacity(1)
            .clock(Arc::new(SimClock::new()))
            .build()
            .unwrap();
        let first = Arc::new(Request::new(0, 10));
        let second = Arc::new(Request::new(1, 10));
        server.submit(first.clone()).unwrap();

        let blocked = {
            let server = server.clone();
            let second = second.clone();
            thread::spawn(move || server.submit(second))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished(), "submit should block on a full queue");

        let worker = server.spawn(None).unwrap();
        assert_eq!(blocked.join().unwrap(), Ok(()));
        wait_all(&[first.clone(), second.clone()]);
        assert_eq!(first.completion_time(), Some(10));
        assert_eq!(second.completion_time(), Some(20));
        worker.shutdown_and_join().unwrap().unwrap();
        assert_eq!(server.stats().submitted, 2);
    }

    #[tokio::test]
    async fn test_async_producer() {
        let (server, _clock) = sim_server(Discipline::Sjf);
        let worker = server.spawn(None).unwrap();
        let reqs = submit_all(&server, &[30, 20, 10]);
        for req in &reqs {
            let result = tokio::time::timeout(Duration::from_secs(5), req.completed()).await;
            assert!(result.is_ok(), "request should complete");
        }
        assert!(reqs.iter().all(|r| r.is_completed()));
        worker.shutdown_and_join().unwrap().unwrap();
    }
}
