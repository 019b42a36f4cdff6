//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use aio_runtime::{
    AioConfig, AioProvider, CallId, Capability, CompletionRecord, IssueOptions, Issued, PortHandle, RecordSlot,
};
use parking_lot::{Condvar, Mutex};

/// How the scripted provider answers the next `issue_multi_io`.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Complete inline with this return code and byte count.
    Immediate { rc: i32, bytes: u64 },
    /// Leave the operation outstanding.
    Pending,
    /// Fail the issue call itself.
    Fail,
}

/// Provider whose answers are dictated by the test.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Script>>,
    issued: Mutex<Vec<(CompletionRecord, IssueOptions)>>,
    cancels: Mutex<Vec<(u64, CallId)>>,
    cancel_rc: AtomicI32,
    queue: Mutex<VecDeque<CompletionRecord>>,
    ready: Condvar,
    port_open: AtomicBool,
    batch: bool,
    dequeues: AtomicU64,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::with_batch(true)
    }

    pub fn with_batch(batch: bool) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            issued: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            cancel_rc: AtomicI32::new(0),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            port_open: AtomicBool::new(false),
            batch,
            dequeues: AtomicU64::new(0),
        }
    }

    /// Queue the answer for the next issue. Unscripted issues pend.
    pub fn push(&self, script: Script) {
        self.script.lock().push_back(script);
    }

    /// Return code for every later cancel.
    pub fn set_cancel_rc(&self, rc: i32) {
        self.cancel_rc.store(rc, Ordering::SeqCst);
    }

    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }

    pub fn last_issued(&self) -> Option<(CompletionRecord, IssueOptions)> {
        self.issued.lock().last().cloned()
    }

    pub fn cancels(&self) -> Vec<(u64, CallId)> {
        self.cancels.lock().clone()
    }

    /// Post a completion for the most recently issued operation.
    pub fn complete_last(&self, rc: i32, bytes: u64) {
        let Some((mut record, _)) = self.last_issued() else {
            panic!("nothing issued");
        };
        record.set_result(rc, bytes);
        self.post(record);
    }

    /// Post an arbitrary record to the completion port.
    pub fn post(&self, record: CompletionRecord) {
        self.queue.lock().push_back(record);
        self.ready.notify_one();
    }
}

impl AioProvider for ScriptedProvider {
    fn associate(&self, _native_handle: u64, _port: PortHandle) -> io::Result<()> {
        Ok(())
    }

    fn issue_multi_io(&self, record: &mut CompletionRecord, options: IssueOptions) -> io::Result<Issued> {
        self.issued.lock().push((record.clone(), options));
        match self.script.lock().pop_front().unwrap_or(Script::Pending) {
            Script::Immediate { rc, bytes } => {
                record.set_result(rc, bytes);
                Ok(Issued::Immediate)
            }
            Script::Pending => Ok(Issued::Pending),
            Script::Fail => Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted failure")),
        }
    }

    fn cancel(&self, channel_id: u64, call_id: CallId) -> i32 {
        self.cancels.lock().push((channel_id, call_id));
        self.cancel_rc.load(Ordering::SeqCst)
    }

    fn dequeue_completions(&self, _port: PortHandle, slots: &mut [RecordSlot], timeout: Duration) -> io::Result<usize> {
        self.dequeues.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        while queue.is_empty() && self.port_open.load(Ordering::Acquire) {
            if self.ready.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
        let mut filled = 0;
        while filled < slots.len() {
            let Some(record) = queue.pop_front() else { break };
            slots[filled]
                .store(&record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            filled += 1;
        }
        Ok(filled)
    }

    fn open_completion_port(&self) -> io::Result<PortHandle> {
        self.port_open.store(true, Ordering::Release);
        Ok(PortHandle(1))
    }

    fn close_completion_port(&self, _port: PortHandle) {
        self.port_open.store(false, Ordering::Release);
        self.ready.notify_all();
    }

    fn is_port_valid(&self, _port: PortHandle) -> bool {
        self.port_open.load(Ordering::Acquire)
    }

    fn capability_query(&self, capability: Capability) -> bool {
        capability == Capability::BatchDequeue && self.batch
    }
}

/// Configuration with short intervals so timing tests stay fast.
pub fn fast_config() -> AioConfig {
    AioConfig::builder()
        .max_workers(2)
        .initial_workers(1)
        .dequeue_timeout(Duration::from_millis(20))
        .max_batched_events(8)
        .timer_sleep_interval(Duration::from_millis(1))
        .timer_check_interval(Duration::from_millis(5))
        .timer_prune_interval(Duration::from_millis(50))
        .build()
        .expect("valid test configuration")
}

/// Poll `cond` for up to two seconds.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
