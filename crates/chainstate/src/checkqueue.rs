//! The script-check queue: a process-wide pool of worker threads draining
//! batches of independent script verifications with fail-fast semantics.
//! At most one batch is outstanding; the controller serializes callers and
//! its drop waits for quiescence.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use emberd_primitives::transaction::Transaction;
use emberd_script::interpreter::{verify_script, ScriptError, ScriptFlags};

/// One pending verification. Jobs own their inputs so workers share nothing
/// mutable; the batch-failed flag is the only cross-job channel.
pub struct ScriptCheck {
    pub tx: Arc<Transaction>,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub amount: i64,
    pub flags: ScriptFlags,
}

impl ScriptCheck {
    pub fn execute(&self) -> Result<(), ScriptError> {
        verify_script(
            &self.tx.vin[self.input_index].script_sig,
            &self.script_pubkey,
            &self.tx,
            self.input_index,
            self.amount,
            self.flags,
        )
    }
}

const MAX_JOBS_PER_WAKE: usize = 32;

struct QueueState {
    jobs: Vec<ScriptCheck>,
    /// Jobs queued or executing in the open batch.
    todo: usize,
    idle_workers: usize,
    all_ok: bool,
    quit: bool,
    batch_open: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    /// Workers park here when no jobs are queued.
    worker_cv: Condvar,
    /// The controller parks here until the batch drains.
    master_cv: Condvar,
}

impl QueueInner {
    /// Worker/master processing loop ported batch-for-batch: take a slice of
    /// jobs, run them outside the lock, fold the result into the shared
    /// flag. The master variant returns once the batch is drained; workers
    /// run until told to quit.
    fn run(&self, master: bool) -> bool {
        let mut state = self.state.lock().expect("check queue lock");
        loop {
            while state.jobs.is_empty() {
                if state.todo == 0 {
                    if master {
                        let result = state.all_ok;
                        state.all_ok = true;
                        return result;
                    }
                    // Workers idle between batches.
                }
                if !master && state.quit {
                    return false;
                }
                state.idle_workers += 1;
                state = if master {
                    self.master_cv.wait(state).expect("check queue lock")
                } else {
                    self.worker_cv.wait(state).expect("check queue lock")
                };
                state.idle_workers -= 1;
            }

            let take = state
                .jobs
                .len()
                .div_ceil(state.idle_workers + 1)
                .clamp(1, MAX_JOBS_PER_WAKE);
            let split = state.jobs.len() - take;
            let batch: Vec<ScriptCheck> = state.jobs.drain(split..).collect();
            let mut ok = state.all_ok;
            drop(state);

            if ok {
                for job in &batch {
                    if job.execute().is_err() {
                        ok = false;
                        break;
                    }
                }
            }

            state = self.state.lock().expect("check queue lock");
            state.all_ok &= ok;
            state.todo -= batch.len();
            if state.todo == 0 {
                self.master_cv.notify_one();
            }
        }
    }

    fn add(&self, checks: Vec<ScriptCheck>) {
        if checks.is_empty() {
            return;
        }
        let mut state = self.state.lock().expect("check queue lock");
        debug_assert!(state.batch_open, "add outside an open batch");
        state.todo += checks.len();
        let added = checks.len();
        state.jobs.extend(checks);
        drop(state);
        if added == 1 {
            self.worker_cv.notify_one();
        } else {
            self.worker_cv.notify_all();
        }
    }
}

pub struct CheckQueue {
    inner: Arc<QueueInner>,
    workers: Vec<JoinHandle<()>>,
}

impl CheckQueue {
    /// Spawns `threads` workers; zero means every batch is executed entirely
    /// on the controller's thread when it waits.
    pub fn new(threads: usize) -> Self {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                jobs: Vec::new(),
                todo: 0,
                idle_workers: 0,
                all_ok: true,
                quit: false,
                batch_open: false,
            }),
            worker_cv: Condvar::new(),
            master_cv: Condvar::new(),
        });
        let workers = (0..threads)
            .map(|index| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("scriptcheck.{index}"))
                    .spawn(move || {
                        inner.run(false);
                    })
                    .expect("spawn script check worker")
            })
            .collect();
        Self { inner, workers }
    }

    /// Opens the single outstanding batch.
    pub fn control(&self) -> CheckQueueControl<'_> {
        {
            let mut state = self.inner.state.lock().expect("check queue lock");
            assert!(!state.batch_open, "script check batch already outstanding");
            assert_eq!(state.todo, 0);
            state.batch_open = true;
        }
        CheckQueueControl {
            queue: self,
            done: false,
        }
    }
}

impl Drop for CheckQueue {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().expect("check queue lock");
            state.quit = true;
        }
        self.inner.worker_cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Scope owning one batch. `wait` drains it and reports the verdict; drop
/// without an explicit wait still drains, discarding the verdict.
pub struct CheckQueueControl<'a> {
    queue: &'a CheckQueue,
    done: bool,
}

impl CheckQueueControl<'_> {
    pub fn add(&mut self, checks: Vec<ScriptCheck>) {
        debug_assert!(!self.done);
        self.queue.inner.add(checks);
    }

    /// Blocks until every queued job finished (participating in the work)
    /// and returns whether all of them verified.
    pub fn wait(&mut self) -> bool {
        if self.done {
            return true;
        }
        let result = self.queue.inner.run(true);
        let mut state = self.queue.inner.state.lock().expect("check queue lock");
        state.batch_open = false;
        self.done = true;
        result
    }
}

impl Drop for CheckQueueControl<'_> {
    fn drop(&mut self) {
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_primitives::outpoint::OutPoint;
    use emberd_primitives::transaction::{TxIn, TxOut, SEQUENCE_FINAL};
    use emberd_script::interpreter::SCRIPT_VERIFY_NONE;

    fn job(pass: bool, inputs: usize) -> Vec<ScriptCheck> {
        let tx = Arc::new(Transaction {
            version: 1,
            vin: (0..inputs)
                .map(|index| TxIn {
                    prevout: OutPoint::new([index as u8; 32], 0),
                    script_sig: Vec::new(),
                    sequence: SEQUENCE_FINAL,
                })
                .collect(),
            vout: vec![TxOut {
                value: 0,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        });
        (0..inputs)
            .map(|input_index| ScriptCheck {
                tx: Arc::clone(&tx),
                input_index,
                // OP_TRUE passes, OP_RETURN fails.
                script_pubkey: vec![if pass { 0x51 } else { 0x6a }],
                amount: 0,
                flags: SCRIPT_VERIFY_NONE,
            })
            .collect()
    }

    #[test]
    fn empty_batch_succeeds() {
        for threads in [0, 4] {
            let queue = CheckQueue::new(threads);
            let mut control = queue.control();
            assert!(control.wait());
        }
    }

    #[test]
    fn all_passing_jobs_succeed() {
        for threads in [0, 2, 8] {
            let queue = CheckQueue::new(threads);
            let mut control = queue.control();
            for _ in 0..16 {
                control.add(job(true, 4));
            }
            assert!(control.wait());
        }
    }

    #[test]
    fn one_failure_fails_the_batch() {
        for threads in [0, 2, 8] {
            let queue = CheckQueue::new(threads);
            let mut control = queue.control();
            for index in 0..64 {
                control.add(job(index != 31, 2));
            }
            assert!(!control.wait());
        }
    }

    #[test]
    fn batches_are_independent() {
        let queue = CheckQueue::new(3);
        {
            let mut control = queue.control();
            control.add(job(false, 3));
            assert!(!control.wait());
        }
        {
            let mut control = queue.control();
            control.add(job(true, 3));
            assert!(control.wait());
        }
    }

    #[test]
    fn drop_without_wait_drains() {
        let queue = CheckQueue::new(2);
        {
            let mut control = queue.control();
            control.add(job(true, 8));
            // Dropped without waiting; the next control call asserts the
            // queue returned to quiescence.
        }
        let mut control = queue.control();
        assert!(control.wait());
    }
}
