//! Per-thread CPU vs. blocked-time classification.
//!
//! Thread-time mode wants every sample labelled with whether its thread was
//! running or waiting. That state is reconstructed from the event stream
//! itself: a `sched_switch` tells us one thread yielded a CPU and another
//! took it, and a plain sample on a CPU that was last seen running a
//! *different* thread implies that other thread has been switched back in
//! without us seeing the switch. The analyzer requires the events in global
//! order, which is why thread-time mode is restricted to serial ingestion.

use ahash::AHashMap;

use crate::ingest::event::{Event, EventKind, ThreadRunState};

#[derive(Debug)]
struct ThreadEntry {
    state: ThreadRunState,
    /// Time of the event that put the thread into its current state.
    anchor: f64,
}

/// State machine tracking, per thread, whether it is on-CPU or blocked.
#[derive(Debug, Default)]
pub struct BlockedTimeAnalyzer {
    threads: AHashMap<i32, ThreadEntry>,
    /// Which thread each CPU was last seen running.
    cpus: AHashMap<i32, i32>,
    total_blocked: f64,
    last_time: f64,
}

impl BlockedTimeAnalyzer {
    /// Creates an analyzer with no thread state.
    pub fn new() -> Self {
        BlockedTimeAnalyzer::default()
    }

    /// Feeds the next event, in stream order, through the state machine.
    ///
    /// When the event unblocks a thread, the blocked duration is added to
    /// the running total and written into the event's `period`.
    pub fn observe(&mut self, event: &mut Event) {
        let time = event.time;
        self.last_time = time;
        self.touch(event.tid, time);

        match &event.kind {
            EventKind::Scheduler(switch) => {
                let (prev_tid, next_tid) = (switch.prev_tid, switch.next_tid);
                self.touch(prev_tid, time);
                self.touch(next_tid, time);

                // The previous thread is yielding the CPU.
                let prev = self.threads.get_mut(&prev_tid).unwrap();
                if prev.state == ThreadRunState::CpuTime {
                    prev.state = ThreadRunState::BlockedTime;
                    prev.anchor = time;
                }

                // The next thread is taking it.
                let next = self.threads.get_mut(&next_tid).unwrap();
                if next.state == ThreadRunState::BlockedTime {
                    let blocked = time - next.anchor;
                    next.state = ThreadRunState::CpuTime;
                    next.anchor = time;
                    self.total_blocked += blocked;
                    event.period = blocked;
                }
            }
            EventKind::Cpu => {
                // A sample on a CPU that was last attributed to a different
                // thread means that other thread has been switched back in
                // without a visible sched_switch.
                if let Some(&last_tid) = self.cpus.get(&event.cpu) {
                    if last_tid != event.tid {
                        self.touch(last_tid, time);
                        let other = self.threads.get_mut(&last_tid).unwrap();
                        if other.state == ThreadRunState::BlockedTime {
                            let blocked = time - other.anchor;
                            other.state = ThreadRunState::CpuTime;
                            other.anchor = time;
                            self.total_blocked += blocked;
                            event.period = blocked;
                        }
                    }
                }
                self.cpus.insert(event.cpu, event.tid);
            }
        }
    }

    /// Flushes intervals still open at the end of the stream into the
    /// blocked-time total, so trailing blocked periods are not dropped.
    pub fn finish(&mut self) {
        for entry in self.threads.values_mut() {
            if entry.state == ThreadRunState::BlockedTime {
                self.total_blocked += self.last_time - entry.anchor;
                entry.anchor = self.last_time;
            }
        }
    }

    /// Whether the given thread is currently classified as blocked.
    pub fn is_thread_blocked(&self, tid: i32) -> bool {
        matches!(
            self.threads.get(&tid),
            Some(ThreadEntry {
                state: ThreadRunState::BlockedTime,
                ..
            })
        )
    }

    /// The classification for the given thread right now.
    pub fn thread_state(&self, tid: i32) -> ThreadRunState {
        if self.is_thread_blocked(tid) {
            ThreadRunState::BlockedTime
        } else {
            ThreadRunState::CpuTime
        }
    }

    /// Total milliseconds all threads spent blocked, including intervals
    /// flushed by [`finish`](Self::finish).
    pub fn total_blocked_time(&self) -> f64 {
        self.total_blocked
    }

    fn touch(&mut self, tid: i32, time: f64) {
        self.threads.entry(tid).or_insert(ThreadEntry {
            state: ThreadRunState::CpuTime,
            anchor: time,
        });
    }
}
