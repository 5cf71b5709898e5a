use std::borrow::Cow;

/// What kind of record an [`Event`] was parsed from.
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    /// A plain CPU sample.
    Cpu,
    /// A `sched_switch` scheduler event, with the switch details.
    Scheduler(ScheduleSwitch),
}

/// The fields of a `sched_switch` record: which thread yielded the CPU and
/// which thread it was handed to.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleSwitch {
    /// Command name of the thread leaving the CPU.
    pub prev_comm: String,
    /// Thread id of the thread leaving the CPU.
    pub prev_tid: i32,
    /// Priority of the thread leaving the CPU.
    pub prev_prio: i32,
    /// Run state the previous thread was left in (`R`, `S`, `D`, ...).
    pub prev_state: char,
    /// Command name of the thread taking the CPU.
    pub next_comm: String,
    /// Thread id of the thread taking the CPU.
    pub next_tid: i32,
    /// Priority of the thread taking the CPU.
    pub next_prio: i32,
}

/// One parsed trace record.
///
/// Events are transient: the sample builder consumes each one immediately
/// after the parser produces it.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Command (process) name, which may itself contain spaces.
    pub comm: String,
    /// Thread id the record was taken on.
    pub tid: i32,
    /// Process id the record was taken on.
    pub pid: i32,
    /// Absolute record time in fractional milliseconds. Monotonically
    /// increasing within one source.
    pub time: f64,
    /// The optional integer time property some record kinds carry between
    /// the timestamp and the event name.
    pub time_property: Option<u64>,
    /// CPU number the record was taken on.
    pub cpu: i32,
    /// Event name (e.g. `cycles`, `cpu-clock`, `sched`).
    pub name: String,
    /// Raw event-detail text following the event name.
    pub detail: String,
    /// CPU sample or scheduler switch.
    pub kind: EventKind,
    /// Stack frames in the order they appear in the dump (leaf first), with
    /// a synthetic thread frame and process frame appended last.
    pub frames: Vec<Frame>,
    /// Time since the previous relevant event on the same logical entity.
    ///
    /// The parser leaves this at 1.0; the blocked-time analyzer overwrites
    /// it when thread-time classification is on.
    pub period: f64,
}

/// Label for the two per-thread run states tracked by the blocked-time
/// analyzer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadRunState {
    /// The thread was running on a CPU.
    CpuTime,
    /// The thread was off-CPU, waiting to run.
    BlockedTime,
}

impl ThreadRunState {
    /// The display label used for the synthetic classification frame.
    pub fn label(&self) -> &'static str {
        match self {
            ThreadRunState::CpuTime => "CPU_TIME",
            ThreadRunState::BlockedTime => "BLOCKED_TIME",
        }
    }
}

/// One entry in an event's stack.
///
/// A closed set of variants: real stack frames from the dump plus the
/// synthetic frames the pipeline appends (process, thread, and the
/// thread-time classification frame).
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// A stack line from the dump.
    Stack {
        /// The frame's instruction address, as the hex text from the dump.
        address: String,
        /// Module the address resolved into.
        module: String,
        /// Symbol name, or the raw address text when resolution failed.
        symbol: String,
    },
    /// Synthetic process frame appended at the root of every stack.
    Process {
        /// The process (command) name.
        name: String,
    },
    /// Synthetic thread frame appended beneath the process frame.
    Thread {
        /// The thread id.
        tid: i32,
        /// Display prefix, normally `"Thread"`.
        name: String,
    },
    /// Synthetic thread-time classification frame.
    BlockedCpu {
        /// The thread the classification applies to.
        tid: i32,
        /// Whether the thread was on-CPU or blocked.
        state: ThreadRunState,
    },
}

impl Frame {
    /// The name this frame is interned (and displayed) under.
    pub fn display_name(&self) -> Cow<'_, str> {
        match self {
            Frame::Stack { module, symbol, .. } => Cow::Owned(format!("{}!{}", module, symbol)),
            Frame::Process { name } => Cow::Borrowed(name.as_str()),
            Frame::Thread { tid, name } => Cow::Owned(format!("{} ({})", name, tid)),
            Frame::BlockedCpu { state, .. } => Cow::Borrowed(state.label()),
        }
    }

    /// The module this frame belongs to, for frames that have one.
    pub fn module(&self) -> Option<&str> {
        match self {
            Frame::Stack { module, .. } if !module.is_empty() => Some(module),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_names() {
        let stack = Frame::Stack {
            address: "ffffffff8103ce3b".to_owned(),
            module: "kernel.kallsyms".to_owned(),
            symbol: "native_safe_halt".to_owned(),
        };
        assert_eq!(stack.display_name(), "kernel.kallsyms!native_safe_halt");

        let process = Frame::Process {
            name: "java".to_owned(),
        };
        assert_eq!(process.display_name(), "java");

        let thread = Frame::Thread {
            tid: 25607,
            name: "Thread".to_owned(),
        };
        assert_eq!(thread.display_name(), "Thread (25607)");

        let blocked = Frame::BlockedCpu {
            tid: 25607,
            state: ThreadRunState::BlockedTime,
        };
        assert_eq!(blocked.display_name(), "BLOCKED_TIME");
        let running = Frame::BlockedCpu {
            tid: 25607,
            state: ThreadRunState::CpuTime,
        };
        assert_eq!(running.display_name(), "CPU_TIME");
    }

    #[test]
    fn module_is_reported_only_for_stack_frames() {
        let stack = Frame::Stack {
            address: "0".to_owned(),
            module: "libc.so".to_owned(),
            symbol: "read".to_owned(),
        };
        assert_eq!(stack.module(), Some("libc.so"));
        assert_eq!(
            Frame::Process {
                name: "java".to_owned()
            }
            .module(),
            None
        );
    }
}
