//! Frame and call-stack interning.
//!
//! Profiling data repeats itself: the frames near the root of a call stack
//! are shared by thousands of samples. The interner replaces every frame
//! name and every (frame, caller) pair with a dense integer handle, so each
//! distinct value is stored exactly once and the call stacks form a DAG
//! rooted at [`CallStackIndex::ROOT`].
//!
//! The interner holds no domain knowledge; it is a dictionary keyed on the
//! natural equality of its inputs. In parallel mode both tables sit behind
//! one mutex: correctness over throughput, since text scanning dominates
//! interning by a wide margin.

#[cfg(feature = "multithreaded")]
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use indexmap::{IndexMap, IndexSet};

/// Dense handle for an interned frame name.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FrameIndex(u32);

/// Dense handle for an interned module name.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ModuleIndex(u32);

/// Dense handle for an interned call stack: one frame plus the stack of its
/// caller, forming a DAG whose leaves are [`CallStackIndex::ROOT`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CallStackIndex(u32);

impl CallStackIndex {
    /// The distinguished sentinel every caller chain terminates in.
    pub const ROOT: CallStackIndex = CallStackIndex(u32::MAX);

    /// Whether this is the root sentinel rather than a real stack.
    pub fn is_root(&self) -> bool {
        *self == CallStackIndex::ROOT
    }
}

impl From<FrameIndex> for usize {
    fn from(index: FrameIndex) -> usize {
        index.0 as usize
    }
}

impl From<ModuleIndex> for usize {
    fn from(index: ModuleIndex) -> usize {
        index.0 as usize
    }
}

impl From<CallStackIndex> for usize {
    fn from(index: CallStackIndex) -> usize {
        index.0 as usize
    }
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    frames: IndexMap<Box<str>, Option<ModuleIndex>, RandomState>,
    stacks: IndexSet<(FrameIndex, CallStackIndex), RandomState>,
    modules: IndexSet<Box<str>, RandomState>,
}

impl Tables {
    fn intern_frame(&mut self, name: &str, module: Option<&str>) -> FrameIndex {
        if let Some(index) = self.frames.get_index_of(name) {
            return FrameIndex(index as u32);
        }
        let module = module
            .filter(|m| !m.is_empty())
            .map(|m| self.intern_module(m));
        let (index, _) = self.frames.insert_full(Box::from(name), module);
        FrameIndex(index as u32)
    }

    fn intern_module(&mut self, name: &str) -> ModuleIndex {
        if let Some(index) = self.modules.get_index_of(name) {
            return ModuleIndex(index as u32);
        }
        let (index, _) = self.modules.insert_full(Box::from(name));
        ModuleIndex(index as u32)
    }

    fn intern_stack(&mut self, frame: FrameIndex, caller: CallStackIndex) -> CallStackIndex {
        let (index, _) = self.stacks.insert_full((frame, caller));
        CallStackIndex(index as u32)
    }
}

/// The mutable interning tables, in one of two flavors:
/// * `Serial` for single-threaded ingestion, and
/// * `Shared` for the worker pool, with both tables behind a single mutex.
#[derive(Debug)]
pub(crate) enum Interner {
    Serial(Tables),
    #[cfg(feature = "multithreaded")]
    Shared(Arc<Mutex<Tables>>),
}

impl Interner {
    #[cfg(feature = "multithreaded")]
    pub(crate) fn new(nthreads: usize) -> Self {
        assert_ne!(nthreads, 0);
        if nthreads == 1 {
            Interner::Serial(Tables::default())
        } else {
            Interner::Shared(Arc::new(Mutex::new(Tables::default())))
        }
    }

    #[cfg(not(feature = "multithreaded"))]
    pub(crate) fn new(nthreads: usize) -> Self {
        assert_ne!(nthreads, 0);
        Interner::Serial(Tables::default())
    }

    /// A handle for a worker thread. Only the shared flavor can be handed
    /// across threads.
    #[cfg(feature = "multithreaded")]
    pub(crate) fn handle(&self) -> Interner {
        match self {
            Interner::Shared(arc) => Interner::Shared(Arc::clone(arc)),
            Interner::Serial(_) => panic!("cannot share a serial interner across threads"),
        }
    }

    /// Interns a frame display name (and its module, when first seen),
    /// returning the same index for every structurally-equal call.
    pub(crate) fn intern_frame(&mut self, name: &str, module: Option<&str>) -> FrameIndex {
        match self {
            Interner::Serial(tables) => tables.intern_frame(name, module),
            #[cfg(feature = "multithreaded")]
            Interner::Shared(arc) => arc
                .lock()
                .expect("interner mutex poisoned")
                .intern_frame(name, module),
        }
    }

    /// Interns a (frame, caller) pair, returning the same index for every
    /// structurally-equal call.
    pub(crate) fn intern_stack(
        &mut self,
        frame: FrameIndex,
        caller: CallStackIndex,
    ) -> CallStackIndex {
        match self {
            Interner::Serial(tables) => tables.intern_stack(frame, caller),
            #[cfg(feature = "multithreaded")]
            Interner::Shared(arc) => arc
                .lock()
                .expect("interner mutex poisoned")
                .intern_stack(frame, caller),
        }
    }

    /// Freezes the tables. Must only be called once no other handle to the
    /// interner remains.
    pub(crate) fn done_interning(self) -> StackTable {
        let tables = match self {
            Interner::Serial(tables) => tables,
            #[cfg(feature = "multithreaded")]
            Interner::Shared(arc) => match Arc::try_unwrap(arc) {
                Ok(mutex) => mutex.into_inner().expect("interner mutex poisoned"),
                Err(_) => panic!(
                    "attempted to freeze the interner while worker threads \
                     still hold a handle to it"
                ),
            },
        };
        StackTable {
            frames: tables.frames.into_iter().collect(),
            stacks: tables.stacks.into_iter().collect(),
            modules: tables.modules.into_iter().collect(),
        }
    }
}

/// The frozen interning tables produced by one ingestion run.
///
/// All accessors are read-only index lookups; the indices come from the
/// samples of the same run. Indices from a different run are meaningless
/// here and will panic or return arbitrary entries.
#[derive(Debug)]
pub struct StackTable {
    frames: Vec<(Box<str>, Option<ModuleIndex>)>,
    stacks: Vec<(FrameIndex, CallStackIndex)>,
    modules: Vec<Box<str>>,
}

impl StackTable {
    /// The display name of an interned frame.
    pub fn frame_name(&self, frame: FrameIndex) -> &str {
        &self.frames[frame.0 as usize].0
    }

    /// The module of an interned frame, for frames that have one.
    pub fn frame_module(&self, frame: FrameIndex) -> Option<ModuleIndex> {
        self.frames[frame.0 as usize].1
    }

    /// The name of an interned module.
    pub fn module_name(&self, module: ModuleIndex) -> &str {
        &self.modules[module.0 as usize]
    }

    /// The top (leaf-most) frame of a call stack.
    pub fn frame_of(&self, stack: CallStackIndex) -> FrameIndex {
        self.stacks[stack.0 as usize].0
    }

    /// The caller of a call stack; the chain terminates in
    /// [`CallStackIndex::ROOT`].
    pub fn caller_of(&self, stack: CallStackIndex) -> CallStackIndex {
        self.stacks[stack.0 as usize].1
    }

    /// Number of distinct frames interned.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of distinct call stacks interned.
    pub fn stack_count(&self) -> usize {
        self.stacks.len()
    }

    /// Number of distinct modules interned.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Resolves a call stack to its frames in root-to-leaf order.
    pub fn frames_of(&self, mut stack: CallStackIndex) -> Vec<FrameIndex> {
        let mut frames = Vec::new();
        while !stack.is_root() {
            frames.push(self.frame_of(stack));
            stack = self.caller_of(stack);
        }
        frames.reverse();
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_interning_is_deterministic() {
        let mut interner = Interner::new(1);
        let a = interner.intern_frame("libc.so!read", Some("libc.so"));
        let b = interner.intern_frame("libc.so!write", Some("libc.so"));
        let c = interner.intern_frame("libc.so!read", Some("libc.so"));
        assert_eq!(a, c);
        assert_ne!(a, b);

        let table = interner.done_interning();
        assert_eq!(table.frame_name(a), "libc.so!read");
        assert_eq!(table.frame_name(b), "libc.so!write");
        assert_eq!(table.frame_count(), 2);
        // Both frames share a single interned module.
        assert_eq!(table.module_count(), 1);
        assert_eq!(
            table.module_name(table.frame_module(a).unwrap()),
            "libc.so"
        );
    }

    #[test]
    fn stack_interning_is_deterministic() {
        let mut interner = Interner::new(1);
        let main = interner.intern_frame("main", None);
        let work = interner.intern_frame("work", None);

        let s1 = interner.intern_stack(main, CallStackIndex::ROOT);
        let s2 = interner.intern_stack(work, s1);
        let s1_again = interner.intern_stack(main, CallStackIndex::ROOT);
        let s2_again = interner.intern_stack(work, s1_again);
        assert_eq!(s1, s1_again);
        assert_eq!(s2, s2_again);

        let table = interner.done_interning();
        assert_eq!(table.stack_count(), 2);
        assert_eq!(table.frames_of(s2), vec![main, work]);
        assert!(table.caller_of(s1).is_root());
    }

    #[test]
    fn shared_suffixes_are_stored_once() {
        let mut interner = Interner::new(1);
        let main = interner.intern_frame("main", None);
        let a = interner.intern_frame("a", None);
        let b = interner.intern_frame("b", None);

        let root = interner.intern_stack(main, CallStackIndex::ROOT);
        let leaf_a = interner.intern_stack(a, root);
        let leaf_b = interner.intern_stack(b, root);

        let table = interner.done_interning();
        // main/a, main/b share the main stack: 3 stacks, not 4.
        assert_eq!(table.stack_count(), 3);
        assert_eq!(table.caller_of(leaf_a), table.caller_of(leaf_b));
    }

    #[cfg(feature = "multithreaded")]
    #[test]
    fn shared_interner_deduplicates_across_threads() {
        let interner = Interner::new(4);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mut interner = interner.handle();
            handles.push(std::thread::spawn(move || {
                let mut indices = Vec::new();
                for name in ["alpha", "beta", "gamma"] {
                    let frame = interner.intern_frame(name, None);
                    let stack = interner.intern_stack(frame, CallStackIndex::ROOT);
                    indices.push((frame, stack));
                }
                indices
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for window in results.windows(2) {
            assert_eq!(window[0], window[1]);
        }

        let table = interner.done_interning();
        assert_eq!(table.frame_count(), 3);
        assert_eq!(table.stack_count(), 3);
    }
}
