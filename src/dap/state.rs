//! Session state reconstructed from the flat MI interface: threads, cached
//! stack frames, breakpoints and variable-scope references.
//!
//! The state has two writers - the request loop and the backend reader
//! callback - serialized through the mutex the session wraps it in. Nothing
//! here touches the wire.

use std::collections::{BTreeMap, HashMap};

/// Reported when the backend never announced any thread: some backends omit
/// thread notifications for single-threaded programs.
pub const SYNTHETIC_MAIN_THREAD: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
}

/// One stack frame, rebuilt on every stackTrace request and cached per
/// thread for scope/variable lookups within the same stop.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub index: u32,
    pub function: String,
    pub source: Option<String>,
    pub line: i64,
}

#[derive(Debug, Clone)]
pub struct BreakpointRec {
    pub line: i64,
    pub backend_id: Option<u64>,
    pub verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Locals,
    Globals,
}

/// An opaque reference handed to the client by a scopes response and
/// consumed by a later variables request. Not persisted across stops.
#[derive(Debug, Clone)]
pub struct ScopeRef {
    pub kind: ScopeKind,
    pub thread_id: i64,
    pub frame_index: u32,
}

pub struct SessionState {
    threads: BTreeMap<i64, ThreadInfo>,
    frames: HashMap<i64, Vec<FrameInfo>>,
    breakpoints: HashMap<String, Vec<BreakpointRec>>,
    scope_refs: HashMap<i64, ScopeRef>,
    next_scope_ref: i64,
    current_thread: i64,
    current_frame: u32,
}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            threads: BTreeMap::new(),
            frames: HashMap::new(),
            breakpoints: HashMap::new(),
            scope_refs: HashMap::new(),
            next_scope_ref: 1000,
            current_thread: SYNTHETIC_MAIN_THREAD,
            current_frame: 0,
        }
    }
}

impl SessionState {
    pub fn new() -> SessionState {
        SessionState::default()
    }

    /// The thread table, defaulting to a single synthetic main thread.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        if self.threads.is_empty() {
            return vec![ThreadInfo {
                id: SYNTHETIC_MAIN_THREAD,
                name: "Main Thread".to_string(),
            }];
        }
        self.threads.values().cloned().collect()
    }

    /// Record a backend-announced thread, synthesizing a local id when the
    /// backend omits one.
    pub fn thread_created(&mut self, id: Option<i64>) -> ThreadInfo {
        let id = id.unwrap_or_else(|| {
            self.threads.keys().next_back().copied().unwrap_or(0) + 1
        });
        let info = ThreadInfo {
            id,
            name: format!("Thread #{id}"),
        };
        self.threads.insert(id, info.clone());
        info
    }

    /// Remove a thread, falling back to the current one when the backend
    /// omits the id. Returns the id actually removed.
    pub fn thread_exited(&mut self, id: Option<i64>) -> i64 {
        let id = id.unwrap_or(self.current_thread);
        self.threads.remove(&id);
        self.frames.remove(&id);
        id
    }

    pub fn current_thread(&self) -> i64 {
        self.current_thread
    }

    /// A stop invalidates everything bound to the previous stop: cached
    /// frames and outstanding scope references.
    pub fn on_stop(&mut self, thread_id: i64) {
        self.current_thread = thread_id;
        self.current_frame = 0;
        self.frames.clear();
        self.scope_refs.clear();
    }

    pub fn select_frame(&mut self, thread_id: i64, frame_index: u32) {
        self.current_thread = thread_id;
        self.current_frame = frame_index;
    }

    pub fn set_frames(&mut self, thread_id: i64, frames: Vec<FrameInfo>) {
        self.frames.insert(thread_id, frames);
    }

    pub fn frames(&self, thread_id: i64) -> Option<&[FrameInfo]> {
        self.frames.get(&thread_id).map(|f| f.as_slice())
    }

    pub fn alloc_scope(&mut self, kind: ScopeKind, thread_id: i64, frame_index: u32) -> i64 {
        self.next_scope_ref += 1;
        let id = self.next_scope_ref;
        self.scope_refs.insert(
            id,
            ScopeRef {
                kind,
                thread_id,
                frame_index,
            },
        );
        id
    }

    pub fn scope(&self, id: i64) -> Option<ScopeRef> {
        self.scope_refs.get(&id).cloned()
    }

    /// Backend ids recorded for a source, removed from the table. The caller
    /// deletes them on the backend before inserting the new set - replace,
    /// not diff, otherwise the two sides can desynchronize.
    pub fn take_breakpoint_ids(&mut self, source: &str) -> Vec<u64> {
        self.breakpoints
            .remove(source)
            .map(|recs| recs.into_iter().filter_map(|r| r.backend_id).collect())
            .unwrap_or_default()
    }

    pub fn record_breakpoints(&mut self, source: String, recs: Vec<BreakpointRec>) {
        self.breakpoints.insert(source, recs);
    }

    pub fn breakpoints(&self, source: &str) -> Option<&[BreakpointRec]> {
        self.breakpoints.get(source).map(|b| b.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_thread_when_none_reported() {
        let state = SessionState::new();
        let threads = state.threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, SYNTHETIC_MAIN_THREAD);
        assert_eq!(threads[0].name, "Main Thread");
    }

    #[test]
    fn thread_lifecycle() {
        let mut state = SessionState::new();
        let t1 = state.thread_created(Some(1));
        let t2 = state.thread_created(None); // synthesized id
        assert_eq!(t1.id, 1);
        assert_eq!(t2.id, 2);
        assert_eq!(state.threads().len(), 2);

        assert_eq!(state.thread_exited(Some(1)), 1);
        assert_eq!(state.threads().len(), 1);
        assert_eq!(state.threads()[0].id, 2);
    }

    #[test]
    fn thread_exited_without_id_uses_current() {
        let mut state = SessionState::new();
        state.thread_created(Some(7));
        state.on_stop(7);
        assert_eq!(state.thread_exited(None), 7);
        // back to the synthetic default
        assert_eq!(state.threads()[0].id, SYNTHETIC_MAIN_THREAD);
    }

    #[test]
    fn stop_clears_scopes_and_frames() {
        let mut state = SessionState::new();
        state.set_frames(
            1,
            vec![FrameInfo {
                index: 0,
                function: "main".to_string(),
                source: None,
                line: 1,
            }],
        );
        let scope = state.alloc_scope(ScopeKind::Locals, 1, 0);
        assert!(state.scope(scope).is_some());
        assert!(state.frames(1).is_some());

        state.on_stop(2);
        assert!(state.scope(scope).is_none());
        assert!(state.frames(1).is_none());
        assert_eq!(state.current_thread(), 2);
    }

    #[test]
    fn scope_refs_are_unique_and_resolvable() {
        let mut state = SessionState::new();
        let locals = state.alloc_scope(ScopeKind::Locals, 2, 3);
        let globals = state.alloc_scope(ScopeKind::Globals, 2, 3);
        assert_ne!(locals, globals);

        let r = state.scope(locals).unwrap();
        assert_eq!(r.kind, ScopeKind::Locals);
        assert_eq!(r.thread_id, 2);
        assert_eq!(r.frame_index, 3);
        assert_eq!(state.scope(globals).unwrap().kind, ScopeKind::Globals);
    }

    #[test]
    fn breakpoint_replace_bookkeeping() {
        let mut state = SessionState::new();
        state.record_breakpoints(
            "/tmp/a.cpp".to_string(),
            vec![
                BreakpointRec {
                    line: 10,
                    backend_id: Some(1),
                    verified: true,
                },
                BreakpointRec {
                    line: 20,
                    backend_id: Some(2),
                    verified: true,
                },
                BreakpointRec {
                    line: 30,
                    backend_id: None,
                    verified: false,
                },
            ],
        );

        // Replace: previous backend ids are surrendered exactly once.
        let ids = state.take_breakpoint_ids("/tmp/a.cpp");
        assert_eq!(ids, vec![1, 2]);
        assert!(state.take_breakpoint_ids("/tmp/a.cpp").is_empty());

        state.record_breakpoints(
            "/tmp/a.cpp".to_string(),
            vec![BreakpointRec {
                line: 20,
                backend_id: Some(3),
                verified: true,
            }],
        );
        let recs = state.breakpoints("/tmp/a.cpp").unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].line, 20);
    }
}
