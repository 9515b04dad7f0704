//! Side records attached to a small minority of variables.

/// Callback invoked after a variable was materialized (or when it is freed
/// without having been materialized). The second argument is `true` when the
/// variable is being freed.
pub type VarCallback = Box<dyn FnMut(u32, bool) + Send>;

/// Structured payload of a loop-end node: the per-variable state registers
/// and the body-exit values written back on every iteration.
#[derive(Debug, Default, Clone)]
pub struct LoopInfo {
    pub state: Vec<u32>,
    pub body_exit: Vec<u32>,
}

/// Extension record for variables that need more than four dependencies or a
/// completion callback. Stored out of line; `Variable::extra` marks presence.
#[derive(Default)]
pub struct Extra {
    /// Auxiliary dependencies, traversed like regular ones.
    pub dep: Vec<u32>,
    pub callback: Option<VarCallback>,
    /// Internal callbacks run under the global lock; external ones release it.
    pub callback_internal: bool,
    pub loop_info: Option<LoopInfo>,
}

impl std::fmt::Debug for Extra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extra")
            .field("dep", &self.dep)
            .field("callback", &self.callback.is_some())
            .field("loop_info", &self.loop_info)
            .finish()
    }
}
