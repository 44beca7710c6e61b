//! Current-bridge tracking
//!
//! Native destructors are plain `extern "C"` function pointers with no
//! captured state. While a thread is inside a bridge operation the bridge is
//! recorded here, so a destructor invoked from that operation can find its
//! way back with `Bridge::with_current`.

use super::Bridge;
use std::cell::RefCell;
use std::marker::PhantomData;

thread_local! {
    static CURRENT: RefCell<Vec<*const Bridge>> = const { RefCell::new(Vec::new()) };
}

/// Pops the bridge pushed by `enter` when dropped
pub(crate) struct ScopeGuard {
    // Must be dropped on the thread that created it
    _not_send: PhantomData<*const ()>,
}

/// Record `bridge` as current on this thread until the guard drops
pub(crate) fn enter(bridge: &Bridge) -> ScopeGuard {
    CURRENT.with(|stack| stack.borrow_mut().push(bridge as *const Bridge));
    ScopeGuard {
        _not_send: PhantomData,
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run `f` against the innermost bridge this thread is inside
pub(crate) fn with_current<R>(f: impl FnOnce(&Bridge) -> R) -> Option<R> {
    let top = CURRENT.with(|stack| stack.borrow().last().copied())?;
    // SAFETY: every pointer on the stack was pushed by `enter` from a frame
    // that borrows the bridge and pops it (via `ScopeGuard`) before that
    // borrow ends, so the bridge outlives this call.
    Some(f(unsafe { &*top }))
}

/// Depth of nested bridge scopes on this thread
pub(crate) fn depth() -> usize {
    CURRENT.with(|stack| stack.borrow().len())
}
