//! Script Runtime

use std::{cell::Cell, rc::Rc};

use crate::error::ScriptError;

pub mod runtime;
pub use runtime::{ScriptConfig, WorkerRuntime};

pub mod handle;
pub mod wrappers;

/// Well-known global invoked on the request path. Absence disables the
/// request direction.
pub const REQUEST_ENTRY_POINT: &str = "envoy_on_request";

/// Well-known global invoked on the response path. Absence disables the
/// response direction.
pub const RESPONSE_ENTRY_POINT: &str = "envoy_on_response";

/// Shared liveness bit for every script-visible native object of one stream
/// handle. A script may retain a wrapper arbitrarily long; any method call
/// outside the owning live window fails instead of touching freed state.
#[derive(Debug, Clone, Default)]
pub(crate) struct LiveFlag(Rc<Cell<bool>>);

impl LiveFlag {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn mark_live(&self) {
        self.0.set(true);
    }

    pub(crate) fn mark_dead(&self) {
        self.0.set(false);
    }

    pub(crate) fn check(&self) -> mlua::Result<()> {
        if self.0.get() {
            Ok(())
        } else {
            Err(mlua::Error::external(ScriptError::DeadObject))
        }
    }
}

/// Brackets one pipeline event dispatch: live while the owning native frame
/// is on the stack, dead again as soon as it unwinds.
pub(crate) struct LiveGuard(LiveFlag);

impl LiveGuard {
    pub(crate) fn enter(flag: &LiveFlag) -> Self {
        flag.mark_live();
        Self(flag.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.mark_dead();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_guard() {
        let flag = LiveFlag::new();
        assert!(flag.check().is_err());

        {
            let _guard = LiveGuard::enter(&flag);
            assert!(flag.check().is_ok());
        }

        let err = flag.check().unwrap_err();
        assert!(err
            .to_string()
            .contains("object used outside of proper scope"));
    }
}
