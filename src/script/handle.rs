//! Stream Handle State Machine
//!
//! Bridges the proxy's push pipeline (headers, data frames, trailers) with
//! the script's pull interface. The script runs on a coroutine; a handle
//! method that needs data not yet delivered parks the coroutine in a wait
//! state and the next pipeline event resumes it.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use bytes::Bytes;
use mlua::{
    AnyUserData, Function, Lua, MultiValue, Table, Thread, ThreadStatus, UserData,
    UserDataMethods, Value, Variadic,
};
use tracing::debug;

use crate::{
    error::ScriptError,
    filter::{FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus},
    headers::SharedHeaderMap,
    LogLevel, ScriptResult, SharedFilterCallbacks, SharedScriptLogger,
};

use super::{
    runtime::WorkerRuntime,
    wrappers::{BufferWrapper, HeaderMapWrapper},
    LiveFlag, LiveGuard,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoroutineState {
    Running,
    WaitForBodyChunk,
    WaitForBody,
    WaitForTrailers,
}

struct StreamState {
    state: CoroutineState,
    end_stream: bool,
    headers: SharedHeaderMap,
    trailers: Option<SharedHeaderMap>,
    callbacks: SharedFilterCallbacks,
    logger: SharedScriptLogger,
    live: LiveFlag,
    headers_released: Rc<Cell<bool>>,
    // Some data already went downstream unbuffered, so a later body() can
    // never see the whole body.
    body_passed_through: bool,
    headers_wrapper: Option<AnyUserData>,
    body_wrapper: Option<AnyUserData>,
    trailers_wrapper: Option<AnyUserData>,
}

/// Native side of the handle passed to the script. The blocking methods
/// report `(ready, value)`; the Lua glue yields when ready is false and
/// hands back whatever the next resume carries.
pub(crate) struct StreamHandle {
    state: Rc<RefCell<StreamState>>,
}

impl UserData for StreamHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("headers", |lua, this, ()| {
            let mut state = this.state.borrow_mut();
            state.live.check()?;

            let wrapper = match &state.headers_wrapper {
                Some(wrapper) => wrapper.clone(),
                None => {
                    let wrapper = lua.create_userdata(HeaderMapWrapper::with_release_flag(
                        state.headers.clone(),
                        state.live.clone(),
                        state.headers_released.clone(),
                    ))?;
                    state.headers_wrapper = Some(wrapper.clone());
                    wrapper
                }
            };
            Ok(wrapper)
        });

        methods.add_method("body", |lua, this, ()| {
            let mut state = this.state.borrow_mut();
            state.live.check()?;
            debug_assert_eq!(state.state, CoroutineState::Running);

            if state.body_passed_through {
                return Err(mlua::Error::external(ScriptError::BodyNotBuffered));
            }

            if !state.end_stream {
                debug!("yielding for full body");
                state.state = CoroutineState::WaitForBody;
                return Ok((false, Value::Nil));
            }

            let buffered = { state.callbacks.borrow().buffered_body() };
            match buffered {
                Some(data) => {
                    let wrapper = match &state.body_wrapper {
                        Some(wrapper) => wrapper.clone(),
                        None => {
                            let wrapper = lua
                                .create_userdata(BufferWrapper::new(data, state.live.clone()))?;
                            state.body_wrapper = Some(wrapper.clone());
                            wrapper
                        }
                    };
                    Ok((true, Value::UserData(wrapper)))
                }
                None => {
                    debug!("end stream, no body");
                    Ok((true, Value::Nil))
                }
            }
        });

        methods.add_method("bodyChunk", |_, this, ()| {
            let mut state = this.state.borrow_mut();
            state.live.check()?;
            debug_assert_eq!(state.state, CoroutineState::Running);

            if state.end_stream {
                debug!("body complete, no more body chunks");
                Ok((true, Value::Nil))
            } else {
                debug!("yielding for next body chunk");
                state.state = CoroutineState::WaitForBodyChunk;
                Ok((false, Value::Nil))
            }
        });

        methods.add_method("trailers", |lua, this, ()| {
            let mut state = this.state.borrow_mut();
            state.live.check()?;
            debug_assert_eq!(state.state, CoroutineState::Running);

            if let Some(trailers) = state.trailers.clone() {
                let wrapper = match &state.trailers_wrapper {
                    Some(wrapper) => wrapper.clone(),
                    None => {
                        let wrapper = lua.create_userdata(HeaderMapWrapper::new(
                            trailers,
                            state.live.clone(),
                        ))?;
                        state.trailers_wrapper = Some(wrapper.clone());
                        wrapper
                    }
                };
                Ok((true, Value::UserData(wrapper)))
            } else if state.end_stream {
                debug!("end stream, no trailers");
                Ok((true, Value::Nil))
            } else {
                debug!("yielding for trailers");
                state.state = CoroutineState::WaitForTrailers;
                Ok((false, Value::Nil))
            }
        });

        methods.add_method("log", |_, this, (level, message): (i64, mlua::String)| {
            let state = this.state.borrow();
            state.live.check()?;
            let level = LogLevel::from_int(level)
                .ok_or_else(|| mlua::Error::external(ScriptError::BadLogLevel(level)))?;
            state.logger.script_log(level, &message.as_bytes());
            Ok(())
        });

        methods.add_method("httpCall", |_, this, _args: Variadic<Value>| -> mlua::Result<()> {
            this.state.borrow().live.check()?;
            Err(mlua::Error::external(ScriptError::NotSupported("httpCall")))
        });
    }
}

/// Drives one script coroutine for one (stream, direction) pair.
pub(crate) struct StreamCoroutine {
    lua: Lua,
    thread: Thread,
    state: Rc<RefCell<StreamState>>,
    pending_handle: Option<Table>,
}

impl StreamCoroutine {
    pub(crate) fn spawn(
        runtime: &WorkerRuntime,
        entry: &Function,
        headers: SharedHeaderMap,
        end_stream: bool,
        callbacks: SharedFilterCallbacks,
        logger: SharedScriptLogger,
        headers_released: Rc<Cell<bool>>,
    ) -> ScriptResult<Self> {
        let state = Rc::new(RefCell::new(StreamState {
            state: CoroutineState::Running,
            end_stream,
            headers,
            trailers: None,
            callbacks,
            logger,
            live: LiveFlag::new(),
            headers_released,
            body_passed_through: false,
            headers_wrapper: None,
            body_wrapper: None,
            trailers_wrapper: None,
        }));

        let thread = runtime.spawn_coroutine(entry)?;
        let native = runtime
            .lua()
            .create_userdata(StreamHandle {
                state: state.clone(),
            })?;
        let handle = runtime.wrap_handle().call::<Table>(native)?;

        Ok(Self {
            lua: runtime.lua().clone(),
            thread,
            state,
            pending_handle: Some(handle),
        })
    }

    pub(crate) fn live_guard(&self) -> LiveGuard {
        LiveGuard::enter(&self.state.borrow().live)
    }

    /// First invocation: resumes the coroutine with the handle as the entry
    /// point's single argument.
    pub(crate) fn start(&mut self) -> ScriptResult<FilterHeadersStatus> {
        debug_assert!(self.pending_handle.is_some());
        let handle = match self.pending_handle.take() {
            Some(handle) => handle,
            None => return Ok(FilterHeadersStatus::Continue),
        };

        self.resume(Some(Value::Table(handle)))?;
        Ok(match self.state.borrow().state {
            CoroutineState::WaitForBody => FilterHeadersStatus::StopIteration,
            _ => FilterHeadersStatus::Continue,
        })
    }

    pub(crate) fn on_data(
        &mut self,
        data: Bytes,
        end_stream: bool,
    ) -> ScriptResult<FilterDataStatus> {
        let state = {
            let mut state = self.state.borrow_mut();
            debug_assert!(!state.end_stream);
            state.end_stream = end_stream;
            state.state
        };

        match state {
            CoroutineState::WaitForBodyChunk => {
                debug!("resuming with next body chunk");
                // The chunk is only valid for this one iteration, so it gets
                // its own liveness window closed right after the resume.
                let chunk_live = LiveFlag::new();
                chunk_live.mark_live();
                let wrapper = self
                    .lua
                    .create_userdata(BufferWrapper::new(data, chunk_live.clone()))?;
                self.state.borrow_mut().body_passed_through = true;
                self.set_running();
                let result = self.resume(Some(Value::UserData(wrapper)));
                chunk_live.mark_dead();
                result?;
            }
            CoroutineState::WaitForBody if end_stream => {
                debug!("resuming body due to end stream");
                {
                    let state = self.state.borrow();
                    state.callbacks.borrow_mut().add_buffered_data(data);
                }
                let body = self.body_value()?;
                self.set_running();
                self.resume(body)?;
            }
            CoroutineState::WaitForBody => {
                debug!("buffering body");
                return Ok(FilterDataStatus::StopIterationAndBuffer);
            }
            CoroutineState::WaitForTrailers if end_stream => {
                debug!("resuming with nil trailers due to end stream");
                self.set_running();
                self.resume(None)?;
            }
            _ => {
                // The script is not waiting on this frame; it flows through
                // unbuffered.
                self.state.borrow_mut().body_passed_through = true;
            }
        }

        Ok(FilterDataStatus::Continue)
    }

    pub(crate) fn on_trailers(
        &mut self,
        trailers: SharedHeaderMap,
    ) -> ScriptResult<FilterTrailersStatus> {
        let state = {
            let mut state = self.state.borrow_mut();
            debug_assert!(!state.end_stream);
            state.end_stream = true;
            state.trailers = Some(trailers);
            state.state
        };

        match state {
            CoroutineState::WaitForBodyChunk => {
                debug!("resuming with nil body chunk due to trailers");
                self.set_running();
                self.resume(None)?;
            }
            CoroutineState::WaitForBody => {
                debug!("resuming body due to trailers");
                let body = self.body_value()?;
                self.set_running();
                self.resume(body)?;
            }
            _ => {}
        }

        // A script that consumed the body above and immediately asked for
        // trailers is resumed once more within the same event so it does
        // not stall; same for a script that was already waiting on them.
        if self.state.borrow().state == CoroutineState::WaitForTrailers {
            let trailers = self.trailers_value()?;
            self.set_running();
            self.resume(Some(trailers))?;
        }

        Ok(FilterTrailersStatus::Continue)
    }

    fn set_running(&self) {
        self.state.borrow_mut().state = CoroutineState::Running;
    }

    /// Buffered-body resume argument, mirroring what a body() call would
    /// produce: the cached buffer wrapper, or nothing when there is no body.
    fn body_value(&self) -> ScriptResult<Option<Value>> {
        let mut state = self.state.borrow_mut();
        let buffered = { state.callbacks.borrow().buffered_body() };
        match buffered {
            Some(data) => {
                let wrapper = match &state.body_wrapper {
                    Some(wrapper) => wrapper.clone(),
                    None => {
                        let wrapper = self
                            .lua
                            .create_userdata(BufferWrapper::new(data, state.live.clone()))?;
                        state.body_wrapper = Some(wrapper.clone());
                        wrapper
                    }
                };
                Ok(Some(Value::UserData(wrapper)))
            }
            None => Ok(None),
        }
    }

    fn trailers_value(&self) -> ScriptResult<Value> {
        let mut state = self.state.borrow_mut();
        let trailers = match state.trailers.clone() {
            Some(trailers) => trailers,
            None => return Ok(Value::Nil),
        };

        let wrapper = match &state.trailers_wrapper {
            Some(wrapper) => wrapper.clone(),
            None => {
                let wrapper = self
                    .lua
                    .create_userdata(HeaderMapWrapper::new(trailers, state.live.clone()))?;
                state.trailers_wrapper = Some(wrapper.clone());
                wrapper
            }
        };
        Ok(Value::UserData(wrapper))
    }

    fn resume(&mut self, arg: Option<Value>) -> ScriptResult<()> {
        let result: mlua::Result<MultiValue> = match arg {
            Some(value) => self.thread.resume(value),
            None => self.thread.resume(()),
        };
        result?;

        match self.thread.status() {
            ThreadStatus::Resumable => {
                // The coroutine yielded. Only the handle methods may request
                // a yield; anything else is a script bug.
                if self.state.borrow().state == CoroutineState::Running {
                    Err(ScriptError::UnexpectedYield)
                } else {
                    Ok(())
                }
            }
            _ => {
                self.set_running();
                Ok(())
            }
        }
    }
}
