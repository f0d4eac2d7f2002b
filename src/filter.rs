//! Script Stream Filter

use std::{cell::Cell, rc::Rc};

use bytes::Bytes;

use crate::{
    error::ScriptError,
    headers::SharedHeaderMap,
    script::{handle::StreamCoroutine, runtime::WorkerRuntime},
    LogLevel, SharedFilterCallbacks, SharedScriptLogger,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    Continue,
    StopIteration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    Continue,
    StopIterationAndBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    Continue,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Request,
    Response,
}

#[derive(Default)]
struct DirectionSlot {
    coroutine: Option<StreamCoroutine>,
    headers_released: Rc<Cell<bool>>,
}

/// Binds the stream handle state machine to both pipeline directions and
/// turns every script failure into a degraded-but-safe continuation: the
/// error is logged, both handles are dropped and the stream itself keeps
/// flowing untouched.
///
/// Dropping the filter (stream reset, client disconnect) abandons the
/// coroutines without resuming them.
pub struct ScriptFilter {
    runtime: Rc<WorkerRuntime>,
    logger: SharedScriptLogger,
    decoder_callbacks: SharedFilterCallbacks,
    encoder_callbacks: SharedFilterCallbacks,
    request: DirectionSlot,
    response: DirectionSlot,
}

impl ScriptFilter {
    pub fn init(
        runtime: Rc<WorkerRuntime>,
        logger: SharedScriptLogger,
        decoder_callbacks: SharedFilterCallbacks,
        encoder_callbacks: SharedFilterCallbacks,
    ) -> Self {
        Self {
            runtime,
            logger,
            decoder_callbacks,
            encoder_callbacks,
            request: DirectionSlot::default(),
            response: DirectionSlot::default(),
        }
    }

    pub fn decode_headers(
        &mut self,
        headers: SharedHeaderMap,
        end_stream: bool,
    ) -> FilterHeadersStatus {
        self.do_headers(Direction::Request, headers, end_stream)
    }

    pub fn decode_data(&mut self, data: Bytes, end_stream: bool) -> FilterDataStatus {
        self.do_data(Direction::Request, data, end_stream)
    }

    pub fn decode_trailers(&mut self, trailers: SharedHeaderMap) -> FilterTrailersStatus {
        self.do_trailers(Direction::Request, trailers)
    }

    pub fn encode_headers(
        &mut self,
        headers: SharedHeaderMap,
        end_stream: bool,
    ) -> FilterHeadersStatus {
        self.do_headers(Direction::Response, headers, end_stream)
    }

    pub fn encode_data(&mut self, data: Bytes, end_stream: bool) -> FilterDataStatus {
        self.do_data(Direction::Response, data, end_stream)
    }

    pub fn encode_trailers(&mut self, trailers: SharedHeaderMap) -> FilterTrailersStatus {
        self.do_trailers(Direction::Response, trailers)
    }

    fn do_headers(
        &mut self,
        direction: Direction,
        headers: SharedHeaderMap,
        end_stream: bool,
    ) -> FilterHeadersStatus {
        let entry = match direction {
            Direction::Request => self.runtime.request_entry(),
            Direction::Response => self.runtime.response_entry(),
        };
        let entry = match entry {
            Some(entry) => entry.clone(),
            None => return FilterHeadersStatus::Continue,
        };

        let callbacks = match direction {
            Direction::Request => self.decoder_callbacks.clone(),
            Direction::Response => self.encoder_callbacks.clone(),
        };

        let spawned = StreamCoroutine::spawn(
            &self.runtime,
            &entry,
            headers,
            end_stream,
            callbacks,
            self.logger.clone(),
            self.slot(direction).headers_released.clone(),
        );
        let mut coroutine = match spawned {
            Ok(coroutine) => coroutine,
            Err(error) => {
                self.handle_script_error(error);
                return FilterHeadersStatus::Continue;
            }
        };

        let result = {
            let _live = coroutine.live_guard();
            coroutine.start()
        };
        match result {
            Ok(status) => {
                self.slot_mut(direction).coroutine = Some(coroutine);
                if status == FilterHeadersStatus::Continue {
                    self.slot(direction).headers_released.set(true);
                }
                status
            }
            Err(error) => {
                self.handle_script_error(error);
                FilterHeadersStatus::Continue
            }
        }
    }

    fn do_data(&mut self, direction: Direction, data: Bytes, end_stream: bool) -> FilterDataStatus {
        let mut coroutine = match self.slot_mut(direction).coroutine.take() {
            Some(coroutine) => coroutine,
            None => return FilterDataStatus::Continue,
        };

        let result = {
            let _live = coroutine.live_guard();
            coroutine.on_data(data, end_stream)
        };
        match result {
            Ok(status) => {
                self.slot_mut(direction).coroutine = Some(coroutine);
                if status == FilterDataStatus::Continue {
                    self.slot(direction).headers_released.set(true);
                }
                status
            }
            Err(error) => {
                self.handle_script_error(error);
                FilterDataStatus::Continue
            }
        }
    }

    fn do_trailers(&mut self, direction: Direction, trailers: SharedHeaderMap) -> FilterTrailersStatus {
        let mut coroutine = match self.slot_mut(direction).coroutine.take() {
            Some(coroutine) => coroutine,
            None => return FilterTrailersStatus::Continue,
        };

        let result = {
            let _live = coroutine.live_guard();
            coroutine.on_trailers(trailers)
        };
        match result {
            Ok(status) => {
                self.slot_mut(direction).coroutine = Some(coroutine);
                self.slot(direction).headers_released.set(true);
                status
            }
            Err(error) => {
                self.handle_script_error(error);
                FilterTrailersStatus::Continue
            }
        }
    }

    fn slot(&self, direction: Direction) -> &DirectionSlot {
        match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        }
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut DirectionSlot {
        match direction {
            Direction::Request => &mut self.request,
            Direction::Response => &mut self.response,
        }
    }

    /// Script errors never reach the proxy: log, drop both handles and let
    /// the stream continue without the script.
    fn handle_script_error(&mut self, error: ScriptError) {
        self.logger
            .script_log(LogLevel::Error, error.to_string().as_bytes());
        self.request.coroutine = None;
        self.response.coroutine = None;
    }
}
