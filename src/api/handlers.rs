//! API Handlers
//!
//! One handler per line protocol command. Handlers call the engine
//! synchronously and turn its result into a [`Response`].

use std::sync::Arc;

use tracing::debug;

use crate::cache::CacheEngine;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::models::{DeleteRequest, GetRequest, InitRequest, Request, Response, SetRequest};

/// Application state shared by every session.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The engine served by this process
    pub engine: Arc<CacheEngine>,
    /// Sync-on-commit setting applied to engines initialised over the wire
    pub sync_writes: bool,
}

impl AppState {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        Self {
            engine,
            sync_writes: true,
        }
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }
}

// == Dispatch ==
/// Parses one request line and runs it against the engine.
pub fn handle_line(state: &AppState, line: &str) -> Response {
    let result = Request::parse(line).and_then(|request| {
        let command = request.command();
        debug!("Handling {}", command);
        dispatch(state, request)
    });

    match result {
        Ok(response) => response,
        Err(err) => {
            debug!("Request failed: {}", err);
            Response::failure(&err)
        }
    }
}

/// Runs a decoded request.
pub fn dispatch(state: &AppState, request: Request) -> Result<Response> {
    match request {
        Request::Init(req) => init_handler(state, req),
        Request::Get(req) => get_handler(state, req),
        Request::Set(req) => set_handler(state, req),
        Request::Delete(req) => delete_handler(state, req),
        Request::Close => close_handler(state),
    }
}

/// Handler for INIT
pub fn init_handler(state: &AppState, req: InitRequest) -> Result<Response> {
    let config = CacheConfig::from_megabytes(req.base_dir, req.max_size, req.cap)
        .with_sync_writes(state.sync_writes);
    state.engine.init(config)?;
    Ok(Response::ok())
}

/// Handler for GET
pub fn get_handler(state: &AppState, req: GetRequest) -> Result<Response> {
    let payload = state
        .engine
        .get(&req.table, &req.tenant_id, &req.freshness, &req.bind)?;
    Ok(Response::with_data(&payload))
}

/// Handler for SET
pub fn set_handler(state: &AppState, req: SetRequest) -> Result<Response> {
    let content = req.decode_content()?;
    state
        .engine
        .set(&req.table, &req.tenant_id, &req.freshness, &req.bind, &content)?;
    Ok(Response::ok())
}

/// Handler for DELETE
pub fn delete_handler(state: &AppState, req: DeleteRequest) -> Result<Response> {
    state.engine.delete(&req.table)?;
    Ok(Response::ok())
}

/// Handler for CLOSE
pub fn close_handler(state: &AppState) -> Result<Response> {
    state.engine.close()?;
    Ok(Response::ok())
}
