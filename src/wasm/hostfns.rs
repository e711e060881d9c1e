//! The host-function surface registered into every module's `env` import
//! namespace.
//!
//! Every host function takes integer arguments only (pointers and sizes into
//! guest linear memory, plus the caller's identifier), resolves its instance
//! through the identifier registry, and returns `-1` on any failure. Calls
//! that produce a reply stage it as the instance's ffi result and return the
//! reply's length; the guest collects the bytes with `get_ffi_result`.
//!
//! Synchronous capabilities register via `func_wrap`; capabilities that do
//! I/O register via the async variants.

use std::sync::Arc;

use wasmtime::{Caller, Linker, Memory};

use crate::caps::{HttpMethod, LogLevel};
use crate::error::{JobError, RunErr};
use crate::job::Ctx;
use crate::wasm::instance::{InstanceShared, InstanceState};
use crate::wasm::{environment, ident};

/// Look up the instance serving `ident`. When `needs_ffi_result` is set the
/// call intends to stage a reply, so a still-pending reply is a reentrancy
/// error. An identifier that was never issued is treated as hostile.
fn resolve(ident: i32, needs_ffi_result: bool) -> Result<(Ctx, Arc<InstanceShared>), JobError> {
    let entry = ident::resolve(ident).ok_or(JobError::InvalidIdentifier(ident))?;
    let env = environment::lookup(entry.env).ok_or(JobError::InvalidIdentifier(ident))?;
    let shared = env.shared_at(entry.index)?;
    if needs_ffi_result && shared.has_ffi_result() {
        return Err(JobError::ReentrantCall);
    }
    let ctx = shared
        .ctx()
        .ok_or_else(|| JobError::fatal("no execution context bound to instance"))?;
    Ok((ctx, shared))
}

fn log_host_err(host_fn: &str, err: &JobError) {
    match err {
        JobError::InvalidIdentifier(ident) => tracing::warn!(
            host_fn,
            ident,
            "invalid identifier used in host call, potential malicious activity"
        ),
        other => tracing::error!(host_fn, error = %other, "host call failed"),
    }
}

fn guest_memory(caller: &mut Caller<'_, InstanceState>) -> Result<Memory, JobError> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| JobError::fatal("module does not export its linear memory"))
}

/// Bounds-checked copy out of guest memory.
fn read_guest(
    caller: &mut Caller<'_, InstanceState>,
    ptr: i32,
    size: i32,
) -> Result<Vec<u8>, JobError> {
    if ptr < 0 || size < 0 {
        return Err(JobError::fatal("negative guest pointer or size"));
    }
    let memory = guest_memory(caller)?;
    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start
        .checked_add(size as usize)
        .ok_or_else(|| JobError::fatal("guest read range overflows"))?;
    if end > data.len() {
        return Err(JobError::fatal("guest read beyond memory bounds"));
    }
    Ok(data[start..end].to_vec())
}

fn read_guest_string(
    caller: &mut Caller<'_, InstanceState>,
    ptr: i32,
    size: i32,
) -> Result<String, JobError> {
    let bytes = read_guest(caller, ptr, size)?;
    String::from_utf8(bytes).map_err(|_| JobError::fatal("guest string is not valid utf-8"))
}

/// Bounds-checked copy into guest memory at a guest-chosen destination.
fn write_guest(
    caller: &mut Caller<'_, InstanceState>,
    ptr: i32,
    bytes: &[u8],
) -> Result<(), JobError> {
    if ptr < 0 {
        return Err(JobError::fatal("negative guest destination pointer"));
    }
    let memory = guest_memory(caller)?;
    let start = ptr as usize;
    let end = start
        .checked_add(bytes.len())
        .ok_or_else(|| JobError::fatal("guest write range overflows"))?;
    if end > memory.data_size(&caller) {
        return Err(JobError::fatal("guest write beyond memory bounds"));
    }
    memory
        .write(caller, start, bytes)
        .map_err(|err| JobError::fatal(format!("guest memory write failed: {err}")))
}

/// Mount the full host-function set into the module's imports.
pub(crate) fn add_host_fns(linker: &mut Linker<InstanceState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "return_result",
        |mut caller: Caller<'_, InstanceState>, ptr: i32, size: i32, ident: i32| {
            let outcome = (|| {
                let (_ctx, shared) = resolve(ident, false)?;
                let bytes = read_guest(&mut caller, ptr, size)?;
                shared.publish_result(bytes)
            })();
            if let Err(err) = outcome {
                log_host_err("return_result", &err);
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "return_error",
        |mut caller: Caller<'_, InstanceState>, code: i32, msg_ptr: i32, msg_size: i32, ident: i32| {
            let outcome = (|| {
                let (_ctx, shared) = resolve(ident, false)?;
                let message = String::from_utf8_lossy(&read_guest(&mut caller, msg_ptr, msg_size)?)
                    .into_owned();
                shared.publish_error(RunErr::new(code, message))
            })();
            if let Err(err) = outcome {
                log_host_err("return_error", &err);
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_ffi_result",
        |mut caller: Caller<'_, InstanceState>, dest_ptr: i32, ident: i32| -> i32 {
            match (|| {
                let (_ctx, shared) = resolve(ident, false)?;
                let bytes = shared
                    .take_ffi_result()
                    .ok_or_else(|| JobError::fatal("instance ffi result is not set"))?;
                write_guest(&mut caller, dest_ptr, &bytes)?;
                Ok::<i32, JobError>(bytes.len() as i32)
            })() {
                Ok(len) => len,
                Err(err) => {
                    log_host_err("get_ffi_result", &err);
                    -1
                }
            }
        },
    )?;

    linker.func_wrap_async(
        "env",
        "fetch_url",
        |mut caller: Caller<'_, InstanceState>,
         (method, url_ptr, url_size, body_ptr, body_size, ident): (i32, i32, i32, i32, i32, i32)| {
            Box::new(async move {
                let outcome = async {
                    let (ctx, shared) = resolve(ident, true)?;
                    let method = HttpMethod::from_i32(method)
                        .ok_or_else(|| JobError::fatal(format!("unknown http method {method}")))?;
                    let url = read_guest_string(&mut caller, url_ptr, url_size)?;
                    let body = if body_size > 0 {
                        read_guest(&mut caller, body_ptr, body_size)?
                    } else {
                        Vec::new()
                    };
                    let authorization = ctx.caps.auth.authorization_for(&url);
                    let reply = ctx
                        .caps
                        .http
                        .fetch(method, &url, body, authorization)
                        .await
                        .map_err(|err| JobError::fatal(format!("fetch failed: {err:#}")))?;
                    let len = reply.len() as i32;
                    shared.set_ffi_result(reply)?;
                    Ok::<i32, JobError>(len)
                };
                match outcome.await {
                    Ok(len) => len,
                    Err(err) => {
                        log_host_err("fetch_url", &err);
                        -1
                    }
                }
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "graphql_query",
        |mut caller: Caller<'_, InstanceState>,
         (endpoint_ptr, endpoint_size, query_ptr, query_size, ident): (i32, i32, i32, i32, i32)| {
            Box::new(async move {
                let outcome = async {
                    let (ctx, shared) = resolve(ident, true)?;
                    let endpoint = read_guest_string(&mut caller, endpoint_ptr, endpoint_size)?;
                    let query = read_guest_string(&mut caller, query_ptr, query_size)?;
                    let authorization = ctx.caps.auth.authorization_for(&endpoint);
                    let reply = ctx
                        .caps
                        .graphql
                        .query(&endpoint, &query, authorization)
                        .await
                        .map_err(|err| JobError::fatal(format!("query failed: {err:#}")))?;
                    let bytes = serde_json::to_vec(&reply)
                        .map_err(|err| JobError::fatal(format!("reply serialization failed: {err}")))?;
                    let len = bytes.len() as i32;
                    shared.set_ffi_result(bytes)?;
                    Ok::<i32, JobError>(len)
                };
                match outcome.await {
                    Ok(len) => len,
                    Err(err) => {
                        log_host_err("graphql_query", &err);
                        -1
                    }
                }
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "cache_set",
        |mut caller: Caller<'_, InstanceState>,
         (key_ptr, key_size, value_ptr, value_size, ttl, ident): (i32, i32, i32, i32, i32, i32)| {
            Box::new(async move {
                let outcome = async {
                    let (ctx, _shared) = resolve(ident, false)?;
                    let key = read_guest_string(&mut caller, key_ptr, key_size)?;
                    let value = read_guest(&mut caller, value_ptr, value_size)?;
                    let ttl = (ttl > 0).then_some(ttl as u32);
                    ctx.caps
                        .cache
                        .set(&key, value, ttl)
                        .await
                        .map_err(|err| JobError::fatal(format!("cache set failed: {err:#}")))?;
                    Ok::<i32, JobError>(0)
                };
                match outcome.await {
                    Ok(code) => code,
                    Err(err) => {
                        log_host_err("cache_set", &err);
                        -1
                    }
                }
            })
        },
    )?;

    linker.func_wrap_async(
        "env",
        "cache_get",
        |mut caller: Caller<'_, InstanceState>, (key_ptr, key_size, ident): (i32, i32, i32)| {
            Box::new(async move {
                let outcome = async {
                    let (ctx, shared) = resolve(ident, true)?;
                    let key = read_guest_string(&mut caller, key_ptr, key_size)?;
                    let value = ctx
                        .caps
                        .cache
                        .get(&key)
                        .await
                        .map_err(|err| JobError::fatal(format!("cache get failed: {err:#}")))?;
                    match value {
                        Some(bytes) => {
                            let len = bytes.len() as i32;
                            shared.set_ffi_result(bytes)?;
                            Ok::<i32, JobError>(len)
                        }
                        None => {
                            tracing::debug!(%key, "cache miss");
                            Ok(-1)
                        }
                    }
                };
                match outcome.await {
                    Ok(len) => len,
                    Err(err) => {
                        log_host_err("cache_get", &err);
                        -1
                    }
                }
            })
        },
    )?;

    linker.func_wrap(
        "env",
        "log_msg",
        |mut caller: Caller<'_, InstanceState>, msg_ptr: i32, msg_size: i32, level: i32, ident: i32| {
            let outcome = (|| {
                let (ctx, _shared) = resolve(ident, false)?;
                let message =
                    String::from_utf8_lossy(&read_guest(&mut caller, msg_ptr, msg_size)?).into_owned();
                ctx.caps.logger.log(LogLevel::from_i32(level), &message);
                Ok::<(), JobError>(())
            })();
            if let Err(err) = outcome {
                log_host_err("log_msg", &err);
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "request_get_field",
        |mut caller: Caller<'_, InstanceState>,
         field_type: i32,
         key_ptr: i32,
         key_size: i32,
         ident: i32|
         -> i32 {
            match (|| {
                let (ctx, shared) = resolve(ident, true)?;
                let key = read_guest_string(&mut caller, key_ptr, key_size)?;
                let value = ctx
                    .caps
                    .request
                    .field(field_type, &key)
                    .map_err(|err| JobError::fatal(format!("request field failed: {err:#}")))?;
                let len = value.len() as i32;
                shared.set_ffi_result(value)?;
                Ok::<i32, JobError>(len)
            })() {
                Ok(len) => len,
                Err(err) => {
                    log_host_err("request_get_field", &err);
                    -1
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "resp_set_header",
        |mut caller: Caller<'_, InstanceState>,
         key_ptr: i32,
         key_size: i32,
         value_ptr: i32,
         value_size: i32,
         ident: i32|
         -> i32 {
            match (|| {
                let (ctx, _shared) = resolve(ident, false)?;
                let key = read_guest_string(&mut caller, key_ptr, key_size)?;
                let value = read_guest_string(&mut caller, value_ptr, value_size)?;
                ctx.caps
                    .response
                    .set_header(&key, &value)
                    .map_err(|err| JobError::fatal(format!("set header failed: {err:#}")))?;
                Ok::<i32, JobError>(0)
            })() {
                Ok(code) => code,
                Err(err) => {
                    log_host_err("resp_set_header", &err);
                    -1
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "get_static_file",
        |mut caller: Caller<'_, InstanceState>, name_ptr: i32, name_size: i32, ident: i32| -> i32 {
            match (|| {
                let (ctx, shared) = resolve(ident, true)?;
                let name = read_guest_string(&mut caller, name_ptr, name_size)?;
                let bytes = ctx
                    .caps
                    .file
                    .static_file(&name)
                    .map_err(|err| JobError::fatal(format!("static file failed: {err:#}")))?;
                let len = bytes.len() as i32;
                shared.set_ffi_result(bytes)?;
                Ok::<i32, JobError>(len)
            })() {
                Ok(len) => len,
                Err(err) => {
                    log_host_err("get_static_file", &err);
                    -1
                }
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "abort_handler",
        |mut caller: Caller<'_, InstanceState>, msg_ptr: i32, msg_size: i32, ident: i32| {
            let outcome = (|| {
                let (_ctx, shared) = resolve(ident, false)?;
                let message =
                    String::from_utf8_lossy(&read_guest(&mut caller, msg_ptr, msg_size)?).into_owned();
                shared.publish_error(RunErr::new(-1, format!("runnable aborted: {message}")))
            })();
            if let Err(err) = outcome {
                log_host_err("abort_handler", &err);
            }
        },
    )?;

    Ok(())
}
