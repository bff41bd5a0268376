//! FFI bindings for Swing Fusion
//!
//! This module provides C-compatible functions for calling the fusion pipeline
//! from other languages. All functions take C strings (null-terminated) and
//! return allocated memory that must be freed by the caller using
//! `fusion_free_string`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::config::FusionConfig;
use crate::error::FusionError;
use crate::loader::JsonRow;
use crate::pipeline::{fuse_json, FusionPipeline};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Error text handed to C callers: `CODE: message`
fn record_error(err: &FusionError) {
    set_last_error(&format!("{}: {}", err.code(), err));
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn into_cstr(result: Result<String, FusionError>) -> *mut c_char {
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            record_error(&e);
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Stateless API
// ============================================================================

/// Run a fusion and return `{ "rows": [...], "report": {...} }` as JSON.
///
/// `inputs` is a JSON object mapping each configured stream name to an array
/// of row objects.
///
/// # Safety
/// - `config` and `inputs` must be valid null-terminated C strings.
/// - Returns a newly allocated string that must be freed with `fusion_free_string`.
/// - Returns NULL on error; call `fusion_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn fusion_run_json(config: *const c_char, inputs: *const c_char) -> *mut c_char {
    clear_last_error();

    let Some(config) = cstr_to_string(config) else {
        set_last_error("Invalid config string pointer");
        return ptr::null_mut();
    };
    let Some(inputs) = cstr_to_string(inputs) else {
        set_last_error("Invalid inputs string pointer");
        return ptr::null_mut();
    };

    into_cstr(fuse_json(&config, &inputs))
}

/// Validate a configuration without running it.
///
/// # Safety
/// - `config` must be a valid null-terminated C string.
/// - Returns 0 when valid, -1 otherwise; call `fusion_last_error` for the reason.
#[no_mangle]
pub unsafe extern "C" fn fusion_validate_config(config: *const c_char) -> i32 {
    clear_last_error();

    let Some(config) = cstr_to_string(config) else {
        set_last_error("Invalid config string pointer");
        return -1;
    };

    match FusionConfig::from_json(&config) {
        Ok(_) => 0,
        Err(e) => {
            record_error(&e);
            -1
        }
    }
}

/// Example configuration for the three-sensor tennis setup.
///
/// # Safety
/// - Returns a newly allocated string that must be freed with `fusion_free_string`.
#[no_mangle]
pub unsafe extern "C" fn fusion_example_config() -> *mut c_char {
    clear_last_error();
    into_cstr(FusionConfig::example().and_then(|c| c.to_json_pretty()))
}

// ============================================================================
// Pipeline Handle API
// ============================================================================

/// Opaque handle to a validated FusionPipeline
pub struct FusionPipelineHandle {
    pipeline: FusionPipeline,
}

/// Validate a configuration once and keep it for repeated runs.
///
/// # Safety
/// - `config` must be a valid null-terminated C string.
/// - Must be freed with `fusion_pipeline_free`.
/// - Returns NULL on error.
#[no_mangle]
pub unsafe extern "C" fn fusion_pipeline_new(config: *const c_char) -> *mut FusionPipelineHandle {
    clear_last_error();

    let Some(config) = cstr_to_string(config) else {
        set_last_error("Invalid config string pointer");
        return ptr::null_mut();
    };

    match FusionPipeline::from_json(&config) {
        Ok(pipeline) => Box::into_raw(Box::new(FusionPipelineHandle { pipeline })),
        Err(e) => {
            record_error(&e);
            ptr::null_mut()
        }
    }
}

/// Run a pipeline handle over a JSON object of input rows.
///
/// # Safety
/// - `pipeline` must be a valid pointer returned by `fusion_pipeline_new`.
/// - `inputs` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `fusion_free_string`.
#[no_mangle]
pub unsafe extern "C" fn fusion_pipeline_run(
    pipeline: *const FusionPipelineHandle,
    inputs: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if pipeline.is_null() {
        set_last_error("Invalid pipeline pointer");
        return ptr::null_mut();
    }
    let Some(inputs) = cstr_to_string(inputs) else {
        set_last_error("Invalid inputs string pointer");
        return ptr::null_mut();
    };

    let handle = &*pipeline;
    let result = serde_json::from_str::<BTreeMap<String, Vec<JsonRow>>>(&inputs)
        .map_err(FusionError::from)
        .and_then(|inputs| handle.pipeline.run(inputs))
        .and_then(|output| Ok(serde_json::to_string(&output.to_json_value()?)?));
    into_cstr(result)
}

/// Free a pipeline handle.
///
/// # Safety
/// - `pipeline` must be a valid pointer returned by `fusion_pipeline_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn fusion_pipeline_free(pipeline: *mut FusionPipelineHandle) {
    if !pipeline.is_null() {
        drop(Box::from_raw(pipeline));
    }
}

// ============================================================================
// Memory and Errors
// ============================================================================

/// Free a string returned by fusion functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a fusion function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn fusion_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next fusion call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn fusion_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn fusion_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CString {
        CString::new(
            r#"{
                "streams": [
                    { "name": "zepp", "time_column": "l_id", "encoding": { "kind": "epoch", "units_per_second": 1000 } },
                    { "name": "babolat", "time_column": "time", "encoding": { "kind": "epoch", "units_per_second": 10000 } }
                ],
                "steps": [
                    { "step": "join", "left": "zepp", "right": "babolat", "output": "racket", "tolerance_ms": 5000 }
                ],
                "output": "racket"
            }"#,
        )
        .unwrap()
    }

    fn inputs() -> CString {
        CString::new(
            r#"{
                "zepp": [ { "l_id": 1000, "ball_spin": 3.0 }, { "l_id": 60000, "ball_spin": 4.0 } ],
                "babolat": [ { "time": 20000, "SpeedScore": 7.0 } ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_ffi_run_json() {
        unsafe {
            let result = fusion_run_json(config().as_ptr(), inputs().as_ptr());
            assert!(!result.is_null());

            let text = CStr::from_ptr(result).to_str().unwrap();
            let value: serde_json::Value = serde_json::from_str(text).unwrap();
            assert_eq!(value["rows"].as_array().unwrap().len(), 2);
            assert_eq!(value["rows"][0]["SpeedScore"], 7.0);
            assert!(value["rows"][1]["SpeedScore"].is_null());

            fusion_free_string(result);
        }
    }

    #[test]
    fn test_ffi_pipeline_lifecycle() {
        unsafe {
            let pipeline = fusion_pipeline_new(config().as_ptr());
            assert!(!pipeline.is_null());

            for _ in 0..2 {
                let result = fusion_pipeline_run(pipeline, inputs().as_ptr());
                assert!(!result.is_null());
                fusion_free_string(result);
            }

            fusion_pipeline_free(pipeline);
        }
    }

    #[test]
    fn test_ffi_error_handling() {
        unsafe {
            let invalid = CString::new("not json").unwrap();
            let result = fusion_run_json(invalid.as_ptr(), inputs().as_ptr());
            assert!(result.is_null());

            let error = fusion_last_error();
            assert!(!error.is_null());
            let error_str = CStr::from_ptr(error).to_str().unwrap();
            assert!(error_str.starts_with("JSON_ERROR"));

            assert_eq!(fusion_validate_config(invalid.as_ptr()), -1);
            assert_eq!(fusion_validate_config(config().as_ptr()), 0);
            assert!(fusion_last_error().is_null());
        }
    }

    #[test]
    fn test_ffi_example_config_validates() {
        unsafe {
            let example = fusion_example_config();
            assert!(!example.is_null());
            assert_eq!(fusion_validate_config(example), 0);
            fusion_free_string(example);
        }
    }

    #[test]
    fn test_ffi_version() {
        unsafe {
            let version = fusion_version();
            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert!(!version_str.is_empty());
        }
    }
}
