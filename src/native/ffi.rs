//! Backend over a C function table exported by the native inference library.
//!
//! Status convention: `0` is success; anything else is a failure, optionally
//! with a heap-allocated message that has to be handed back to `free_error`.

use std::ffi::{c_char, c_int, CStr, CString};
use std::ptr::{self, NonNull};

use llm_host_models::{ModelSettings, PromptTemplates, SessionConfig};

use super::{InferenceBackend, NativeError, NativeResponse};

/// Status used for failures detected on the Rust side of the boundary.
const LOCAL_FAILURE: i32 = -1;

#[repr(C)]
pub struct LlmEngineRaw {
    _private: [u8; 0],
}

#[repr(C)]
pub struct LlmSessionRaw {
    _private: [u8; 0],
}

#[repr(C)]
pub struct LlmModelSettings {
    pub model_path: *const c_char,
    pub vision_encoder_path: *const c_char,
    pub vision_adapter_path: *const c_char,
    pub cache_dir: *const c_char,
    pub max_num_tokens: usize,
    pub max_num_images: usize,
    pub activation_data_type: c_int,
    pub preferred_backend: c_int,
    pub enable_audio_modality: bool,
}

#[repr(C)]
pub struct LlmPromptTemplates {
    pub prefix: *const c_char,
    pub suffix: *const c_char,
    pub system_instruction: *const c_char,
}

/// Zero in a numeric field means "native default".
#[repr(C)]
pub struct LlmSessionConfig {
    pub topk: usize,
    pub topp: f32,
    pub temperature: f32,
    pub random_seed: usize,
    pub prompt_templates: *const LlmPromptTemplates,
    pub enable_vision_modality: bool,
    pub enable_audio_modality: bool,
}

#[repr(C)]
pub struct LlmResponseContext {
    pub response_array: *mut *mut c_char,
    pub response_count: c_int,
    pub done: bool,
}

impl LlmResponseContext {
    fn empty() -> Self {
        Self {
            response_array: ptr::null_mut(),
            response_count: 0,
            done: false,
        }
    }
}

type ErrorOut = *mut *mut c_char;

#[repr(C)]
pub struct LlmEngineApi {
    pub create_engine:
        unsafe extern "C" fn(*const LlmModelSettings, *mut *mut LlmEngineRaw, ErrorOut) -> c_int,
    pub delete_engine: unsafe extern "C" fn(*mut LlmEngineRaw),
    pub create_session: unsafe extern "C" fn(
        *mut LlmEngineRaw,
        *const LlmSessionConfig,
        *mut *mut LlmSessionRaw,
        ErrorOut,
    ) -> c_int,
    pub delete_session: unsafe extern "C" fn(*mut LlmSessionRaw),
    pub clone_session:
        unsafe extern "C" fn(*mut LlmSessionRaw, *mut *mut LlmSessionRaw, ErrorOut) -> c_int,
    pub update_runtime_config:
        unsafe extern "C" fn(*mut LlmSessionRaw, *const LlmSessionConfig, ErrorOut) -> c_int,
    pub add_query_chunk: unsafe extern "C" fn(*mut LlmSessionRaw, *const c_char, ErrorOut) -> c_int,
    pub add_image: unsafe extern "C" fn(*mut LlmSessionRaw, *const u8, usize, ErrorOut) -> c_int,
    pub add_audio: unsafe extern "C" fn(*mut LlmSessionRaw, *const u8, usize, ErrorOut) -> c_int,
    pub predict_sync:
        unsafe extern "C" fn(*mut LlmSessionRaw, *mut LlmResponseContext, ErrorOut) -> c_int,
    pub predict_step:
        unsafe extern "C" fn(*mut LlmSessionRaw, *mut LlmResponseContext, ErrorOut) -> c_int,
    pub cancel_generation: unsafe extern "C" fn(*mut LlmSessionRaw, ErrorOut) -> c_int,
    pub size_in_tokens:
        unsafe extern "C" fn(*mut LlmSessionRaw, *const c_char, *mut c_int, ErrorOut) -> c_int,
    pub close_response: unsafe extern "C" fn(*mut LlmResponseContext),
    pub free_error: unsafe extern "C" fn(*mut c_char),
}

/// Error string owned by the native side until this guard drops.
struct ErrorMessage {
    api: &'static LlmEngineApi,
    ptr: *mut c_char,
}

impl ErrorMessage {
    fn read(&self, fallback: &str) -> String {
        if self.ptr.is_null() {
            return fallback.to_string();
        }
        // SAFETY: a non-null error pointer is a NUL-terminated string that
        // stays valid until `free_error` runs in `drop`.
        unsafe { CStr::from_ptr(self.ptr) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for ErrorMessage {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: the pointer came from the library and is released once.
            unsafe { (self.api.free_error)(self.ptr) };
        }
    }
}

pub struct CEngine {
    raw: NonNull<LlmEngineRaw>,
    api: &'static LlmEngineApi,
}

// SAFETY: the engine pointer is only dereferenced by the native library, and
// the host core hands `&mut CEngine` to one thread at a time.
unsafe impl Send for CEngine {}

impl Drop for CEngine {
    fn drop(&mut self) {
        // SAFETY: `raw` was produced by `create_engine` and is deleted once.
        unsafe { (self.api.delete_engine)(self.raw.as_ptr()) };
    }
}

pub struct CSession {
    raw: NonNull<LlmSessionRaw>,
    api: &'static LlmEngineApi,
}

// SAFETY: same contract as `CEngine`; calls for one session are serialized.
unsafe impl Send for CSession {}

impl Drop for CSession {
    fn drop(&mut self) {
        // SAFETY: `raw` was produced by `create_session`/`clone_session`.
        unsafe { (self.api.delete_session)(self.raw.as_ptr()) };
    }
}

pub struct CResponse {
    ctx: LlmResponseContext,
    api: &'static LlmEngineApi,
}

impl NativeResponse for CResponse {
    fn candidate_count(&self) -> usize {
        usize::try_from(self.ctx.response_count).unwrap_or(0)
    }

    fn candidate(&self, index: usize) -> Result<String, NativeError> {
        if index >= self.candidate_count() || self.ctx.response_array.is_null() {
            return Err(NativeError::new(
                LOCAL_FAILURE,
                format!("response candidate {} out of range", index),
            ));
        }
        // SAFETY: index < response_count, and the array stays alive until
        // `close_response` runs in `drop`.
        let item = unsafe { *self.ctx.response_array.add(index) };
        if item.is_null() {
            return Err(NativeError::new(
                LOCAL_FAILURE,
                format!("response candidate {} is null", index),
            ));
        }
        // SAFETY: non-null candidates are NUL-terminated strings.
        unsafe { CStr::from_ptr(item) }
            .to_str()
            .map(str::to_owned)
            .map_err(|e| {
                NativeError::new(
                    LOCAL_FAILURE,
                    format!("response candidate {} is not UTF-8: {}", index, e),
                )
            })
    }

    fn is_done(&self) -> bool {
        self.ctx.done
    }
}

impl Drop for CResponse {
    fn drop(&mut self) {
        // SAFETY: the context was handed to a predict call and closes once.
        unsafe { (self.api.close_response)(&mut self.ctx) };
    }
}

/// C strings kept alive for as long as the raw struct pointing at them.
struct CModelSettings {
    _strings: Vec<CString>,
    raw: LlmModelSettings,
}

struct CSessionConfig {
    _strings: Vec<CString>,
    _templates: Option<Box<LlmPromptTemplates>>,
    raw: LlmSessionConfig,
}

fn c_string(field: &str, value: &str) -> Result<CString, NativeError> {
    CString::new(value).map_err(|_| {
        NativeError::new(LOCAL_FAILURE, format!("{} contains an interior NUL byte", field))
    })
}

fn optional_c_string(
    strings: &mut Vec<CString>,
    field: &str,
    value: Option<&str>,
) -> Result<*const c_char, NativeError> {
    match value {
        Some(value) => {
            let owned = c_string(field, value)?;
            let ptr = owned.as_ptr();
            strings.push(owned);
            Ok(ptr)
        }
        None => Ok(ptr::null()),
    }
}

fn model_settings_to_c(settings: &ModelSettings) -> Result<CModelSettings, NativeError> {
    let mut strings = Vec::new();
    let model_path = optional_c_string(&mut strings, "modelPath", Some(&settings.model_path))?;
    let vision_encoder_path = optional_c_string(
        &mut strings,
        "visionEncoderPath",
        settings.vision_encoder_path.as_deref(),
    )?;
    let vision_adapter_path = optional_c_string(
        &mut strings,
        "visionAdapterPath",
        settings.vision_adapter_path.as_deref(),
    )?;
    let cache_dir = optional_c_string(&mut strings, "cacheDir", settings.cache_dir.as_deref())?;

    let raw = LlmModelSettings {
        model_path,
        vision_encoder_path,
        vision_adapter_path,
        cache_dir,
        max_num_tokens: settings.effective_max_num_tokens(),
        max_num_images: settings.max_num_images.unwrap_or(0),
        activation_data_type: settings
            .activation_data_type
            .map(|a| a.as_raw())
            .unwrap_or(0),
        preferred_backend: settings.preferred_backend.map(|b| b.as_raw()).unwrap_or(0),
        enable_audio_modality: settings.enable_audio_modality.unwrap_or(false),
    };

    Ok(CModelSettings {
        _strings: strings,
        raw,
    })
}

fn templates_to_c(
    strings: &mut Vec<CString>,
    templates: &PromptTemplates,
) -> Result<Box<LlmPromptTemplates>, NativeError> {
    Ok(Box::new(LlmPromptTemplates {
        prefix: optional_c_string(strings, "promptTemplates.prefix", templates.prefix.as_deref())?,
        suffix: optional_c_string(strings, "promptTemplates.suffix", templates.suffix.as_deref())?,
        system_instruction: optional_c_string(
            strings,
            "promptTemplates.systemInstruction",
            templates.system_instruction.as_deref(),
        )?,
    }))
}

fn session_config_to_c(config: &SessionConfig) -> Result<CSessionConfig, NativeError> {
    let mut strings = Vec::new();
    let templates = config
        .prompt_templates
        .as_ref()
        .map(|t| templates_to_c(&mut strings, t))
        .transpose()?;
    let templates_ptr = templates
        .as_deref()
        .map_or(ptr::null(), |t| t as *const LlmPromptTemplates);

    let raw = LlmSessionConfig {
        topk: config.top_k.unwrap_or(0),
        topp: config.top_p.unwrap_or(0.0),
        temperature: config.temperature.unwrap_or(0.0),
        random_seed: config.random_seed.unwrap_or(0),
        prompt_templates: templates_ptr,
        enable_vision_modality: config.enable_vision_modality.unwrap_or(false),
        enable_audio_modality: config.enable_audio_modality.unwrap_or(false),
    };

    Ok(CSessionConfig {
        _strings: strings,
        _templates: templates,
        raw,
    })
}

/// Backend over an [`LlmEngineApi`] table provided by the embedder.
#[derive(Clone, Copy)]
pub struct CApiBackend {
    api: &'static LlmEngineApi,
}

impl CApiBackend {
    /// # Safety
    ///
    /// Every entry of `api` must follow the status/ownership contract of this
    /// module: handles returned by the factories stay valid until passed to
    /// the matching delete function, error strings must be released with
    /// `free_error`, and every response context passed to a predict call,
    /// filled or still empty, with `close_response`.
    pub unsafe fn new(api: &'static LlmEngineApi) -> Self {
        Self { api }
    }

    fn call<F>(&self, fallback: &str, f: F) -> Result<(), NativeError>
    where
        F: FnOnce(ErrorOut) -> c_int,
    {
        let mut err: *mut c_char = ptr::null_mut();
        let status = f(&mut err as ErrorOut);
        let message = ErrorMessage {
            api: self.api,
            ptr: err,
        };
        if status == 0 {
            Ok(())
        } else {
            Err(NativeError::new(status, message.read(fallback)))
        }
    }

    fn respond<F>(&self, fallback: &str, f: F) -> Result<CResponse, NativeError>
    where
        F: FnOnce(*mut LlmResponseContext, ErrorOut) -> c_int,
    {
        // Owned before the call so a context filled on failure still closes.
        let mut response = CResponse {
            ctx: LlmResponseContext::empty(),
            api: self.api,
        };
        self.call(fallback, |err| {
            f(&mut response.ctx as *mut LlmResponseContext, err)
        })?;
        Ok(response)
    }

    fn add_bytes(
        &self,
        session: &mut CSession,
        bytes: &[u8],
        entry: unsafe extern "C" fn(*mut LlmSessionRaw, *const u8, usize, ErrorOut) -> c_int,
        fallback: &str,
    ) -> Result<(), NativeError> {
        let raw = session.raw.as_ptr();
        // SAFETY: the slice outlives the call; the session is valid.
        self.call(fallback, |err| unsafe {
            entry(raw, bytes.as_ptr(), bytes.len(), err)
        })
    }
}

impl InferenceBackend for CApiBackend {
    type Engine = CEngine;
    type Session = CSession;
    type Response = CResponse;

    fn create_engine(&self, settings: &ModelSettings) -> Result<CEngine, NativeError> {
        let c_settings = model_settings_to_c(settings)?;
        let mut raw: *mut LlmEngineRaw = ptr::null_mut();
        // SAFETY: `c_settings` and its strings outlive the call.
        self.call("Unknown error creating engine", |err| unsafe {
            (self.api.create_engine)(&c_settings.raw, &mut raw, err)
        })?;
        let raw = NonNull::new(raw).ok_or_else(|| {
            NativeError::new(LOCAL_FAILURE, "Engine factory returned a null handle")
        })?;
        Ok(CEngine { raw, api: self.api })
    }

    fn create_session(
        &self,
        engine: &mut CEngine,
        config: &SessionConfig,
    ) -> Result<CSession, NativeError> {
        let c_config = session_config_to_c(config)?;
        let engine_raw = engine.raw.as_ptr();
        let mut raw: *mut LlmSessionRaw = ptr::null_mut();
        // SAFETY: the engine is alive and `c_config` outlives the call.
        self.call("Unknown error creating session", |err| unsafe {
            (self.api.create_session)(engine_raw, &c_config.raw, &mut raw, err)
        })?;
        let raw = NonNull::new(raw).ok_or_else(|| {
            NativeError::new(LOCAL_FAILURE, "Session factory returned a null handle")
        })?;
        Ok(CSession { raw, api: self.api })
    }

    fn clone_session(&self, session: &mut CSession) -> Result<CSession, NativeError> {
        let source = session.raw.as_ptr();
        let mut raw: *mut LlmSessionRaw = ptr::null_mut();
        // SAFETY: the source session is alive for the duration of the call.
        self.call("Unknown error cloning session", |err| unsafe {
            (self.api.clone_session)(source, &mut raw, err)
        })?;
        let raw = NonNull::new(raw).ok_or_else(|| {
            NativeError::new(LOCAL_FAILURE, "Session clone returned a null handle")
        })?;
        Ok(CSession { raw, api: self.api })
    }

    fn update_runtime_config(
        &self,
        session: &mut CSession,
        config: &SessionConfig,
    ) -> Result<(), NativeError> {
        let c_config = session_config_to_c(config)?;
        let raw = session.raw.as_ptr();
        // SAFETY: the session is alive and `c_config` outlives the call.
        self.call("Unknown error updating runtime config", |err| unsafe {
            (self.api.update_runtime_config)(raw, &c_config.raw, err)
        })
    }

    fn add_query_chunk(&self, session: &mut CSession, text: &str) -> Result<(), NativeError> {
        let chunk = c_string("query chunk", text)?;
        let raw = session.raw.as_ptr();
        // SAFETY: `chunk` outlives the call.
        self.call("Unknown error adding query chunk", |err| unsafe {
            (self.api.add_query_chunk)(raw, chunk.as_ptr(), err)
        })
    }

    fn add_image(&self, session: &mut CSession, image: &[u8]) -> Result<(), NativeError> {
        self.add_bytes(session, image, self.api.add_image, "Unknown error adding image")
    }

    fn add_audio(&self, session: &mut CSession, audio: &[u8]) -> Result<(), NativeError> {
        self.add_bytes(session, audio, self.api.add_audio, "Unknown error adding audio")
    }

    fn predict_sync(&self, session: &mut CSession) -> Result<CResponse, NativeError> {
        let raw = session.raw.as_ptr();
        // SAFETY: the response context lives in `CResponse`, closed on drop.
        self.respond("Unknown error during prediction", |ctx, err| unsafe {
            (self.api.predict_sync)(raw, ctx, err)
        })
    }

    fn predict_step(&self, session: &mut CSession) -> Result<CResponse, NativeError> {
        let raw = session.raw.as_ptr();
        // SAFETY: as in `predict_sync`.
        self.respond("Unknown error during prediction", |ctx, err| unsafe {
            (self.api.predict_step)(raw, ctx, err)
        })
    }

    fn abort_generation(&self, session: &mut CSession) -> Result<(), NativeError> {
        let raw = session.raw.as_ptr();
        // SAFETY: the session is alive for the duration of the call.
        self.call("Unknown error cancelling generation", |err| unsafe {
            (self.api.cancel_generation)(raw, err)
        })
    }

    fn size_in_tokens(&self, session: &mut CSession, text: &str) -> Result<usize, NativeError> {
        let text = c_string("text", text)?;
        let raw = session.raw.as_ptr();
        let mut count: c_int = 0;
        // SAFETY: `text` and `count` outlive the call.
        self.call("Unknown error counting tokens", |err| unsafe {
            (self.api.size_in_tokens)(raw, text.as_ptr(), &mut count, err)
        })?;
        usize::try_from(count).map_err(|_| {
            NativeError::new(LOCAL_FAILURE, format!("negative token count {}", count))
        })
    }
}
