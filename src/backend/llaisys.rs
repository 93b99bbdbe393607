//! Bridge to the native `llaisys` shared library.
//!
//! The library is opened at runtime with `libloading` and its Qwen2 C ABI is
//! bound once per [`LlaisysEngine`]:
//!
//! ```text
//! llaisysQwen2ModelCreate(const Meta*, int device, int* ids, int ndev) -> Model*
//! llaisysQwen2ModelDestroy(Model*)
//! llaisysQwen2ModelWeights(Model*) -> Weights*
//! llaisysQwen2ModelInfer(Model*, int64_t* tokens, size_t ntoken) -> int64_t
//! llaisysQwen2ModelReset(Model*)
//! tensorLoad(Tensor*, const void* data)
//! ```
//!
//! The native engine samples greedily; sampling parameters are not part of
//! its ABI and are ignored.

use std::ffi::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use libloading::{Library, Symbol};
use tracing::{debug, info, warn};

use crate::engine::sampler::SamplingConfig;
use crate::error::InferenceError;
use crate::model::config::ModelMeta;
use crate::model::weights::WeightTable;

use super::{DeviceType, NativeEngine};

/// Mirror of the native `LlaisysQwen2Meta`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawMeta {
    dtype: c_int,
    nlayer: usize,
    hs: usize,
    nh: usize,
    nkvh: usize,
    dh: usize,
    di: usize,
    maxseq: usize,
    voc: usize,
    epsilon: f32,
    theta: f32,
    end_token: i64,
}

impl From<&ModelMeta> for RawMeta {
    fn from(meta: &ModelMeta) -> Self {
        Self {
            dtype: meta.dtype.tag(),
            nlayer: meta.num_layers,
            hs: meta.hidden_size,
            nh: meta.num_heads,
            nkvh: meta.num_kv_heads,
            dh: meta.head_dim,
            di: meta.ffn_hidden,
            maxseq: meta.max_seq_len,
            voc: meta.vocab_size,
            epsilon: meta.norm_eps,
            theta: meta.rope_theta,
            end_token: meta.end_token,
        }
    }
}

/// Mirror of the native `LlaisysQwen2Weights`: three tensors and twelve
/// arrays of `nlayer` tensors each.
#[repr(C)]
struct RawWeights {
    in_embed: *mut c_void,
    out_embed: *mut c_void,
    out_norm_w: *mut c_void,
    attn_norm_w: *mut *mut c_void,
    attn_q_w: *mut *mut c_void,
    attn_q_b: *mut *mut c_void,
    attn_k_w: *mut *mut c_void,
    attn_k_b: *mut *mut c_void,
    attn_v_w: *mut *mut c_void,
    attn_v_b: *mut *mut c_void,
    attn_o_w: *mut *mut c_void,
    mlp_norm_w: *mut *mut c_void,
    mlp_gate_w: *mut *mut c_void,
    mlp_up_w: *mut *mut c_void,
    mlp_down_w: *mut *mut c_void,
}

type CreateFn = unsafe extern "C" fn(*const RawMeta, c_int, *mut c_int, c_int) -> *mut c_void;
type DestroyFn = unsafe extern "C" fn(*mut c_void);
type WeightsFn = unsafe extern "C" fn(*mut c_void) -> *mut RawWeights;
type InferFn = unsafe extern "C" fn(*mut c_void, *mut i64, usize) -> i64;
type ResetFn = unsafe extern "C" fn(*mut c_void);
type TensorLoadFn = unsafe extern "C" fn(*mut c_void, *const c_void);

struct Api {
    create: CreateFn,
    destroy: DestroyFn,
    weights: WeightsFn,
    infer: InferFn,
    reset: ResetFn,
    tensor_load: TensorLoadFn,
}

/// Opaque native tensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LlaisysTensor(NonNull<c_void>);

// SAFETY: The handle is an address into engine-owned memory. It is only
// dereferenced by the native library, from the thread that owns the model.
unsafe impl Send for LlaisysTensor {}

/// Opaque native model handle.
#[derive(Debug)]
pub struct LlaisysModel {
    ptr: NonNull<c_void>,
    num_layers: usize,
}

// SAFETY: The native model has no thread affinity; the handle that owns it
// serializes every call through `&mut self`.
unsafe impl Send for LlaisysModel {}

/// Engine backed by the native library.
pub struct LlaisysEngine {
    api: Api,
    path: PathBuf,
    sampling_warned: AtomicBool,
    // Keeps the function pointers in `api` valid.
    _library: Library,
}

impl std::fmt::Debug for LlaisysEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlaisysEngine").field("path", &self.path).finish()
    }
}

impl LlaisysEngine {
    /// Platform file name of the native library.
    pub fn default_library_name() -> &'static str {
        if cfg!(target_os = "windows") {
            "llaisys.dll"
        } else if cfg!(target_os = "macos") {
            "libllaisys.dylib"
        } else {
            "libllaisys.so"
        }
    }

    /// Open the library at `path` and bind the Qwen2 entry points.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref().to_path_buf();
        crate::runtime::init();

        // SAFETY: Loading runs the library's initializers. The library is a
        // trusted inference engine built for this ABI.
        let library = unsafe { Library::new(&path) }.map_err(|e| {
            InferenceError::Backend(format!("failed to load {}: {}", path.display(), e))
        })?;

        // SAFETY: Symbol types match the C declarations in the module docs.
        // The fn pointers are copied out and stay valid while `_library` lives.
        let api = unsafe {
            Api {
                create: *symbol::<CreateFn>(&library, b"llaisysQwen2ModelCreate\0")?,
                destroy: *symbol::<DestroyFn>(&library, b"llaisysQwen2ModelDestroy\0")?,
                weights: *symbol::<WeightsFn>(&library, b"llaisysQwen2ModelWeights\0")?,
                infer: *symbol::<InferFn>(&library, b"llaisysQwen2ModelInfer\0")?,
                reset: *symbol::<ResetFn>(&library, b"llaisysQwen2ModelReset\0")?,
                tensor_load: *symbol::<TensorLoadFn>(&library, b"tensorLoad\0")?,
            }
        };

        info!(path = %path.display(), "Loaded llaisys library");
        Ok(Self {
            api,
            path,
            sampling_warned: AtomicBool::new(false),
            _library: library,
        })
    }
}

unsafe fn symbol<'l, T>(library: &'l Library, name: &[u8]) -> Result<Symbol<'l, T>, InferenceError> {
    library.get::<T>(name).map_err(|e| {
        let printable = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name));
        InferenceError::Backend(format!("missing symbol {}: {}", printable, e))
    })
}

/// Read `len` tensor pointers from a native array.
///
/// # Safety
/// `array` must be null or point to at least `len` readable pointers.
unsafe fn tensor_array(array: *mut *mut c_void, len: usize) -> Option<Vec<LlaisysTensor>> {
    if array.is_null() {
        return None;
    }
    std::slice::from_raw_parts(array, len)
        .iter()
        .map(|&p| NonNull::new(p).map(LlaisysTensor))
        .collect()
}

impl NativeEngine for LlaisysEngine {
    type Model = LlaisysModel;
    type Tensor = LlaisysTensor;

    fn name(&self) -> &str {
        "llaisys"
    }

    fn create_model(
        &self,
        meta: &ModelMeta,
        device: DeviceType,
        device_ids: &[i32],
    ) -> Option<LlaisysModel> {
        let raw = RawMeta::from(meta);
        let mut ids: Vec<c_int> = device_ids.to_vec();
        let ndev = c_int::try_from(ids.len()).ok()?;
        // SAFETY: `raw` and `ids` outlive the call; the library copies both.
        let ptr = unsafe { (self.api.create)(&raw, device.tag(), ids.as_mut_ptr(), ndev) };
        let ptr = NonNull::new(ptr)?;
        debug!(device = %device, ndev, "Native model created");
        Some(LlaisysModel {
            ptr,
            num_layers: meta.num_layers,
        })
    }

    fn destroy_model(&self, model: LlaisysModel) {
        // SAFETY: `model` came from `create` and is consumed here, so it is
        // destroyed exactly once.
        unsafe { (self.api.destroy)(model.ptr.as_ptr()) }
    }

    fn model_weights(&self, model: &LlaisysModel) -> Option<WeightTable<LlaisysTensor>> {
        // SAFETY: the returned struct is owned by the live model; every
        // per-layer array holds `nlayer` entries.
        unsafe {
            let raw = (self.api.weights)(model.ptr.as_ptr()).as_ref()?;
            let n = model.num_layers;
            Some(WeightTable {
                in_embed: LlaisysTensor(NonNull::new(raw.in_embed)?),
                out_embed: LlaisysTensor(NonNull::new(raw.out_embed)?),
                out_norm_w: LlaisysTensor(NonNull::new(raw.out_norm_w)?),
                attn_norm_w: tensor_array(raw.attn_norm_w, n)?,
                attn_q_w: tensor_array(raw.attn_q_w, n)?,
                attn_q_b: tensor_array(raw.attn_q_b, n)?,
                attn_k_w: tensor_array(raw.attn_k_w, n)?,
                attn_k_b: tensor_array(raw.attn_k_b, n)?,
                attn_v_w: tensor_array(raw.attn_v_w, n)?,
                attn_v_b: tensor_array(raw.attn_v_b, n)?,
                attn_o_w: tensor_array(raw.attn_o_w, n)?,
                mlp_norm_w: tensor_array(raw.mlp_norm_w, n)?,
                mlp_gate_w: tensor_array(raw.mlp_gate_w, n)?,
                mlp_up_w: tensor_array(raw.mlp_up_w, n)?,
                mlp_down_w: tensor_array(raw.mlp_down_w, n)?,
            })
        }
    }

    fn load_tensor(
        &self,
        _model: &mut LlaisysModel,
        tensor: LlaisysTensor,
        data: &[u8],
    ) -> Result<(), InferenceError> {
        if data.is_empty() {
            return Err(InferenceError::Backend("refusing to load an empty buffer".to_string()));
        }
        // SAFETY: the tensor belongs to a live model; the loader has checked
        // that `data` holds exactly the tensor's shape in the model dtype, and
        // the buffer is only read for the duration of the call.
        unsafe { (self.api.tensor_load)(tensor.0.as_ptr(), data.as_ptr().cast()) };
        Ok(())
    }

    fn infer_step(&self, model: &mut LlaisysModel, tokens: &[i64], sampling: &SamplingConfig) -> i64 {
        if !sampling.is_greedy() && !self.sampling_warned.swap(true, Ordering::Relaxed) {
            warn!(
                temperature = sampling.temperature,
                top_k = sampling.top_k,
                top_p = sampling.top_p,
                "llaisys samples greedily; sampling parameters are ignored"
            );
        }
        let mut buf = tokens.to_vec();
        // SAFETY: `buf` holds `buf.len()` tokens and outlives the call.
        unsafe { (self.api.infer)(model.ptr.as_ptr(), buf.as_mut_ptr(), buf.len()) }
    }

    fn reset_cache(&self, model: &mut LlaisysModel) {
        // SAFETY: the model is live; reset only touches its own cache.
        unsafe { (self.api.reset)(model.ptr.as_ptr()) }
    }
}
