//! Process-wide runtime initialization.
//!
//! [`init`] runs once per process and is safe to call any number of times;
//! [`ModelHandle::create`](crate::model::ModelHandle::create) calls it before
//! the first engine allocation. With the `llaisys` feature it preloads the
//! OpenMP runtime the native library links against, making its symbols
//! globally visible. A missing OpenMP runtime is not an error.

use std::sync::OnceLock;

use tracing::{debug, info};

/// State established by [`init`].
#[derive(Debug)]
pub struct Runtime {
    openmp: Option<String>,
    #[cfg(all(feature = "llaisys", unix))]
    _openmp_lib: Option<libloading::os::unix::Library>,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Initialize the runtime, or return the existing one.
pub fn init() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        let runtime = start();
        info!(openmp = ?runtime.openmp, "Runtime initialized");
        runtime
    })
}

pub fn is_initialized() -> bool {
    RUNTIME.get().is_some()
}

/// OpenMP runtimes tried in order.
#[cfg(all(feature = "llaisys", unix))]
const OPENMP_CANDIDATES: &[&str] = if cfg!(target_os = "macos") {
    &["libomp.dylib"]
} else {
    &["libgomp.so.1", "libomp.so"]
};

#[cfg(all(feature = "llaisys", unix))]
fn start() -> Runtime {
    use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};

    for &name in OPENMP_CANDIDATES {
        // SAFETY: OpenMP runtimes have no library constructors with
        // preconditions; the handle is kept for the life of the process.
        match unsafe { Library::open(Some(name), RTLD_NOW | RTLD_GLOBAL) } {
            Ok(lib) => {
                return Runtime {
                    openmp: Some(name.to_string()),
                    _openmp_lib: Some(lib),
                }
            }
            Err(e) => debug!(library = name, error = %e, "OpenMP runtime not found"),
        }
    }
    Runtime {
        openmp: None,
        _openmp_lib: None,
    }
}

#[cfg(not(all(feature = "llaisys", unix)))]
fn start() -> Runtime {
    debug!("No native runtime to preload");
    Runtime { openmp: None }
}
