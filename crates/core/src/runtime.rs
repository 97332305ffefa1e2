//! Locate the ONNX Runtime shared library and GPU dependencies before the
//! first `ort` call. `ort` is built with `load-dynamic`, so nothing is linked
//! at build time.

use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ENV_ORT_DYLIB_PATH: &str = "ORT_DYLIB_PATH";
const ENV_LIB_DIR: &str = "RECOLOR_LIB_DIR";

static RUNTIME_STATUS: OnceLock<RuntimeLibStatus> = OnceLock::new();

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibStatus {
    /// Set when `ORT_DYLIB_PATH` was filled in from a probed directory.
    pub discovered_ort: Option<PathBuf>,
    pub preloaded: Vec<PathBuf>,
}

/// Directories probed for runtime libraries, in order:
///   1. `$RECOLOR_LIB_DIR`
///   2. `<exe_dir>/` (Windows only)
///   3. `<exe_dir>/lib/` and `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Some(dir) = env::var_os(ENV_LIB_DIR).filter(|v| !v.is_empty()) {
        push(PathBuf::from(dir));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn prepend_dirs_to_path(dirs: &[PathBuf]) {
    use std::collections::HashSet;

    let current: Option<OsString> = env::var_os("PATH");
    let mut seen = HashSet::<String>::new();
    let mut merged = Vec::new();
    let key = |p: &Path| p.to_string_lossy().replace('/', "\\").to_ascii_lowercase();

    for dir in dirs.iter().filter(|d| d.is_dir()) {
        if seen.insert(key(dir)) {
            merged.push(dir.clone());
        }
    }
    if let Some(path) = current.as_ref() {
        for dir in env::split_paths(path).filter(|d| !d.as_os_str().is_empty()) {
            if seen.insert(key(&dir)) {
                merged.push(dir);
            }
        }
    }

    if let Ok(joined) = env::join_paths(merged) {
        env::set_var("PATH", joined);
    }
}

/// Preload tier for CUDA execution provider dependencies. `None` means the
/// file is left for ORT (its own provider libs need `libonnxruntime` first).
///
///   0 - CUDA runtime and math libs
///   1 - cuDNN
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublaslt", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_", "cufft64_", "curand64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries found in `dirs`, ordered so dependencies come first. The
/// first directory holding a given file name wins.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

// dlopen search paths are fixed at process start, so libraries are opened by
// absolute path with RTLD_GLOBAL and intentionally leaked.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point ORT at its shared library and preload CUDA dependencies.
///
/// Call at the very start of `main()`, before tracing and before any `ort` use.
pub fn setup_runtime_libs() -> &'static RuntimeLibStatus {
    RUNTIME_STATUS.get_or_init(|| {
        let dirs = candidate_lib_dirs();
        let mut status = RuntimeLibStatus::default();

        if env::var_os(ENV_ORT_DYLIB_PATH).is_none() {
            if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
                env::set_var(ENV_ORT_DYLIB_PATH, &path);
                status.discovered_ort = Some(path);
            }

            #[cfg(windows)]
            prepend_dirs_to_path(&dirs);
        }

        for lib in preload_plan(&dirs) {
            if unsafe { load_library(&lib) } {
                status.preloaded.push(lib);
            }
        }
        status
    })
}

/// Report what [`setup_runtime_libs`] resolved. Call once tracing is up.
pub fn log_runtime_lib_status() {
    match env::var(ENV_ORT_DYLIB_PATH) {
        Ok(ort) if Path::new(&ort).is_file() => info!(path = %ort, "ONNX Runtime library"),
        Ok(ort) => warn!(path = %ort, "ORT_DYLIB_PATH is set but the file does not exist"),
        Err(_) => warn!("ORT_DYLIB_PATH not set; ONNX Runtime will use the default search path"),
    }

    if let Some(status) = RUNTIME_STATUS.get() {
        if status.discovered_ort.is_some() {
            debug!("ORT_DYLIB_PATH filled in from a probed library directory");
        }
        for lib in &status.preloaded {
            debug!(path = %lib.display(), "Preloaded GPU runtime library");
        }
    }
}
