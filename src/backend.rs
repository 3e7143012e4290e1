//! Backend abstraction - Multi-backend support
//!
//! Supports both CUDA (GPU) and NdArray (CPU) backends, plus the one-shot
//! thread configuration of the numerical runtime.

use burn::backend::Autodiff;
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, UNetError};

// --------------------------------------------------------------------------------
// BACKEND SELECTION: CUDA (opt-in) or NdArray (default)
// --------------------------------------------------------------------------------

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
pub type DefaultBackend = burn_ndarray::NdArray<f32>;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray"), not(feature = "cpu")))]
compile_error!("At least one backend (cuda, ndarray, or cpu) must be enabled!");

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Get the default device
pub fn default_device() -> <DefaultBackend as burn::tensor::backend::Backend>::Device {
    <DefaultBackend as burn::tensor::backend::Backend>::Device::default()
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
    {
        "NdArray (CPU)"
    }
}

/// Blocktime values above this render as "infinite"
const INFINITE_BLOCKTIME_MS: u64 = 1000;

/// Process-wide thread configuration, applied once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Threads used inside a single operation (0 = one per core)
    pub intra_op_threads: usize,
    /// Workers for independent host-side work across samples
    pub inter_op_threads: usize,
    /// Scheduling hint in milliseconds; recorded, not enforced
    pub blocktime_ms: u64,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            intra_op_threads: 0,
            inter_op_threads: 1,
            blocktime_ms: 30,
        }
    }
}

impl ThreadConfig {
    /// Blocktime as used in log lines and trace file names
    pub fn blocktime_label(&self) -> String {
        if self.blocktime_ms > INFINITE_BLOCKTIME_MS {
            "infinite".to_string()
        } else {
            self.blocktime_ms.to_string()
        }
    }

    /// Intra-op thread count with the automatic value resolved
    pub fn effective_intra_op_threads(&self) -> usize {
        if self.intra_op_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.intra_op_threads
        }
    }

    /// Inter-op worker count, at least one
    pub fn effective_inter_op_threads(&self) -> usize {
        self.inter_op_threads.max(1)
    }
}

/// Initialized runtime; owns the inter-op worker pool
pub struct BackendRuntime {
    config: ThreadConfig,
    inter_op_pool: rayon::ThreadPool,
    global_pool_configured: bool,
}

impl std::fmt::Debug for BackendRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRuntime")
            .field("config", &self.config)
            .field("inter_op_threads", &self.inter_op_pool.current_num_threads())
            .field("global_pool_configured", &self.global_pool_configured)
            .finish()
    }
}

impl BackendRuntime {
    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    /// False when an earlier initialization already owned the global pool
    pub fn global_pool_configured(&self) -> bool {
        self.global_pool_configured
    }

    /// Run `op` on the inter-op pool
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.inter_op_pool.install(op)
    }
}

/// Configure the numerical runtime's thread pools
///
/// The global rayon pool (used by the CPU backend inside each operation) can
/// only be sized once per process. A second call keeps the existing pool and
/// logs a warning.
pub fn init_backend(config: &ThreadConfig) -> Result<BackendRuntime> {
    let intra = config.effective_intra_op_threads();
    let inter = config.effective_inter_op_threads();

    let global_pool_configured = match rayon::ThreadPoolBuilder::new()
        .num_threads(intra)
        .build_global()
    {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Intra-op thread pool already initialized, keeping it: {}", e);
            false
        }
    };

    let inter_op_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(inter)
        .thread_name(|i| format!("inter-op-{}", i))
        .build()
        .map_err(|e| UNetError::Config(format!("Failed to build inter-op pool: {}", e)))?;

    tracing::info!(
        "Backend {} | intra-op threads: {} | inter-op threads: {} | blocktime: {}",
        backend_name(),
        intra,
        inter,
        config.blocktime_label()
    );

    Ok(BackendRuntime {
        config: config.clone(),
        inter_op_pool,
        global_pool_configured,
    })
}
