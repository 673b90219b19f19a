//! Process-wide kernel dispatch table.
//!
//! CPU feature detection runs once, lazily, the first time a kernel is
//! needed, and the resulting [`KernelDispatch`] is cached for the life of the
//! process. This is the one piece of global mutable state in the crate; every
//! other type here is plain data passed explicitly by the caller.

use std::sync::OnceLock;

/// The SIMD instruction set family a kernel implementation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformTag {
    /// x86_64 with AVX2 and FMA.
    Avx2,
    /// aarch64 with NEON (baseline on all accepted targets).
    Neon,
    /// No SIMD extensions detected; portable scalar loops.
    Scalar,
}

/// Resolved kernel routing for the current process.
#[derive(Debug, Clone, Copy)]
pub struct KernelDispatch {
    platform: PlatformTag,
}

impl KernelDispatch {
    /// Which SIMD family GEMM and the elementwise primitives should use.
    pub fn platform(&self) -> PlatformTag {
        self.platform
    }

    fn detect() -> Self {
        let platform = detect_platform();
        log::debug!("smallmind-kernels: dispatching to {platform:?} kernels");
        Self { platform }
    }
}

fn detect_platform() -> PlatformTag {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return PlatformTag::Avx2;
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        if std::arch::is_aarch64_feature_detected!("neon") {
            return PlatformTag::Neon;
        }
    }
    PlatformTag::Scalar
}

static DISPATCH: OnceLock<KernelDispatch> = OnceLock::new();

/// The process-wide kernel dispatch table, initialized on first use.
pub fn dispatch() -> KernelDispatch {
    *DISPATCH.get_or_init(KernelDispatch::detect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_is_stable_across_calls() {
        let a = dispatch();
        let b = dispatch();
        assert_eq!(a.platform(), b.platform());
    }
}
