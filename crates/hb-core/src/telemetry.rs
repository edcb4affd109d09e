//! Host telemetry collection
//!
//! A snapshot is computed fresh on every request, never cached; callers that
//! want staleness control do their own.

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Point-in-time report of host platform, privilege, and resource facts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Operating system name (e.g. "linux", "macos", "windows")
    pub platform: String,
    /// Whether this process runs with elevated privileges
    pub is_admin: bool,
    /// Hostname of the machine
    pub hostname: String,
    /// CPU architecture (e.g. "x86_64", "aarch64")
    pub arch: String,
    /// Total physical memory in bytes
    pub memory_total: u64,
}

impl TelemetrySnapshot {
    /// Collect a fresh snapshot
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        Self {
            platform: std::env::consts::OS.to_string(),
            is_admin: is_admin(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            arch: std::env::consts::ARCH.to_string(),
            memory_total: system.total_memory(),
        }
    }
}

/// Check whether the current process has elevated privileges
#[cfg(unix)]
pub fn is_admin() -> bool {
    // Effective uid 0 means root, directly or via setuid/sudo
    unsafe { libc::geteuid() == 0 }
}

/// Check whether the current process has elevated privileges
#[cfg(windows)]
pub fn is_admin() -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token: HANDLE = 0;
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION { TokenIsElevated: 0 };
        let mut returned = 0u32;
        let ok = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        );
        CloseHandle(token);

        ok != 0 && elevation.TokenIsElevated != 0
    }
}
