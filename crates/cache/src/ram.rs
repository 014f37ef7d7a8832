//! System RAM queries for the adaptive admission policy.
//!
//! The allocator only ever talks to [`RamProbe`], so the RAM-headroom policy
//! can be exercised in tests with a scripted probe instead of platform calls.

/// Source of total/available physical memory figures.
pub trait RamProbe: Send + Sync {
    /// Total physical RAM in bytes. `0` means the query failed.
    fn total_bytes(&self) -> u64;

    /// RAM currently available for new allocations, in bytes.
    ///
    /// On platforms that transparently compress idle memory the reported
    /// figure is unreliable; the admission policy compares against
    /// [`total_bytes`](Self::total_bytes) there instead.
    fn available_bytes(&self) -> u64;
}

/// Live system memory, queried through the platform APIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRam;

impl RamProbe for SystemRam {
    fn total_bytes(&self) -> u64 {
        platform::total_bytes().unwrap_or(0)
    }

    fn available_bytes(&self) -> u64 {
        platform::available_bytes().unwrap_or(0)
    }
}

/// Extracts `MemTotal` and `MemAvailable` (both in kB) from
/// `/proc/meminfo`-formatted content, returning bytes.
#[cfg(any(target_os = "linux", test))]
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total_kb = parts.next().and_then(|v| v.parse().ok()),
            Some("MemAvailable:") => available_kb = parts.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }

    Some((total_kb? * 1024, available_kb? * 1024))
}

#[cfg(target_os = "linux")]
mod platform {
    use super::parse_meminfo;

    pub fn total_bytes() -> Option<u64> {
        meminfo().map(|(total, _)| total)
    }

    pub fn available_bytes() -> Option<u64> {
        meminfo().map(|(_, available)| available)
    }

    fn meminfo() -> Option<(u64, u64)> {
        parse_meminfo(&std::fs::read_to_string("/proc/meminfo").ok()?)
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use std::ffi::CString;
    use std::ptr;

    pub fn total_bytes() -> Option<u64> {
        sysctl_u64("hw.memsize")
    }

    pub fn available_bytes() -> Option<u64> {
        // Free page count understates what the OS can reclaim, but the
        // compressed-memory admission variant never consults this figure.
        let pages = sysctl_u64("vm.page_free_count")?;
        let page_size = sysctl_u64("hw.pagesize")?;
        pages.checked_mul(page_size)
    }

    fn sysctl_u64(name: &str) -> Option<u64> {
        let key = CString::new(name).ok()?;
        let mut buf = [0u8; 8];
        let mut len: libc::size_t = buf.len();
        let rc = unsafe {
            libc::sysctlbyname(
                key.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
                ptr::null_mut(),
                0,
            )
        };
        if rc != 0 {
            return None;
        }
        match len {
            4 => Some(u32::from_ne_bytes(buf[..4].try_into().ok()?) as u64),
            8 => Some(u64::from_ne_bytes(buf)),
            _ => None,
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod platform {
    pub fn total_bytes() -> Option<u64> {
        None
    }

    pub fn available_bytes() -> Option<u64> {
        None
    }
}
