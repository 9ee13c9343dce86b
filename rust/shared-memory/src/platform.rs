//! Platform-specific helpers

use std::path::PathBuf;

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Get current process ID
    pub fn get_process_id() -> u32 {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                unsafe { libc::getpid() as u32 }
            } else if #[cfg(windows)] {
                unsafe { winapi::um::processthreadsapi::GetCurrentProcessId() }
            } else {
                std::process::id()
            }
        }
    }

    /// Whether the OS offers named shared memory objects
    pub fn supports_named_regions() -> bool {
        cfg!(any(unix, windows))
    }

    /// Location for lock and share files both processes agree on
    pub fn temp_path(file_name: &str) -> PathBuf {
        std::env::temp_dir().join(file_name)
    }

    /// Generate a unique region name.
    ///
    /// Kept short: some systems cap shared memory names at 31 bytes.
    pub fn generate_region_name(prefix: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", prefix, &id[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_utils() {
        assert!(PlatformUtils::get_process_id() > 0);
        assert_eq!(PlatformUtils::get_process_id(), std::process::id());

        let region_name = PlatformUtils::generate_region_name("test");
        assert!(region_name.starts_with("test_"));
        assert_eq!(region_name.len(), "test_".len() + 12);
        assert_ne!(region_name, PlatformUtils::generate_region_name("test"));
    }

    #[test]
    fn test_temp_path() {
        let path = PlatformUtils::temp_path("StudioLink_Lock.lock");
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.ends_with("StudioLink_Lock.lock"));
    }
}
