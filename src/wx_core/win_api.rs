use std::ffi::c_void;
use std::path::PathBuf;

use windows_sys::Win32::{
    Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE},
    System::Diagnostics::Debug::ReadProcessMemory,
    System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Process32FirstW, Process32NextW,
        MODULEENTRY32W, PROCESSENTRY32W, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
        TH32CS_SNAPPROCESS,
    },
    System::Memory::{VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_PRIVATE,
        PAGE_READWRITE},
    System::Threading::{
        IsWow64Process, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    },
};

use crate::wx_core::utils::{WxCoreError, WxCoreResult};

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
}

/// Lists all running processes.
pub fn list_processes() -> WxCoreResult<Vec<ProcessInfo>> {
    let snapshot: HANDLE = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        return Err(WxCoreError::ProcessOpenFailed {
            pid: 0,
            reason: format!("toolhelp snapshot: {}", std::io::Error::last_os_error()),
        });
    }

    let mut processes = Vec::new();
    let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;

    if unsafe { Process32FirstW(snapshot, &mut entry) } == 0 {
        unsafe { CloseHandle(snapshot) };
        return Err(WxCoreError::ProcessOpenFailed {
            pid: 0,
            reason: format!("Process32FirstW: {}", std::io::Error::last_os_error()),
        });
    }

    loop {
        let name = String::from_utf16_lossy(&entry.szExeFile)
            .trim_end_matches('\0')
            .to_string();
        processes.push(ProcessInfo {
            pid: entry.th32ProcessID,
            parent_pid: entry.th32ParentProcessID,
            name,
        });
        if unsafe { Process32NextW(snapshot, &mut entry) } == 0 {
            break;
        }
    }

    unsafe { CloseHandle(snapshot) };
    Ok(processes)
}

/// Process handle with read + query-information rights, released on drop.
/// Workers share one handle per scan; concurrent ReadProcessMemory on it
/// is safe.
pub struct ProcessHandle {
    handle: HANDLE,
    pid: u32,
}

unsafe impl Send for ProcessHandle {}
unsafe impl Sync for ProcessHandle {}

impl ProcessHandle {
    pub fn open(pid: u32) -> WxCoreResult<Self> {
        let handle =
            unsafe { OpenProcess(PROCESS_VM_READ | PROCESS_QUERY_INFORMATION, 0, pid) };
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            return Err(WxCoreError::ProcessOpenFailed {
                pid,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(Self { handle, pid })
    }

    /// Reads `size` bytes at `address`, truncated to what the OS actually
    /// delivered.
    pub fn read_memory(&self, address: u64, size: usize) -> WxCoreResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; size];
        let mut bytes_read: usize = 0;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                size,
                &mut bytes_read,
            )
        };
        if ok == 0 {
            return Err(WxCoreError::MemoryReadFailed { address, size });
        }
        buffer.truncate(bytes_read);
        Ok(buffer)
    }

    /// Reads exactly `N` bytes or fails.
    pub fn read_exact<const N: usize>(&self, address: u64) -> WxCoreResult<[u8; N]> {
        let bytes = self.read_memory(address, N)?;
        bytes
            .try_into()
            .map_err(|_| WxCoreError::MemoryReadFailed { address, size: N })
    }

    /// Memory-info query for the region containing `address`, or None
    /// once the address space is exhausted.
    pub fn virtual_query(&self, address: u64) -> Option<RegionInfo> {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let len = unsafe {
            VirtualQueryEx(
                self.handle,
                address as *const c_void,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if len == 0 {
            return None;
        }
        Some(RegionInfo {
            base: info.BaseAddress as u64,
            size: info.RegionSize as u64,
            committed: info.State == MEM_COMMIT,
            read_write: info.Protect & PAGE_READWRITE != 0,
            private: info.Type == MEM_PRIVATE,
        })
    }

    /// Pointer width of the target process, in bytes.
    pub fn pointer_size(&self) -> WxCoreResult<usize> {
        let mut is_wow64: i32 = 0;
        let ok = unsafe { IsWow64Process(self.handle, &mut is_wow64) };
        if ok == 0 {
            return Err(WxCoreError::ProcessOpenFailed {
                pid: self.pid,
                reason: format!("IsWow64Process: {}", std::io::Error::last_os_error()),
            });
        }
        if is_wow64 != 0 {
            Ok(4)
        } else {
            Ok(std::mem::size_of::<usize>())
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

/// One entry from the target's virtual-memory map.
#[derive(Debug, Clone, Copy)]
pub struct RegionInfo {
    pub base: u64,
    pub size: u64,
    pub committed: bool,
    pub read_write: bool,
    pub private: bool,
}

/// Gets the executable path for a given process ID.
pub fn get_process_exe_path(pid: u32) -> WxCoreResult<String> {
    const MAX_PATH_LEN: usize = 1024;
    let mut exe_path: Vec<u16> = vec![0; MAX_PATH_LEN];

    let handle =
        unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, 0, pid) };
    if handle.is_null() || handle == INVALID_HANDLE_VALUE {
        return Err(WxCoreError::ProcessOpenFailed {
            pid,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }

    let copied = unsafe {
        windows_sys::Win32::System::ProcessStatus::K32GetModuleFileNameExW(
            handle,
            std::ptr::null_mut(),
            exe_path.as_mut_ptr(),
            MAX_PATH_LEN as u32,
        )
    };
    unsafe { CloseHandle(handle) };

    if copied == 0 {
        return Err(WxCoreError::ProcessOpenFailed {
            pid,
            reason: format!("K32GetModuleFileNameExW: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(String::from_utf16_lossy(&exe_path[..copied as usize]))
}

#[allow(non_snake_case)]
#[repr(C)]
struct VS_FIXEDFILEINFO {
    dwSignature: u32,
    dwStrucVersion: u32,
    dwFileVersionMS: u32,
    dwFileVersionLS: u32,
    dwProductVersionMS: u32,
    dwProductVersionLS: u32,
    dwFileFlagsMask: u32,
    dwFileFlags: u32,
    dwFileOS: u32,
    dwFileType: u32,
    dwFileSubtype: u32,
    dwFileDateMS: u32,
    dwFileDateLS: u32,
}

/// Full `a.b.c.d` version string of an executable.
pub fn get_file_version_info(exe_path: &str) -> WxCoreResult<String> {
    let mut wide_path: Vec<u16> = exe_path.encode_utf16().chain(std::iter::once(0)).collect();
    let mut dummy: u32 = 0;

    let size = unsafe {
        windows_sys::Win32::Storage::FileSystem::GetFileVersionInfoSizeW(
            wide_path.as_mut_ptr(),
            &mut dummy,
        )
    };
    if size == 0 {
        return Err(WxCoreError::InvalidPath(format!(
            "no version info in [{}]: {}",
            exe_path,
            std::io::Error::last_os_error()
        )));
    }

    let mut buffer: Vec<u8> = vec![0; size as usize];
    let ok = unsafe {
        windows_sys::Win32::Storage::FileSystem::GetFileVersionInfoW(
            wide_path.as_mut_ptr(),
            0,
            size,
            buffer.as_mut_ptr() as *mut c_void,
        )
    };
    if ok == 0 {
        return Err(WxCoreError::InvalidPath(format!(
            "GetFileVersionInfoW failed for [{}]: {}",
            exe_path,
            std::io::Error::last_os_error()
        )));
    }

    let mut info_ptr: *mut VS_FIXEDFILEINFO = std::ptr::null_mut();
    let mut len: u32 = 0;
    let root: Vec<u16> = "\\".encode_utf16().chain(std::iter::once(0)).collect();
    let ok = unsafe {
        windows_sys::Win32::Storage::FileSystem::VerQueryValueW(
            buffer.as_ptr() as *const c_void,
            root.as_ptr(),
            &mut info_ptr as *mut _ as *mut *mut c_void,
            &mut len,
        )
    };
    if ok == 0 || info_ptr.is_null() || len == 0 {
        return Err(WxCoreError::InvalidPath(format!(
            "VS_FIXEDFILEINFO missing in [{}]",
            exe_path
        )));
    }

    let info = unsafe { &*info_ptr };
    if info.dwSignature != 0xFEEF04BD {
        return Err(WxCoreError::InvalidPath(format!(
            "bad VS_FIXEDFILEINFO signature in [{}]",
            exe_path
        )));
    }

    let major = (info.dwFileVersionMS >> 16) & 0xffff;
    let minor = info.dwFileVersionMS & 0xffff;
    let build = (info.dwFileVersionLS >> 16) & 0xffff;
    let patch = info.dwFileVersionLS & 0xffff;
    Ok(format!("{}.{}.{}.{}", major, minor, build, patch))
}

/// Gets the base address of a module loaded in a process, by exact name
/// (case-insensitive).
pub fn get_module_base_address(pid: u32, module_name: &str) -> WxCoreResult<u64> {
    let snapshot = unsafe {
        CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid)
    };
    if snapshot == INVALID_HANDLE_VALUE {
        return Err(WxCoreError::ProcessOpenFailed {
            pid,
            reason: format!("module snapshot: {}", std::io::Error::last_os_error()),
        });
    }

    let mut entry: MODULEENTRY32W = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<MODULEENTRY32W>() as u32;

    if unsafe { Module32FirstW(snapshot, &mut entry) } == 0 {
        unsafe { CloseHandle(snapshot) };
        return Err(WxCoreError::ProcessOpenFailed {
            pid,
            reason: format!("Module32FirstW: {}", std::io::Error::last_os_error()),
        });
    }

    let mut base: Option<u64> = None;
    loop {
        let name = String::from_utf16_lossy(&entry.szModule)
            .trim_end_matches('\0')
            .to_string();
        if name.eq_ignore_ascii_case(module_name) {
            base = Some(entry.modBaseAddr as u64);
            break;
        }
        if unsafe { Module32NextW(snapshot, &mut entry) } == 0 {
            break;
        }
    }
    unsafe { CloseHandle(snapshot) };

    base.ok_or_else(|| {
        WxCoreError::InvalidPath(format!("module '{}' not found in PID {}", module_name, pid))
    })
}

/// Reads a REG_SZ value from HKEY_CURRENT_USER.
pub fn read_registry_sz_value(sub_key_path: &str, value_name: &str) -> WxCoreResult<String> {
    use windows_sys::Win32::System::Registry::{
        RegCloseKey, RegOpenKeyExW, RegQueryValueExW, HKEY, HKEY_CURRENT_USER, KEY_READ, REG_SZ,
    };

    let mut hkey: HKEY = std::ptr::null_mut();
    let wide_sub_key: Vec<u16> = sub_key_path.encode_utf16().chain(std::iter::once(0)).collect();
    let wide_value: Vec<u16> = value_name.encode_utf16().chain(std::iter::once(0)).collect();

    let status = unsafe {
        RegOpenKeyExW(HKEY_CURRENT_USER, wide_sub_key.as_ptr(), 0, KEY_READ, &mut hkey)
    };
    if status != 0 {
        return Err(WxCoreError::InvalidPath(format!(
            "registry key '{}' not readable (code {})",
            sub_key_path, status
        )));
    }

    let mut data_type: u32 = 0;
    let mut buffer_size: u32 = 0;
    let status = unsafe {
        RegQueryValueExW(
            hkey,
            wide_value.as_ptr(),
            std::ptr::null_mut(),
            &mut data_type,
            std::ptr::null_mut(),
            &mut buffer_size,
        )
    };
    if status != 0 || data_type != REG_SZ {
        unsafe { RegCloseKey(hkey) };
        return Err(WxCoreError::InvalidPath(format!(
            "registry value '{}' missing or not REG_SZ",
            value_name
        )));
    }
    if buffer_size == 0 {
        unsafe { RegCloseKey(hkey) };
        return Ok(String::new());
    }

    let mut value: Vec<u16> = vec![0u16; (buffer_size / 2) as usize];
    let mut actual_size = buffer_size;
    let status = unsafe {
        RegQueryValueExW(
            hkey,
            wide_value.as_ptr(),
            std::ptr::null_mut(),
            &mut data_type,
            value.as_mut_ptr() as *mut u8,
            &mut actual_size,
        )
    };
    unsafe { RegCloseKey(hkey) };

    if status != 0 {
        return Err(WxCoreError::InvalidPath(format!(
            "registry value '{}' read failed (code {})",
            value_name, status
        )));
    }

    let len = (actual_size / 2) as usize;
    let end = if len > 0 && value[len - 1] == 0 { len - 1 } else { len };
    Ok(String::from_utf16_lossy(&value[..end]))
}

/// The user's Documents directory, resolved from the profile directory.
pub fn documents_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(|p| PathBuf::from(p).join("Documents"))
}

/// The user's profile directory.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}
