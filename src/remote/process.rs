//! Live-process implementation of [`MemorySource`].
//!
//! Opens a handle to a target process by executable name or pid, enumerates
//! its loaded modules and memory-mapped files, and performs raw remote reads
//! and writes. The target is a Windows game, so on Linux the process is
//! located through its Wine preloader and the guest executable name is
//! recovered from `argv[0]`.

use std::path::PathBuf;

use log::debug;
use process_memory::{CopyAddress, PutAddress, TryIntoProcessHandle};
use sysinfo::{Pid as SysPid, System};

use super::{MemRange, MemorySource, RemotePtr};
use crate::error::{Error, Result};

/// Info about a loaded module in the remote process.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub base: RemotePtr,
    pub path: PathBuf,
}

/// Info about a file-backed memory mapping in the remote process.
#[derive(Debug, Clone)]
pub struct MappedFileInfo {
    pub range: MemRange,
    pub path: PathBuf,
}

/// An open handle to a remote process.
///
/// The handle is exclusively owned; when the target is detected to have
/// exited (see [`poll_liveness`](Self::poll_liveness)) all OS resources are
/// released eagerly and every later call fails with
/// [`Error::ProcessExited`] until a fresh open.
pub struct RemoteProcess {
    pid: u32,
    handle: Option<process_memory::ProcessHandle>,
    #[cfg(target_os = "windows")]
    query_handle: winapi::um::winnt::HANDLE,
}

impl RemoteProcess {
    /// Opens the first running process whose executable filename matches.
    pub fn open_by_name(process_name: &str) -> Result<Self> {
        let pid = find_pid_by_name(process_name).ok_or(Error::NotFound)?;
        debug!("found '{}' with pid {}", process_name, pid);
        Self::open_by_pid(pid)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Releases the process handle. Idempotent.
    pub fn close(&mut self) {
        self.handle = None;
        #[cfg(target_os = "windows")]
        unsafe {
            if !self.query_handle.is_null() {
                winapi::um::handleapi::CloseHandle(self.query_handle);
                self.query_handle = std::ptr::null_mut();
            }
        }
    }

    /// Asks the OS whether the target still exists. A dead target
    /// invalidates the handle for all future calls.
    pub fn poll_liveness(&mut self) -> bool {
        if self.handle.is_none() {
            return false;
        }
        let mut sys = System::new();
        if !sys.refresh_process(SysPid::from_u32(self.pid)) {
            debug!("target process {} exited, releasing handle", self.pid);
            self.close();
            return false;
        }
        true
    }

    /// Maps a failed OS read/write to the right error class, checking
    /// whether the failure actually means "target gone".
    fn read_write_error(&mut self, err: std::io::Error) -> Error {
        if !self.poll_liveness() {
            return Error::ProcessExited;
        }
        Error::Access(err)
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        self.close();
    }
}

impl MemorySource for RemoteProcess {
    fn read_raw(&mut self, addr: RemotePtr, out: &mut [u8]) -> Result<()> {
        let Some(handle) = self.handle else {
            return Err(Error::ProcessExited);
        };
        if out.is_empty() {
            // Nothing to transfer, but still report a dead target.
            return if self.poll_liveness() {
                Ok(())
            } else {
                Err(Error::ProcessExited)
            };
        }
        match handle.copy_address(addr.0 as usize, out) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.read_write_error(e)),
        }
    }

    fn write_raw(&mut self, addr: RemotePtr, data: &[u8]) -> Result<()> {
        let Some(handle) = self.handle else {
            return Err(Error::ProcessExited);
        };
        if data.is_empty() {
            return if self.poll_liveness() {
                Ok(())
            } else {
                Err(Error::ProcessExited)
            };
        }
        match handle.put_address(addr.0 as usize, data) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.read_write_error(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Linux (Wine guest)
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn find_pid_by_name(process_name: &str) -> Option<u32> {
    let mut sys = System::new_all();
    sys.refresh_all();

    // The game only exists as a Windows build, so look for Wine preloaders
    // and match the guest executable name carried in argv[0].
    sys.processes()
        .iter()
        .find(|(_, process)| {
            let is_preloader = process
                .exe()
                .and_then(|exe| exe.file_name())
                .and_then(|name| name.to_str())
                .is_some_and(|name| name == "wine64-preloader" || name == "wine-preloader");
            if !is_preloader {
                return false;
            }
            process
                .cmd()
                .first()
                .is_some_and(|argv0| guest_exe_name(argv0).eq_ignore_ascii_case(process_name))
        })
        .map(|(pid, _)| pid.as_u32())
}

/// Extracts the guest executable filename from a Wine argv[0], which may be
/// either a Windows or a Unix style path.
#[cfg(target_os = "linux")]
fn guest_exe_name(argv0: &str) -> &str {
    argv0.rsplit(['\\', '/']).next().unwrap_or(argv0)
}

#[cfg(target_os = "linux")]
impl RemoteProcess {
    /// Opens a remote process by pid.
    pub fn open_by_pid(pid: u32) -> Result<Self> {
        // Probe /proc/<pid>/mem with the access the reads and writes will
        // need; process_vm_readv obeys the same ptrace policy, so a denial
        // here is a denial everywhere.
        if let Err(e) = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{}/mem", pid))
        {
            return Err(match e.kind() {
                std::io::ErrorKind::PermissionDenied => Error::NoPrivileges,
                std::io::ErrorKind::NotFound => Error::NotFound,
                _ => Error::Access(e),
            });
        }

        let handle = (pid as process_memory::Pid)
            .try_into_process_handle()
            .map_err(Error::Access)?;
        Ok(RemoteProcess {
            pid,
            handle: Some(handle),
        })
    }

    /// Finds the first loaded module with the given filename. Under Wine a
    /// module base is simply the lowest file-backed mapping of its file.
    pub fn module_info(&mut self, module_name: &str) -> Option<ModuleInfo> {
        let info = self.mapped_file_info(module_name)?;
        Some(ModuleInfo {
            base: RemotePtr(info.range.start),
            path: info.path,
        })
    }

    /// Finds the first memory region backed by a file with the given
    /// filename.
    pub fn mapped_file_info(&mut self, file_name: &str) -> Option<MappedFileInfo> {
        if self.handle.is_none() {
            return None;
        }
        let maps = match std::fs::read_to_string(format!("/proc/{}/maps", self.pid)) {
            Ok(maps) => maps,
            Err(_) => {
                self.poll_liveness();
                return None;
            }
        };
        for line in maps.lines() {
            let Some(entry) = MapsEntry::parse(line) else {
                continue;
            };
            // Only the base mapping of the file is interesting.
            if entry.file_offset != 0 {
                continue;
            }
            let Some(name) = std::path::Path::new(entry.path)
                .file_name()
                .and_then(|name| name.to_str())
            else {
                continue;
            };
            if name.eq_ignore_ascii_case(file_name) {
                return Some(MappedFileInfo {
                    range: MemRange {
                        start: entry.start,
                        end: entry.end,
                    },
                    path: PathBuf::from(entry.path),
                });
            }
        }
        None
    }
}

/// One parsed line of `/proc/<pid>/maps`.
#[cfg(any(target_os = "linux", test))]
#[derive(Debug, PartialEq, Eq)]
struct MapsEntry<'a> {
    start: u64,
    end: u64,
    file_offset: u64,
    path: &'a str,
}

#[cfg(any(target_os = "linux", test))]
impl<'a> MapsEntry<'a> {
    // "start-end perms offset dev inode    path"; the path may contain
    // spaces and is empty for anonymous mappings.
    fn parse(line: &'a str) -> Option<Self> {
        fn field(s: &str) -> Option<(&str, &str)> {
            let s = s.trim_start();
            if s.is_empty() {
                return None;
            }
            match s.find(char::is_whitespace) {
                Some(i) => Some((&s[..i], &s[i..])),
                None => Some((s, "")),
            }
        }

        let (range, rest) = field(line)?;
        let (_perms, rest) = field(rest)?;
        let (offset, rest) = field(rest)?;
        let (_dev, rest) = field(rest)?;
        let (_inode, rest) = field(rest)?;
        let path = rest.trim();

        let (start, end) = range.split_once('-')?;
        Some(MapsEntry {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            file_offset: u64::from_str_radix(offset, 16).ok()?,
            path,
        })
    }
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

#[cfg(target_os = "windows")]
fn find_pid_by_name(process_name: &str) -> Option<u32> {
    let mut sys = System::new_all();
    sys.refresh_all();

    sys.processes()
        .iter()
        .find(|(_, process)| process.name().eq_ignore_ascii_case(process_name))
        .map(|(pid, _)| pid.as_u32())
}

#[cfg(target_os = "windows")]
impl RemoteProcess {
    /// Opens a remote process by pid.
    pub fn open_by_pid(pid: u32) -> Result<Self> {
        use winapi::shared::winerror::{ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER};
        use winapi::um::errhandlingapi::GetLastError;
        use winapi::um::processthreadsapi::OpenProcess;
        use winapi::um::winnt::{PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};

        // A separate query handle backs the module/mapping walks; the
        // read/write handle itself is owned by process-memory.
        let query_handle =
            unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, 0, pid) };
        if query_handle.is_null() {
            return Err(match unsafe { GetLastError() } {
                ERROR_ACCESS_DENIED => Error::NoPrivileges,
                ERROR_INVALID_PARAMETER => Error::NotFound,
                code => Error::Access(std::io::Error::from_raw_os_error(code as i32)),
            });
        }

        let handle = match (pid as process_memory::Pid).try_into_process_handle() {
            Ok(handle) => handle,
            Err(e) => {
                unsafe { winapi::um::handleapi::CloseHandle(query_handle) };
                return Err(match e.kind() {
                    std::io::ErrorKind::PermissionDenied => Error::NoPrivileges,
                    _ => Error::Access(e),
                });
            }
        };
        Ok(RemoteProcess {
            pid,
            handle: Some(handle),
            query_handle,
        })
    }

    /// Finds the first loaded module with the given filename.
    pub fn module_info(&mut self, module_name: &str) -> Option<ModuleInfo> {
        use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
        use winapi::um::tlhelp32::{
            CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W,
            TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
        };

        if self.handle.is_none() {
            return None;
        }
        unsafe {
            let snapshot =
                CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid);
            if snapshot == INVALID_HANDLE_VALUE {
                self.poll_liveness();
                return None;
            }

            let mut entry: MODULEENTRY32W = std::mem::zeroed();
            entry.dwSize = std::mem::size_of::<MODULEENTRY32W>() as u32;
            let mut has_entry = Module32FirstW(snapshot, &mut entry) != 0;
            while has_entry {
                let name = utf16_until_nul(&entry.szModule);
                if name.eq_ignore_ascii_case(module_name) {
                    let path = utf16_until_nul(&entry.szExePath);
                    CloseHandle(snapshot);
                    return Some(ModuleInfo {
                        base: RemotePtr(entry.modBaseAddr as usize as u64),
                        path: PathBuf::from(path),
                    });
                }
                has_entry = Module32NextW(snapshot, &mut entry) != 0;
            }
            CloseHandle(snapshot);
        }
        None
    }

    /// Finds the first committed mapped region backed by a file with the
    /// given filename.
    pub fn mapped_file_info(&mut self, file_name: &str) -> Option<MappedFileInfo> {
        use winapi::shared::minwindef::MAX_PATH;
        use winapi::um::memoryapi::VirtualQueryEx;
        use winapi::um::psapi::GetMappedFileNameW;
        use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
        use winapi::um::winnt::{MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_MAPPED};

        if self.handle.is_none() {
            return None;
        }
        unsafe {
            let mut sysinfo: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut sysinfo);

            let max_addr = sysinfo.lpMaximumApplicationAddress as usize as u64;
            let mut addr = sysinfo.lpMinimumApplicationAddress as usize as u64;
            let mut mbi: MEMORY_BASIC_INFORMATION = std::mem::zeroed();

            while addr < max_addr {
                if VirtualQueryEx(
                    self.query_handle,
                    addr as usize as *const _,
                    &mut mbi,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                ) == 0
                {
                    self.poll_liveness();
                    break;
                }

                if mbi.Type == MEM_MAPPED && mbi.State == MEM_COMMIT {
                    let mut buf = [0u16; MAX_PATH];
                    let len = GetMappedFileNameW(
                        self.query_handle,
                        mbi.BaseAddress,
                        buf.as_mut_ptr(),
                        MAX_PATH as u32,
                    );
                    if len != 0 {
                        let path = String::from_utf16_lossy(&buf[..len as usize]);
                        let base_name = path.rsplit('\\').next().unwrap_or(&path);
                        if base_name.eq_ignore_ascii_case(file_name) {
                            let start = mbi.BaseAddress as usize as u64;
                            return Some(MappedFileInfo {
                                range: MemRange {
                                    start,
                                    end: start + mbi.RegionSize as u64,
                                },
                                path: device_path_to_dos_path(&path),
                            });
                        }
                    }
                }

                addr = mbi.BaseAddress as usize as u64 + mbi.RegionSize as u64;
            }
        }
        None
    }
}

/// GetMappedFileNameW returns device paths ("\Device\HarddiskVolume1\...");
/// translate them back to drive-letter paths so the file can be opened
/// locally. Wine may also hand back an NT path prefix.
#[cfg(target_os = "windows")]
fn device_path_to_dos_path(path: &str) -> PathBuf {
    use winapi::shared::minwindef::MAX_PATH;
    use winapi::um::fileapi::{GetLogicalDrives, QueryDosDeviceW};

    let path = path.strip_prefix("\\??\\").unwrap_or(path);

    // Already a drive-letter path?
    let bytes = path.as_bytes();
    if bytes.len() >= 3 && bytes[1] == b':' && bytes[2] == b'\\' {
        return PathBuf::from(path);
    }

    unsafe {
        let mut drives = GetLogicalDrives();
        let mut letter = b'A';
        while drives != 0 {
            if drives & 1 != 0 {
                let drive: [u16; 3] = [letter as u16, b':' as u16, 0];
                let mut buf = [0u16; MAX_PATH];
                // Docs say QueryDosDeviceW may return multiple strings; only
                // the first (current) mapping matters here.
                if QueryDosDeviceW(drive.as_ptr(), buf.as_mut_ptr(), MAX_PATH as u32) != 0 {
                    let device = utf16_until_nul(&buf);
                    if let Some(rest) = path.strip_prefix(&device) {
                        return PathBuf::from(format!("{}:{}", letter as char, rest));
                    }
                }
            }
            drives >>= 1;
            letter += 1;
        }
    }

    PathBuf::from(path)
}

#[cfg(target_os = "windows")]
fn utf16_until_nul(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}
