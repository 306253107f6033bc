//! Running process enumeration
//!
//! Produces the set of executable file names currently running. Names keep
//! their extension (`eldenring.exe`) so they match the configured game list.

use std::collections::HashMap;

/// Running executables keyed by lowercased name, mapped to the name as seen
pub type ProcessSnapshot = HashMap<String, String>;

/// Snapshot of every running executable
pub fn snapshot() -> ProcessSnapshot {
    let mut processes = ProcessSnapshot::new();
    for name in list_executables() {
        insert(&mut processes, &name);
    }
    processes
}

/// Add one executable path or name to a snapshot
pub fn insert(snapshot: &mut ProcessSnapshot, executable: &str) {
    let name = executable_file_name(executable);
    if name.is_empty() {
        return;
    }
    snapshot
        .entry(name.to_lowercase())
        .or_insert_with(|| name.to_string());
}

/// Last path component, accepting both separator styles
pub fn executable_file_name(executable: &str) -> &str {
    executable
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
}

#[cfg(target_os = "linux")]
fn list_executables() -> Vec<String> {
    use std::fs;
    use std::path::Path;

    let Ok(entries) = fs::read_dir(Path::new("/proc")) else {
        return Vec::new();
    };

    let mut names = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_pid = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.parse::<u32>().is_ok())
            .unwrap_or(false);
        if !is_pid {
            continue;
        }

        // comm is truncated to 15 bytes; argv[0] carries the full name,
        // including Windows paths for games run through Wine/Proton
        let from_cmdline = fs::read(path.join("cmdline")).ok().and_then(|raw| {
            raw.split(|b| *b == 0)
                .next()
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
        });
        match from_cmdline {
            Some(argv0) => names.push(argv0),
            None => {
                if let Ok(comm) = fs::read_to_string(path.join("comm")) {
                    names.push(comm.trim().to_string());
                }
            }
        }
    }
    names
}

#[cfg(target_os = "macos")]
fn list_executables() -> Vec<String> {
    use std::process::Command;

    let output = match Command::new("ps").args(["-axo", "comm="]).output() {
        Ok(output) if output.status.success() => output,
        _ => return Vec::new(),
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(target_os = "windows")]
fn list_executables() -> Vec<String> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;

    #[repr(C)]
    struct ProcessEntry32W {
        dw_size: u32,
        cnt_usage: u32,
        th32_process_id: u32,
        th32_default_heap_id: usize,
        th32_module_id: u32,
        cnt_threads: u32,
        th32_parent_process_id: u32,
        pc_pri_class_base: i32,
        dw_flags: u32,
        sz_exe_file: [u16; 260],
    }

    #[link(name = "kernel32")]
    extern "system" {
        fn CreateToolhelp32Snapshot(flags: u32, pid: u32) -> *mut std::ffi::c_void;
        fn Process32FirstW(snapshot: *mut std::ffi::c_void, entry: *mut ProcessEntry32W) -> i32;
        fn Process32NextW(snapshot: *mut std::ffi::c_void, entry: *mut ProcessEntry32W) -> i32;
        fn CloseHandle(handle: *mut std::ffi::c_void) -> i32;
    }

    const TH32CS_SNAPPROCESS: u32 = 0x00000002;
    const INVALID_HANDLE_VALUE: *mut std::ffi::c_void = -1isize as *mut std::ffi::c_void;

    let mut names = Vec::new();

    // SAFETY: the entry is zero-initialised with its size set as the API
    // requires, and the snapshot handle is closed before returning.
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0);
        if snapshot == INVALID_HANDLE_VALUE {
            return names;
        }

        let mut entry: ProcessEntry32W = std::mem::zeroed();
        entry.dw_size = std::mem::size_of::<ProcessEntry32W>() as u32;

        if Process32FirstW(snapshot, &mut entry) != 0 {
            loop {
                let len = entry
                    .sz_exe_file
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(entry.sz_exe_file.len());
                names.push(
                    OsString::from_wide(&entry.sz_exe_file[..len])
                        .to_string_lossy()
                        .into_owned(),
                );

                if Process32NextW(snapshot, &mut entry) == 0 {
                    break;
                }
            }
        }

        CloseHandle(snapshot);
    }

    names
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn list_executables() -> Vec<String> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_from_any_path_style() {
        assert_eq!(executable_file_name("C:\\Games\\Hades.exe"), "Hades.exe");
        assert_eq!(executable_file_name("/usr/bin/factorio"), "factorio");
        assert_eq!(executable_file_name(" steam "), "steam");
        assert_eq!(executable_file_name("dir/"), "");
    }

    #[test]
    fn snapshot_keys_are_case_insensitive() {
        let mut snapshot = ProcessSnapshot::new();
        insert(&mut snapshot, "Z:\\games\\EldenRing.exe");
        insert(&mut snapshot, "eldenring.EXE");
        insert(&mut snapshot, "");

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["eldenring.exe"], "EldenRing.exe");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn current_process_is_listed() {
        let own = std::env::current_exe().unwrap();
        let name = own.file_name().unwrap().to_string_lossy().to_lowercase();
        assert!(snapshot().contains_key(&name));
    }
}
