//! Account database lookups (`getpwnam_r` / `getgrnam_r`).

use std::ffi::{CStr, CString};
use std::io;
use std::path::PathBuf;

use crate::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

const MAX_BUFFER: usize = 1 << 20;

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| AgentError::config(format!("invalid account name {:?}", name)))
}

fn lossy(ptr: *const libc::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: non-null pointers filled in by getpwnam_r/getgrnam_r point at
    // NUL-terminated strings inside our buffer.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Resolve a user name. `Ok(None)` means no such user.
pub fn lookup_user(name: &str) -> Result<Option<Account>> {
    let cname = c_name(name)?;
    let mut buf: Vec<libc::c_char> = vec![0; 4096];
    loop {
        // SAFETY: passwd is plain old data; getpwnam_r fills it in.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf.len() < MAX_BUFFER {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).into());
        }
        if result.is_null() {
            return Ok(None);
        }
        return Ok(Some(Account {
            name: lossy(pwd.pw_name),
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
            home: PathBuf::from(lossy(pwd.pw_dir)),
            shell: PathBuf::from(lossy(pwd.pw_shell)),
        }));
    }
}

/// Resolve a group name. `Ok(None)` means no such group.
pub fn lookup_group(name: &str) -> Result<Option<Group>> {
    let cname = c_name(name)?;
    let mut buf: Vec<libc::c_char> = vec![0; 4096];
    loop {
        // SAFETY: group is plain old data; getgrnam_r fills it in.
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrnam_r(cname.as_ptr(), &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf.len() < MAX_BUFFER {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).into());
        }
        if result.is_null() {
            return Ok(None);
        }
        return Ok(Some(Group {
            name: lossy(grp.gr_name),
            gid: grp.gr_gid,
        }));
    }
}

/// Uid of the running process.
pub fn current_uid() -> u32 {
    // SAFETY: getuid cannot fail.
    unsafe { libc::getuid() }
}
