//! OS username lookup
//!
//! Resolves the effective user's name from the passwd database, falling
//! back to the `USER` environment variable. The name feeds the user-scoped
//! identity hash and the primary's registration in the state block.

use std::ffi::CStr;

/// Get the effective user's name.
///
/// Returns an empty string only when both the passwd database and the
/// environment are unhelpful.
pub fn username() -> String {
    if let Some(name) = passwd_name() {
        if !name.is_empty() {
            return name;
        }
    }

    std::env::var("USER").unwrap_or_default()
}

/// Look up the passwd entry for the effective uid.
fn passwd_name() -> Option<String> {
    // SAFETY: geteuid() is always safe to call
    let uid = unsafe { libc::geteuid() };

    let mut buf = vec![0_u8; 1024];
    // SAFETY: a zeroed passwd is a valid out-parameter for getpwuid_r
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    loop {
        // SAFETY: pwd, buf and result all outlive the call and buf.len()
        // describes the buffer we actually pass
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr().cast::<libc::c_char>(),
                buf.len(),
                &mut result,
            )
        };

        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }

        if rc != 0 || result.is_null() {
            return None;
        }

        // SAFETY: on success pw_name points at a NUL-terminated string in buf
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}
