// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Deterministic derivation of OS object names from a base name plus a role
// suffix, and the POSIX-safe name mapping. Every process that wants to
// interoperate on a named resource must reproduce these derivations exactly.

/// Header region of a shared segment: `<base>_h`.
pub fn header_name(base: &str) -> String {
    format!("{base}_h")
}

/// Data region of a ring queue: `<base>_b`.
pub fn buffer_name(base: &str) -> String {
    format!("{base}_b")
}

/// Mutual-exclusion semaphore of a shared segment: `<base>_s`.
pub fn mutex_name(base: &str) -> String {
    format!("{base}_s")
}

/// Data-availability semaphore: `<base>_sc`.
pub fn data_sem_name(base: &str) -> String {
    format!("{base}_sc")
}

/// Base name for a ring queue's own synchronization objects, so that the
/// queue mutex is `<queue>_allqs` and its data semaphore `<queue>_allqsc`.
pub fn queue_sync_base(queue: &str) -> String {
    format!("{queue}_allq")
}

/// Base name of the condition variable nested inside a ring queue:
/// `<queue>_c_v`. Its waiter-slot semaphores are `<queue>_c_v_s_0..7`.
pub fn cond_base(queue: &str) -> String {
    format!("{queue}_c_v")
}

/// Waiter-slot semaphore `i` of a condition variable: `<cond>_s_<i>`.
pub fn cond_slot_name(cond: &str, i: usize) -> String {
    format!("{cond}_s_{i}")
}

/// Paired mutex semaphore of the write-backpressure condition: `<queue>_cv_wc`.
pub fn write_cond_mutex_name(queue: &str) -> String {
    format!("{queue}_cv_wc")
}

/// Path of the per-name bootstrap lock file, inside the system temp dir.
/// Path separators in the base name are flattened so the name cannot escape
/// the directory.
pub fn lock_file_path(base: &str) -> std::path::PathBuf {
    let flat: String = base
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    std::env::temp_dir().join(format!("{flat}.lck"))
}

/// FNV-1a 64-bit hash, used to shorten over-long POSIX names.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Convert a 64-bit value to a fixed-width 16-char lowercase hex string.
fn to_hex(val: u64) -> [u8; 16] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut buf = [0u8; 16];
    let mut v = val;
    for i in (0..16).rev() {
        buf[i] = DIGITS[(v & 0xf) as usize];
        v >>= 4;
    }
    buf
}

/// Maximum length for POSIX object names. Set to 0 to disable truncation.
///
/// On macOS `PSHMNAMLEN` is 31. On Linux the limit is typically 255.
#[cfg(target_os = "macos")]
pub const IPC_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const IPC_NAME_MAX: usize = 0; // 0 = no truncation

/// Produce a POSIX-safe object name (with leading '/').
///
/// When `IPC_NAME_MAX > 0`, names whose POSIX form (including the leading
/// '/') would exceed that limit are shortened to
///     `/<prefix>_<16-hex-FNV-1a-hash>`
/// where `<prefix>` is a truncated portion of the original name for
/// debuggability. Windows uses the flat name unchanged and never calls this.
pub fn make_ipc_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if IPC_NAME_MAX == 0 {
        return result;
    }

    if result.len() <= IPC_NAME_MAX {
        return result;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = if IPC_NAME_MAX > HASH_SUFFIX_LEN + 1 {
        IPC_NAME_MAX - HASH_SUFFIX_LEN - 1 // -1 for leading '/'
    } else {
        0
    };

    let hash = fnv1a_64(result.as_bytes());
    let hex = to_hex(hash);
    let hex_str = std::str::from_utf8(&hex).unwrap();

    let mut shortened = String::with_capacity(IPC_NAME_MAX);
    shortened.push('/');
    if prefix_len > 0 {
        // Skip the leading '/' of the original, take prefix_len bytes
        let original_body = &result[1..];
        let take = prefix_len.min(original_body.len());
        shortened.push_str(&original_body[..take]);
    }
    shortened.push('_');
    shortened.push_str(hex_str);
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_suffixes() {
        assert_eq!(header_name("q1"), "q1_h");
        assert_eq!(buffer_name("q1"), "q1_b");
        assert_eq!(mutex_name("q1"), "q1_s");
        assert_eq!(data_sem_name("q1"), "q1_sc");
    }

    #[test]
    fn queue_wire_names() {
        // The full derivation an external process must reproduce.
        let sync = queue_sync_base("X");
        assert_eq!(mutex_name(&sync), "X_allqs");
        assert_eq!(data_sem_name(&sync), "X_allqsc");

        let cond = cond_base("X");
        assert_eq!(header_name(&cond), "X_c_v_h");
        assert_eq!(mutex_name(&cond), "X_c_v_s");
        assert_eq!(cond_slot_name(&cond, 0), "X_c_v_s_0");
        assert_eq!(cond_slot_name(&cond, 7), "X_c_v_s_7");

        assert_eq!(write_cond_mutex_name("X"), "X_cv_wc");
    }

    #[test]
    fn lock_file_path_flattens_separators() {
        let p = lock_file_path("a/b\\c");
        let file = p.file_name().unwrap().to_str().unwrap();
        assert_eq!(file, "a_b_c.lck");
    }

    #[test]
    fn fnv1a_known_value() {
        // FNV-1a of empty string
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
    }

    #[test]
    fn make_ipc_name_prepends_slash() {
        let name = make_ipc_name("foo");
        assert!(name.starts_with('/'));
        assert!(name.contains("foo"));
    }

    #[test]
    fn make_ipc_name_keeps_existing_slash() {
        let name = make_ipc_name("/bar");
        assert_eq!(&name[..4], "/bar");
    }

    #[test]
    fn to_hex_roundtrip() {
        let hex = to_hex(0x0123456789abcdef);
        assert_eq!(&hex, b"0123456789abcdef");
    }
}
