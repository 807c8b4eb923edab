//! Utility functions for descriptor plumbing

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{access, dup2, AccessFlags};
use std::os::unix::io::RawFd;
use std::path::Path;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Set or clear the close-on-exec flag on a descriptor
pub fn set_cloexec(fd: RawFd, enable: bool) -> nix::Result<()> {
    let current = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    let updated = if enable {
        current | FdFlag::FD_CLOEXEC
    } else {
        current - FdFlag::FD_CLOEXEC
    };

    if updated != current {
        fcntl(fd, FcntlArg::F_SETFD(updated))?;
    }
    Ok(())
}

/// Check whether a descriptor has close-on-exec set
pub fn is_cloexec(fd: RawFd) -> nix::Result<bool> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    Ok(flags.contains(FdFlag::FD_CLOEXEC))
}

/// Put a descriptor into non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    Ok(())
}

/// Make `target` refer to the same open file as `fd`, and let it survive exec.
///
/// `target` does not need to be open beforehand. When both numbers are the
/// same only the close-on-exec flag is cleared.
pub fn dup_onto(fd: RawFd, target: RawFd) -> nix::Result<()> {
    if fd != target {
        loop {
            match dup2(fd, target) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
    }

    set_cloexec(target, false)
}

/// Resolve a program name to an absolute path using PATH semantics.
///
/// Names containing a `/` are returned as given.
pub fn resolve_program_path(
    program: &str,
    env: &[(String, String)],
) -> std::result::Result<String, String> {
    if program.contains('/') {
        return Ok(program.to_string());
    }

    let path_value = env
        .iter()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| value.as_str())
        .unwrap_or(DEFAULT_PATH);

    for entry in path_value.split(':') {
        let dir = if entry.is_empty() { "." } else { entry };
        let candidate = Path::new(dir).join(program);

        if candidate.is_file() && access(&candidate, AccessFlags::X_OK).is_ok() {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }

    Err(format!("command not found: {}", program))
}

/// Quote a string so a POSIX shell tokenizer reads it back as one word
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | ',' | '+' | '=' | '@')
    }) {
        return s.to_string();
    }

    let escaped = s.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_cloexec_roundtrip() {
        let (read, _write) = pipe().unwrap();
        let fd = read.as_raw_fd();

        set_cloexec(fd, true).unwrap();
        assert!(is_cloexec(fd).unwrap());

        set_cloexec(fd, false).unwrap();
        assert!(!is_cloexec(fd).unwrap());
    }

    #[test]
    fn test_set_nonblocking() {
        let (read, _write) = pipe().unwrap();
        set_nonblocking(read.as_raw_fd()).unwrap();

        let flags = OFlag::from_bits_truncate(fcntl(read.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_dup_onto_self_clears_cloexec() {
        let (read, _write) = pipe().unwrap();
        let fd = read.as_raw_fd();
        set_cloexec(fd, true).unwrap();

        dup_onto(fd, fd).unwrap();
        assert!(!is_cloexec(fd).unwrap());
    }

    #[test]
    fn test_dup_onto_from_unopened_descriptor_is_ebadf() {
        let (_read, write) = pipe().unwrap();
        let target = write.as_raw_fd();

        assert_eq!(dup_onto(100_000, target), Err(Errno::EBADF));
        // The target is left as it was.
        assert!(fcntl(target, FcntlArg::F_GETFD).is_ok());
    }

    #[test]
    fn test_dup_onto_other_descriptor() {
        let (read, _write) = pipe().unwrap();
        let (spare, _spare_write) = pipe().unwrap();

        dup_onto(read.as_raw_fd(), spare.as_raw_fd()).unwrap();
        assert!(!is_cloexec(spare.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_dup_onto_bad_descriptor() {
        assert_eq!(dup_onto(-1, 100), Err(Errno::EBADF));
    }

    #[test]
    fn test_resolve_program_with_slash() {
        assert_eq!(
            resolve_program_path("./local/tool", &[]).unwrap(),
            "./local/tool"
        );
    }

    #[test]
    fn test_resolve_program_on_path() {
        let env = vec![("PATH".to_string(), "/nonexistent:/bin:/usr/bin".to_string())];
        let resolved = resolve_program_path("sh", &env).unwrap();
        assert!(resolved.ends_with("/sh"));
    }

    #[test]
    fn test_resolve_program_missing() {
        let env = vec![("PATH".to_string(), "/nonexistent".to_string())];
        let err = resolve_program_path("definitely-not-a-program", &env).unwrap_err();
        assert!(err.contains("command not found"));
    }

    #[test]
    fn test_shell_escape_plain() {
        assert_eq!(shell_escape("ls"), "ls");
        assert_eq!(shell_escape("/tmp/file.txt"), "/tmp/file.txt");
        assert_eq!(shell_escape("--flag=value"), "--flag=value");
    }

    #[test]
    fn test_shell_escape_quotes_metacharacters() {
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("hello world"), "'hello world'");
        assert_eq!(shell_escape("a;b"), "'a;b'");
        assert_eq!(shell_escape("$HOME"), "'$HOME'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }
}
