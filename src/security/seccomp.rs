//! Seccomp BPF filter that takes networking away from sandboxed code
//!
//! # How BPF Filters Work
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  ┌──────────┐     ┌─────────────┐     ┌──────────────────┐     │
//! │  │ Syscall  │────►│ BPF Program │────►│ Decision         │     │
//! │  │ (socket, │     │ (tiny code  │     │ ALLOW, or EACCES │     │
//! │  │  connect)│     │  in kernel) │     │ for denied calls │     │
//! │  └──────────┘     └─────────────┘     └──────────────────┘     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Unlike an allow-list, this filter lets the interpreter do everything it
//! normally does (mmap, threads, file I/O in its temp dir) and only fails the
//! syscalls that open or use network endpoints. Denied calls return `EACCES`
//! instead of killing the process, so Python surfaces a `PermissionError`
//! and the runner can still report it.

use seccompiler::{
    BpfProgram,    // Vec<sock_filter> - the compiled bytecode
    SeccompAction, // What to do: Allow, Errno, ...
    SeccompFilter, // The filter with rules
    SeccompRule,   // A single rule (conditions for a syscall)
    TargetArch,    // CPU architecture (x86_64, aarch64)
};
use std::convert::TryInto;
use std::io;

// ═══════════════════════════════════════════════════════════════════════════
// NetworkSeccomp
// ═══════════════════════════════════════════════════════════════════════════
// WHAT IT IS:
//   A builder for a deny-list filter. Every listed syscall fails with
//   EACCES; everything else is allowed.
//
// USAGE:
//   Build in the parent (allocation), apply in the child between fork and
//   exec via Command::pre_exec. The filter survives exec.
// ═══════════════════════════════════════════════════════════════════════════

pub struct NetworkSeccomp {
    /// Syscall numbers that fail with EACCES
    denied_syscalls: Vec<i64>,
}

impl NetworkSeccomp {
    /// Empty filter (allows everything)
    pub fn new() -> Self {
        Self {
            denied_syscalls: Vec::new(),
        }
    }

    /// Deny socket creation and use, plus process-debugging escapes
    pub fn with_network_denied() -> Self {
        let mut filter = Self::new();

        // ─────────────────────────────────────────────────────────────────
        // Sockets - create, connect, accept, send
        // ─────────────────────────────────────────────────────────────────
        filter.deny(libc::SYS_socket);
        filter.deny(libc::SYS_socketpair);
        filter.deny(libc::SYS_connect);
        filter.deny(libc::SYS_bind);
        filter.deny(libc::SYS_listen);
        filter.deny(libc::SYS_accept);
        filter.deny(libc::SYS_accept4);
        filter.deny(libc::SYS_sendto);
        filter.deny(libc::SYS_sendmsg);
        filter.deny(libc::SYS_sendmmsg);
        filter.deny(libc::SYS_recvfrom);
        filter.deny(libc::SYS_recvmsg);
        filter.deny(libc::SYS_recvmmsg);

        // ─────────────────────────────────────────────────────────────────
        // Escapes - tracing other processes, namespaces, mounts
        // ─────────────────────────────────────────────────────────────────
        filter.deny(libc::SYS_ptrace);
        filter.deny(libc::SYS_process_vm_readv);
        filter.deny(libc::SYS_process_vm_writev);
        filter.deny(libc::SYS_unshare);
        filter.deny(libc::SYS_setns);
        filter.deny(libc::SYS_mount);
        filter.deny(libc::SYS_umount2);

        filter
    }

    pub fn deny(&mut self, syscall: i64) -> &mut Self {
        if !self.denied_syscalls.contains(&syscall) {
            self.denied_syscalls.push(syscall);
        }
        self
    }

    pub fn denied_count(&self) -> usize {
        self.denied_syscalls.len()
    }

    /// Compile into BPF bytecode for the running architecture
    ///
    /// ```text
    /// SeccompFilter
    ///   mismatch_action: Allow          (anything not listed)
    ///   match_action:    Errno(EACCES)  (listed syscalls)
    ///   rules:
    ///     socket  → [] (empty = always matches)
    ///     connect → []
    ///     ...
    /// ```
    pub fn build(&self) -> Result<BpfProgram, io::Error> {
        let rules: Vec<(i64, Vec<SeccompRule>)> = self
            .denied_syscalls
            .iter()
            .map(|&syscall| (syscall, vec![]))
            .collect();

        let arch: TargetArch = std::env::consts::ARCH
            .try_into()
            .map_err(|e: seccompiler::BackendError| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let filter = SeccompFilter::new(
            rules.into_iter().collect(),
            SeccompAction::Allow,
            SeccompAction::Errno(libc::EACCES as u32),
            arch,
        )
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        filter
            .try_into()
            .map_err(|e: seccompiler::BackendError| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    /// Install a compiled program on the calling thread
    ///
    /// Irreversible. Meant for the forked child right before exec.
    pub fn apply_program(program: &BpfProgram) -> Result<(), io::Error> {
        seccompiler::apply_filter(program).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

impl Default for NetworkSeccomp {
    fn default() -> Self {
        Self::with_network_denied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_network_filter() {
        let filter = NetworkSeccomp::with_network_denied();
        let result = filter.build();
        assert!(result.is_ok(), "Failed to build filter: {:?}", result.err());
    }

    #[test]
    fn test_deny_is_idempotent() {
        let mut filter = NetworkSeccomp::new();
        filter.deny(libc::SYS_socket).deny(libc::SYS_socket).deny(libc::SYS_connect);
        assert_eq!(filter.denied_count(), 2);
    }

    #[test]
    fn test_default_denies_sockets() {
        let filter = NetworkSeccomp::default();
        assert!(filter.denied_syscalls.contains(&libc::SYS_socket));
        assert!(filter.denied_syscalls.contains(&libc::SYS_connect));
    }
}
