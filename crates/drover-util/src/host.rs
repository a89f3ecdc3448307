//! Facts about the host and its processes: proportional-set-size of a
//! process tree, our own footprint, accumulated child rusage, hostname, and
//! the IP a server should use to reach us.

use anyhow::{anyhow, Context as _, Result};
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::IpAddr;
use std::time::Duration;

/// Assumed runner footprint in MiB when the probe fails.
pub const DEFAULT_SELF_MEMORY_MIB: u64 = 10;

/// Current memory usage of `pid` and all of its descendants, in MiB, based
/// on proportional set size so shared pages are not multiply counted.
pub fn current_memory(pid: u32) -> Result<u64> {
    let mut total_kib = 0;
    for p in process_tree(pid)? {
        if let Some(kib) = pss_kib(p) {
            total_kib += kib;
        }
    }
    Ok(total_kib / 1024)
}

/// This process's resident set size in MiB, floored at
/// [`DEFAULT_SELF_MEMORY_MIB`] when `/proc` is unreadable.
pub fn self_memory() -> u64 {
    status_vm_rss_kib(std::process::id())
        .map(|kib| kib / 1024)
        .unwrap_or(DEFAULT_SELF_MEMORY_MIB)
}

/// `pid` plus every transitive child found in the process table.
fn process_tree(pid: u32) -> Result<Vec<u32>> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in std::fs::read_dir("/proc").context("could not read /proc")? {
        let entry = entry?;
        let Some(p) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(ppid) = stat_ppid(p) {
            children.entry(ppid).or_default().push(p);
        }
    }
    let mut tree = vec![pid];
    let mut i = 0;
    while i < tree.len() {
        if let Some(kids) = children.get(&tree[i]) {
            tree.extend(kids);
        }
        i += 1;
    }
    Ok(tree)
}

fn stat_ppid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // the comm field is parenthesized and may itself contain spaces
    let after_comm = stat.get(stat.rfind(')')? + 1..)?;
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

/// PSS of a single process in KiB, via `smaps_rollup`, then `smaps`, then
/// RSS as a last resort.
fn pss_kib(pid: u32) -> Option<u64> {
    if let Ok(rollup) = std::fs::read_to_string(format!("/proc/{pid}/smaps_rollup")) {
        return field_kib(&rollup, "Pss:");
    }
    if let Ok(smaps) = std::fs::read_to_string(format!("/proc/{pid}/smaps")) {
        let total = smaps
            .lines()
            .filter(|line| line.starts_with("Pss:"))
            .filter_map(|line| line.split_whitespace().nth(1)?.parse::<u64>().ok())
            .sum();
        return Some(total);
    }
    status_vm_rss_kib(pid)
}

fn status_vm_rss_kib(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    field_kib(&status, "VmRSS:")
}

fn field_kib(table: &str, field: &str) -> Option<u64> {
    table
        .lines()
        .find(|line| line.starts_with(field))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn rusage_children() -> Result<libc::rusage> {
    let mut ru = MaybeUninit::<libc::rusage>::zeroed();
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, ru.as_mut_ptr()) };
    if rc != 0 {
        return Err(anyhow!("getrusage failed: {}", std::io::Error::last_os_error()));
    }
    Ok(unsafe { ru.assume_init() })
}

/// Total user+system CPU time of all reaped children.
pub fn children_cpu_time() -> Duration {
    match rusage_children() {
        Ok(ru) => {
            Duration::new(
                (ru.ru_utime.tv_sec + ru.ru_stime.tv_sec) as u64,
                ((ru.ru_utime.tv_usec + ru.ru_stime.tv_usec) * 1000) as u32,
            )
        }
        Err(_) => Duration::ZERO,
    }
}

/// Largest resident set of any reaped child, in MiB. maxrss is KiB on Linux
/// but bytes on macOS.
pub fn children_max_rss_mib() -> u64 {
    let Ok(ru) = rusage_children() else {
        return 0;
    };
    let maxrss = ru.ru_maxrss as u64;
    if cfg!(target_os = "macos") {
        maxrss / (1024 * 1024)
    } else {
        maxrss / 1024
    }
}

/// Send SIGKILL to a process. Errors (already-gone targets included) are
/// deliberately ignored; the caller observes the outcome via wait.
pub fn kill_process(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

pub fn hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "localhost".to_string())
}

/// The first non-loopback IPv4 bound to a live interface, preferring
/// addresses that start with `prefer` when it is non-empty.
pub fn current_ip(prefer: &str) -> Option<IpAddr> {
    let ifas = local_ip_address::list_afinet_netifas().ok()?;
    ifas.into_iter()
        .map(|(_, ip)| ip)
        .filter(|ip| matches!(ip, IpAddr::V4(v4) if !v4.is_loopback()))
        .find(|ip| prefer.is_empty() || ip.to_string().starts_with(prefer))
}

/// Right-biased merge of environment variable lists: a `NAME=value` in
/// `overrides` replaces any same-named entry in `env`.
pub fn env_override(env: &[String], overrides: &[String]) -> Vec<String> {
    let mut merged = env.to_vec();
    for over in overrides {
        let name = over.split('=').next().unwrap_or(over);
        let prefix = format!("{name}=");
        match merged.iter_mut().find(|v| v.starts_with(&prefix)) {
            Some(existing) => *existing = over.clone(),
            None => merged.push(over.clone()),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_is_right_biased() {
        let env = vec!["HOME=/home/a".to_string(), "PATH=/bin".to_string()];
        let merged = env_override(
            &env,
            &["HOME=/job/cwd".to_string(), "TMPDIR=/job/tmp".to_string()],
        );
        assert_eq!(
            merged,
            vec![
                "HOME=/job/cwd".to_string(),
                "PATH=/bin".to_string(),
                "TMPDIR=/job/tmp".to_string(),
            ]
        );
    }

    #[test]
    fn env_override_with_no_overrides_is_identity() {
        let env = vec!["A=1".to_string()];
        assert_eq!(env_override(&env, &[]), env);
    }

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn current_memory_sees_this_process() {
        let mib = current_memory(std::process::id()).unwrap();
        assert!(mib > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_tree_includes_spawned_child() {
        let mut child = std::process::Command::new("sleep").arg("2").spawn().unwrap();
        let tree = process_tree(std::process::id()).unwrap();
        assert!(tree.contains(&child.id()));
        child.kill().ok();
        child.wait().ok();
    }

    #[test]
    fn children_rusage_after_a_child_ran() {
        std::process::Command::new("sh")
            .args(["-c", ":"])
            .status()
            .unwrap();
        assert!(children_max_rss_mib() > 0);
    }
}
