//! Listening-socket enumeration through external tools.
//!
//! The daemon never parses kernel tables itself; it shells out to the
//! first of `lsof -i -P -n`, `netstat -tulpn`, `ss -tulpn` that produces
//! parseable LISTEN lines. Fields are taken positionally. Each invocation
//! runs under a hard deadline and is killed when it overruns.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::port::Port;

/// A raw record of one listening socket, as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerInfo {
    /// The listening port.
    pub port: Port,
    /// Owning process id, when the tool reported one.
    pub pid: Option<u32>,
    /// Short process name.
    pub process_name: String,
    /// Full command line when resolvable, otherwise the process name.
    pub command: String,
    /// The owning process's working directory, best effort.
    pub working_dir: Option<PathBuf>,
}

/// Enumerates listeners via the tool fallback chain.
///
/// Returns an empty list when every tool fails or reports nothing; the
/// caller cannot distinguish "no listeners" from "no working tool", which
/// is the intended conservative contract.
#[must_use]
pub fn collect(budget: Duration) -> Vec<ListenerInfo> {
    let attempts: [(&str, &[&str], fn(&str) -> Vec<ListenerInfo>); 3] = [
        ("lsof", &["-i", "-P", "-n"], parse_lsof),
        ("netstat", &["-tulpn"], parse_netstat),
        ("ss", &["-tulpn"], parse_ss),
    ];

    for (tool, args, parser) in attempts {
        if let Some(output) = run_with_deadline(tool, args, budget) {
            let mut listeners = parser(&output);
            if !listeners.is_empty() {
                dedupe_by_port(&mut listeners);
                for info in &mut listeners {
                    if info.working_dir.is_none() {
                        info.working_dir = info.pid.and_then(process_cwd);
                    }
                }
                return listeners;
            }
        }
    }

    Vec::new()
}

/// Runs a command, collecting stdout, killing the child at the deadline.
///
/// Returns `None` on spawn failure, timeout, or unreadable output. A
/// non-zero exit with output is still returned: `lsof` exits 1 when some
/// of its queries matched nothing.
fn run_with_deadline(tool: &str, args: &[&str], budget: Duration) -> Option<String> {
    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    // Drain stdout on a helper thread so a chatty child can't wedge on a
    // full pipe before we observe its exit.
    let mut stdout = child.stdout.take()?;
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buffer = String::new();
        let _ = stdout.read_to_string(&mut buffer);
        let _ = tx.send(buffer);
    });

    let deadline = Instant::now() + budget;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(_) => {
                let _ = child.kill();
                return None;
            }
        }
    }

    rx.recv_timeout(Duration::from_millis(250)).ok()
}

/// `lsof -i -P -n` lines:
/// `node  4242 dev 23u IPv4 0x0 0t0 TCP 127.0.0.1:3000 (LISTEN)`
fn parse_lsof(output: &str) -> Vec<ListenerInfo> {
    output
        .lines()
        .filter(|line| line.contains("(LISTEN)"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 9 {
                return None;
            }
            let port = port_from_addr(fields[8])?;
            Some(ListenerInfo {
                port,
                pid: fields[1].parse().ok(),
                process_name: fields[0].to_string(),
                command: fields[0].to_string(),
                working_dir: None,
            })
        })
        .collect()
}

/// `netstat -tulpn` lines:
/// `tcp  0  0 127.0.0.1:3000  0.0.0.0:*  LISTEN  4242/node`
fn parse_netstat(output: &str) -> Vec<ListenerInfo> {
    output
        .lines()
        .filter(|line| line.split_whitespace().any(|f| f == "LISTEN"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 7 {
                return None;
            }
            let port = port_from_addr(fields[3])?;
            let (pid, name) = match fields[6].split_once('/') {
                Some((pid, name)) => (pid.parse().ok(), name.to_string()),
                None => (None, fields[6].to_string()),
            };
            Some(ListenerInfo {
                port,
                pid,
                process_name: name.clone(),
                command: name,
                working_dir: None,
            })
        })
        .collect()
}

/// `ss -tulpn` lines:
/// `tcp LISTEN 0 128 127.0.0.1:3000 0.0.0.0:* users:(("node",pid=4242,fd=23))`
fn parse_ss(output: &str) -> Vec<ListenerInfo> {
    output
        .lines()
        .filter(|line| line.split_whitespace().any(|f| f == "LISTEN"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            let port = port_from_addr(fields[4])?;
            let users = fields.iter().find(|f| f.starts_with("users:"));
            let (pid, name) = users.map_or((None, String::new()), |f| parse_ss_users(f));
            let name = if name.is_empty() {
                "unknown".to_string()
            } else {
                name
            };
            Some(ListenerInfo {
                port,
                pid,
                process_name: name.clone(),
                command: name,
                working_dir: None,
            })
        })
        .collect()
}

/// Pulls `("name",pid=N,…)` apart without a full parser.
fn parse_ss_users(field: &str) -> (Option<u32>, String) {
    let name = field
        .split('"')
        .nth(1)
        .unwrap_or_default()
        .to_string();
    let pid = field.split("pid=").nth(1).and_then(|rest| {
        rest.chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .ok()
    });
    (pid, name)
}

/// Extracts the port from an `addr:port` field; the address part may
/// itself contain colons (IPv6), so only the suffix after the last colon
/// counts.
fn port_from_addr(addr: &str) -> Option<Port> {
    let raw: u16 = addr.rsplit(':').next()?.parse().ok()?;
    Port::try_from(raw).ok()
}

/// Keeps the first record per port; tools report one line per socket and
/// dual-stack listeners would otherwise appear twice.
fn dedupe_by_port(listeners: &mut Vec<ListenerInfo>) {
    let mut seen = std::collections::HashSet::new();
    listeners.retain(|info| seen.insert(info.port));
}

/// Resolves a process's working directory through procfs, best effort.
#[cfg(target_os = "linux")]
fn process_cwd(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/cwd")).ok()
}

#[cfg(not(target_os = "linux"))]
fn process_cwd(_pid: u32) -> Option<PathBuf> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof_listen_lines() {
        let output = "\
COMMAND   PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
node     4242  dev   23u  IPv4    0x0      0t0  TCP 127.0.0.1:3000 (LISTEN)
node     4242  dev   24u  IPv6    0x0      0t0  TCP [::1]:3000 (LISTEN)
postgres 5432  dev    5u  IPv4    0x0      0t0  TCP *:5432 (LISTEN)
chrome   9999  dev   88u  IPv4    0x0      0t0  TCP 10.0.0.5:44312->1.2.3.4:443 (ESTABLISHED)
";
        let listeners = parse_lsof(output);
        assert_eq!(listeners.len(), 3);
        assert_eq!(listeners[0].port.value(), 3000);
        assert_eq!(listeners[0].pid, Some(4242));
        assert_eq!(listeners[0].process_name, "node");
        assert_eq!(listeners[2].port.value(), 5432);
    }

    #[test]
    fn test_parse_netstat_listen_lines() {
        let output = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 127.0.0.1:6006          0.0.0.0:*               LISTEN      1717/storybook
tcp6       0      0 :::8080                 :::*                    LISTEN      2020/java
udp        0      0 0.0.0.0:68              0.0.0.0:*                           901/dhclient
";
        let listeners = parse_netstat(output);
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].port.value(), 6006);
        assert_eq!(listeners[0].pid, Some(1717));
        assert_eq!(listeners[0].process_name, "storybook");
        assert_eq!(listeners[1].port.value(), 8080);
        assert_eq!(listeners[1].pid, Some(2020));
    }

    #[test]
    fn test_parse_netstat_without_pid_column() {
        // Unprivileged netstat prints '-' for other users' sockets.
        let output =
            "tcp        0      0 0.0.0.0:5432            0.0.0.0:*               LISTEN      -\n";
        let listeners = parse_netstat(output);
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].pid, None);
        assert_eq!(listeners[0].process_name, "-");
    }

    #[test]
    fn test_parse_ss_listen_lines() {
        let output = "\
Netid State  Recv-Q Send-Q  Local Address:Port  Peer Address:Port Process
tcp   LISTEN 0      128         127.0.0.1:3000       0.0.0.0:*    users:((\"node\",pid=4242,fd=23))
tcp   LISTEN 0      511                 *:11400            *:*    users:((\"ollama\",pid=777,fd=3))
udp   UNCONN 0      0             0.0.0.0:68           0.0.0.0:*
";
        let listeners = parse_ss(output);
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].port.value(), 3000);
        assert_eq!(listeners[0].pid, Some(4242));
        assert_eq!(listeners[0].process_name, "node");
        assert_eq!(listeners[1].port.value(), 11400);
        assert_eq!(listeners[1].process_name, "ollama");
    }

    #[test]
    fn test_parse_ss_without_users_field() {
        let output = "tcp   LISTEN 0      128         127.0.0.1:9876       0.0.0.0:*\n";
        let listeners = parse_ss(output);
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].pid, None);
        assert_eq!(listeners[0].process_name, "unknown");
    }

    #[test]
    fn test_port_from_addr_shapes() {
        assert_eq!(port_from_addr("127.0.0.1:3000").unwrap().value(), 3000);
        assert_eq!(port_from_addr("[::1]:8080").unwrap().value(), 8080);
        assert_eq!(port_from_addr("*:5432").unwrap().value(), 5432);
        assert!(port_from_addr("127.0.0.1:*").is_none());
        assert!(port_from_addr("garbage").is_none());
        assert!(port_from_addr("127.0.0.1:0").is_none());
    }

    #[test]
    fn test_dedupe_keeps_first_record_per_port() {
        let mut listeners = vec![
            ListenerInfo {
                port: Port::try_from(3000).unwrap(),
                pid: Some(1),
                process_name: "a".into(),
                command: "a".into(),
                working_dir: None,
            },
            ListenerInfo {
                port: Port::try_from(3000).unwrap(),
                pid: Some(2),
                process_name: "b".into(),
                command: "b".into(),
                working_dir: None,
            },
            ListenerInfo {
                port: Port::try_from(3001).unwrap(),
                pid: Some(3),
                process_name: "c".into(),
                command: "c".into(),
                working_dir: None,
            },
        ];
        dedupe_by_port(&mut listeners);
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].pid, Some(1));
    }

    #[test]
    fn test_run_with_deadline_kills_overrunning_child() {
        let started = Instant::now();
        let output = run_with_deadline("sleep", &["5"], Duration::from_millis(200));
        assert!(output.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_run_with_deadline_missing_tool() {
        assert!(run_with_deadline("definitely-not-a-tool", &[], Duration::from_millis(100)).is_none());
    }
}
