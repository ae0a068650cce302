use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use tokio::process::Command;

/// Answers whether a device responds within `timeout`. Network failures of
/// any kind are reported as `false`, never as errors.
pub trait Prober {
    fn check(&self, address: &str, timeout: Duration) -> impl Future<Output = bool> + Send;
}

/// Whole-run deadline in seconds. BSD and macOS spell it `-t`, their `-w`
/// and `-W` mean something else.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
const DEADLINE_FLAG: &str = "-t";
#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
const DEADLINE_FLAG: &str = "-w";

/// Probes with a single ICMP echo request through the system `ping`.
#[derive(Debug, Clone, Default)]
pub struct PingProber;

impl PingProber {
    fn command(address: &str, timeout: Duration) -> Command {
        let mut cmd = Command::new("ping");
        if cfg!(windows) {
            let wait_ms = timeout.as_millis().max(1).to_string();
            cmd.args(["-n", "1", "-w", wait_ms.as_str()]);
        } else {
            let deadline = timeout.as_secs().max(1).to_string();
            cmd.args(["-c", "1", DEADLINE_FLAG, deadline.as_str()]);
        }
        cmd.arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl Prober for PingProber {
    async fn check(&self, address: &str, timeout: Duration) -> bool {
        let mut child = match Self::command(address, timeout).spawn() {
            Ok(child) => child,
            Err(err) => {
                debug!("Failed to spawn ping for {}: {}", address, err);
                return false;
            }
        };

        // ping's own deadline is advisory, enforce the bound here too
        let grace = Duration::from_millis(500);
        match tokio::time::timeout(timeout + grace, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(err)) => {
                debug!("Waiting on ping for {} failed: {}", address, err);
                false
            }
            Err(_) => {
                debug!("Ping for {} timed out after {:?}", address, timeout);
                false
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory prober whose answers are set by the test.
    #[derive(Debug, Default)]
    pub struct ScriptedProber {
        reachable: Mutex<HashMap<String, bool>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        pub fn set(&self, address: &str, reachable: bool) {
            self.reachable
                .lock()
                .unwrap()
                .insert(address.to_string(), reachable);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Prober for ScriptedProber {
        async fn check(&self, address: &str, _timeout: Duration) -> bool {
            self.calls.lock().unwrap().push(address.to_string());
            self.reachable
                .lock()
                .unwrap()
                .get(address)
                .copied()
                .unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_command_line() {
        let cmd = PingProber::command("192.168.1.20", Duration::from_secs(2));
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args.last().map(String::as_str), Some("192.168.1.20"));
        if cfg!(windows) {
            assert_eq!(args, ["-n", "1", "-w", "2000", "192.168.1.20"]);
        } else {
            assert_eq!(args, ["-c", "1", DEADLINE_FLAG, "2", "192.168.1.20"]);
        }
        if cfg!(target_os = "linux") {
            assert_eq!(args[2], "-w");
        }
    }

    #[test]
    fn test_sub_second_timeout_rounds_up() {
        let cmd = PingProber::command("host", Duration::from_millis(200));
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        if !cfg!(windows) {
            assert_eq!(args[3], "1");
        }
    }

    #[tokio::test]
    async fn test_unresolvable_address_is_unreachable() {
        // Either ping is missing, fails to resolve, or times out: all false.
        let reachable = PingProber
            .check("no-such-host.invalid", Duration::from_secs(1))
            .await;
        assert!(!reachable);
    }
}
