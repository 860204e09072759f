use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::debug;

// A single 2xx right after a rolling deployment is weak evidence; connections
// may still be draining. Require a streak before declaring traffic-ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub max_attempts: u32,
    pub required_successes: u32,
    pub interval: Duration,
}

impl ProbePolicy {
    pub fn new(max_attempts: u32, required_successes: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            required_successes,
            interval,
        }
    }

    // Larger deployments take longer to stabilize after rollout.
    pub fn for_size(size: u64) -> Self {
        let max_attempts = if size >= 20 { 20 } else { 15 };
        Self::new(max_attempts, 3, Duration::from_secs(2))
    }
}

pub fn probe(client: &Client, url: &str, policy: ProbePolicy) -> bool {
    let mut streak = 0u32;
    for attempt in 1..=policy.max_attempts {
        match client.get(url).send() {
            Ok(resp) if resp.status().is_success() => {
                streak += 1;
                debug!(attempt, streak, required = policy.required_successes, "probe ok");
                if streak >= policy.required_successes {
                    return true;
                }
            }
            Ok(resp) => {
                streak = 0;
                debug!(attempt, status = %resp.status(), "probe failed");
            }
            Err(err) => {
                streak = 0;
                debug!(attempt, error = %err, "probe transport error");
            }
        }
        if attempt < policy.max_attempts {
            thread::sleep(policy.interval);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::JoinHandle;
    use tiny_http::{Response, Server, StatusCode};

    fn scripted_server(statuses: Vec<u16>) -> (String, JoinHandle<usize>) {
        let server = Server::http("127.0.0.1:0").expect("server");
        let port = server.server_addr().to_ip().expect("ip addr").port();
        let handle = thread::spawn(move || {
            let mut served = 0usize;
            for status in statuses {
                let rq = match server.recv() {
                    Ok(rq) => rq,
                    Err(_) => break,
                };
                let _ = rq.respond(Response::empty(StatusCode(status)));
                served += 1;
            }
            served
        });
        (format!("http://127.0.0.1:{}/s0", port), handle)
    }

    fn test_client() -> Client {
        Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client")
    }

    #[test]
    fn failure_mid_streak_resets_counter() {
        let (url, handle) = scripted_server(vec![200, 200, 500, 200, 200, 200]);
        let policy = ProbePolicy::new(10, 3, Duration::from_millis(0));
        assert!(probe(&test_client(), &url, policy));
        assert_eq!(handle.join().expect("server thread"), 6);
    }

    #[test]
    fn exhausted_attempts_report_not_ready() {
        let (url, handle) = scripted_server(vec![500, 500, 500, 500]);
        let policy = ProbePolicy::new(4, 3, Duration::from_millis(0));
        assert!(!probe(&test_client(), &url, policy));
        assert_eq!(handle.join().expect("server thread"), 4);
    }

    #[test]
    fn transport_error_counts_as_failure() {
        // Nothing is listening on this port.
        let policy = ProbePolicy::new(2, 1, Duration::from_millis(0));
        assert!(!probe(
            &test_client(),
            "http://127.0.0.1:1/unreachable",
            policy
        ));
    }

    #[test]
    fn size_scaled_budgets() {
        assert_eq!(ProbePolicy::for_size(20).max_attempts, 20);
        assert_eq!(ProbePolicy::for_size(10).max_attempts, 15);
        assert_eq!(ProbePolicy::for_size(5).required_successes, 3);
    }
}
