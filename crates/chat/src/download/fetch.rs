//! Streaming HTTP GET used by download workers

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::slack::is_slack_url;

/// Some hosts stall requests without a browser-like agent
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/84.0.4147.125 Safari/537.36";

/// Response to a GET, with the body not yet read
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Box<dyn Read + Send>,
}

impl FetchResponse {
    /// First header named `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Performs a GET; any response, whatever its status, is `Ok`
pub trait Fetch: Send + Sync {
    fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<FetchResponse>;
}

/// Headers sent with every download
///
/// The workspace credential is only ever sent to Slack's own hosts.
pub fn request_headers(url: &str, token: &str) -> Vec<(&'static str, String)> {
    let mut headers = vec![("User-Agent", USER_AGENT.to_string())];
    if is_slack_url(url) {
        headers.push(("Authorization", format!("Bearer {}", token)));
    }
    headers
}

/// Fetcher backed by a shared ureq agent
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    /// Limit on connecting, sending the request and receiving the headers
    pub const TIMEOUT: Duration = Duration::from_secs(60);
    /// Limit on streaming one body; large files on slow links take a while
    pub const BODY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    pub fn new() -> Self {
        Self::with_timeouts(Self::TIMEOUT, Self::BODY_TIMEOUT)
    }

    /// Body reads are bounded by `body` alone, never by `request`
    pub fn with_timeouts(request: Duration, body: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_connect(Some(request))
            .timeout_send_request(Some(request))
            .timeout_recv_response(Some(request))
            .timeout_recv_body(Some(body))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetch for HttpFetcher {
    fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<FetchResponse> {
        let mut request = self.agent.get(url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let response = request
            .call()
            .with_context(|| format!("GET {}", url))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response.into_body().into_reader();

        Ok(FetchResponse {
            status,
            headers,
            body: Box::new(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    /// Serve one response whose body trickles out a byte at a time
    fn trickle_server(body: &'static [u8], every: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .unwrap();
            stream.flush().unwrap();
            for byte in body {
                thread::sleep(every);
                stream.write_all(&[*byte]).unwrap();
                stream.flush().unwrap();
            }
        });
        format!("http://{}/slow.txt", addr)
    }

    #[test]
    fn test_slow_body_outlasts_request_timeout() {
        let url = trickle_server(b"0123456789", Duration::from_millis(300));
        let fetcher = HttpFetcher::with_timeouts(Duration::from_secs(1), Duration::from_secs(30));

        let started = Instant::now();
        let mut response = fetcher.get(&url, &[]).unwrap();
        let mut body = Vec::new();
        response.body.read_to_end(&mut body).unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(body, b"0123456789");
        assert!(started.elapsed() > Duration::from_secs(1));
    }

    #[test]
    fn test_token_only_for_slack() {
        let slack = request_headers("https://files.slack.com/files-pri/T1-F1/a.png", "xoxp-1");
        assert_eq!(slack.len(), 2);
        assert_eq!(slack[1], ("Authorization", "Bearer xoxp-1".to_string()));

        let other = request_headers("https://example.com/a.png", "xoxp-1");
        assert_eq!(other, vec![("User-Agent", USER_AGENT.to_string())]);
    }

    #[test]
    fn test_header_lookup() {
        let response = FetchResponse {
            status: 200,
            headers: vec![("ETag".to_string(), "\"abc\"".to_string())],
            body: Box::new(std::io::empty()),
        };
        assert_eq!(response.header("etag"), Some("\"abc\""));
        assert_eq!(response.header("content-type"), None);
    }
}
