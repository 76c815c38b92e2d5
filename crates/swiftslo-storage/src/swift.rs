use std::sync::Mutex;
use std::time::Duration;

use crate::auth::{self, Credentials};
use crate::retry::{self, RetryConfig};
use crate::{ObjectStore, Result, SwiftError};

/// An authenticated Swift connection.
///
/// The token lives behind a mutex because upload workers share one connection
/// across threads; a 401 from any worker swaps in a fresh token for all of
/// them. The storage URL is fixed at connect time; Keystone endpoints do not
/// move within a token's lifetime.
pub struct SwiftConnection {
    agent: ureq::Agent,
    creds: Credentials,
    storage_url: String,
    token: Mutex<String>,
    retry: RetryConfig,
}

impl SwiftConnection {
    /// Authenticate and return a ready connection.
    pub fn connect(creds: Credentials, retry: RetryConfig) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        let session = auth::authenticate(&agent, &creds)?;
        tracing::debug!("authenticated against {}", creds.auth_url);

        Ok(Self {
            agent,
            creds,
            storage_url: session.storage_url.trim_end_matches('/').to_string(),
            token: Mutex::new(session.token),
            retry,
        })
    }

    fn object_url(&self, container: &str, object: &str) -> String {
        format!("{}/{container}/{object}", self.storage_url)
    }

    fn current_token(&self) -> String {
        self.token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run `f` under the retry policy; on a post-retry 401, re-authenticate
    /// once and replay. A second 401 is a permanent failure.
    fn with_reauth<T>(
        &self,
        op: &str,
        f: impl Fn(&str) -> std::result::Result<T, ureq::Error>,
    ) -> Result<T> {
        let token = self.current_token();
        match retry::retry_http(&self.retry, op, || f(&token)) {
            Ok(val) => Ok(val),
            Err(ureq::Error::Status(401, _)) => {
                tracing::info!("{op}: token rejected, re-authenticating");
                let session = auth::authenticate(&self.agent, &self.creds)?;
                *self.token.lock().unwrap_or_else(|e| e.into_inner()) = session.token.clone();
                retry::retry_http(&self.retry, op, || f(&session.token))
                    .map_err(|e| SwiftError::from_ureq(op, e))
            }
            Err(e) => Err(SwiftError::from_ureq(op, e)),
        }
    }
}

impl ObjectStore for SwiftConnection {
    fn put_object(
        &self,
        container: &str,
        object: &str,
        data: &[u8],
        etag_hex: &str,
    ) -> Result<()> {
        let op = format!("PUT {container}/{object}");
        let url = self.object_url(container, object);
        self.with_reauth(&op, |token| {
            self.agent
                .put(&url)
                .set("X-Auth-Token", token)
                .set("ETag", etag_hex)
                .send_bytes(data)
        })?;
        Ok(())
    }

    fn put_manifest(&self, container: &str, object: &str, body: &[u8]) -> Result<()> {
        let op = format!("PUT manifest {container}/{object}");
        let url = format!(
            "{}?multipart-manifest=put",
            self.object_url(container, object)
        );
        self.with_reauth(&op, |token| {
            self.agent
                .put(&url)
                .set("X-Auth-Token", token)
                .set("Content-Type", "application/json")
                .send_bytes(body)
        })?;
        Ok(())
    }

    fn list_container(&self, container: &str) -> Result<Vec<String>> {
        let op = format!("LIST {container}");
        let url = format!("{}/{container}", self.storage_url);
        let resp = self.with_reauth(&op, |token| {
            self.agent.get(&url).set("X-Auth-Token", token).call()
        })?;
        // An empty container answers 204 with no body; otherwise the default
        // text listing is one object name per line.
        let text = resp.into_string().map_err(|e| SwiftError::Request {
            op,
            message: e.to_string(),
        })?;
        Ok(text
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    /// Serve `responses` to that many sequential connections, reporting each
    /// request head (request line + headers) on the returned channel.
    fn mock_server_seq(
        responses: Vec<String>,
    ) -> (String, mpsc::Receiver<String>, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let (head_tx, head_rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut head = String::new();
                let mut content_length = 0usize;
                let mut line = String::new();
                loop {
                    line.clear();
                    reader.read_line(&mut line).unwrap();
                    if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = v.trim().parse().unwrap();
                    }
                    if line.trim().is_empty() {
                        break;
                    }
                    head.push_str(&line);
                }
                let mut body = vec![0u8; content_length];
                reader.read_exact(&mut body).unwrap();
                head_tx.send(head).unwrap();
                stream.write_all(response.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });
        (url, head_rx, handle)
    }

    fn canned(status: u16, reason: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn no_retry() -> RetryConfig {
        RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
            max_server_error_attempts: 1,
            max_transport_attempts: Some(1),
        }
    }

    fn test_connection(storage_url: &str, auth_url: &str, retry: RetryConfig) -> SwiftConnection {
        SwiftConnection {
            agent: ureq::agent(),
            creds: Credentials {
                username: "tester".into(),
                api_key: "secret".into(),
                auth_url: auth_url.to_string(),
                domain: None,
                tenant: None,
            },
            storage_url: storage_url.trim_end_matches('/').to_string(),
            token: Mutex::new("tok-original".into()),
            retry,
        }
    }

    #[test]
    fn put_object_sends_token_and_etag() {
        let (url, heads, handle) = mock_server_seq(vec![canned(201, "Created", "")]);
        let conn = test_connection(&url, "http://unused/v1", no_retry());

        conn.put_object("cont", "obj-0001", b"payload", "abc123").unwrap();

        let head = heads.recv().unwrap();
        assert!(head.starts_with("PUT /cont/obj-0001 "), "head: {head}");
        assert!(head.contains("X-Auth-Token: tok-original"), "head: {head}");
        assert!(head.to_ascii_lowercase().contains("etag: abc123"), "head: {head}");
        handle.join().unwrap();
    }

    #[test]
    fn put_manifest_declares_slo() {
        let (url, heads, handle) = mock_server_seq(vec![canned(201, "Created", "")]);
        let conn = test_connection(&url, "http://unused/v1", no_retry());

        conn.put_manifest("cont", "big-object", b"[]").unwrap();

        let head = heads.recv().unwrap();
        assert!(
            head.starts_with("PUT /cont/big-object?multipart-manifest=put "),
            "head: {head}"
        );
        handle.join().unwrap();
    }

    #[test]
    fn list_container_splits_lines() {
        let (url, _heads, handle) =
            mock_server_seq(vec![canned(200, "OK", "alpha\nbeta\ngamma\n")]);
        let conn = test_connection(&url, "http://unused/v1", no_retry());

        let names = conn.list_container("cont").unwrap();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        handle.join().unwrap();
    }

    #[test]
    fn permanent_4xx_is_not_retried() {
        let (url, heads, handle) = mock_server_seq(vec![canned(403, "Forbidden", "")]);
        let conn = test_connection(&url, "http://unused/v1", no_retry());

        let err = conn.put_object("cont", "obj", b"x", "h").unwrap_err();
        assert!(
            matches!(err, SwiftError::Status { status: 403, .. }),
            "got: {err}"
        );
        drop(heads);
        handle.join().unwrap();
    }

    #[test]
    fn transient_5xx_is_retried_until_success() {
        let (url, heads, handle) = mock_server_seq(vec![
            canned(503, "Service Unavailable", ""),
            canned(503, "Service Unavailable", ""),
            canned(201, "Created", ""),
        ]);
        let retry = RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 4,
            max_server_error_attempts: 5,
            max_transport_attempts: Some(1),
        };
        let conn = test_connection(&url, "http://unused/v1", retry);

        conn.put_object("cont", "obj", b"x", "h").unwrap();
        assert_eq!(heads.iter().count(), 3);
        handle.join().unwrap();
    }

    #[test]
    fn reauthenticates_once_on_401() {
        // v1 auth endpoint hands out a replacement token.
        let (auth_url, _auth_heads, auth_handle) = mock_server_seq(vec![
            "HTTP/1.1 200 OK\r\n\
             X-Storage-Url: http://ignored/v1/AUTH_t\r\n\
             X-Auth-Token: tok-fresh\r\n\
             Content-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string(),
        ]);
        let (url, heads, handle) = mock_server_seq(vec![
            canned(401, "Unauthorized", ""),
            canned(201, "Created", ""),
        ]);
        let conn = test_connection(&url, &format!("{auth_url}/v1"), no_retry());

        conn.put_object("cont", "obj", b"x", "h").unwrap();

        let first = heads.recv().unwrap();
        let second = heads.recv().unwrap();
        assert!(first.contains("X-Auth-Token: tok-original"), "first: {first}");
        assert!(second.contains("X-Auth-Token: tok-fresh"), "second: {second}");
        assert_eq!(conn.current_token(), "tok-fresh");
        handle.join().unwrap();
        auth_handle.join().unwrap();
    }

    #[test]
    fn second_401_is_permanent() {
        let (auth_url, _auth_heads, auth_handle) = mock_server_seq(vec![
            "HTTP/1.1 200 OK\r\n\
             X-Storage-Url: http://ignored/v1/AUTH_t\r\n\
             X-Auth-Token: tok-still-bad\r\n\
             Content-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string(),
        ]);
        let (url, _heads, handle) = mock_server_seq(vec![
            canned(401, "Unauthorized", ""),
            canned(401, "Unauthorized", ""),
        ]);
        let conn = test_connection(&url, &format!("{auth_url}/v1"), no_retry());

        let err = conn.put_object("cont", "obj", b"x", "h").unwrap_err();
        assert!(
            matches!(err, SwiftError::Status { status: 401, .. }),
            "got: {err}"
        );
        handle.join().unwrap();
        auth_handle.join().unwrap();
    }
}
