//! HTTP [`Fetcher`] backed by `ureq`.
//!
//! Each fetch runs on its own short-lived thread and streams the body into the
//! slot directory. The thread never touches update state: it posts a
//! [`LoopEvent::FetchDone`] and exits.

use std::thread;
use std::time::Duration;

use ota_config::FetchSettings;
use tracing::{debug, warn};

use super::{DirStore, FetchCompletion, FetchError, FetchOutcome, FetchReceipt, FetchRequest, Fetcher};
use crate::logging::{event_names, scrub_userinfo, Stage};
use crate::runtime::{LoopEvent, LoopSender};

/// Fetches URLs into a [`DirStore`].
pub struct HttpFetcher {
    store: DirStore,
    timeout: Duration,
    user_agent: String,
    events: LoopSender,
}

impl HttpFetcher {
    pub fn new(store: DirStore, settings: &FetchSettings, events: LoopSender) -> Self {
        HttpFetcher {
            store,
            timeout: Duration::from_secs(settings.timeout_secs),
            user_agent: settings.user_agent.clone(),
            events,
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: FetchRequest) {
        let store = self.store.clone();
        let agent = ureq::AgentBuilder::new()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build();
        let events = self.events.clone();

        let spawned = thread::Builder::new()
            .name("ota-fetch".to_string())
            .spawn({
                let request = request.clone();
                move || {
                    let outcome = download(&agent, &store, &request);
                    if events
                        .send(LoopEvent::FetchDone(FetchCompletion { request, outcome }))
                        .is_err()
                    {
                        debug!(
                            target: event_names::FETCH_DROPPED,
                            stage = %Stage::Runtime,
                            "event loop gone; fetch result dropped"
                        );
                    }
                }
            });

        if let Err(e) = spawned {
            warn!(
                target: event_names::UPDATE_FETCH_FAILED,
                stage = %Stage::Update,
                url = %scrub_userinfo(&request.url),
                error = %e,
                "could not start fetch thread"
            );
            let outcome = Err(FetchError::Transport(format!("could not start fetch: {}", e)));
            let _ = self
                .events
                .send(LoopEvent::FetchDone(FetchCompletion { request, outcome }));
        }
    }
}

fn download(agent: &ureq::Agent, store: &DirStore, request: &FetchRequest) -> FetchOutcome {
    debug!(
        stage = %Stage::Update,
        url = %scrub_userinfo(&request.url),
        destination = %request.destination,
        "fetch started"
    );

    let response = agent.get(&request.url).call().map_err(|e| match e {
        ureq::Error::Status(code, _) => FetchError::Status(code),
        ureq::Error::Transport(t) => FetchError::Transport(t.to_string()),
    })?;

    let mut body = response.into_reader();
    let bytes_written = store
        .write_from(&request.destination, &mut body)
        .map_err(|e| FetchError::Storage(e.to_string()))?;

    Ok(FetchReceipt { bytes_written })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FetchPurpose, KvStore};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use tempfile::TempDir;

    /// One-shot HTTP server answering with `status` and `body`.
    fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(body).unwrap();
        });
        format!("http://{}/image", addr)
    }

    fn request(url: String) -> FetchRequest {
        FetchRequest {
            url,
            destination: "app.new".to_string(),
            purpose: FetchPurpose::Update {
                name: "app".to_string(),
                size: 0,
            },
        }
    }

    fn fetch_and_wait(url: String) -> (TempDir, DirStore, FetchCompletion) {
        let dir = TempDir::new().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let (tx, rx) = mpsc::channel();
        let fetcher = HttpFetcher::new(store.clone(), &FetchSettings::default(), tx);

        fetcher.fetch(request(url));
        let completion = match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            LoopEvent::FetchDone(c) => c,
            _ => panic!("unexpected loop event"),
        };
        (dir, store, completion)
    }

    #[test]
    fn test_fetch_streams_body_into_store() {
        let url = serve_once("200 OK", b"new image");
        let (_dir, store, completion) = fetch_and_wait(url);

        assert_eq!(completion.outcome, Ok(FetchReceipt { bytes_written: 9 }));
        assert_eq!(store.read("app.new").unwrap().as_deref(), Some(&b"new image"[..]));
    }

    #[test]
    fn test_http_error_status_reported() {
        let url = serve_once("404 Not Found", b"");
        let (_dir, store, completion) = fetch_and_wait(url);

        assert_eq!(completion.outcome, Err(FetchError::Status(404)));
        assert!(!store.exists("app.new").unwrap());
    }

    #[test]
    fn test_unreachable_host_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_dir, _store, completion) = fetch_and_wait(format!("http://{}/image", addr));
        assert!(matches!(completion.outcome, Err(FetchError::Transport(_))));
    }
}
