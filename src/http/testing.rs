use std::{
    collections::HashMap,
    io::{self, Cursor, Read},
    sync::Arc,
};

use parking_lot::Mutex;

use super::{Header, Probe, Response, Transport, TransportError};

/// One scripted remote resource.
#[derive(Debug, Clone)]
pub struct Resource {
    pub status: u16,
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub accept_ranges: bool,
    pub fail_head: bool,
    pub fail_get: bool,
    /// Serve only this many bytes on the next `GET`, then fail the body.
    pub interrupt_after: Option<usize>,
    /// Answer ranged requests with a full `200` body.
    pub ignore_range: bool,
}

impl Resource {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            etag: None,
            accept_ranges: true,
            fail_head: false,
            fail_get: false,
            interrupt_after: None,
            ignore_range: false,
        }
    }

    pub fn json(body: &str) -> Self {
        Self::new(body.as_bytes().to_vec())
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_etag(mut self, etag: &str) -> Self {
        self.etag = Some(etag.to_string());
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<Header>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct State {
    resources: HashMap<String, Resource>,
    requests: Vec<Recorded>,
    bytes_served: u64,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<State>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, resource: Resource) {
        self.state.lock().resources.insert(url.to_string(), resource);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().requests.clone()
    }

    pub fn count(&self, method: &str, url: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|request| request.method == method && request.url == url)
            .count()
    }

    pub fn total_requests(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn bytes_served(&self) -> u64 {
        self.state.lock().bytes_served
    }

    fn record(state: &mut State, method: &'static str, url: &str, headers: &[Header]) {
        state.requests.push(Recorded {
            method,
            url: url.to_string(),
            headers: headers.to_vec(),
        });
    }
}

fn range_start(headers: &[Header]) -> Option<u64> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("range"))
        .and_then(|(_, value)| value.strip_prefix("bytes="))
        .and_then(|value| value.strip_suffix('-'))
        .and_then(|value| value.parse().ok())
}

struct InterruptedBody {
    data: Cursor<Vec<u8>>,
}

impl Read for InterruptedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.data.read(buf)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ));
        }
        Ok(read)
    }
}

impl Transport for FakeTransport {
    fn head(&self, url: &str, headers: &[Header]) -> Result<Probe, TransportError> {
        let mut state = self.state.lock();
        Self::record(&mut state, "HEAD", url, headers);
        let Some(resource) = state.resources.get(url) else {
            return Ok(Probe {
                status: 404,
                ..Probe::default()
            });
        };
        if resource.fail_head {
            return Err(TransportError::Request(format!("HEAD {url}: connection refused")));
        }
        Ok(Probe {
            status: resource.status,
            etag: resource.etag.clone(),
            accept_ranges: Some(if resource.accept_ranges { "bytes" } else { "none" }.into()),
            content_length: Some(resource.body.len() as u64),
        })
    }

    fn get(&self, url: &str, headers: &[Header]) -> Result<Response, TransportError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        Self::record(state, "GET", url, headers);
        let Some(resource) = state.resources.get_mut(url) else {
            return Ok(Response::new(404, Some(0), Box::new(io::empty())));
        };
        if resource.fail_get {
            return Err(TransportError::Request(format!("GET {url}: connection refused")));
        }

        let (status, payload) = match range_start(headers) {
            Some(start) if resource.accept_ranges && !resource.ignore_range => {
                let start = start as usize;
                if start >= resource.body.len() {
                    return Ok(Response::new(416, Some(0), Box::new(io::empty())));
                }
                (206, resource.body[start..].to_vec())
            }
            _ => (resource.status, resource.body.clone()),
        };
        let content_length = Some(payload.len() as u64);

        let response = match resource.interrupt_after.take() {
            Some(limit) => {
                let served = payload[..limit.min(payload.len())].to_vec();
                state.bytes_served += served.len() as u64;
                Response::new(
                    status,
                    content_length,
                    Box::new(InterruptedBody {
                        data: Cursor::new(served),
                    }),
                )
            }
            None => {
                state.bytes_served += payload.len() as u64;
                Response::new(status, content_length, Box::new(Cursor::new(payload)))
            }
        };
        Ok(response)
    }
}
