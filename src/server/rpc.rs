//! The native protocol transport, a thin adapter over `server::Core`.
//!
//! Each accepted connection gets its own thread and may carry any number of
//! request frames before hanging up. The caller-address tag for admission is
//! the TCP peer address itself -- unlike HTTP there is no proxy header to
//! consult. Business rules and their outcomes are `Core`'s; this module only
//! translates them into `protocols::wire` responses.

use std::io;
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::protocols::wire;
use crate::protocols::wire::{ErrorCode, Request, Response};
use crate::server::{Core, ServeError};
use crate::thread;
use crate::thread::Stoppable;

// A client that stalls mid-frame only ever stalls its own thread, and only
// this long.
const STREAM_TIMEOUT_SECS: u64 = 30;

/// The native protocol listener.
pub struct Server {
    thread: thread::ThreadHandle,
}

impl Server {
    /// Bind `host_port` and start accepting. As with the HTTP listener, a
    /// bad address fails here at startup.
    pub fn new(host_port: &str, core: Arc<Core>) -> Result<Server, String> {
        let listener = TcpListener::bind(host_port).map_err(|e| {
            format!("failed to bind native listener {}: {}", host_port, e)
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| format!("failed to configure native listener: {}", e))?;
        info!("native listener bound to {}", host_port);

        Ok(Server {
            thread: thread::spawn(move |stop| accept_loop(&listener, &core, &stop)),
        })
    }
}

impl Stoppable for Server {
    fn join(self) {
        self.thread.join();
    }

    fn shutdown(self) {
        self.thread.shutdown();
    }
}

fn accept_loop(listener: &TcpListener, core: &Arc<Core>, stop: &thread::Shutdown) {
    loop {
        if stop.is_set() {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let core = Arc::clone(core);
                ::std::thread::spawn(move || handle_stream(&core, stream, peer));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                stop.wait_timeout(Duration::from_millis(250));
            }
            Err(e) => {
                warn!("failed to accept native connection: {}", e);
                stop.wait_timeout(Duration::from_millis(250));
            }
        }
    }
}

fn handle_stream(core: &Core, stream: TcpStream, peer: SocketAddr) {
    // accepted sockets inherit the listener's non-blocking mode on some
    // platforms
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    let _ = stream.set_read_timeout(Some(Duration::from_secs(STREAM_TIMEOUT_SECS)));

    let mut reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(e) => {
            warn!("failed to clone native stream from {}: {}", peer, e);
            return;
        }
    };
    let mut writer = BufWriter::new(stream);

    loop {
        let payload = match wire::read_frame(&mut reader) {
            Ok(payload) => payload,
            // EOF, timeout or garbage all end the session
            Err(_) => return,
        };

        let response = process(core, &payload, peer);
        let bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to marshal native response: {}", e);
                return;
            }
        };
        if wire::write_frame(&mut writer, &bytes).is_err() {
            return;
        }
    }
}

fn process(core: &Core, payload: &[u8], peer: SocketAddr) -> Response {
    if let Err(err) = core.admit(Some(peer.ip())) {
        warn!("{}", err);
        return error_response(err);
    }

    let plain = match core.decrypt_body(payload) {
        Ok(plain) => plain,
        Err(err) => {
            warn!("{}", err);
            return error_response(err);
        }
    };

    let request: Request = match serde_json::from_slice(&plain) {
        Ok(request) => request,
        Err(_) => {
            return Response::Error {
                code: ErrorCode::Internal,
                message: "bad or no payload".to_string(),
            }
        }
    };

    match request {
        Request::UpdateOne { metric } => match core.save_one(&metric) {
            Ok(()) => Response::Ok,
            Err(err) => error_response(err),
        },
        Request::UpdateMany { metrics } => match core.save_many(&metrics) {
            Ok(()) => Response::Ok,
            Err(err) => error_response(err),
        },
        Request::LoadOne { id, kind } => match core.load_one(&id, &kind) {
            Ok(metric) => Response::Metric { metric },
            Err(err) => error_response(err),
        },
        Request::Ping => match core.ping() {
            Ok(()) => Response::Ok,
            Err(err) => error_response(err),
        },
    }
}

fn error_response(err: ServeError) -> Response {
    let code = match err {
        ServeError::Unsupported => ErrorCode::Unimplemented,
        ServeError::NotFound => ErrorCode::NotFound,
        ServeError::Forbidden(_) => ErrorCode::PermissionDenied,
        ServeError::BadPayload(_)
        | ServeError::HashUndecodable
        | ServeError::HashMismatch
        | ServeError::Internal(_) => ErrorCode::Internal,
    };
    Response::Error {
        code,
        message: err.to_string(),
    }
}
