//! TCP listener and per-connection workers.
//!
//! One listener thread accepts connections and hands each to its own
//! worker thread; queries run entirely on the blocking disk path, so a
//! slow client only ever stalls its own worker. Shutdown flips the
//! running flag, nudges the listener awake with a loopback connection
//! and joins the workers.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, info, info_span, warn};

use fa_core::FaError;
use fa_storage::{Archive, Reader};

use crate::protocol::{parse_request, Request};

/// Longest accepted request line.
const MAX_REQUEST_BYTES: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Honour `M` mask-update requests.
    pub allow_mask_update: bool,
}

/// Running socket server.
pub struct Server {
    address: SocketAddr,
    running: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Server {
    /// Bind and start accepting. `file` is a plain read handle onto the
    /// archive for the query path.
    pub fn start(
        bind: SocketAddr,
        archive: Arc<Archive>,
        file: Arc<File>,
        config: ServerConfig,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .with_context(|| format!("binding server socket {bind}"))?;
        let address = listener.local_addr()?;
        info!(%address, "server listening");

        let running = Arc::new(AtomicBool::new(true));
        let workers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_running = Arc::clone(&running);
        let accept_workers = Arc::clone(&workers);
        let handle = thread::Builder::new()
            .name("fa-server".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    if !accept_running.load(Ordering::Acquire) {
                        break;
                    }
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let archive = Arc::clone(&archive);
                    let file = Arc::clone(&file);
                    let config = config.clone();
                    let worker = thread::Builder::new()
                        .name("fa-client".into())
                        .spawn(move || handle_client(stream, archive, file, config));
                    match worker {
                        Ok(worker) => accept_workers.lock().push(worker),
                        Err(err) => warn!(error = %err, "spawning client worker failed"),
                    }
                }
            })
            .context("spawning server listener thread")?;

        Ok(Server {
            address,
            running,
            listener: Some(handle),
            workers,
        })
    }

    /// Actual bound address (useful when binding port 0).
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting and drain the workers.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Release);
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.address);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        info!("server stopped");
    }
}

fn handle_client(
    stream: TcpStream,
    archive: Arc<Archive>,
    file: Arc<File>,
    config: ServerConfig,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    let span = info_span!("client", %peer);
    let _guard = span.enter();

    if let Err(err) = serve_one(stream, &archive, file, &config) {
        debug!(error = %err, "connection closed with error");
    }
}

/// Read one request line, answer it, close.
fn serve_one(
    mut stream: TcpStream,
    archive: &Arc<Archive>,
    file: Arc<File>,
    config: &ServerConfig,
) -> std::io::Result<()> {
    // A client that connects and never sends a request must not pin its
    // worker forever.
    stream.set_read_timeout(Some(std::time::Duration::from_secs(60)))?;
    let mut line = Vec::new();
    {
        let mut buffered = BufReader::new(&stream).take(MAX_REQUEST_BYTES as u64);
        buffered.read_until(b'\n', &mut line)?;
    }
    let line = String::from_utf8_lossy(&line).into_owned();
    let text = line.trim_end_matches(['\r', '\n']);
    debug!(request = text, "request received");

    let entry_count = archive.geometry.fa_entry_count;
    let outcome = match parse_request(text, entry_count) {
        Err(err) => Err(err),
        Ok(Request::ServerInfo) => serve_info(&mut stream, archive, file).map(|()| None),
        Ok(Request::Read(request)) => {
            let reader = Reader::new(Arc::clone(archive), file);
            match reader.prepare(&request) {
                Err(err) => Err(err),
                Ok(plan) => {
                    stream.write_all(&[0u8])?;
                    if plan.flags.send_sample_count {
                        stream.write_all(&plan.count.to_ne_bytes())?;
                    }
                    if plan.flags.send_timestamp {
                        stream.write_all(&plan.first_timestamp.to_ne_bytes())?;
                    }
                    reader.stream(&plan, &mut stream).map(|()| Some(plan.count))
                }
            }
        }
        Ok(Request::MaskUpdate(mask)) => {
            if !config.allow_mask_update {
                Err(FaError::protocol("Mask update not permitted"))
            } else {
                match archive.update_mask(mask) {
                    Ok(()) => {
                        // Acknowledge with the success marker.
                        stream.write_all(&[0u8])?;
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    };

    match outcome {
        Ok(Some(count)) => debug!(samples = count, "read completed"),
        Ok(None) => {}
        Err(FaError::Io(err)) => return Err(err),
        Err(err) => {
            // Protocol-level failure before any data: one printable
            // error line.
            let mut message = err.to_string();
            message.push('\n');
            stream.write_all(message.as_bytes())?;
        }
    }
    stream.flush()?;
    Ok(())
}

fn serve_info(
    stream: &mut TcpStream,
    archive: &Arc<Archive>,
    file: Arc<File>,
) -> fa_core::Result<()> {
    let reader = Reader::new(Arc::clone(archive), file);
    let g = &archive.geometry;
    let info = format!(
        "FA {} entries:{} d1:{} d2:{} first:{} last:{}\n",
        env!("CARGO_PKG_VERSION"),
        g.fa_entry_count,
        g.first_decimation(),
        1 << g.second_decimation_log2,
        reader.earliest_timestamp(),
        reader.latest_timestamp(),
    );
    stream.write_all(info.as_bytes())?;
    Ok(())
}
