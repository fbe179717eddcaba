//! Listen socket and acceptor threads
//!
//! Binds the configured port through socket2 (reuse-addr, backlog 1024),
//! spawns the worker pool, and runs `boss_threads` acceptor threads that
//! hand each accepted socket round-robin to a worker. The TLS context is
//! built before the socket opens: certificate problems abort startup.

use super::worker::{wake_pipe, WakeWriter, Worker};
use super::ServerError;
use crate::config::ServerConfig;
use crate::http::tls::TlsContext;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// The echo server: listen socket, acceptors and worker pool
///
/// `bind` starts everything; the server is accepting connections once it
/// returns. `run` parks the caller until the acceptors exit (the process
/// normally runs until killed).
pub struct EchoServer {
    local_addr: SocketAddr,
    acceptors: Vec<thread::JoinHandle<()>>,
}

impl EchoServer {
    /// Build the TLS context, bind the port and start all threads
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let config = Arc::new(config);

        // Startup-fatal: never listen with a broken certificate setup
        let tls = if config.ssl {
            Some(Arc::new(TlsContext::from_cert_source(
                &config.cert_source,
                config.http2,
            )?))
        } else {
            None
        };

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        socket.bind(&bind_addr.into())?;
        socket.listen(BACKLOG)?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        let mut senders: Vec<Sender<(TcpStream, SocketAddr)>> = Vec::new();
        let mut wakers: Vec<Arc<WakeWriter>> = Vec::new();
        for index in 0..config.worker_threads {
            let (tx, rx) = mpsc::channel();
            let (wake_reader, wake_writer) = wake_pipe()?;
            senders.push(tx);
            wakers.push(Arc::new(wake_writer));

            let worker = Worker::new(index, rx, wake_reader, config.clone(), tls.clone());
            thread::Builder::new()
                .name(format!("echod-worker-{}", index))
                .spawn(move || worker.run())?;
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let mut acceptors = Vec::new();
        for index in 0..config.boss_threads {
            let listener = listener.try_clone()?;
            let senders = senders.clone();
            let wakers = wakers.clone();
            let counter = counter.clone();
            let handle = thread::Builder::new()
                .name(format!("echod-boss-{}", index))
                .spawn(move || accept_loop(listener, senders, wakers, counter))?;
            acceptors.push(handle);
        }

        info!(
            addr = %local_addr,
            boss_threads = config.boss_threads,
            worker_threads = config.worker_threads,
            "Listening"
        );

        Ok(EchoServer {
            local_addr,
            acceptors,
        })
    }

    /// The bound address (resolves port 0 to the assigned port)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the acceptor threads exit
    pub fn run(self) {
        for handle in self.acceptors {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    senders: Vec<Sender<(TcpStream, SocketAddr)>>,
    wakers: Vec<Arc<WakeWriter>>,
    counter: Arc<AtomicUsize>,
) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                let _ = SockRef::from(&stream).set_keepalive(true);

                let index = counter.fetch_add(1, Ordering::Relaxed) % senders.len();
                debug!(peer = %addr, worker = index, "Connection accepted");
                if senders[index].send((stream, addr)).is_err() {
                    // Worker is gone; nothing left to hand connections to
                    break;
                }
                wakers[index].wake();
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                // Back off briefly so a persistent error (fd exhaustion)
                // does not spin the acceptor
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertSource;
    use std::io::Write;

    #[test]
    fn test_bind_ephemeral_port() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let server = EchoServer::bind(config).unwrap();
        assert_ne!(server.local_addr().port(), 0);

        // The socket accepts connections right away
        let stream = TcpStream::connect(server.local_addr()).unwrap();
        drop(stream);
    }

    #[test]
    fn test_bad_keystore_aborts_startup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"garbage").unwrap();

        let config = ServerConfig {
            port: 0,
            ssl: true,
            cert_source: CertSource::Keystore {
                path: file.path().to_path_buf(),
                password: "pw".to_string(),
            },
            ..ServerConfig::default()
        };
        assert!(matches!(
            EchoServer::bind(config),
            Err(ServerError::Tls(_))
        ));
    }
}
