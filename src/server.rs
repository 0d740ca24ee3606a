//! BlobVault TCP server
//!
//! Every accepted connection gets its own task, which runs the key
//! handshake and the encrypted framing. Decoded requests go to a fixed pool
//! of worker tasks through a bounded job queue, so at most `workers` requests
//! execute at once no matter how many sessions are open. A connection waits
//! for the reply to one request before reading the next.
//!
//! Shutdown is driven by a [`CancellationToken`]. An authenticated `BYE`
//! cancels it after the reply is sent; so does a fatal persistence error.
//! Cancellation stops the listener and closes idle connections. Requests
//! already queued still run before the workers exit.

use crate::{
    config::ServerConfig,
    crypto::{ServerKeys, SessionCipher},
    engine::Vault,
    error::{Result, VaultError},
    protocol::{
        parse_request, read_frame, write_frame, Command, Request, Response, Status,
        KEY_REQUEST, SESSION_REQUEST,
    },
};
use parking_lot::Mutex as SyncMutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, Mutex},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Load the key pair named by `config`, or generate and save a new one
pub fn load_or_generate_keys(config: &ServerConfig) -> Result<ServerKeys> {
    let public_path = config.public_key_path();
    let private_path = config.private_key_path();
    if public_path.exists() && private_path.exists() {
        debug!(path = %private_path.display(), "Loading RSA keys");
        return ServerKeys::load(&private_path);
    }
    info!(
        "Generating RSA keys as ({}, {})",
        public_path.display(),
        private_path.display()
    );
    let keys = ServerKeys::generate(config.key_bits)?;
    keys.save(&public_path, &private_path)?;
    Ok(keys)
}

/// State shared by the listener, connections and workers
struct Shared {
    vault: Vault,
    keys: ServerKeys,
    frame_limit: usize,
    shutdown: CancellationToken,
    fatal: SyncMutex<Option<VaultError>>,
}

/// One decoded request waiting for a worker. `None` as the reply means the
/// request could not be executed and the connection should close.
struct Job {
    request: Request,
    reply: oneshot::Sender<Option<Response>>,
}

type Queue = Arc<Mutex<mpsc::Receiver<Job>>>;

/// BlobVault TCP server
pub struct VaultServer {
    listener: TcpListener,
    workers: usize,
    shared: Arc<Shared>,
}

impl VaultServer {
    /// Load keys and state, then bind the listening socket
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let keys = load_or_generate_keys(&config)?;
        let (vault, outcome) = Vault::open(&config)?;
        let log_bytes = vault.log_size()?;
        debug!(
            ?outcome,
            users = vault.user_count(),
            keys = vault.key_count(),
            shards = vault.shard_count(),
            log_bytes,
            "Vault ready"
        );

        let listener = TcpListener::bind(&config.bind_addr).await?;
        let addr = listener.local_addr()?;
        info!(
            "Listening on port {} using (key/data) = ({}, {})",
            addr.port(),
            config.key_file.display(),
            config.data_file.display()
        );

        Ok(Self {
            listener,
            workers: config.workers,
            shared: Arc::new(Shared {
                vault,
                keys,
                frame_limit: config.frame_limit(),
                shutdown: CancellationToken::new(),
                fatal: SyncMutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Serve until shutdown. Returns the fatal error, if one stopped the server.
    pub async fn run(self) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.workers);
        let queue: Queue = Arc::new(Mutex::new(rx));

        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|id| {
                let shared = Arc::clone(&self.shared);
                let queue = Arc::clone(&queue);
                tokio::spawn(worker(id, shared, queue))
            })
            .collect();

        let token = self.shared.shutdown.clone();
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task failed");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        let shared = Arc::clone(&self.shared);
                        connections.spawn(connection(shared, tx.clone(), stream, peer));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!("Shutting down, draining connections");
        drop(self.listener);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection task failed");
            }
        }

        // Workers exit once every sender is gone and the queue is empty
        drop(tx);
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }

        let fatal = self.shared.fatal.lock().take();
        if let Err(e) = self.shared.vault.sync() {
            error!(error = %e, "Final log sync failed");
            return Err(fatal.unwrap_or(e));
        }
        info!("Server terminated");
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn worker(id: usize, shared: Arc<Shared>, queue: Queue) {
    debug!(worker = id, "Worker started");
    loop {
        let next = queue.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        let reply = match shared.vault.execute(&job.request) {
            Ok(response) => Some(response),
            Err(e) if e.is_fatal() => {
                error!(worker = id, error = %e, "Fatal error, stopping server");
                shared.fatal.lock().get_or_insert(e);
                shared.shutdown.cancel();
                None
            }
            Err(e) => {
                warn!(worker = id, error = %e, "Request failed");
                None
            }
        };
        // The connection may already be gone
        let _ = job.reply.send(reply);
    }
    debug!(worker = id, "Worker stopped");
}

async fn connection(
    shared: Arc<Shared>,
    jobs: mpsc::Sender<Job>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    match serve(&shared, &jobs, stream, peer).await {
        Ok(()) => debug!(%peer, "Connection closed"),
        Err(e) => warn!(%peer, error = %e, "Connection dropped"),
    }
}

/// Hand a request to the worker pool and wait for its response
async fn dispatch(jobs: &mpsc::Sender<Job>, request: Request) -> Option<Response> {
    let (reply, response) = oneshot::channel();
    jobs.send(Job { request, reply }).await.ok()?;
    response.await.ok().flatten()
}

/// Read the next frame unless shutdown comes first
async fn next_frame(
    shared: &Shared,
    stream: &mut TcpStream,
) -> Result<Option<Vec<u8>>> {
    tokio::select! {
        _ = shared.shutdown.cancelled() => Ok(None),
        frame = read_frame(stream, shared.frame_limit) => frame,
    }
}

async fn handshake(
    shared: &Shared,
    stream: &mut TcpStream,
    peer: SocketAddr,
) -> Result<Option<SessionCipher>> {
    loop {
        let Some(frame) = next_frame(shared, stream).await? else {
            return Ok(None);
        };
        if frame.len() < 8 {
            return Err(VaultError::Protocol(format!(
                "handshake frame of {} bytes",
                frame.len()
            )));
        }
        let (tag, body) = frame.split_at(8);
        if tag == KEY_REQUEST {
            debug!(%peer, "Sending public key");
            write_frame(stream, shared.keys.public_pem().as_bytes()).await?;
        } else if tag == SESSION_REQUEST {
            let cipher = shared.keys.open_session(body)?;
            let ack = cipher.seal(&Response::status(Status::Ok).to_bytes())?;
            write_frame(stream, &ack).await?;
            debug!(%peer, "Session established");
            return Ok(Some(cipher));
        } else {
            return Err(VaultError::Protocol(
                "connection did not start with a key or session request".to_string(),
            ));
        }
    }
}

async fn serve(
    shared: &Shared,
    jobs: &mpsc::Sender<Job>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let Some(cipher) = handshake(shared, &mut stream, peer).await? else {
        return Ok(());
    };

    while let Some(frame) = next_frame(shared, &mut stream).await? {
        let body = cipher.open(&frame)?;
        let (response, command) = match parse_request(&body) {
            Ok(request) => {
                let command = request.command.clone();
                let Some(response) = dispatch(jobs, request).await else {
                    return Ok(());
                };
                (response, Some(command))
            }
            Err(e) => {
                debug!(%peer, error = %e, "Malformed request");
                (Response::status(Status::ErrReqFmt), None)
            }
        };

        write_frame(&mut stream, &cipher.seal(&response.to_bytes())?).await?;

        if response.status != Status::Ok {
            continue;
        }
        match command {
            Some(Command::Register) => {
                let push = cipher.seal(shared.keys.public_pem().as_bytes())?;
                write_frame(&mut stream, &push).await?;
            }
            Some(Command::Shutdown) => {
                shared.shutdown.cancel();
                return Ok(());
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::wrap_session;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            key_file: dir.path().join("rsa"),
            data_file: dir.path().join("company.dir"),
            key_bits: 1024,
            workers: 2,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_keys_are_generated_then_reused() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let first = load_or_generate_keys(&config).unwrap();
        assert!(config.public_key_path().exists());
        assert!(config.private_key_path().exists());
        let second = load_or_generate_keys(&config).unwrap();
        assert_eq!(first.public_pem(), second.public_pem());
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let server = VaultServer::bind(test_config(&dir)).await.unwrap();
        let token = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_single_worker_serves_many_sessions() {
        use crate::client::{Client, Credentials};

        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            workers: 1,
            ..test_config(&dir)
        };
        let server = VaultServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let token = server.shutdown_handle();
        let pem = server.shared.keys.public_pem().to_string();
        let task = tokio::spawn(server.run());

        // The first session stays open and idle
        let alice = Credentials::new("alice", "alice_password");
        let mut first = Client::connect(&addr, &pem).await.unwrap();
        assert_eq!(first.register(&alice).await.unwrap().status, Status::Ok);

        let bob = Credentials::new("bob", "bob_password");
        let second = async {
            let mut client = Client::connect(&addr, &pem).await.unwrap();
            assert_eq!(client.register(&bob).await.unwrap().status, Status::Ok);
            assert_eq!(client.insert(&bob, "k", "v").await.unwrap().status, Status::Ok);
            client
        };
        let second = tokio::time::timeout(Duration::from_secs(3), second)
            .await
            .expect("second session was not served");

        // Both sessions keep working side by side
        assert_eq!(first.get(&alice, "k").await.unwrap().status, Status::Ok);
        first.close().await.unwrap();
        second.close().await.unwrap();

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_and_bad_first_frame() {
        let dir = TempDir::new().unwrap();
        let server = VaultServer::bind(test_config(&dir)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let token = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        // Key fetch, then a session on the same socket
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, KEY_REQUEST).await.unwrap();
        let pem = read_frame(&mut stream, 1 << 16).await.unwrap().unwrap();
        let pem = String::from_utf8(pem).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));

        let (cipher, wrapped) = wrap_session(&pem).unwrap();
        let mut frame = SESSION_REQUEST.to_vec();
        frame.extend_from_slice(&wrapped);
        write_frame(&mut stream, &frame).await.unwrap();
        let ack = read_frame(&mut stream, 1 << 16).await.unwrap().unwrap();
        let ack = crate::protocol::parse_response(&cipher.open(&ack).unwrap()).unwrap();
        assert_eq!(ack.status, Status::Ok);

        // A garbage request body still gets an answer
        write_frame(&mut stream, &cipher.seal(b"nonsense").unwrap())
            .await
            .unwrap();
        let reply = read_frame(&mut stream, 1 << 16).await.unwrap().unwrap();
        let reply = crate::protocol::parse_response(&cipher.open(&reply).unwrap()).unwrap();
        assert_eq!(reply.status, Status::ErrReqFmt);

        // Anything else as the first frame closes the connection
        let mut other = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut other, b"HELLO___").await.unwrap();
        assert_eq!(read_frame(&mut other, 1 << 16).await.ok().flatten(), None);

        token.cancel();
        task.await.unwrap().unwrap();
    }
}
