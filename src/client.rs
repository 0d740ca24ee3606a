//! Client library for connecting to a BlobVault server
//!
//! A [`Client`] owns one encrypted session. Every method sends one request
//! and returns the server's [`Response`]; request-level failures such as
//! `ERR_KEY` come back as a status, not as an `Err`.

use crate::crypto::{wrap_session, SessionCipher};
use crate::error::{Result, VaultError};
use crate::protocol::{
    parse_response, read_frame, write_frame, Command, Request, Response, Status, KEY_REQUEST,
    SESSION_REQUEST,
};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Largest frame the client will accept from a server
pub const CLIENT_FRAME_LIMIT: usize = 256 * 1024 * 1024;

/// Username and password sent with every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// Client for one BlobVault session
pub struct Client {
    stream: TcpStream,
    cipher: SessionCipher,
    pushed_key: Option<String>,
}

impl Client {
    /// Ask a server for its public key (PEM)
    pub async fn fetch_public_key(addr: &str) -> Result<String> {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, KEY_REQUEST).await?;
        let pem = read_frame(&mut stream, CLIENT_FRAME_LIMIT)
            .await?
            .ok_or_else(|| VaultError::Client("server closed during key fetch".to_string()))?;
        stream.shutdown().await?;
        String::from_utf8(pem)
            .map_err(|_| VaultError::Client("public key is not valid UTF-8".to_string()))
    }

    /// Connect and open a session using the server's public key
    pub async fn connect(addr: &str, public_pem: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let (cipher, wrapped) = wrap_session(public_pem)?;

        let mut hello = Vec::with_capacity(SESSION_REQUEST.len() + wrapped.len());
        hello.extend_from_slice(SESSION_REQUEST);
        hello.extend_from_slice(&wrapped);
        write_frame(&mut stream, &hello).await?;

        let mut client = Self {
            stream,
            cipher,
            pushed_key: None,
        };
        let ack = client.receive().await?;
        if ack.status != Status::Ok {
            return Err(VaultError::Client(format!(
                "session refused: {}",
                ack.status
            )));
        }
        Ok(client)
    }

    async fn receive_frame(&mut self) -> Result<Vec<u8>> {
        let frame = read_frame(&mut self.stream, CLIENT_FRAME_LIMIT)
            .await?
            .ok_or_else(|| VaultError::Client("server closed the connection".to_string()))?;
        self.cipher.open(&frame)
    }

    async fn receive(&mut self) -> Result<Response> {
        let body = self.receive_frame().await?;
        parse_response(&body)
    }

    /// Send a request and receive its response
    pub async fn call(&mut self, credentials: &Credentials, command: Command) -> Result<Response> {
        let request = Request::new(
            credentials.user.clone(),
            credentials.password.clone(),
            command,
        );
        let sealed = self.cipher.seal(&request.to_bytes())?;
        write_frame(&mut self.stream, &sealed).await?;
        self.receive().await
    }

    /// Register a new account. On success the server pushes its public key
    /// on the session, available afterwards from [`Client::pushed_key`].
    pub async fn register(&mut self, credentials: &Credentials) -> Result<Response> {
        let response = self.call(credentials, Command::Register).await?;
        if response.status == Status::Ok {
            let pushed = self.receive_frame().await?;
            self.pushed_key = Some(String::from_utf8_lossy(&pushed).into_owned());
        }
        Ok(response)
    }

    /// Key pushed by the server after the last successful registration
    pub fn pushed_key(&self) -> Option<&str> {
        self.pushed_key.as_deref()
    }

    /// Ask the server to shut down
    pub async fn shutdown(&mut self, credentials: &Credentials) -> Result<Response> {
        self.call(credentials, Command::Shutdown).await
    }

    /// Ask the server to compact its log
    pub async fn persist(&mut self, credentials: &Credentials) -> Result<Response> {
        self.call(credentials, Command::Persist).await
    }

    pub async fn set_content(
        &mut self,
        credentials: &Credentials,
        content: impl Into<Bytes>,
    ) -> Result<Response> {
        let command = Command::SetContent {
            content: content.into(),
        };
        self.call(credentials, command).await
    }

    pub async fn get_content(&mut self, credentials: &Credentials, who: &str) -> Result<Response> {
        let command = Command::GetContent {
            who: who.to_string(),
        };
        self.call(credentials, command).await
    }

    pub async fn all_users(&mut self, credentials: &Credentials) -> Result<Response> {
        self.call(credentials, Command::AllUsers).await
    }

    /// Insert a key that must not exist yet
    pub async fn insert(
        &mut self,
        credentials: &Credentials,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<Response> {
        let command = Command::Insert {
            key: key.to_string(),
            value: value.into(),
        };
        self.call(credentials, command).await
    }

    pub async fn get(&mut self, credentials: &Credentials, key: &str) -> Result<Response> {
        let command = Command::Get {
            key: key.to_string(),
        };
        self.call(credentials, command).await
    }

    pub async fn delete(&mut self, credentials: &Credentials, key: &str) -> Result<Response> {
        let command = Command::Delete {
            key: key.to_string(),
        };
        self.call(credentials, command).await
    }

    /// Insert or replace a key
    pub async fn upsert(
        &mut self,
        credentials: &Credentials,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<Response> {
        let command = Command::Upsert {
            key: key.to_string(),
            value: value.into(),
        };
        self.call(credentials, command).await
    }

    pub async fn all_keys(&mut self, credentials: &Credentials) -> Result<Response> {
        self.call(credentials, Command::AllKeys).await
    }

    pub async fn top_keys(&mut self, credentials: &Credentials) -> Result<Response> {
        self.call(credentials, Command::TopKeys).await
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
