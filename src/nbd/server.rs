//! NBD server
//!
//! Listener and per-connection handling for the two protocol phases:
//! negotiation (handshake, client flags, option haggling) and transmission
//! (command dispatch against a storage backend). Each accepted connection
//! owns its storage instance and the lease on its export.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::protocol::{self, NbdCommand, OptionHeader, Request};
use crate::config::ServerConfig;
use crate::storage::{ClientManager, S3Storage, StorageBackend, StorageError};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
#[cfg(not(target_os = "windows"))]
const KEEPALIVE_RETRIES: u32 = 6;

/// Upper bound on a single READ/WRITE payload; anything larger is a framing
/// error.
const MAX_REQUEST_LENGTH: u32 = 32 * 1024 * 1024;

/// Upper bound on option data (export name plus information requests).
const MAX_OPTION_LENGTH: u32 = 65536;

/// Connection-fatal errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// NBD server: accepts connections and serves exports backed by the object
/// store.
pub struct NbdServer {
    config: ServerConfig,
    s3: Arc<ClientManager>,
    server_id: String,
}

impl NbdServer {
    pub fn new(config: ServerConfig) -> Self {
        let s3 = Arc::new(ClientManager::new(&config.s3));
        Self {
            config,
            s3,
            server_id: Uuid::new_v4().to_string(),
        }
    }

    /// Run until interrupted. Every accepted socket gets its own task; on
    /// shutdown the listener closes first, then handlers are signalled and
    /// awaited so each releases its lease.
    pub async fn run(&self) -> io::Result<()> {
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        log::info!(
            "NBD server listening on {}:{} (server={})",
            self.config.host,
            self.config.port,
            self.server_id
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::info!("Connection from {}", peer);
                            if let Err(err) = configure_keepalive(&stream) {
                                log::warn!("Failed to set keepalive for {}: {}", peer, err);
                            }

                            let connection = Connection {
                                config: self.config.clone(),
                                s3: Arc::clone(&self.s3),
                                server_id: self.server_id.clone(),
                                connection_id: Uuid::new_v4().to_string(),
                            };
                            let shutdown = shutdown_rx.clone();
                            handlers.spawn(async move {
                                match connection.handle(stream, shutdown).await {
                                    Ok(()) => log::info!("Connection from {} closed", peer),
                                    Err(err) => log::warn!("Connection from {} failed: {}", peer, err),
                                }
                            });
                        }
                        Err(err) => log::error!("Accept error: {}", err),
                    }
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        drop(listener);
        let _ = shutdown_tx.send(true);
        while handlers.join_next().await.is_some() {}
        log::info!("Server stopped");
        Ok(())
    }
}

/// Enable TCP keepalive on an accepted socket so silently-dead clients are
/// detected in roughly two minutes and their lease gets released.
fn configure_keepalive(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    #[allow(unused_mut)]
    let mut keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    #[cfg(not(target_os = "windows"))]
    {
        keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    }
    sock.set_tcp_keepalive(&keepalive)
}

/// State for one accepted connection.
struct Connection {
    config: ServerConfig,
    s3: Arc<ClientManager>,
    server_id: String,
    connection_id: String,
}

impl Connection {
    async fn handle(
        &self,
        stream: TcpStream,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let export_name =
            match negotiate(&mut reader, &mut writer, self.config.export_size).await? {
                Some(name) => name,
                None => return Ok(()),
            };

        let storage = match S3Storage::create(
            &export_name,
            Arc::clone(&self.s3),
            self.config.block_size,
            &self.server_id,
            &self.connection_id,
            self.config.lease_duration,
        )
        .await
        {
            Ok(storage) => storage,
            Err(StorageError::ExportBusy(name)) => {
                log::warn!("Export '{}' is busy, dropping connection", name);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        log::info!(
            "Negotiation complete for export '{}', entering transmission",
            export_name
        );
        let result = transmission(&mut reader, &mut writer, &storage, shutdown).await;
        storage.release().await;
        result
    }
}

/// Drive the handshake and option negotiation. Returns the export name the
/// client selected, or `None` when the client aborted or asked for an option
/// this profile does not serve.
pub async fn negotiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    export_size: u64,
) -> Result<Option<String>, ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut handshake = Vec::with_capacity(18);
    protocol::write_handshake(&mut handshake)?;
    writer.write_all(&handshake).await?;
    writer.flush().await?;
    log::debug!("Sent handshake: {} bytes", handshake.len());

    let mut flags = [0u8; 4];
    reader.read_exact(&mut flags).await?;
    let client_flags = u32::from_be_bytes(flags);
    log::debug!("Client flags: 0x{:08x}", client_flags);

    let mut header = [0u8; protocol::OPTION_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let option = OptionHeader::parse(&header)?;

    if option.length > MAX_OPTION_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("option data length {} is implausible", option.length),
        )
        .into());
    }
    let mut data = vec![0u8; option.length as usize];
    if option.length > 0 {
        reader.read_exact(&mut data).await?;
    }

    match option.option {
        protocol::NBD_OPT_GO => {
            let export_name = protocol::parse_go_data(&data)?;
            log::info!("Export name: '{}'", export_name);

            let mut reply = Vec::new();
            protocol::write_info_reply(
                &mut reply,
                option.option,
                export_size,
                protocol::TRANSMISSION_FLAGS,
            )?;
            protocol::write_ack_reply(&mut reply, option.option)?;
            writer.write_all(&reply).await?;
            writer.flush().await?;
            log::debug!(
                "Sent NBD_REP_INFO (size={} bytes, flags=0x{:04x}) and NBD_REP_ACK",
                export_size,
                protocol::TRANSMISSION_FLAGS
            );

            Ok(Some(export_name))
        }
        protocol::NBD_OPT_ABORT => {
            log::info!("Client requested abort");
            Ok(None)
        }
        other => {
            log::warn!("Unsupported option: 0x{:08x}", other);
            Ok(None)
        }
    }
}

/// Transmission-phase command loop. Commands are consumed strictly in order
/// and replies are written in issue order. Ends on DISC, client EOF,
/// shutdown, or a fatal error.
pub async fn transmission<R, W, S>(
    reader: &mut R,
    writer: &mut W,
    storage: &S,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: StorageBackend,
{
    loop {
        let mut header = [0u8; protocol::REQUEST_LEN];
        tokio::select! {
            _ = shutdown.changed() => {
                log::info!("Shutdown requested, closing connection");
                return Ok(());
            }
            read = reader.read_exact(&mut header) => {
                match read {
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                        log::info!("Client disconnected");
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let request = Request::parse(&header)?;
        log::debug!(
            "Command: type={}, handle={:016x}, offset={}, length={}",
            request.cmd_type,
            request.handle,
            request.offset,
            request.length
        );

        if request.length > MAX_REQUEST_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request length {} exceeds maximum", request.length),
            )
            .into());
        }

        match request.command_type() {
            Some(NbdCommand::Read) => handle_read(writer, storage, &request).await?,
            Some(NbdCommand::Write) => handle_write(reader, writer, storage, &request).await?,
            Some(NbdCommand::Flush) => handle_flush(writer, storage, &request).await?,
            Some(NbdCommand::Disc) => {
                log::info!("Client requested disconnect");
                return Ok(());
            }
            None => {
                log::warn!("Unsupported command type {}", request.cmd_type);
                send_simple_reply(writer, libc::EPERM as u32, request.handle).await?;
            }
        }
    }
}

/// Handle READ: reply header first, then the data.
async fn handle_read<W, S>(
    writer: &mut W,
    storage: &S,
    request: &Request,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
    S: StorageBackend,
{
    match storage.read(request.offset, request.length).await {
        Ok(data) => {
            send_simple_reply_with_data(writer, 0, request.handle, &data).await?;
            log::debug!("Sent READ reply: {} bytes", data.len());
            Ok(())
        }
        Err(err @ StorageError::LeaseLost(_)) => Err(err.into()),
        Err(err) => {
            log::error!(
                "Read error at offset {}, length {}: {}",
                request.offset,
                request.length,
                err
            );
            send_simple_reply(writer, libc::EIO as u32, request.handle).await?;
            Ok(())
        }
    }
}

/// Handle WRITE: the payload is consumed before storage is involved, so the
/// stream stays framed even when the write fails.
async fn handle_write<R, W, S>(
    reader: &mut R,
    writer: &mut W,
    storage: &S,
    request: &Request,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: StorageBackend,
{
    let mut data = vec![0u8; request.length as usize];
    reader.read_exact(&mut data).await?;

    match storage.write(request.offset, &data).await {
        Ok(()) => {
            send_simple_reply(writer, 0, request.handle).await?;
            log::debug!(
                "Processed WRITE: {} bytes at offset {}",
                request.length,
                request.offset
            );
            Ok(())
        }
        Err(err @ StorageError::LeaseLost(_)) => Err(err.into()),
        Err(err) => {
            log::error!(
                "Write error at offset {}, length {}: {}",
                request.offset,
                request.length,
                err
            );
            send_simple_reply(writer, libc::EIO as u32, request.handle).await?;
            Ok(())
        }
    }
}

async fn handle_flush<W, S>(
    writer: &mut W,
    storage: &S,
    request: &Request,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
    S: StorageBackend,
{
    match storage.flush().await {
        Ok(()) => {
            send_simple_reply(writer, 0, request.handle).await?;
            log::debug!("Processed FLUSH");
            Ok(())
        }
        Err(err @ StorageError::LeaseLost(_)) => Err(err.into()),
        Err(err) => {
            log::error!("Flush error: {}", err);
            send_simple_reply(writer, libc::EIO as u32, request.handle).await?;
            Ok(())
        }
    }
}

async fn send_simple_reply<W>(writer: &mut W, error: u32, handle: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(16);
    protocol::write_simple_reply(&mut buf, error, handle)?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

async fn send_simple_reply_with_data<W>(
    writer: &mut W,
    error: u32,
    handle: u64,
    data: &[u8],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(16 + data.len());
    protocol::write_simple_reply(&mut buf, error, handle)?;
    buf.extend_from_slice(data);
    writer.write_all(&buf).await?;
    writer.flush().await
}
