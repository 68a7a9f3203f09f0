//! Minimal NBD client for the local transport endpoint.
//!
//! Only what the copy path needs is implemented: the fixed-newstyle handshake,
//! structured replies, the `base:allocation` meta context, reads, block status
//! and a clean disconnect. Requests are issued one at a time.

use crate::block::{BlockFlags, BlockSource, StatusDescriptor};
use crate::error::{NbdError, TransportError};
use crate::log_debug;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{Instant, sleep, timeout_at};

pub const NBDMAGIC: u64 = 0x4e42_444d_4147_4943;
pub const IHAVEOPT: u64 = 0x4948_4156_454f_5054;
pub const OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

pub const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const FLAG_NO_ZEROES: u16 = 1 << 1;

pub const OPT_GO: u32 = 7;
pub const OPT_STRUCTURED_REPLY: u32 = 8;
pub const OPT_SET_META_CONTEXT: u32 = 10;

pub const REP_ACK: u32 = 1;
pub const REP_INFO: u32 = 3;
pub const REP_META_CONTEXT: u32 = 4;
const REP_ERR_BIT: u32 = 1 << 31;

pub const INFO_EXPORT: u16 = 0;

pub const CMD_READ: u16 = 0;
pub const CMD_DISC: u16 = 2;
pub const CMD_BLOCK_STATUS: u16 = 7;
pub const CMD_FLAG_REQ_ONE: u16 = 1 << 3;

pub const REPLY_FLAG_DONE: u16 = 1 << 0;
pub const REPLY_TYPE_NONE: u16 = 0;
pub const REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub const REPLY_TYPE_OFFSET_HOLE: u16 = 2;
pub const REPLY_TYPE_BLOCK_STATUS: u16 = 5;
const REPLY_TYPE_ERR_BIT: u16 = 1 << 15;
pub const REPLY_TYPE_ERROR_OFFSET: u16 = REPLY_TYPE_ERR_BIT | 2;

pub const BASE_ALLOCATION: &str = "base:allocation";

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);
// Option replies larger than this are treated as a protocol violation.
const MAX_OPTION_REPLY: u32 = 64 * 1024;

/// What the server agreed to during the handshake.
#[derive(Debug, Clone, Default)]
pub struct Negotiated {
    pub size: u64,
    pub transmission_flags: u16,
    pub structured_replies: bool,
    pub allocation_context: Option<u32>,
}

pub struct NbdClient<S> {
    stream: S,
    negotiated: Negotiated,
    next_cookie: u64,
}

impl NbdClient<UnixStream> {
    /// Connect to the endpoint at `socket`, retrying until it accepts or
    /// `timeout` expires. The transport process creates the socket some time
    /// after it starts, so the first connect is expected to race it.
    pub async fn connect_with_timeout(
        socket: &Path,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let last_error = match UnixStream::connect(socket).await {
                Ok(stream) => match timeout_at(deadline, Self::handshake(stream)).await {
                    Ok(Ok(client)) => return Ok(client),
                    Ok(Err(NbdError::Io(err))) => err.to_string(),
                    Ok(Err(err)) => {
                        return Err(TransportError::Unreachable {
                            socket: socket.to_path_buf(),
                            reason: err.to_string(),
                        });
                    }
                    Err(_) => {
                        return Err(TransportError::Unreachable {
                            socket: socket.to_path_buf(),
                            reason: format!("handshake did not complete within {:?}", timeout),
                        });
                    }
                },
                Err(err) => err.to_string(),
            };

            if Instant::now() >= deadline {
                return Err(TransportError::Unreachable {
                    socket: socket.to_path_buf(),
                    reason: last_error,
                });
            }
            log_debug!(socket = %socket.display(), error = %last_error, "NBD endpoint not ready, retrying");
            sleep(CONNECT_RETRY_INTERVAL).await;
        }
    }
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the fixed-newstyle handshake against the default export.
    pub async fn handshake(mut stream: S) -> Result<Self, NbdError> {
        let magic = stream.read_u64().await?;
        if magic != NBDMAGIC {
            return Err(NbdError::BadMagic {
                expected: NBDMAGIC,
                found: magic,
            });
        }
        let opt_magic = stream.read_u64().await?;
        if opt_magic != IHAVEOPT {
            return Err(NbdError::Handshake(
                "server does not speak the newstyle protocol".to_string(),
            ));
        }
        let server_flags = stream.read_u16().await?;
        if server_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(NbdError::Handshake(
                "server does not support fixed newstyle negotiation".to_string(),
            ));
        }
        let client_flags = FLAG_FIXED_NEWSTYLE | (server_flags & FLAG_NO_ZEROES);
        stream.write_u32(u32::from(client_flags)).await?;

        let mut client = NbdClient {
            stream,
            negotiated: Negotiated::default(),
            next_cookie: 1,
        };

        client.negotiated.structured_replies = client.negotiate_structured_replies().await?;
        if client.negotiated.structured_replies {
            client.negotiated.allocation_context = client.negotiate_allocation_context().await?;
        }
        client.negotiate_go().await?;

        log_debug!(
            size = client.negotiated.size,
            structured = client.negotiated.structured_replies,
            block_status = client.negotiated.allocation_context.is_some(),
            "NBD handshake complete"
        );
        Ok(client)
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// Send `NBD_CMD_DISC`. The server closes the connection without replying.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        let cookie = self.cookie();
        self.send_request(CMD_DISC, 0, cookie, 0, 0).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn send_option(&mut self, option: u32, data: &[u8]) -> Result<(), NbdError> {
        let length = u32::try_from(data.len())
            .map_err(|_| NbdError::Protocol("option payload too large".to_string()))?;
        self.stream.write_u64(IHAVEOPT).await?;
        self.stream.write_u32(option).await?;
        self.stream.write_u32(length).await?;
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_option_reply(&mut self, option: u32) -> Result<(u32, Vec<u8>), NbdError> {
        let magic = self.stream.read_u64().await?;
        if magic != OPTION_REPLY_MAGIC {
            return Err(NbdError::BadMagic {
                expected: OPTION_REPLY_MAGIC,
                found: magic,
            });
        }
        let replied_option = self.stream.read_u32().await?;
        if replied_option != option {
            return Err(NbdError::Protocol(format!(
                "reply for option {} while negotiating {}",
                replied_option, option
            )));
        }
        let reply_type = self.stream.read_u32().await?;
        let length = self.stream.read_u32().await?;
        if length > MAX_OPTION_REPLY {
            return Err(NbdError::Protocol(format!(
                "option reply of {} bytes",
                length
            )));
        }
        let mut data = vec![0u8; length as usize];
        self.stream.read_exact(&mut data).await?;
        Ok((reply_type, data))
    }

    async fn negotiate_structured_replies(&mut self) -> Result<bool, NbdError> {
        self.send_option(OPT_STRUCTURED_REPLY, &[]).await?;
        let (reply, _) = self.read_option_reply(OPT_STRUCTURED_REPLY).await?;
        match reply {
            REP_ACK => Ok(true),
            r if r & REP_ERR_BIT != 0 => Ok(false),
            other => Err(NbdError::Protocol(format!(
                "unexpected reply {:#x} to structured reply option",
                other
            ))),
        }
    }

    async fn negotiate_allocation_context(&mut self) -> Result<Option<u32>, NbdError> {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes()); // default export
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&(BASE_ALLOCATION.len() as u32).to_be_bytes());
        data.extend_from_slice(BASE_ALLOCATION.as_bytes());
        self.send_option(OPT_SET_META_CONTEXT, &data).await?;

        let mut context = None;
        loop {
            let (reply, payload) = self.read_option_reply(OPT_SET_META_CONTEXT).await?;
            match reply {
                REP_META_CONTEXT => {
                    if payload.len() < 4 {
                        return Err(NbdError::Protocol("short meta context reply".to_string()));
                    }
                    let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    if &payload[4..] == BASE_ALLOCATION.as_bytes() {
                        context = Some(id);
                    }
                }
                REP_ACK => return Ok(context),
                r if r & REP_ERR_BIT != 0 => return Ok(None),
                other => {
                    return Err(NbdError::Protocol(format!(
                        "unexpected reply {:#x} to meta context option",
                        other
                    )));
                }
            }
        }
    }

    async fn negotiate_go(&mut self) -> Result<(), NbdError> {
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes()); // default export
        data.extend_from_slice(&0u16.to_be_bytes()); // no extra info requests
        self.send_option(OPT_GO, &data).await?;

        let mut have_size = false;
        loop {
            let (reply, payload) = self.read_option_reply(OPT_GO).await?;
            match reply {
                REP_INFO => {
                    if payload.len() >= 12 && u16::from_be_bytes([payload[0], payload[1]]) == INFO_EXPORT
                    {
                        let mut size = [0u8; 8];
                        size.copy_from_slice(&payload[2..10]);
                        self.negotiated.size = u64::from_be_bytes(size);
                        self.negotiated.transmission_flags =
                            u16::from_be_bytes([payload[10], payload[11]]);
                        have_size = true;
                    }
                }
                REP_ACK if have_size => return Ok(()),
                REP_ACK => {
                    return Err(NbdError::Handshake(
                        "server finished NBD_OPT_GO without export info".to_string(),
                    ));
                }
                r if r & REP_ERR_BIT != 0 => {
                    return Err(NbdError::OptionRejected {
                        option: OPT_GO,
                        reply: r,
                    });
                }
                _ => {}
            }
        }
    }

    fn cookie(&mut self) -> u64 {
        let cookie = self.next_cookie;
        self.next_cookie = self.next_cookie.wrapping_add(1);
        cookie
    }

    async fn send_request(
        &mut self,
        command: u16,
        flags: u16,
        cookie: u64,
        offset: u64,
        length: u32,
    ) -> Result<(), NbdError> {
        let mut header = [0u8; 28];
        header[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
        header[4..6].copy_from_slice(&flags.to_be_bytes());
        header[6..8].copy_from_slice(&command.to_be_bytes());
        header[8..16].copy_from_slice(&cookie.to_be_bytes());
        header[16..24].copy_from_slice(&offset.to_be_bytes());
        header[24..28].copy_from_slice(&length.to_be_bytes());
        self.stream.write_all(&header).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_chunk_header(&mut self, cookie: u64) -> Result<ChunkHeader, NbdError> {
        let magic = self.stream.read_u32().await?;
        let header = match magic {
            SIMPLE_REPLY_MAGIC => {
                let error = self.stream.read_u32().await?;
                let reply_cookie = self.stream.read_u64().await?;
                ChunkHeader::Simple {
                    error,
                    cookie: reply_cookie,
                }
            }
            STRUCTURED_REPLY_MAGIC => {
                let flags = self.stream.read_u16().await?;
                let reply_type = self.stream.read_u16().await?;
                let reply_cookie = self.stream.read_u64().await?;
                let length = self.stream.read_u32().await?;
                ChunkHeader::Structured {
                    flags,
                    reply_type,
                    cookie: reply_cookie,
                    length,
                }
            }
            other => {
                return Err(NbdError::BadMagic {
                    expected: u64::from(STRUCTURED_REPLY_MAGIC),
                    found: u64::from(other),
                });
            }
        };
        if header.cookie() != cookie {
            return Err(NbdError::Protocol(format!(
                "reply cookie {} does not match request {}",
                header.cookie(),
                cookie
            )));
        }
        Ok(header)
    }

    async fn read_payload(&mut self, length: u32) -> Result<Vec<u8>, NbdError> {
        let mut payload = vec![0u8; length as usize];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    async fn read_error_chunk(
        &mut self,
        command: &'static str,
        offset: u64,
        reply_type: u16,
        length: u32,
    ) -> Result<NbdError, NbdError> {
        let payload = self.read_payload(length).await?;
        if payload.len() < 6 {
            return Err(NbdError::Protocol("short error chunk".to_string()));
        }
        let errno = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let message_len = u16::from_be_bytes([payload[4], payload[5]]) as usize;
        let message_end = (6 + message_len).min(payload.len());
        let message = String::from_utf8_lossy(&payload[6..message_end]).into_owned();
        let offset = if reply_type == REPLY_TYPE_ERROR_OFFSET && payload.len() >= message_end + 8 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&payload[message_end..message_end + 8]);
            u64::from_be_bytes(raw)
        } else {
            offset
        };
        Ok(NbdError::Command {
            command,
            offset,
            errno,
            message,
        })
    }

    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), NbdError> {
        let length = u32::try_from(buf.len())
            .map_err(|_| NbdError::Protocol("read request exceeds 4 GiB".to_string()))?;
        let cookie = self.cookie();
        self.send_request(CMD_READ, 0, cookie, offset, length).await?;

        let mut pending_error = None;
        let mut filled = 0u64;
        loop {
            match self.read_chunk_header(cookie).await? {
                ChunkHeader::Simple { error, .. } => {
                    if error != 0 {
                        return Err(NbdError::Command {
                            command: "read",
                            offset,
                            errno: error,
                            message: String::new(),
                        });
                    }
                    self.stream.read_exact(buf).await?;
                    return Ok(());
                }
                ChunkHeader::Structured {
                    flags,
                    reply_type,
                    length: chunk_len,
                    ..
                } => {
                    match reply_type {
                        REPLY_TYPE_OFFSET_DATA => {
                            if chunk_len < 8 {
                                return Err(NbdError::Protocol("short data chunk".to_string()));
                            }
                            let chunk_offset = self.stream.read_u64().await?;
                            let data_len = u64::from(chunk_len - 8);
                            let start = chunk_slot(offset, buf.len(), chunk_offset, data_len)?;
                            self.stream
                                .read_exact(&mut buf[start..start + data_len as usize])
                                .await?;
                            filled += data_len;
                        }
                        REPLY_TYPE_OFFSET_HOLE => {
                            if chunk_len != 12 {
                                return Err(NbdError::Protocol("malformed hole chunk".to_string()));
                            }
                            let chunk_offset = self.stream.read_u64().await?;
                            let hole_len = u64::from(self.stream.read_u32().await?);
                            let start = chunk_slot(offset, buf.len(), chunk_offset, hole_len)?;
                            buf[start..start + hole_len as usize].fill(0);
                            filled += hole_len;
                        }
                        REPLY_TYPE_NONE => {}
                        t if t & REPLY_TYPE_ERR_BIT != 0 => {
                            pending_error =
                                Some(self.read_error_chunk("read", offset, t, chunk_len).await?);
                        }
                        other => {
                            // Unknown non-error chunk types must be skipped.
                            log_debug!(reply_type = other, "skipping unknown NBD reply chunk");
                            self.read_payload(chunk_len).await?;
                        }
                    }
                    if flags & REPLY_FLAG_DONE != 0 {
                        break;
                    }
                }
            }
        }

        if let Some(err) = pending_error {
            return Err(err);
        }
        if filled != buf.len() as u64 {
            return Err(NbdError::Protocol(format!(
                "read at {} returned {} of {} bytes",
                offset,
                filled,
                buf.len()
            )));
        }
        Ok(())
    }

    async fn status(
        &mut self,
        offset: u64,
        length: u32,
    ) -> Result<Vec<StatusDescriptor>, NbdError> {
        let context = self
            .negotiated
            .allocation_context
            .ok_or(NbdError::BlockStatusUnsupported)?;
        let cookie = self.cookie();
        self.send_request(CMD_BLOCK_STATUS, CMD_FLAG_REQ_ONE, cookie, offset, length)
            .await?;

        let mut descriptors = Vec::new();
        let mut pending_error = None;
        loop {
            match self.read_chunk_header(cookie).await? {
                ChunkHeader::Simple { error, .. } => {
                    // Only legal for errors once structured replies are on.
                    return Err(NbdError::Command {
                        command: "block status",
                        offset,
                        errno: error,
                        message: String::new(),
                    });
                }
                ChunkHeader::Structured {
                    flags,
                    reply_type,
                    length: chunk_len,
                    ..
                } => {
                    match reply_type {
                        REPLY_TYPE_BLOCK_STATUS => {
                            let payload = self.read_payload(chunk_len).await?;
                            if payload.len() < 4 || (payload.len() - 4) % 8 != 0 {
                                return Err(NbdError::Protocol(
                                    "malformed block status chunk".to_string(),
                                ));
                            }
                            let id = u32::from_be_bytes([
                                payload[0], payload[1], payload[2], payload[3],
                            ]);
                            if id == context {
                                for entry in payload[4..].chunks_exact(8) {
                                    descriptors.push(StatusDescriptor {
                                        length: u32::from_be_bytes([
                                            entry[0], entry[1], entry[2], entry[3],
                                        ]),
                                        flags: BlockFlags::from_bits_retain(u32::from_be_bytes([
                                            entry[4], entry[5], entry[6], entry[7],
                                        ])),
                                    });
                                }
                            }
                        }
                        REPLY_TYPE_NONE => {}
                        t if t & REPLY_TYPE_ERR_BIT != 0 => {
                            pending_error = Some(
                                self.read_error_chunk("block status", offset, t, chunk_len)
                                    .await?,
                            );
                        }
                        _ => {
                            self.read_payload(chunk_len).await?;
                        }
                    }
                    if flags & REPLY_FLAG_DONE != 0 {
                        break;
                    }
                }
            }
        }

        match pending_error {
            Some(err) => Err(err),
            None => Ok(descriptors),
        }
    }
}

#[async_trait]
impl<S> BlockSource for NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn size(&self) -> u64 {
        self.negotiated.size
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), NbdError> {
        self.read(offset, buf).await
    }

    async fn block_status(
        &mut self,
        offset: u64,
        length: u32,
    ) -> Result<Vec<StatusDescriptor>, NbdError> {
        self.status(offset, length).await
    }
}

enum ChunkHeader {
    Simple {
        error: u32,
        cookie: u64,
    },
    Structured {
        flags: u16,
        reply_type: u16,
        cookie: u64,
        length: u32,
    },
}

impl ChunkHeader {
    fn cookie(&self) -> u64 {
        match self {
            ChunkHeader::Simple { cookie, .. } | ChunkHeader::Structured { cookie, .. } => *cookie,
        }
    }
}

/// Position of a reply chunk inside the caller's buffer.
fn chunk_slot(
    request_offset: u64,
    request_len: usize,
    chunk_offset: u64,
    chunk_len: u64,
) -> Result<usize, NbdError> {
    let request_end = request_offset + request_len as u64;
    if chunk_offset < request_offset || chunk_offset + chunk_len > request_end {
        return Err(NbdError::Protocol(format!(
            "chunk {}+{} outside request {}+{}",
            chunk_offset, chunk_len, request_offset, request_len
        )));
    }
    Ok((chunk_offset - request_offset) as usize)
}
