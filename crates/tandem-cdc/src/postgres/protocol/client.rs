//! Replication-mode PostgreSQL client
//!
//! Minimal TCP client for the streaming replication protocol: startup with
//! `replication=database`, cleartext or MD5 password auth, then
//! `START_REPLICATION ... LOGICAL` into CopyBoth mode. The query side of the
//! connector uses tokio-postgres; this client exists because replication
//! mode needs raw access to CopyData frames and standby status updates.

use anyhow::{anyhow, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

/// Connect timeout for the replication session.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-read/write timeout once streaming.
const IO_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on a single protocol frame; anything larger is a corrupt
/// stream, not a real message.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Microseconds between the Unix and PostgreSQL epochs (2000-01-01).
const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

/// A connection in replication mode, pre-streaming.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    /// Connect and authenticate with `replication=database`.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        info!(host, port, user, database, "opening replication session");

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| anyhow!("connect timeout after {CONNECT_TIMEOUT:?}"))?
            .context("tcp connect")?;
        let mut stream = BufReader::new(stream);

        let params = vec![
            ("user", user),
            ("database", database),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        // Authentication exchange.
        loop {
            let (type_code, body) = read_frame(&mut stream).await?;

            let mut raw = BytesMut::with_capacity(1 + 4 + body.len());
            raw.put_u8(type_code);
            raw.put_i32((body.len() + 4) as i32);
            raw.put_slice(&body);
            let msg = backend::Message::parse(&mut raw)?
                .ok_or_else(|| anyhow!("failed to parse auth message"))?;

            match msg {
                backend::Message::AuthenticationOk => {
                    debug!("replication session authenticated");
                    break;
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let pass = password.ok_or_else(|| anyhow!("password required"))?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(pass.as_bytes(), &mut buf)?;
                    stream.write_all(&buf).await?;
                    stream.flush().await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let pass = password.ok_or_else(|| anyhow!("password required"))?;
                    let hashed = md5_password(user, pass, &body.salt());
                    let mut buf = BytesMut::new();
                    frontend::password_message(hashed.as_bytes(), &mut buf)?;
                    stream.write_all(&buf).await?;
                    stream.flush().await?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    return Err(anyhow!(
                        "server requires SCRAM auth on the replication session; \
                         configure md5 or password auth for the replication role"
                    ));
                }
                backend::Message::ErrorResponse(_) => {
                    return Err(anyhow!("authentication rejected"));
                }
                _ => return Err(anyhow!("unexpected message during auth: {type_code:#04x}")),
            }
        }

        // Drain parameter status etc. until ReadyForQuery.
        loop {
            let (type_code, _) = read_frame(&mut stream).await?;
            match type_code {
                b'Z' => break,
                b'E' => return Err(anyhow!("error waiting for ready-for-query")),
                _ => {}
            }
        }

        Ok(Self { stream })
    }

    /// Enter CopyBoth mode streaming from `slot` at `start_lsn` (0 resumes
    /// from the slot's confirmed position).
    pub async fn start_replication(
        mut self,
        slot: &str,
        start_lsn: u64,
        publication: &str,
    ) -> Result<ReplicationStream> {
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {:X}/{:X} \
             (proto_version '1', publication_names '{}')",
            slot,
            (start_lsn >> 32) as u32,
            start_lsn as u32,
            publication
        );

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let (type_code, _) = read_frame(&mut self.stream).await?;
        match type_code {
            b'W' => {
                info!(slot, publication, "replication stream started");
                Ok(ReplicationStream {
                    stream: self.stream,
                })
            }
            b'E' => Err(anyhow!("START_REPLICATION rejected for slot {slot}")),
            t => Err(anyhow!(
                "unexpected response to START_REPLICATION: {:?}",
                t as char
            )),
        }
    }
}

/// CopyBoth stream of WAL data.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Next CopyData payload; `None` when the server ends the copy.
    pub async fn next_message(&mut self) -> Result<Option<Bytes>> {
        let (type_code, body) = read_frame(&mut self.stream).await?;
        match type_code {
            b'd' => Ok(Some(Bytes::from(body))),
            b'c' => Ok(None),
            b'E' => Err(anyhow!("replication stream error frame")),
            t => Err(anyhow!("unexpected frame in CopyBoth: {:?}", t as char)),
        }
    }

    /// Standby status update. `write_lsn` is the newest position received;
    /// `flush_lsn` must only ever carry positions durably applied at the
    /// target, because the server trims WAL up to it.
    pub async fn send_status_update(
        &mut self,
        write_lsn: u64,
        flush_lsn: u64,
        reply_requested: bool,
    ) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(write_lsn);
        payload.put_u64(flush_lsn);
        payload.put_u64(flush_lsn); // apply == flush for this relay
        payload.put_i64(pg_now_micros());
        payload.put_u8(u8::from(reply_requested));

        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        timeout(IO_TIMEOUT, async {
            self.stream.get_mut().write_all(&frame).await?;
            self.stream.get_mut().flush().await
        })
        .await
        .map_err(|_| anyhow!("status update write timeout"))??;
        Ok(())
    }
}

/// Parse an XLogData ('w') or keepalive ('k') payload header.
#[derive(Debug)]
pub enum WalFrame {
    /// XLogData: WAL bytes plus their start/end positions
    XLogData {
        wal_start: u64,
        wal_end: u64,
        data: Bytes,
    },
    /// Primary keepalive
    KeepAlive { wal_end: u64, reply_requested: bool },
}

impl WalFrame {
    /// Split a CopyData payload into its replication sub-message.
    pub fn parse(mut payload: Bytes) -> Result<WalFrame> {
        if !payload.has_remaining() {
            return Err(anyhow!("empty CopyData payload"));
        }
        match payload.get_u8() {
            b'w' => {
                if payload.remaining() < 24 {
                    return Err(anyhow!("short XLogData header"));
                }
                let wal_start = payload.get_u64();
                let wal_end = payload.get_u64();
                let _server_time = payload.get_i64();
                Ok(WalFrame::XLogData {
                    wal_start,
                    wal_end,
                    data: payload,
                })
            }
            b'k' => {
                if payload.remaining() < 17 {
                    return Err(anyhow!("short keepalive"));
                }
                let wal_end = payload.get_u64();
                let _server_time = payload.get_i64();
                let reply_requested = payload.get_u8() == 1;
                Ok(WalFrame::KeepAlive {
                    wal_end,
                    reply_requested,
                })
            }
            t => Err(anyhow!("unknown replication sub-message: {:?}", t as char)),
        }
    }
}

async fn read_frame(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let (type_code, len) = timeout(IO_TIMEOUT, async {
        let type_code = stream.read_u8().await?;
        let len = stream.read_i32().await?;
        Ok::<_, std::io::Error>((type_code, len))
    })
    .await
    .map_err(|_| anyhow!("read timeout"))?
    .context("read frame header")?;

    let len = len as usize;
    if !(4..=MAX_FRAME_SIZE).contains(&len) {
        return Err(anyhow!("invalid frame length {len}"));
    }

    let mut body = vec![0u8; len - 4];
    timeout(IO_TIMEOUT, stream.read_exact(&mut body))
        .await
        .map_err(|_| anyhow!("read timeout"))?
        .context("read frame body")?;

    Ok((type_code, body))
}

/// Microseconds since the PostgreSQL epoch, for status updates.
fn pg_now_micros() -> i64 {
    let pg_epoch =
        std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(PG_EPOCH_OFFSET_SECS);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn md5_password(user: &str, pass: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pass);
    hasher.update(user);
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_md5_password_format() {
        let hashed = md5_password("replicator", "secret", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 3 + 32);
        // Deterministic for fixed inputs
        assert_eq!(hashed, md5_password("replicator", "secret", &[1, 2, 3, 4]));
    }

    #[test]
    fn test_wal_frame_parse_xlogdata() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'w');
        payload.put_u64(0x10);
        payload.put_u64(0x20);
        payload.put_i64(0);
        payload.put_slice(b"inner");

        match WalFrame::parse(payload.freeze()).unwrap() {
            WalFrame::XLogData {
                wal_start,
                wal_end,
                data,
            } => {
                assert_eq!(wal_start, 0x10);
                assert_eq!(wal_end, 0x20);
                assert_eq!(&data[..], b"inner");
            }
            other => panic!("expected XLogData, got {other:?}"),
        }
    }

    #[test]
    fn test_wal_frame_parse_keepalive() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'k');
        payload.put_u64(0x30);
        payload.put_i64(0);
        payload.put_u8(1);

        match WalFrame::parse(payload.freeze()).unwrap() {
            WalFrame::KeepAlive {
                wal_end,
                reply_requested,
            } => {
                assert_eq!(wal_end, 0x30);
                assert!(reply_requested);
            }
            other => panic!("expected KeepAlive, got {other:?}"),
        }
    }

    #[test]
    fn test_wal_frame_rejects_garbage() {
        assert!(WalFrame::parse(Bytes::new()).is_err());
        assert!(WalFrame::parse(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_pg_epoch_offset() {
        // 2000-01-01 is 946684800s after 1970-01-01
        assert_eq!(PG_EPOCH_OFFSET_SECS, 946_684_800);
        assert!(pg_now_micros() > 0);
    }
}
