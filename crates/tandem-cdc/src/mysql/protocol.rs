//! MySQL replication wire client
//!
//! Speaks just enough of the client/server protocol to be a replica:
//! handshake with `mysql_native_password` (including the auth-switch path
//! servers take when the account plugin differs), `COM_QUERY` for session
//! setup statements, `COM_REGISTER_SLAVE`, and `COM_BINLOG_DUMP` streaming.
//! Everything query-shaped beyond session setup goes through `mysql_async`
//! on the connector's query session instead.

use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(30);
/// 3-byte length prefix bounds a packet payload.
const MAX_PACKET_SIZE: usize = 16_777_215;

// Capability flags used in the handshake response.
const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

/// Parsed initial handshake from the server.
#[derive(Debug)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_name: String,
    salt: Vec<u8>,
}

impl Handshake {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let next_u8 = |pos: &mut usize| -> Result<u8> {
            let b = *data.get(*pos).ok_or_else(|| anyhow!("short handshake"))?;
            *pos += 1;
            Ok(b)
        };

        let protocol_version = next_u8(&mut pos)?;
        if protocol_version != 10 {
            bail!("unsupported handshake protocol version {protocol_version}");
        }

        let version_end = data[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| anyhow!("unterminated server version"))?;
        let server_version = String::from_utf8_lossy(&data[pos..pos + version_end]).to_string();
        pos += version_end + 1;

        if data.len() < pos + 4 + 8 + 1 + 2 {
            bail!("short handshake");
        }
        let connection_id = u32::from_le_bytes(data[pos..pos + 4].try_into()?);
        pos += 4;

        let mut salt = data[pos..pos + 8].to_vec();
        pos += 8;
        pos += 1; // filler

        let cap_lower = u16::from_le_bytes(data[pos..pos + 2].try_into()?) as u32;
        pos += 2;

        let mut capabilities = cap_lower;
        let mut auth_plugin_name = String::new();

        // charset + status + upper caps + auth-data length + reserved
        if data.len() >= pos + 1 + 2 + 2 + 1 + 10 {
            pos += 1; // character set
            pos += 2; // status flags
            let cap_upper = u16::from_le_bytes(data[pos..pos + 2].try_into()?) as u32;
            pos += 2;
            capabilities |= cap_upper << 16;

            let auth_data_len = data[pos] as usize;
            pos += 1;
            pos += 10; // reserved

            let part2_len = auth_data_len.saturating_sub(8).max(13);
            let end = (pos + part2_len).min(data.len());
            let mut part2 = data[pos..end].to_vec();
            if let Some(nul) = part2.iter().position(|&b| b == 0) {
                part2.truncate(nul);
            }
            salt.extend_from_slice(&part2);
            pos = end;

            if capabilities & CLIENT_PLUGIN_AUTH != 0 && pos < data.len() {
                let name_end = data[pos..]
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(data.len() - pos);
                auth_plugin_name =
                    String::from_utf8_lossy(&data[pos..pos + name_end]).to_string();
            }
        }

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_name,
            salt,
        })
    }
}

/// Replica-side binlog client.
pub struct MySqlBinlogClient {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
}

impl MySqlBinlogClient {
    /// Connect and authenticate.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
    ) -> Result<Self> {
        info!(host, port, user, "opening binlog replication session");

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| anyhow!("connect timeout after {CONNECT_TIMEOUT:?}"))?
            .context("tcp connect")?;
        let mut client = Self {
            stream: BufReader::new(stream),
            sequence_id: 0,
            server_version: String::new(),
        };

        let packet = client.read_packet().await?;
        if packet.first() == Some(&0xFF) {
            bail!("server rejected connection: {}", err_message(&packet));
        }
        let handshake = Handshake::parse(&packet)?;
        client.server_version = handshake.server_version.clone();
        debug!(
            version = %handshake.server_version,
            plugin = %handshake.auth_plugin_name,
            "received handshake"
        );

        client.authenticate(user, password, database, &handshake).await?;
        info!(version = %client.server_version, "binlog session authenticated");
        Ok(client)
    }

    /// Server version string from the handshake.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
        handshake: &Handshake,
    ) -> Result<()> {
        let mut flags = CLIENT_LONG_PASSWORD
            | CLIENT_PROTOCOL_41
            | CLIENT_TRANSACTIONS
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH;
        if database.is_some() {
            flags |= 0x0000_0008; // CLIENT_CONNECT_WITH_DB
        }

        // Reply with native-password regardless of the server default; the
        // server sends an auth-switch if the account needs it.
        let auth_response = native_password_scramble(password, &handshake.salt);

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(flags);
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(45); // utf8mb4
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        if let Some(db) = database {
            response.put_slice(db.as_bytes());
            response.put_u8(0);
        }
        response.put_slice(b"mysql_native_password");
        response.put_u8(0);

        self.write_packet(&response).await?;

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0xFE) => {
                // Auth switch: plugin name then fresh salt.
                let name_end = reply[1..]
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| anyhow!("malformed auth switch"))?;
                let plugin = String::from_utf8_lossy(&reply[1..1 + name_end]).to_string();
                let mut salt = reply[2 + name_end..].to_vec();
                if salt.last() == Some(&0) {
                    salt.pop();
                }
                if plugin != "mysql_native_password" {
                    bail!(
                        "server requires auth plugin '{plugin}'; configure the replication \
                         account with mysql_native_password"
                    );
                }
                debug!("auth switch to mysql_native_password");
                let scramble = native_password_scramble(password, &salt);
                self.write_packet(&scramble).await?;

                let reply = self.read_packet().await?;
                match reply.first() {
                    Some(0x00) => Ok(()),
                    Some(0xFF) => bail!("authentication failed: {}", err_message(&reply)),
                    other => bail!("unexpected auth-switch reply: {other:?}"),
                }
            }
            Some(0xFF) => bail!("authentication failed: {}", err_message(&reply)),
            other => bail!("unexpected auth reply: {other:?}"),
        }
    }

    /// Run a session-setup statement, ignoring any result set.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(0x03); // COM_QUERY
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet).await?;

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0xFF) => bail!("query failed: {}", err_message(&reply)),
            _ => Ok(()),
        }
    }

    /// Announce this session as a replica.
    pub async fn register_slave(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(0x15); // COM_REGISTER_SLAVE
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id
        self.write_packet(&packet).await?;

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x00) => {
                info!(server_id, "registered as replica");
                Ok(())
            }
            Some(0xFF) => bail!("COM_REGISTER_SLAVE failed: {}", err_message(&reply)),
            other => bail!("unexpected COM_REGISTER_SLAVE reply: {other:?}"),
        }
    }

    /// Request the binlog stream from `file:position`.
    pub async fn binlog_dump(
        mut self,
        server_id: u32,
        file: &str,
        position: u32,
    ) -> Result<BinlogStream> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(file.len() + 11);
        packet.put_u8(0x12); // COM_BINLOG_DUMP
        packet.put_u32_le(position);
        packet.put_u16_le(0); // flags: block on EOF like a real replica
        packet.put_u32_le(server_id);
        packet.put_slice(file.as_bytes());
        self.write_packet(&packet).await?;

        info!(file, position, "binlog dump started");
        Ok(BinlogStream { client: self })
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut header))
            .await
            .map_err(|_| anyhow!("read timeout"))?
            .context("read packet header")?;

        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        self.sequence_id = header[3].wrapping_add(1);

        if len > MAX_PACKET_SIZE {
            bail!("oversized packet: {len} bytes");
        }
        let mut body = vec![0u8; len];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut body))
            .await
            .map_err(|_| anyhow!("read timeout"))?
            .context("read packet body")?;
        Ok(body)
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_PACKET_SIZE {
            bail!("packet too large: {} bytes", data.len());
        }
        let mut frame = BytesMut::with_capacity(4 + data.len());
        let len = data.len() as u32;
        frame.put_u8(len as u8);
        frame.put_u8((len >> 8) as u8);
        frame.put_u8((len >> 16) as u8);
        frame.put_u8(self.sequence_id);
        self.sequence_id = self.sequence_id.wrapping_add(1);
        frame.put_slice(data);

        timeout(IO_TIMEOUT, async {
            self.stream.get_mut().write_all(&frame).await?;
            self.stream.get_mut().flush().await
        })
        .await
        .map_err(|_| anyhow!("write timeout"))??;
        Ok(())
    }
}

/// Streaming side of a binlog dump.
pub struct BinlogStream {
    client: MySqlBinlogClient,
}

impl BinlogStream {
    /// Next raw binlog event, or `None` on a server EOF.
    pub async fn next_event(&mut self) -> Result<Option<Bytes>> {
        let packet = self.client.read_packet().await?;
        match packet.first() {
            // Binlog events ride inside OK-prefixed packets.
            Some(0x00) => Ok(Some(Bytes::from(packet).slice(1..))),
            Some(0xFE) if packet.len() < 9 => {
                debug!("binlog stream EOF");
                Ok(None)
            }
            Some(0xFF) => Err(anyhow!("binlog stream error: {}", err_message(&packet))),
            other => {
                warn!(marker = ?other, "unexpected binlog packet marker");
                Ok(None)
            }
        }
    }
}

/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`
fn native_password_scramble(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            let mut hasher = Sha1::new();
            hasher.update(pwd.as_bytes());
            let stage1 = hasher.finalize();

            let mut hasher = Sha1::new();
            hasher.update(stage1);
            let stage2 = hasher.finalize();

            let mut hasher = Sha1::new();
            hasher.update(salt);
            hasher.update(stage2);
            let stage3 = hasher.finalize();

            stage1
                .iter()
                .zip(stage3.iter())
                .map(|(a, b)| a ^ b)
                .collect()
        }
    }
}

/// Human-readable message out of an ERR packet.
fn err_message(packet: &[u8]) -> String {
    if packet.len() < 9 {
        return "malformed error packet".to_string();
    }
    let code = u16::from_le_bytes([packet[1], packet[2]]);
    let msg = String::from_utf8_lossy(&packet[9..]);
    format!("{code} - {msg}")
}
