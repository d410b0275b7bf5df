//! MPD input module: polls a Music Player Daemon and publishes the song
//! being played once it has been playing long enough.
//!
//! # Configuration
//!
//! ```text
//! module mpd
//! host localhost      # default
//! port 6600           # default
//! password secret     # optional
//! ```

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::{register_module, ArgKind, ModuleBody, ModuleDecl, ModuleType, OptSpec};
use crate::{Error, Input, Lifecycle, Publisher, Shutdown, Sleep, Song};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 6600;

/// Seconds between status polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The same song id must be sighted this many consecutive polls before the
/// song is published.
const SUBMIT_SIGHTINGS: u32 = 30;

const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
const RECONNECT_CEILING: Duration = Duration::from_secs(300);

/// Protocol-level timeout for connecting and for individual commands.
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// MPD poller input.
pub struct MpdInput {
    host: String,
    port: u16,
    password: Option<String>,
}

impl MpdInput {
    /// Build the input from resolved options.
    pub fn new(host: String, port: u16, password: Option<String>) -> Self {
        MpdInput {
            host,
            port,
            password,
        }
    }

    async fn connect(&self) -> Result<MpdConnection, Error> {
        let mut conn = MpdConnection::open(&self.host, self.port).await?;
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            conn.command(&format!("password {}", quote(password)))
                .await?;
        }
        Ok(conn)
    }

    /// Poll the player until the connection drops or shutdown.
    async fn watch(
        &self,
        conn: &mut MpdConnection,
        songs: &Publisher,
        shutdown: &Shutdown,
    ) -> Result<(), Error> {
        let mut current: Option<(i64, i64)> = None; // (songid, start wall time)
        let mut sightings = 0u32;

        loop {
            if shutdown.sleep(POLL_INTERVAL).await == Sleep::Woken {
                return Ok(());
            }

            let status = conn.command("status").await?;
            if field(&status, "state") != Some("play") {
                continue;
            }
            let Some(songid) = field(&status, "songid").and_then(|v| v.parse::<i64>().ok())
            else {
                continue;
            };

            match current {
                Some((id, start)) if id == songid => {
                    if sightings < SUBMIT_SIGHTINGS {
                        sightings += 1;
                        if sightings == SUBMIT_SIGHTINGS {
                            self.submit(conn, songs, start).await?;
                        }
                    }
                }
                _ => {
                    let elapsed = elapsed_seconds(&status).unwrap_or(0);
                    current = Some((songid, unix_now() - elapsed));
                    sightings = 1;
                }
            }
        }
    }

    /// Look the current song up and publish it with the recorded start time.
    async fn submit(
        &self,
        conn: &mut MpdConnection,
        songs: &Publisher,
        started_at: i64,
    ) -> Result<(), Error> {
        let info = conn.command("currentsong").await?;
        let length = field(&info, "Time")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            .max(1) as u32;

        songs.publish(Song {
            title: field(&info, "Title").map(String::from),
            artist: field(&info, "Artist").map(String::from),
            album: field(&info, "Album").map(String::from),
            genre: field(&info, "Genre").map(String::from),
            started_at,
            ends_at: started_at + i64::from(length),
            length,
        });
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for MpdInput {}

#[async_trait]
impl Input for MpdInput {
    async fn run(&mut self, songs: Publisher, shutdown: Shutdown) -> Result<(), Error> {
        while shutdown.is_running() {
            // Reconnect with doubling delay until the player answers.
            let mut delay = RECONNECT_INITIAL;
            let mut conn = loop {
                if !shutdown.is_running() {
                    return Ok(());
                }
                match self.connect().await {
                    Ok(conn) => break conn,
                    Err(e) => {
                        warn!(
                            host = %self.host,
                            port = self.port,
                            error = %e,
                            seconds = delay.as_secs(),
                            "unable to connect to MPD; waiting to reconnect"
                        );
                        if shutdown.sleep(delay).await == Sleep::Woken {
                            return Ok(());
                        }
                        delay = (delay * 2).min(RECONNECT_CEILING);
                    }
                }
            };

            debug!(host = %self.host, port = self.port, "connected to MPD");
            if let Err(e) = self.watch(&mut conn, &songs, &shutdown).await {
                warn!(error = %e, "connection error");
            }
        }
        Ok(())
    }
}

/// Minimal MPD line-protocol client: one command in flight, replies read
/// until `OK` or `ACK`.
#[derive(Debug)]
struct MpdConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MpdConnection {
    async fn open(host: &str, port: u16) -> Result<Self, Error> {
        let stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Connection("connect timed out".into()))?
            .map_err(|e| Error::Connection(format!("connect: {}", e)))?;
        let (read, writer) = stream.into_split();
        let mut reader = BufReader::new(read);

        let mut banner = String::new();
        tokio::time::timeout(IO_TIMEOUT, reader.read_line(&mut banner))
            .await
            .map_err(|_| Error::Connection("banner timed out".into()))??;
        if !banner.starts_with("OK MPD") {
            return Err(Error::Connection(format!(
                "unexpected banner: {}",
                banner.trim_end()
            )));
        }

        Ok(MpdConnection { reader, writer })
    }

    /// Send one command and collect the `key: value` pairs of its reply.
    async fn command(&mut self, command: &str) -> Result<Vec<(String, String)>, Error> {
        let line = format!("{}\n", command);
        tokio::time::timeout(IO_TIMEOUT, self.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| Error::Connection("write timed out".into()))??;

        let mut pairs = Vec::new();
        loop {
            let mut reply = String::new();
            let read = tokio::time::timeout(IO_TIMEOUT, self.reader.read_line(&mut reply))
                .await
                .map_err(|_| Error::Connection("read timed out".into()))??;
            if read == 0 {
                return Err(Error::Connection("connection closed".into()));
            }

            let line = reply.trim_end();
            if line == "OK" {
                return Ok(pairs);
            }
            if let Some(message) = line.strip_prefix("ACK") {
                return Err(Error::Connection(format!("MPD: {}", message.trim())));
            }
            if let Some((key, value)) = line.split_once(": ") {
                pairs.push((key.to_string(), value.to_string()));
            }
        }
    }
}

fn field<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Seconds into the current song, from `elapsed` (fractional) or the older
/// `time: elapsed:total` form.
fn elapsed_seconds(status: &[(String, String)]) -> Option<i64> {
    if let Some(elapsed) = field(status, "elapsed") {
        return elapsed.parse::<f64>().ok().map(|v| v as i64);
    }
    field(status, "time")
        .and_then(|v| v.split(':').next())
        .and_then(|v| v.parse::<i64>().ok())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Quote an argument for the MPD protocol.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

const OPTIONS: &[OptSpec] = &[
    OptSpec::new("host", ArgKind::Str),
    OptSpec::new("port", ArgKind::Int),
    OptSpec::new("password", ArgKind::Str),
];

fn create_mpd(decl: &ModuleDecl) -> Result<ModuleBody, Error> {
    let port = match decl.get_int("port") {
        Some(port) if (1..=65535).contains(&port) => port as u16,
        Some(port) => {
            return Err(Error::Config(format!("port: {}: out of range", port)));
        }
        None => DEFAULT_PORT,
    };
    Ok(ModuleBody::Input(Box::new(MpdInput::new(
        decl.get("host").unwrap_or(DEFAULT_HOST).to_string(),
        port,
        decl.get("password").map(String::from),
    ))))
}

pub(crate) fn register_mpd() -> Result<(), Error> {
    register_module("mpd", ModuleType::Input, OPTIONS, create_mpd)
}
