//! HTTP output module: submits song batches to a configured URL as a single
//! authenticated POST and reads the per-song verdict back over the
//! `text/x-music` line protocol.
//!
//! # Configuration
//!
//! ```text
//! module http
//! url http://example.com/submit     # required
//! username joe                      # optional; requires password
//! password secret
//! verbose                           # log request and reply lines
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::config::{register_module, ArgKind, ModuleBody, ModuleDecl, ModuleType, OptSpec};
use crate::{Error, Lifecycle, Output, SendOutcome, Song, BATCH_LIMIT};

mod reply;
use reply::{Backoff, ErrorClass, ReplyParser};

/// A request body never grows beyond this many bytes.
const BODY_CAPACITY: usize = 10_224;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("nowplay-out_http/", env!("CARGO_PKG_VERSION"));

/// HTTP output configuration.
pub struct HttpConfig {
    /// Submission endpoint (required).
    pub url: String,
    /// Account name; requires `password`.
    pub username: Option<String>,
    /// Account password; requires `username`.
    pub password: Option<String>,
    /// Log request bodies and reply lines.
    pub verbose: bool,
}

/// Batched, authenticated POST submitter.
pub struct HttpOutput {
    client: Option<Client>,
    url: String,
    /// Percent-escaped at configuration time, ready for the auth field.
    username: Option<String>,
    password: Option<String>,
    verbose: bool,
    backoff: Backoff,
}

impl HttpOutput {
    /// Validate the configuration and build the output.
    pub fn new(config: HttpConfig) -> Result<Self, Error> {
        if config.url.is_empty() {
            return Err(Error::Config("url not set".into()));
        }
        reqwest::Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("invalid url: {}", e)))?;

        match (&config.username, &config.password) {
            (Some(_), None) => {
                return Err(Error::Config("username set but password not".into()));
            }
            (None, Some(_)) => {
                return Err(Error::Config("password set but username not".into()));
            }
            _ => {}
        }
        if config.username.as_deref().is_some_and(|u| u.len() > 128) {
            return Err(Error::Config("username too long".into()));
        }

        Ok(HttpOutput {
            client: None,
            url: config.url,
            username: config.username.as_deref().map(escape),
            password: config.password,
            verbose: config.verbose,
            backoff: Backoff::new(),
        })
    }

    /// `auth=pass:<user>:<hex_time>:<sig>`, or `None` without credentials.
    fn auth_field(&self) -> Option<String> {
        let username = self.username.as_ref()?;
        let password = self.password.as_ref()?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let stamp = format!("{:x}", now);
        Some(format!(
            "auth=pass:{}:{}:{}",
            username,
            stamp,
            signature(password, &stamp)
        ))
    }

    /// POST one packed request and fold the reply into `failed` (as global
    /// batch indices via `members`).  Returns whether submission may
    /// continue; a `false` starts the backoff window.
    async fn perform(&mut self, body: String, members: &[usize], failed: &mut Vec<usize>) -> bool {
        let Some(client) = &self.client else {
            failed.extend_from_slice(members);
            return false;
        };
        if self.verbose {
            debug!(body = %body, "submitting request");
        }

        let response = client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/x-music")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body)
            .send()
            .await;

        let mut parser = ReplyParser::new(members.len());
        match response {
            Err(e) => {
                warn!(error = %e, "request failed");
                failed.extend_from_slice(members);
                self.suspend(ErrorClass::Transport);
                return false;
            }
            Ok(response) => {
                let status_line = format!(
                    "{:?} {} {}",
                    response.version(),
                    response.status().as_u16(),
                    response.status().canonical_reason().unwrap_or("")
                );
                parser.status_line(&status_line);

                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                parser.content_type(content_type.as_deref());

                if parser.expects_body() {
                    match response.text().await {
                        Ok(text) => {
                            for line in text.lines() {
                                if self.verbose {
                                    debug!(line, "reply");
                                }
                                parser.body_line(line);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed reading reply");
                            failed.extend_from_slice(members);
                            self.suspend(ErrorClass::Transport);
                            return false;
                        }
                    }
                }
            }
        }

        let reply = parser.finish();
        for &pos in &reply.failed {
            failed.push(members[pos]);
        }
        match reply.error {
            Some(class) => {
                self.suspend(class);
                false
            }
            None => {
                self.backoff.success();
                true
            }
        }
    }

    fn suspend(&mut self, class: ErrorClass) {
        let wait = self.backoff.fail(class, Instant::now());
        info!(
            class = ?class,
            seconds = wait.as_secs(),
            "won't submit songs for a while"
        );
    }
}

#[async_trait]
impl Lifecycle for HttpOutput {
    async fn start(&mut self) -> Result<(), Error> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Connection(format!("failed to build HTTP client: {}", e)))?;
        self.client = Some(client);
        debug!(url = %self.url, "HTTP output ready");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.client = None;
        Ok(())
    }
}

#[async_trait]
impl Output for HttpOutput {
    async fn send(&mut self, songs: &[Song]) -> SendOutcome {
        if songs.is_empty() {
            return SendOutcome::ok();
        }
        if self.client.is_none() {
            return SendOutcome::AllFailed;
        }
        if self.backoff.suspended(Instant::now()) {
            debug!("inside backoff window, not submitting");
            return SendOutcome::AllFailed;
        }

        let auth = self.auth_field().unwrap_or_default();
        let mut failed: Vec<usize> = Vec::new();
        let mut body = auth.clone();
        let mut members: Vec<usize> = Vec::new();

        let mut index = 0;
        while index < songs.len() {
            let appended = members.len() < BATCH_LIMIT && append_song(&mut body, &songs[index]);
            if appended {
                members.push(index);
                index += 1;
                continue;
            }

            if members.is_empty() {
                // Does not fit even in an empty request; resubmitting would
                // never help.
                let song = &songs[index];
                warn!(
                    artist = song.artist.as_deref().unwrap_or("(empty)"),
                    album = song.album.as_deref().unwrap_or("(empty)"),
                    title = song.title.as_deref().unwrap_or("(empty)"),
                    "song name too long (will not submit)"
                );
                index += 1;
                continue;
            }

            // Flush the full request, then retry this song in a fresh one.
            let request = std::mem::replace(&mut body, auth.clone());
            let sent = std::mem::take(&mut members);
            if !self.perform(request, &sent, &mut failed).await {
                failed.extend(index..songs.len());
                return SendOutcome::Sent { failed };
            }
        }

        if !members.is_empty() && !self.perform(body, &members, &mut failed).await {
            return SendOutcome::Sent { failed };
        }

        SendOutcome::Sent { failed }
    }
}

/// 28-char base64 of `SHA1(password ‖ hex_time)`.
fn signature(password: &str, stamp: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(stamp.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Append one `song[]` field, or report that it does not fit.
fn append_song(body: &mut String, song: &Song) -> bool {
    let mut field = String::with_capacity(64);
    field.push_str(if body.is_empty() { "song[]=" } else { "&song[]=" });
    for value in [&song.title, &song.artist, &song.album, &song.genre] {
        if let Some(value) = value {
            escape_into(&mut field, value);
        }
        field.push(':');
    }
    let _ = write!(field, "{:x}:{:x}", song.length, song.ends_at.max(0));

    if body.len() + field.len() > BODY_CAPACITY {
        return false;
    }
    body.push_str(&field);
    true
}

/// A byte is escaped iff it is below `0x30`, within `0x3A..=0x40`, or above
/// `0x7F`.  Digits and letters pass through untouched.
fn needs_escape(byte: u8) -> bool {
    byte < 0x30 || (0x3A..=0x40).contains(&byte) || byte > 0x7f
}

fn escape_into(out: &mut String, value: &str) {
    for &byte in value.as_bytes() {
        if needs_escape(byte) {
            let _ = write!(out, "%{:02X}", byte);
        } else {
            out.push(byte as char);
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    escape_into(&mut out, value);
    out
}

const OPTIONS: &[OptSpec] = &[
    OptSpec::new("url", ArgKind::Str),
    OptSpec::new("username", ArgKind::Str),
    OptSpec::new("password", ArgKind::Str),
    OptSpec::new("verbose", ArgKind::None),
];

fn create_http(decl: &ModuleDecl) -> Result<ModuleBody, Error> {
    let config = HttpConfig {
        url: decl.get("url").unwrap_or_default().to_string(),
        username: decl.get("username").map(String::from),
        password: decl.get("password").map(String::from),
        verbose: decl.flag("verbose"),
    };
    Ok(ModuleBody::Output(Box::new(HttpOutput::new(config)?)))
}

pub(crate) fn register_http() -> Result<(), Error> {
    register_module("http", ModuleType::Output, OPTIONS, create_http)
}
