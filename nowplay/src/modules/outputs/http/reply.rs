//! Reply protocol parser and per-error-class backoff.
//!
//! The submission endpoint answers with a line-oriented protocol: the HTTP
//! status line, a `Content-Type: text/x-music` header, a `MUSIC <code>`
//! body status, then zero or more `SONG <index> <status>` acknowledgements
//! terminated by `END`.  The parser is a deterministic state machine over
//! those lines; anything that goes wrong picks an error class, and the class
//! picks the backoff timing.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Failure classes, each with its own backoff timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    /// The status line was not recognisable as HTTP.
    HttpInvalid,
    /// HTTP redirect status.
    Http3xx,
    /// HTTP client-error status.
    Http4xx,
    /// HTTP server-error status.
    Http5xx,
    /// HTTP status outside the known ranges.
    HttpUnknown,
    /// The reply carried no `Content-Type` header.
    TypeUnknown,
    /// The reply's content type is not `text/x-music`.
    TypeInvalid,
    /// The body did not start with a `MUSIC` status.
    MusicInvalid,
    /// Server-level `MUSIC 2xx` status.
    Music2xx,
    /// Server-level `MUSIC 3xx` status.
    Music3xx,
    /// Server-level `MUSIC` status outside the known ranges.
    MusicUnknown,
    /// The request never produced a reply.
    Transport,
}

impl ErrorClass {
    /// `(initial, ceiling)` wait in seconds.
    fn delays(self) -> (u64, u64) {
        match self {
            Self::HttpInvalid => (900, 1800),
            Self::Http3xx => (600, 3600),
            Self::Http4xx => (900, 3600),
            Self::Http5xx => (300, 1800),
            Self::HttpUnknown => (900, 1800),
            Self::TypeUnknown => (600, 3600),
            Self::TypeInvalid => (600, 3600),
            Self::MusicInvalid => (600, 1800),
            Self::Music2xx => (300, 1800),
            Self::Music3xx => (900, 3600),
            Self::MusicUnknown => (600, 1800),
            Self::Transport => (900, 1800),
        }
    }
}

/// Exponential backoff with per-class initial and ceiling waits.
///
/// While suspended, `send` short-circuits with "all failed" and stays off
/// the network.  A fully successful request resets the state.
pub(crate) struct Backoff {
    last_wait: Duration,
    wait_till: Option<Instant>,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff {
            last_wait: Duration::ZERO,
            wait_till: None,
        }
    }

    pub(crate) fn suspended(&self, now: Instant) -> bool {
        self.wait_till.is_some_and(|till| now < till)
    }

    /// Record a failure of the given class; returns how long submissions
    /// stay suspended.
    pub(crate) fn fail(&mut self, class: ErrorClass, now: Instant) -> Duration {
        let (initial, ceiling) = class.delays();
        let doubled = self.last_wait.as_secs().saturating_mul(2);
        let wait = Duration::from_secs(doubled.max(initial).min(ceiling));
        self.last_wait = wait;
        self.wait_till = Some(now + wait);
        wait
    }

    pub(crate) fn success(&mut self) {
        self.last_wait = Duration::ZERO;
        self.wait_till = None;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    HeaderHttp,
    HeaderType,
    BodyStatus,
    BodyCont,
    BodyError,
    Ignore,
}

/// Parsed outcome of one request.
pub(crate) struct Reply {
    /// Positions (within the request) of songs that failed to be submitted.
    pub failed: Vec<usize>,
    /// Error class, when the exchange failed at a protocol level.
    pub error: Option<ErrorClass>,
}

/// State machine over one reply.
///
/// Feed the status line, then the content type, then every body line; call
/// [`ReplyParser::finish`] to collect the verdict.  Songs the server never
/// acknowledged — gaps between indices as well as a missing tail — count as
/// failures.  `REJ` is a permanent rejection and deliberately *not* a
/// failure: resubmitting will not make the song be accepted.
pub(crate) struct ReplyParser {
    state: State,
    count: usize,
    handled: usize,
    failed: Vec<usize>,
    error: Option<ErrorClass>,
}

impl ReplyParser {
    pub(crate) fn new(count: usize) -> Self {
        ReplyParser {
            state: State::HeaderHttp,
            count,
            handled: 0,
            failed: Vec::new(),
            error: None,
        }
    }

    /// Whether the body should be read at all.
    pub(crate) fn expects_body(&self) -> bool {
        self.state == State::BodyStatus
    }

    fn fail_with(&mut self, class: ErrorClass) {
        self.error = Some(class);
        self.state = State::Ignore;
    }

    pub(crate) fn status_line(&mut self, line: &str) {
        if self.state != State::HeaderHttp {
            return;
        }
        let code = line
            .strip_prefix("HTTP/")
            .and_then(|rest| rest.split_whitespace().nth(1))
            .and_then(|token| token.parse::<u16>().ok());
        match code {
            None => {
                warn!(line, "expected HTTP status");
                self.fail_with(ErrorClass::HttpInvalid);
            }
            Some(code) => match code / 100 {
                2 => self.state = State::HeaderType,
                3 => {
                    info!(code, "HTTP redirect status");
                    self.fail_with(ErrorClass::Http3xx);
                }
                4 => {
                    info!(code, "HTTP client error status");
                    self.fail_with(ErrorClass::Http4xx);
                }
                5 => {
                    info!(code, "HTTP server error status");
                    self.fail_with(ErrorClass::Http5xx);
                }
                _ => {
                    info!(code, "unexpected HTTP status");
                    self.fail_with(ErrorClass::HttpUnknown);
                }
            },
        }
    }

    pub(crate) fn content_type(&mut self, value: Option<&str>) {
        if self.state != State::HeaderType {
            return;
        }
        match value {
            None => {
                info!("missing Content-Type header");
                self.fail_with(ErrorClass::TypeUnknown);
            }
            Some(value) if is_music_type(value) => self.state = State::BodyStatus,
            Some(value) => {
                info!(content_type = value, "invalid content type");
                self.fail_with(ErrorClass::TypeInvalid);
            }
        }
    }

    pub(crate) fn body_line(&mut self, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }

        match self.state {
            State::BodyStatus => {
                let mut tokens = line.split_whitespace();
                let code = match (tokens.next(), tokens.next()) {
                    (Some("MUSIC"), Some(token)) => token.parse::<u16>().ok(),
                    _ => None,
                };
                match code {
                    None => {
                        warn!(line, "expected server status");
                        self.fail_with(ErrorClass::MusicInvalid);
                    }
                    Some(code) if code / 100 == 1 => self.state = State::BodyCont,
                    Some(code) => {
                        info!(code, line, "server status");
                        self.error = Some(match code / 100 {
                            2 => ErrorClass::Music2xx,
                            3 => ErrorClass::Music3xx,
                            _ => ErrorClass::MusicUnknown,
                        });
                        self.state = State::BodyError;
                    }
                }
            }

            State::BodyCont => {
                if line == "END" {
                    self.state = State::Ignore;
                    return;
                }
                let mut tokens = line.split_whitespace();
                let index = match (tokens.next(), tokens.next()) {
                    (Some("SONG"), Some(token)) => token.parse::<usize>().ok(),
                    _ => None,
                };
                let Some(index) = index else {
                    debug!(line, "ignoring line");
                    return;
                };
                if index < self.handled {
                    return;
                }
                if index >= self.count {
                    debug!(index, "status for a song index beyond the batch");
                    return;
                }

                // Indices the server skipped past count as failures.
                while self.handled < index {
                    self.failed.push(self.handled);
                    self.handled += 1;
                }

                match tokens.next().unwrap_or("") {
                    "OK" => debug!(index, "song added"),
                    "REJ" => warn!(index, line, "song rejected"),
                    "FAIL" => {
                        info!(index, line, "error when adding song");
                        self.failed.push(index);
                    }
                    other => {
                        info!(index, status = other, "unknown submission status");
                        self.failed.push(index);
                    }
                }
                self.handled += 1;
            }

            State::BodyError => {
                info!(message = line, "server error message");
                self.state = State::Ignore;
            }

            State::HeaderHttp | State::HeaderType | State::Ignore => {}
        }
    }

    pub(crate) fn finish(mut self) -> Reply {
        // Songs never acknowledged are failures.
        while self.handled < self.count {
            self.failed.push(self.handled);
            self.handled += 1;
        }
        Reply {
            failed: self.failed,
            error: self.error,
        }
    }
}

/// `text/x-music`, case-insensitively, optionally followed by parameters.
fn is_music_type(value: &str) -> bool {
    let value = value.trim();
    if value.len() < 12 || !value.is_char_boundary(12) {
        return false;
    }
    let (head, tail) = value.split_at(12);
    head.eq_ignore_ascii_case("text/x-music")
        && tail
            .chars()
            .next()
            .map_or(true, |c| c == ';' || c == ',' || c.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(count: usize, status: &str, content_type: Option<&str>, body: &[&str]) -> Reply {
        let mut parser = ReplyParser::new(count);
        parser.status_line(status);
        parser.content_type(content_type);
        for line in body {
            parser.body_line(line);
        }
        parser.finish()
    }

    #[test]
    fn clean_reply_has_no_failures() {
        let reply = parse(
            1,
            "HTTP/1.1 200 OK",
            Some("text/x-music"),
            &["MUSIC 100 OK", "SONG 0 OK", "END"],
        );
        assert!(reply.failed.is_empty());
        assert!(reply.error.is_none());
    }

    #[test]
    fn http_error_statuses_pick_their_class() {
        let cases = [
            ("HTTP/1.1 301 Moved", ErrorClass::Http3xx),
            ("HTTP/1.1 404 Not Found", ErrorClass::Http4xx),
            ("HTTP/1.1 500 Internal Server Error", ErrorClass::Http5xx),
            ("HTTP/1.1 600 What", ErrorClass::HttpUnknown),
            ("ICY 200 OK", ErrorClass::HttpInvalid),
            ("HTTP/1.1 abc", ErrorClass::HttpInvalid),
        ];
        for (line, class) in cases {
            let reply = parse(2, line, Some("text/x-music"), &[]);
            assert_eq!(reply.error, Some(class), "status line: {}", line);
            assert_eq!(reply.failed, vec![0, 1], "status line: {}", line);
        }
    }

    #[test]
    fn content_type_is_checked_case_insensitively() {
        let reply = parse(
            1,
            "HTTP/1.1 200 OK",
            Some("TEXT/X-Music; charset=utf-8"),
            &["MUSIC 100", "SONG 0 OK", "END"],
        );
        assert!(reply.error.is_none());
        assert!(reply.failed.is_empty());
    }

    #[test]
    fn wrong_content_type_is_type_invalid() {
        let reply = parse(1, "HTTP/1.1 200 OK", Some("text/html"), &[]);
        assert_eq!(reply.error, Some(ErrorClass::TypeInvalid));
    }

    #[test]
    fn missing_content_type_is_type_unknown() {
        let reply = parse(1, "HTTP/1.1 200 OK", None, &[]);
        assert_eq!(reply.error, Some(ErrorClass::TypeUnknown));
    }

    #[test]
    fn content_type_prefix_must_end_at_a_boundary() {
        let reply = parse(1, "HTTP/1.1 200 OK", Some("text/x-musical"), &[]);
        assert_eq!(reply.error, Some(ErrorClass::TypeInvalid));
    }

    #[test]
    fn music_statuses_pick_their_class() {
        let cases = [
            ("MUSIC 200 done", ErrorClass::Music2xx),
            ("MUSIC 321 gone", ErrorClass::Music3xx),
            ("MUSIC 999", ErrorClass::MusicUnknown),
            ("HELLO", ErrorClass::MusicInvalid),
        ];
        for (line, class) in cases {
            let reply = parse(1, "HTTP/1.1 200 OK", Some("text/x-music"), &[line]);
            assert_eq!(reply.error, Some(class), "body status: {}", line);
        }
    }

    #[test]
    fn body_error_consumes_one_message_line() {
        let mut parser = ReplyParser::new(1);
        parser.status_line("HTTP/1.1 200 OK");
        parser.content_type(Some("text/x-music"));
        parser.body_line("MUSIC 250 rejected");
        parser.body_line("quota exceeded, go away");
        parser.body_line("SONG 0 OK");
        let reply = parser.finish();
        assert_eq!(reply.error, Some(ErrorClass::Music2xx));
        assert_eq!(reply.failed, vec![0], "acks after the error are ignored");
    }

    #[test]
    fn rej_is_permanent_but_not_a_failure() {
        let reply = parse(
            3,
            "HTTP/1.1 200 OK",
            Some("text/x-music"),
            &[
                "MUSIC 100",
                "SONG 0 OK",
                "SONG 1 REJ bad metadata",
                "SONG 2 FAIL try later",
                "END",
            ],
        );
        assert!(reply.error.is_none());
        assert_eq!(reply.failed, vec![2]);
    }

    #[test]
    fn unknown_song_status_is_a_failure() {
        let reply = parse(
            1,
            "HTTP/1.1 200 OK",
            Some("text/x-music"),
            &["MUSIC 100", "SONG 0 MAYBE", "END"],
        );
        assert_eq!(reply.failed, vec![0]);
    }

    #[test]
    fn gaps_between_acks_are_failures() {
        let reply = parse(
            4,
            "HTTP/1.1 200 OK",
            Some("text/x-music"),
            &["MUSIC 100", "SONG 2 OK", "END"],
        );
        assert_eq!(reply.failed, vec![0, 1, 3]);
        assert!(reply.error.is_none());
    }

    #[test]
    fn missing_tail_acks_are_failures() {
        let reply = parse(
            2,
            "HTTP/1.1 200 OK",
            Some("text/x-music"),
            &["MUSIC 100", "SONG 0 OK", "END"],
        );
        assert_eq!(reply.failed, vec![1]);
    }

    #[test]
    fn acks_beyond_the_batch_are_dropped() {
        let reply = parse(
            1,
            "HTTP/1.1 200 OK",
            Some("text/x-music"),
            &["MUSIC 100", "SONG 0 OK", "SONG 7 FAIL", "END"],
        );
        assert!(reply.failed.is_empty());
    }

    #[test]
    fn duplicate_acks_are_dropped() {
        let reply = parse(
            2,
            "HTTP/1.1 200 OK",
            Some("text/x-music"),
            &["MUSIC 100", "SONG 0 OK", "SONG 0 FAIL", "SONG 1 OK", "END"],
        );
        assert!(reply.failed.is_empty());
    }

    #[test]
    fn junk_body_lines_are_skipped() {
        let reply = parse(
            1,
            "HTTP/1.1 200 OK",
            Some("text/x-music"),
            &["MUSIC 100", "", "  x-debug: on", "SONG 0 OK", "END"],
        );
        assert!(reply.failed.is_empty());
        assert!(reply.error.is_none());
    }

    #[test]
    fn backoff_doubles_and_clamps_at_the_ceiling() {
        let mut backoff = Backoff::new();
        let t0 = Instant::now();
        assert_eq!(backoff.fail(ErrorClass::Http5xx, t0).as_secs(), 300);
        assert_eq!(backoff.fail(ErrorClass::Http5xx, t0).as_secs(), 600);
        assert_eq!(backoff.fail(ErrorClass::Http5xx, t0).as_secs(), 1200);
        assert_eq!(backoff.fail(ErrorClass::Http5xx, t0).as_secs(), 1800);
        assert_eq!(backoff.fail(ErrorClass::Http5xx, t0).as_secs(), 1800);
    }

    #[test]
    fn backoff_takes_the_larger_of_doubled_and_initial() {
        let mut backoff = Backoff::new();
        let t0 = Instant::now();
        assert_eq!(backoff.fail(ErrorClass::Http5xx, t0).as_secs(), 300);
        // A 4xx after a 5xx starts from the 4xx initial, not 2 * 300.
        assert_eq!(backoff.fail(ErrorClass::Http4xx, t0).as_secs(), 900);
    }

    #[test]
    fn backoff_window_suspends_and_expires() {
        let mut backoff = Backoff::new();
        let t0 = Instant::now();
        let wait = backoff.fail(ErrorClass::Http5xx, t0);
        assert!(backoff.suspended(t0));
        assert!(backoff.suspended(t0 + wait - Duration::from_secs(1)));
        assert!(!backoff.suspended(t0 + wait));
    }

    #[test]
    fn success_resets_backoff() {
        let mut backoff = Backoff::new();
        let t0 = Instant::now();
        backoff.fail(ErrorClass::Http5xx, t0);
        backoff.success();
        assert!(!backoff.suspended(t0));
        assert_eq!(backoff.fail(ErrorClass::Http5xx, t0).as_secs(), 300);
    }

    #[test]
    fn every_class_stays_within_its_ceiling() {
        let classes = [
            ErrorClass::HttpInvalid,
            ErrorClass::Http3xx,
            ErrorClass::Http4xx,
            ErrorClass::Http5xx,
            ErrorClass::HttpUnknown,
            ErrorClass::TypeUnknown,
            ErrorClass::TypeInvalid,
            ErrorClass::MusicInvalid,
            ErrorClass::Music2xx,
            ErrorClass::Music3xx,
            ErrorClass::MusicUnknown,
            ErrorClass::Transport,
        ];
        for class in classes {
            let (initial, ceiling) = class.delays();
            assert!(initial <= ceiling);
            let mut backoff = Backoff::new();
            let t0 = Instant::now();
            for _ in 0..12 {
                assert!(backoff.fail(class, t0).as_secs() <= ceiling, "class {:?}", class);
            }
        }
    }
}
