//! HTTP output behaviour against a local canned-response server: request
//! packing, acknowledgement handling, and the backoff window.

use nowplay::modules::outputs::http::{HttpConfig, HttpOutput};
use nowplay::{Lifecycle, Output, SendOutcome, Song};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    /// Serve `response` verbatim to every connection, recording request
    /// bodies.
    async fn start(response: String) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let accept_hits = Arc::clone(&hits);
        let accept_bodies = Arc::clone(&bodies);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let response = response.clone();
                let hits = Arc::clone(&accept_hits);
                let bodies = Arc::clone(&accept_bodies);
                tokio::spawn(async move {
                    serve_one(socket, response, hits, bodies).await;
                });
            }
        });

        MockServer { addr, hits, bodies }
    }

    fn url(&self) -> String {
        format!("http://{}/submit", self.addr)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn bodies(&self) -> Vec<String> {
        self.bodies.lock().expect("bodies lock").clone()
    }
}

async fn serve_one(
    mut socket: TcpStream,
    response: String,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    let (body_start, content_length) = loop {
        let Ok(read) = socket.read(&mut chunk).await else {
            return;
        };
        if read == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let length = head
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().to_string())
                })
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            break (pos + 4, length);
        }
    };

    while buf.len() < body_start + content_length {
        let Ok(read) = socket.read(&mut chunk).await else {
            return;
        };
        if read == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..read]);
    }

    hits.fetch_add(1, Ordering::SeqCst);
    bodies
        .lock()
        .expect("bodies lock")
        .push(String::from_utf8_lossy(&buf[body_start..]).into_owned());

    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

fn music_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/x-music\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

async fn started_output(url: &str, username: Option<&str>, password: Option<&str>) -> HttpOutput {
    let mut output = HttpOutput::new(HttpConfig {
        url: url.to_string(),
        username: username.map(String::from),
        password: password.map(String::from),
        verbose: false,
    })
    .expect("valid config");
    output.start().await.expect("client builds");
    output
}

fn song(title: &str) -> Song {
    Song {
        title: Some(title.to_string()),
        artist: Some("Artist".to_string()),
        album: Some("Album".to_string()),
        genre: None,
        started_at: 1_500_000_000,
        ends_at: 1_500_000_060,
        length: 60,
    }
}

#[tokio::test]
async fn accepted_batch_reports_no_failures() {
    let server = MockServer::start(music_response("MUSIC 100 OK\nSONG 0 OK\nEND\n")).await;
    let mut output = started_output(&server.url(), None, None).await;

    let outcome = output.send(&[song("T")]).await;
    assert_eq!(outcome, SendOutcome::Sent { failed: vec![] });
    assert_eq!(server.hits(), 1);

    let bodies = server.bodies();
    assert!(bodies[0].starts_with("song[]=T:Artist:Album::3c:"));

    // A clean exchange leaves no backoff window behind.
    let outcome = output.send(&[song("U")]).await;
    assert_eq!(outcome, SendOutcome::Sent { failed: vec![] });
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn rejected_songs_are_not_failures() {
    let server =
        MockServer::start(music_response("MUSIC 100 OK\nSONG 0 REJ bad tags\nEND\n")).await;
    let mut output = started_output(&server.url(), None, None).await;

    let outcome = output.send(&[song("T")]).await;
    assert_eq!(outcome, SendOutcome::Sent { failed: vec![] });
}

#[tokio::test]
async fn failed_songs_are_reported_by_index() {
    let server = MockServer::start(music_response(
        "MUSIC 100 OK\nSONG 0 OK\nSONG 1 FAIL try later\nSONG 2 OK\nEND\n",
    ))
    .await;
    let mut output = started_output(&server.url(), None, None).await;

    let outcome = output.send(&[song("A"), song("B"), song("C")]).await;
    assert_eq!(outcome, SendOutcome::Sent { failed: vec![1] });
}

#[tokio::test]
async fn server_error_opens_a_backoff_window() {
    let server = MockServer::start(
        "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_string(),
    )
    .await;
    let mut output = started_output(&server.url(), None, None).await;

    let outcome = output.send(&[song("T")]).await;
    assert_eq!(outcome, SendOutcome::Sent { failed: vec![0] });
    assert_eq!(server.hits(), 1);

    // Inside the window nothing touches the network.
    let outcome = output.send(&[song("U")]).await;
    assert_eq!(outcome, SendOutcome::AllFailed);
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn thirty_three_songs_split_into_two_requests() {
    // Enough acknowledgements for the bigger request; acks past the count
    // of the smaller one are dropped.
    let acks: String = (0..32).map(|i| format!("SONG {} OK\n", i)).collect();
    let server = MockServer::start(music_response(&format!("MUSIC 100 OK\n{}END\n", acks))).await;
    let mut output = started_output(&server.url(), None, None).await;

    let songs: Vec<Song> = (0..33).map(|i| song(&format!("s{}", i))).collect();
    let outcome = output.send(&songs).await;
    assert_eq!(outcome, SendOutcome::Sent { failed: vec![] });
    assert_eq!(server.hits(), 2);

    let bodies = server.bodies();
    assert_eq!(bodies[0].matches("song[]=").count(), 32);
    assert_eq!(bodies[1].matches("song[]=").count(), 1);
}

#[tokio::test]
async fn oversized_bodies_flush_into_multiple_requests() {
    let acks: String = (0..32).map(|i| format!("SONG {} OK\n", i)).collect();
    let server = MockServer::start(music_response(&format!("MUSIC 100 OK\n{}END\n", acks))).await;
    let mut output = started_output(&server.url(), None, None).await;

    // Four songs of ~3 KB each cannot share one 10 KB request.
    let songs: Vec<Song> = (0..4)
        .map(|i| Song {
            title: Some(format!("{}{}", "x".repeat(3000), i)),
            length: 60,
            ..Song::default()
        })
        .collect();
    let outcome = output.send(&songs).await;
    assert_eq!(outcome, SendOutcome::Sent { failed: vec![] });
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn credentials_prepend_the_auth_field() {
    let server = MockServer::start(music_response("MUSIC 100 OK\nSONG 0 OK\nEND\n")).await;
    let mut output = started_output(&server.url(), Some("joe"), Some("secret")).await;

    let outcome = output.send(&[song("T")]).await;
    assert_eq!(outcome, SendOutcome::Sent { failed: vec![] });

    let bodies = server.bodies();
    let auth = bodies[0]
        .split('&')
        .next()
        .expect("auth field before the first song");
    let parts: Vec<&str> = auth.splitn(4, ':').collect();
    assert_eq!(parts[0], "auth=pass");
    assert_eq!(parts[1], "joe");
    assert!(
        i64::from_str_radix(parts[2], 16).is_ok(),
        "timestamp must be lowercase hex: {}",
        parts[2]
    );
    assert_eq!(parts[3].len(), 28);
    assert!(parts[3].ends_with('='));
    assert!(bodies[0].contains("&song[]=T:"));
}
