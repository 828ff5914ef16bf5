use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};

use gate_sync::config::CameraSettings;
use gate_sync::ingest::SessionTiming;
use gate_sync::{CameraSession, HttpCameraLink, SessionState};

const UPTIME_AT_START_MS: i64 = 5_000;

struct FakeCamera {
    address: String,
    booted_at: DateTime<Utc>,
    stream_requests: Arc<AtomicUsize>,
}

#[derive(Clone, Copy)]
enum UptimeReply {
    Valid,
    Garbage,
}

#[derive(Clone)]
enum StreamReply {
    Frames(Vec<Vec<u8>>),
    /// Accepts the request and never sends a status line.
    Unanswered,
}

impl FakeCamera {
    fn start(stream: StreamReply, uptime: UptimeReply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake camera");
        let address = listener.local_addr().expect("local addr").to_string();
        let booted_at = Utc::now() - TimeDelta::milliseconds(UPTIME_AT_START_MS);
        let held: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        let stream_requests = Arc::new(AtomicUsize::new(0));

        let requests = stream_requests.clone();
        std::thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(conn) = conn else { continue };
                let stream = stream.clone();
                let held = held.clone();
                let requests = requests.clone();
                std::thread::spawn(move || {
                    serve(conn, booted_at, &stream, uptime, &held, &requests)
                });
            }
        });

        Self {
            address,
            booted_at,
            stream_requests,
        }
    }
}

fn serve(
    mut conn: TcpStream,
    booted_at: DateTime<Utc>,
    stream: &StreamReply,
    uptime: UptimeReply,
    held: &Mutex<Vec<TcpStream>>,
    stream_requests: &AtomicUsize,
) {
    let mut reader = BufReader::new(conn.try_clone().expect("clone"));
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 || line.trim().is_empty() {
            break;
        }
    }

    if request_line.contains("/api/config.cgi?TempoLigado") {
        let body = match uptime {
            UptimeReply::Valid => format!(
                "TempoLigado={}",
                (Utc::now() - booted_at).num_milliseconds()
            ),
            UptimeReply::Garbage => "TempoLigado".to_string(),
        };
        let _ = write!(
            conn,
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        return;
    }

    if request_line.contains("/api/mjpegvideo.cgi") {
        stream_requests.fetch_add(1, Ordering::SeqCst);
        let frames = match stream {
            StreamReply::Frames(frames) => frames,
            StreamReply::Unanswered => {
                held.lock().unwrap().push(conn);
                return;
            }
        };
        let _ = conn.write_all(
            b"HTTP/1.0 200 OK\r\n\
              Content-Type: multipart/x-mixed-replace; boundary=myboundary\r\n\r\n",
        );
        for frame in frames {
            let mut part = format!(
                "--myboundary\r\nMotion-Event: 0\r\nContent-Type: image/jpeg\r\n\
                 Content-Length: {}\r\n\r\n",
                frame.len()
            )
            .into_bytes();
            part.extend_from_slice(frame);
            part.extend_from_slice(b"\r\n");
            let _ = conn.write_all(&part);
        }
        let _ = conn.flush();
        // Leave the stream open like a live camera.
        held.lock().unwrap().push(conn);
        return;
    }

    let _ = conn.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n");
}

fn jpeg(offset_ms: i64, night: bool) -> Vec<u8> {
    let comment = format!(
        "TempoCaptura={};SituacaoDayNight={}",
        offset_ms,
        if night { 2 } else { 1 }
    );
    let mut image = vec![0xFF, 0xD8, 0xFF, 0xFE];
    image.extend_from_slice(&((comment.len() + 2) as u16).to_be_bytes());
    image.extend_from_slice(comment.as_bytes());
    image.extend_from_slice(&[0x00, 0x01, 0x02, 0x03, 0xFF, 0xD9]);
    image
}

fn settings(address: &str) -> CameraSettings {
    CameraSettings {
        address: address.to_string(),
        frame_rate: 10,
        image_quality: 75,
    }
}

#[test]
fn session_streams_frames_from_fake_camera() {
    let frames = vec![jpeg(6_000, false), jpeg(6_100, true), jpeg(6_200, false)];
    let camera = FakeCamera::start(StreamReply::Frames(frames.clone()), UptimeReply::Valid);
    let link = HttpCameraLink::new(&settings(&camera.address)).expect("link");

    let (tx, rx) = mpsc::sync_channel(16);
    let handle = CameraSession::new("panoramic", link).spawn(tx);

    let received: Vec<_> = (0..3)
        .map(|_| rx.recv_timeout(Duration::from_secs(10)).expect("frame"))
        .collect();

    for (frame, payload) in received.iter().zip(&frames) {
        assert_eq!(frame.payload(), payload.as_slice());
    }
    assert_eq!(
        received.iter().map(|f| f.is_night_mode()).collect::<Vec<_>>(),
        vec![false, true, false]
    );
    assert_eq!(
        received[1].captured_at() - received[0].captured_at(),
        TimeDelta::milliseconds(100)
    );
    assert_eq!(
        received[2].captured_at() - received[1].captured_at(),
        TimeDelta::milliseconds(100)
    );

    let expected = camera.booted_at + TimeDelta::milliseconds(6_000);
    let error = (received[0].captured_at() - expected).num_milliseconds().abs();
    assert!(error < 1_000, "first frame off by {} ms", error);

    assert_eq!(handle.state(), SessionState::Streaming);
    handle.stop().expect("stop session");
}

#[test]
fn session_keeps_syncing_while_uptime_is_unusable() {
    let camera = FakeCamera::start(
        StreamReply::Frames(vec![jpeg(100, false)]),
        UptimeReply::Garbage,
    );
    let link = HttpCameraLink::new(&settings(&camera.address)).expect("link");

    let (tx, rx) = mpsc::sync_channel(16);
    let handle = CameraSession::new("zoom", link).spawn(tx);

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.state() != SessionState::Syncing {
        assert!(Instant::now() < deadline, "session never started syncing");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    assert_eq!(handle.state(), SessionState::Syncing);

    handle.stop().expect("stop session");
}

#[test]
fn unanswered_stream_request_is_closed_and_retried() {
    let camera = FakeCamera::start(StreamReply::Unanswered, UptimeReply::Valid);
    let link = HttpCameraLink::new(&settings(&camera.address)).expect("link");
    let timing = SessionTiming {
        reconnect_delay: Duration::from_millis(10),
        sync_backoff: Duration::from_millis(10),
        watchdog_period: Duration::from_millis(200),
        stream_closed_pause: Duration::from_millis(10),
    };

    let (tx, _rx) = mpsc::sync_channel(16);
    let handle = CameraSession::new("zoom", link).with_timing(timing).spawn(tx);

    let deadline = Instant::now() + Duration::from_secs(5);
    while camera.stream_requests.load(Ordering::SeqCst) < 2 {
        assert!(
            Instant::now() < deadline,
            "stream request never retried: {} attempts",
            camera.stream_requests.load(Ordering::SeqCst)
        );
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_ne!(handle.state(), SessionState::Streaming);

    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(handle.stop().is_ok());
    });
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(true));
}
