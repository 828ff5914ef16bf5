//! HTTP link to a camera: uptime probe and multipart stream.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use url::Url;

use super::clock::{self, UptimeProbe, SYNC_REQUEST_TIMEOUT};
use super::session::{CameraLink, ConnectionCloser};
use crate::config::CameraSettings;
use crate::error::CameraError;

const UPTIME_PATH: &str = "/api/config.cgi?TempoLigado";
const STREAM_PATH: &str = "/api/mjpegvideo.cgi";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_HEADERS: usize = 64;

pub struct HttpCameraLink {
    address: String,
    agent: ureq::Agent,
    uptime_url: Url,
    stream_url: Url,
}

impl HttpCameraLink {
    /// `settings.address` is a host or `host:port`.
    pub fn new(settings: &CameraSettings) -> Result<Self> {
        let base = Url::parse(&format!("http://{}", settings.address.trim()))
            .with_context(|| format!("parse camera address {:?}", settings.address))?;
        if base.host_str().is_none() {
            return Err(anyhow!("camera address {:?} has no host", settings.address));
        }
        let uptime_url = base.join(UPTIME_PATH).context("build uptime url")?;
        let mut stream_url = base.join(STREAM_PATH).context("build stream url")?;
        stream_url
            .query_pairs_mut()
            .append_pair("Quality", &settings.image_quality.to_string())
            .append_pair("FrameRate", &settings.frame_rate.to_string());

        let agent = ureq::AgentBuilder::new()
            .timeout(SYNC_REQUEST_TIMEOUT)
            .build();
        Ok(Self {
            address: settings.address.clone(),
            agent,
            uptime_url,
            stream_url,
        })
    }

    pub fn uptime_url(&self) -> &Url {
        &self.uptime_url
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    fn connect(&self) -> Result<TcpStream, CameraError> {
        let host = self
            .stream_url
            .host_str()
            .ok_or_else(|| CameraError::Connect(format!("{} has no host", self.stream_url)))?;
        let port = self.stream_url.port_or_known_default().unwrap_or(80);
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(socket) => return Ok(socket),
                Err(err) => last_err = Some(err),
            }
        }
        Err(CameraError::Connect(match last_err {
            Some(err) => format!("{}:{}: {}", host, port, err),
            None => format!("{}:{} did not resolve", host, port),
        }))
    }
}

impl UptimeProbe for HttpCameraLink {
    fn uptime_millis(&self) -> Result<u64, CameraError> {
        let body = self
            .agent
            .get(self.uptime_url.as_str())
            .call()
            .map_err(|err| CameraError::Connect(err.to_string()))?
            .into_string()?;
        parse_uptime(&body)
    }
}

impl CameraLink for HttpCameraLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn sync_clock(&self) -> Result<DateTime<Utc>, CameraError> {
        clock::synchronize(self, &self.address)
    }

    fn open_stream(
        &self,
        register: &dyn Fn(ConnectionCloser),
    ) -> Result<Box<dyn BufRead + Send>, CameraError> {
        let mut socket = self.connect()?;
        register(ConnectionCloser::tcp(socket.try_clone()?));

        let target = match self.stream_url.query() {
            Some(query) => format!("{}?{}", self.stream_url.path(), query),
            None => self.stream_url.path().to_string(),
        };
        let host = self.stream_url.host_str().unwrap_or_default();
        write!(
            socket,
            "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
            target, host
        )?;
        socket.flush()?;

        let mut reader = BufReader::new(socket);
        read_response_head(&mut reader)?;
        Ok(Box::new(reader))
    }
}

/// Parses a `Key=Milliseconds` uptime body.
pub fn parse_uptime(body: &str) -> Result<u64, CameraError> {
    let (_, value) = body
        .trim()
        .split_once('=')
        .ok_or_else(|| CameraError::UptimeResponse(body.to_string()))?;
    value
        .trim()
        .parse()
        .map_err(|_| CameraError::UptimeResponse(body.to_string()))
}

/// Consumes the status line and headers; anything but `200` is an error.
fn read_response_head<R: BufRead>(reader: &mut R) -> Result<(), CameraError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(CameraError::StreamClosed);
    }
    let status = line.split_whitespace().nth(1);
    if status != Some("200") {
        return Err(CameraError::Connect(format!(
            "unexpected response {:?}",
            line.trim()
        )));
    }
    for _ in 0..MAX_RESPONSE_HEADERS {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(CameraError::StreamClosed);
        }
        if line.trim().is_empty() {
            return Ok(());
        }
    }
    Err(CameraError::MalformedHeader(
        "too many response headers".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn settings(address: &str) -> CameraSettings {
        CameraSettings {
            address: address.to_string(),
            frame_rate: 12,
            image_quality: 70,
        }
    }

    #[test]
    fn builds_camera_urls() {
        let link = HttpCameraLink::new(&settings("10.1.2.3:8080")).unwrap();
        assert_eq!(
            link.uptime_url().as_str(),
            "http://10.1.2.3:8080/api/config.cgi?TempoLigado"
        );
        assert_eq!(
            link.stream_url().as_str(),
            "http://10.1.2.3:8080/api/mjpegvideo.cgi?Quality=70&FrameRate=12"
        );
    }

    #[test]
    fn rejects_unparseable_address() {
        assert!(HttpCameraLink::new(&settings("bad host name")).is_err());
    }

    #[test]
    fn parses_uptime_body() {
        assert_eq!(parse_uptime("TempoLigado=123456\r\n").unwrap(), 123_456);
        assert!(matches!(
            parse_uptime("TempoLigado"),
            Err(CameraError::UptimeResponse(_))
        ));
        assert!(matches!(
            parse_uptime("TempoLigado=soon"),
            Err(CameraError::UptimeResponse(_))
        ));
    }

    #[test]
    fn response_head_requires_200() {
        let head = b"HTTP/1.0 200 OK\r\nContent-Type: multipart/x-mixed-replace\r\n\r\n--b";
        let mut ok = Cursor::new(head.to_vec());
        read_response_head(&mut ok).unwrap();
        let mut rest = String::new();
        ok.read_line(&mut rest).unwrap();
        assert_eq!(rest, "--b");

        let mut denied = Cursor::new(b"HTTP/1.0 401 Unauthorized\r\n\r\n".to_vec());
        assert!(matches!(
            read_response_head(&mut denied),
            Err(CameraError::Connect(_))
        ));
    }
}
