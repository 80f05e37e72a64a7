//! Unix domain socket transport: one newline-delimited JSON event per line.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::hub::{Client, EventHub};

/// Sleep between non-blocking accept attempts.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Longest accepted line, excluding the newline.
const MAX_LINE: usize = 64 * 1024;

/// One connected peer.
pub struct UnixClient {
    reader: Mutex<BufReader<UnixStream>>,
    writer: Mutex<UnixStream>,
    stream: UnixStream,
}

impl UnixClient {
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            stream,
        })
    }

    /// Connect to a daemon listening on `path`.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).with_context(|| format!("connect {:?}", path))?;
        Self::new(stream).context("clone unix stream")
    }

    /// Bound blocking reads; a timed-out read fails with `WouldBlock` or `TimedOut`.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}

impl Client for UnixClient {
    fn read(&self) -> io::Result<Vec<u8>> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| io::Error::other("reader lock poisoned"))?;
        loop {
            let mut line = Vec::new();
            let limit = MAX_LINE as u64 + 1;
            if (&mut *reader).take(limit).read_until(b'\n', &mut line)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if line.len() > MAX_LINE && line.last() != Some(&b'\n') {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line longer than {MAX_LINE} bytes"),
                ));
            }
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            if !line.is_empty() {
                return Ok(line);
            }
        }
    }

    fn write(&self, msg: &[u8]) -> io::Result<usize> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("writer lock poisoned"))?;
        writer.write_all(msg)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(msg.len())
    }

    fn close(&self) -> io::Result<()> {
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// Accepts connections on a socket path and registers them with the hub.
pub struct UnixServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl UnixServer {
    /// Bind `path`, replacing a stale socket file, and start accepting.
    pub fn bind(path: &Path, hub: Arc<EventHub>) -> Result<Self> {
        remove_stale_socket(path)?;
        let listener = UnixListener::bind(path).with_context(|| format!("bind {:?}", path))?;
        listener
            .set_nonblocking(true)
            .context("set listener non-blocking")?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let join = std::thread::Builder::new()
            .name("unix-accept".to_string())
            .spawn(move || accept_loop(listener, hub, thread_stop))
            .context("spawn accept thread")?;

        tracing::info!(socket = ?path, "listening");
        Ok(Self {
            path: path.to_path_buf(),
            stop,
            join: Some(join),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting, join the accept thread and remove the socket file. Idempotent.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(join) = self.join.take() else {
            return;
        };
        if join.join().is_err() {
            tracing::error!("accept thread panicked");
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = ?self.path, "remove socket failed: {e}"),
        }
        tracing::info!(socket = ?self.path, "stopped listening");
    }
}

impl Drop for UnixServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(listener: UnixListener, hub: Arc<EventHub>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = register(stream, &hub) {
                    tracing::warn!("client registration failed: {e:#}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!("accept error: {e}");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn register(stream: UnixStream, hub: &EventHub) -> Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream
        .set_nonblocking(false)
        .context("set client blocking")?;
    let client = UnixClient::new(stream).context("clone client stream")?;
    hub.add_client(Arc::new(client))?;
    Ok(())
}

/// Remove a leftover socket file. Any other kind of file is left alone.
fn remove_stale_socket(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {:?}", path)),
    };
    if !meta.file_type().is_socket() {
        return Err(anyhow!("{:?} exists and is not a socket", path));
    }
    std::fs::remove_file(path).with_context(|| format!("remove stale socket {:?}", path))?;
    tracing::info!(socket = ?path, "removed stale socket");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jukebox_player::config::PlaybackConfig;
    use jukebox_player::player::Player;
    use jukebox_player::provider::ProviderRegistry;
    use jukebox_player::sink::AudioSink;
    use jukebox_types::{ErrorPayload, Event, EventType};

    fn hub() -> Arc<EventHub> {
        let (sink, _reader) = AudioSink::new(4);
        let player = Player::new(ProviderRegistry::new(), sink, PlaybackConfig::default());
        Arc::new(EventHub::spawn(player).unwrap())
    }

    #[test]
    fn client_commands_round_trip_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jukebox.sock");
        let hub = hub();
        let mut server = UnixServer::bind(&path, hub.clone()).unwrap();

        let client = UnixClient::connect(&path).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .write(&Event::new(EventType::Pause).to_bytes().unwrap())
            .unwrap();

        let reply = Event::from_slice(&client.read().unwrap()).unwrap();
        assert_eq!(reply.kind, EventType::Error);
        assert_eq!(reply.payload_as::<ErrorPayload>().unwrap().error, "cannot pause");

        server.close();
        server.close();
        assert!(!path.exists());
        hub.close();
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let hub = hub();
        let server = UnixServer::bind(&path, hub.clone()).unwrap();
        assert!(UnixClient::connect(server.path()).is_ok());
    }

    #[test]
    fn regular_file_at_socket_path_is_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"keep me").unwrap();
        assert!(UnixServer::bind(&path, hub()).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn read_splits_lines_and_skips_blank_ones() {
        let (left, right) = UnixStream::pair().unwrap();
        let a = UnixClient::new(left).unwrap();
        let b = UnixClient::new(right).unwrap();

        a.write(b"{\"x\":1}").unwrap();
        {
            let mut raw = a.writer.lock().unwrap();
            raw.write_all(b"\r\n\n{\"y\":2}\r\n").unwrap();
        }
        assert_eq!(b.read().unwrap(), b"{\"x\":1}");
        assert_eq!(b.read().unwrap(), b"{\"y\":2}");

        a.close().unwrap();
        assert_eq!(b.read().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn overlong_line_is_rejected() {
        let (left, right) = UnixStream::pair().unwrap();
        let client = UnixClient::new(left).unwrap();
        let writer = std::thread::spawn(move || {
            let mut right = right;
            // Fails once the reader gives up and the pair is dropped.
            let _ = right.write_all(&vec![b'a'; MAX_LINE + 16]);
        });
        let err = client.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        drop(client);
        writer.join().unwrap();
    }

    #[test]
    fn line_at_the_limit_is_accepted() {
        let (left, right) = UnixStream::pair().unwrap();
        let client = UnixClient::new(left).unwrap();
        let writer = std::thread::spawn(move || {
            let mut right = right;
            let mut line = vec![b'x'; MAX_LINE];
            line.push(b'\n');
            right.write_all(&line).unwrap();
        });
        assert_eq!(client.read().unwrap().len(), MAX_LINE);
        writer.join().unwrap();
    }

    #[test]
    fn unread_socket_does_not_stall_other_clients() {
        let hub = hub();
        let (stalled, _stalled_peer) = UnixStream::pair().unwrap();
        let (healthy, healthy_peer) = UnixStream::pair().unwrap();
        hub.add_client(Arc::new(UnixClient::new(stalled).unwrap())).unwrap();
        hub.add_client(Arc::new(UnixClient::new(healthy).unwrap())).unwrap();

        // Far more than a socket buffer holds.
        let total = 20_000;
        let reader = std::thread::spawn(move || {
            let peer = UnixClient::new(healthy_peer).unwrap();
            peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            for _ in 0..total {
                let event = Event::from_slice(&peer.read().unwrap()).unwrap();
                assert_eq!(event.kind, EventType::Resumed);
            }
        });
        for _ in 0..total {
            hub.broadcast(&Event::new(EventType::Resumed));
        }
        reader.join().unwrap();
        assert_eq!(hub.client_count(), 1);

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let closing = hub.clone();
        std::thread::spawn(move || {
            closing.close();
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn close_unblocks_a_pending_read() {
        let (left, _right) = UnixStream::pair().unwrap();
        let client = Arc::new(UnixClient::new(left).unwrap());
        let reader = {
            let client = client.clone();
            std::thread::spawn(move || client.read())
        };
        std::thread::sleep(Duration::from_millis(50));
        client.close().unwrap();
        assert!(reader.join().unwrap().is_err());
    }
}
