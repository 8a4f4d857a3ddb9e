/// Debug session management over the serial manufacturing prompt
///
/// A session opens the serial transport for exactly one `mfg` command,
/// collects the response until the prompt line comes back, delivers the
/// response lines and closes the transport again. A second command while
/// one is pending is rejected.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;

/// Line the manufacturing prompt prints when it is ready for input
pub const MFG_PROMPT: &str = "-";
pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No serial device configured")]
    NoDevice,
    #[error("A command is already pending on the session")]
    Busy,
    #[error("Failed to open serial transport: {0}")]
    Open(#[source] io::Error),
    #[error("Failed to write command: {0}")]
    Write(#[source] io::Error),
    #[error("Failed to read response: {0}")]
    Read(#[source] io::Error),
    #[error("No prompt within {0:?}")]
    Timeout(Duration),
    #[error("Transport closed before the prompt returned")]
    ClosedBeforePrompt,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Byte stream to the device's debug port
pub trait SerialLink: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialLink for T {}

/// Opens serial links by device id
#[async_trait]
pub trait SerialConnector: Send + Sync {
    async fn open(&self, device: &str, baud: u32) -> io::Result<Box<dyn SerialLink>>;
}

/// Opens real serial ports through `tokio-serial`
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSerialConnector;

#[async_trait]
impl SerialConnector for NativeSerialConnector {
    async fn open(&self, device: &str, baud: u32) -> io::Result<Box<dyn SerialLink>> {
        let stream = tokio_serial::new(device, baud).open_native_async()?;
        Ok(Box::new(stream))
    }
}

/// Reassembles a prompt-terminated response from arbitrary chunks
#[derive(Debug, Default)]
pub struct ResponseFramer {
    buffer: Vec<u8>,
}

impl ResponseFramer {
    /// Append a chunk; returns the response lines once the prompt is seen
    ///
    /// The buffer is never reset mid-command, so a line split across
    /// chunks is only examined once it has been reassembled.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<String>> {
        self.buffer.extend_from_slice(chunk);

        let text = String::from_utf8_lossy(&self.buffer);
        let mut lines: Vec<&str> = text.split('\n').map(|line| line.trim_end_matches('\r')).collect();
        while lines.last().is_some_and(|line| line.trim().is_empty()) {
            lines.pop();
        }

        if lines.last().map(|line| line.trim()) != Some(MFG_PROMPT) {
            return None;
        }
        lines.pop();

        Some(
            lines
                .into_iter()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

#[derive(Debug, Default)]
struct SessionState {
    device: Option<String>,
    active: bool,
}

struct Inner {
    connector: Arc<dyn SerialConnector>,
    baud: u32,
    response_timeout: Duration,
    state: Mutex<SessionState>,
}

/// Exclusive manufacturing-command session on one serial device
#[derive(Clone)]
pub struct DebugSession {
    inner: Arc<Inner>,
}

impl DebugSession {
    pub fn new(connector: Arc<dyn SerialConnector>) -> Self {
        Self::with_settings(connector, DEFAULT_BAUD, DEFAULT_RESPONSE_TIMEOUT)
    }

    pub fn with_settings(connector: Arc<dyn SerialConnector>, baud: u32, response_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                baud,
                response_timeout,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Configure the target device; an open session is left alone
    pub fn set_device(&self, device: Option<String>) {
        log::debug!("MFG: target device -> {:?}", device);
        self.lock().device = device;
    }

    pub fn device(&self) -> Option<String> {
        self.lock().device.clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Send `mfg <command>` and deliver the response lines to `handler`
    ///
    /// Returns false without side effects when a command is already pending
    /// or no device is configured. Otherwise the handler is called exactly
    /// once, after the transport has been closed.
    pub fn run_command<F>(&self, command: &str, handler: F) -> bool
    where
        F: FnOnce(Result<Vec<String>>) + Send + 'static,
    {
        let device = {
            let mut state = self.lock();
            if state.active {
                log::warn!("MFG: session busy, rejecting '{}'", command);
                return false;
            }
            let Some(device) = state.device.clone() else {
                log::warn!("MFG: no device configured, rejecting '{}'", command);
                return false;
            };
            state.active = true;
            device
        };

        let line = format!("mfg {}\n", command);
        let session = self.clone();
        tokio::spawn(async move {
            log::debug!("MFG[{}]: SEND {}", device, line.trim_end());
            let outcome = session.exchange(&device, &line).await;
            session.lock().active = false;

            match &outcome {
                Ok(lines) => log::debug!("MFG[{}]: RECV {} lines", device, lines.len()),
                Err(e) => log::error!("MFG[{}]: {}", device, e),
            }
            handler(outcome);
        });
        true
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open, write, read to the prompt; the link is dropped on return
    async fn exchange(&self, device: &str, line: &str) -> Result<Vec<String>> {
        let mut link = self
            .inner
            .connector
            .open(device, self.inner.baud)
            .await
            .map_err(SessionError::Open)?;

        link.write_all(line.as_bytes()).await.map_err(SessionError::Write)?;
        link.flush().await.map_err(SessionError::Write)?;

        let limit = self.inner.response_timeout;
        tokio::time::timeout(limit, read_response(&mut link))
            .await
            .map_err(|_| SessionError::Timeout(limit))?
    }
}

async fn read_response(link: &mut Box<dyn SerialLink>) -> Result<Vec<String>> {
    let mut framer = ResponseFramer::default();
    let mut buf = [0u8; 256];

    loop {
        let n = link.read(&mut buf).await.map_err(SessionError::Read)?;
        if n == 0 {
            return Err(SessionError::ClosedBeforePrompt);
        }
        if let Some(lines) = framer.push(&buf[..n]) {
            return Ok(lines);
        }
    }
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DebugSession")
            .field("device", &state.device)
            .field("active", &state.active)
            .field("baud", &self.inner.baud)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::oneshot;
    use tokio_test::io::{Builder, Mock};

    struct MockConnector {
        links: Mutex<VecDeque<Mock>>,
        opened: Mutex<Vec<(String, u32)>>,
    }

    impl MockConnector {
        fn new(links: Vec<Mock>) -> Arc<Self> {
            Arc::new(Self {
                links: Mutex::new(links.into()),
                opened: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SerialConnector for MockConnector {
        async fn open(&self, device: &str, baud: u32) -> io::Result<Box<dyn SerialLink>> {
            self.opened.lock().unwrap().push((device.to_string(), baud));
            match self.links.lock().unwrap().pop_front() {
                Some(link) => Ok(Box::new(link)),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no such port")),
            }
        }
    }

    fn session(connector: Arc<MockConnector>) -> DebugSession {
        let session = DebugSession::with_settings(connector, DEFAULT_BAUD, Duration::from_secs(2));
        session.set_device(Some("/dev/ttyUSB0".into()));
        session
    }

    fn run(session: &DebugSession, command: &str) -> (bool, oneshot::Receiver<Result<Vec<String>>>) {
        let (tx, rx) = oneshot::channel();
        let accepted = session.run_command(command, move |outcome| {
            let _ = tx.send(outcome);
        });
        (accepted, rx)
    }

    #[test]
    fn test_framer_waits_for_prompt() {
        let mut framer = ResponseFramer::default();
        assert_eq!(framer.push(b"Application: 2.1"), None);
        assert_eq!(framer.push(b".0\r\nBootloader: 1.0\r\n"), None);
        assert_eq!(
            framer.push(b"-\r\n"),
            Some(vec!["Application: 2.1.0".to_string(), "Bootloader: 1.0".to_string()])
        );
    }

    #[test]
    fn test_framer_prompt_without_newline() {
        let mut framer = ResponseFramer::default();
        assert_eq!(framer.push(b"Radio: 0.9\n-"), Some(vec!["Radio: 0.9".to_string()]));
    }

    #[tokio::test]
    async fn test_command_reassembles_split_lines() {
        let link = Builder::new()
            .write(b"mfg version\n")
            .read(b"Applica")
            .read(b"tion: 2.1.0\nBoot")
            .read(b"loader: 1.0.4\n-\n")
            .build();
        let connector = MockConnector::new(vec![link]);
        let session = session(connector.clone());

        let (accepted, rx) = run(&session, "version");
        assert!(accepted);
        let lines = rx.await.unwrap().unwrap();

        assert_eq!(lines, vec!["Application: 2.1.0", "Bootloader: 1.0.4"]);
        assert!(!session.is_active());
        assert_eq!(
            *connector.opened.lock().unwrap(),
            vec![("/dev/ttyUSB0".to_string(), DEFAULT_BAUD)]
        );
    }

    #[tokio::test]
    async fn test_second_command_rejected_while_active() {
        let link = Builder::new().write(b"mfg version\n").read(b"-\n").build();
        let session = session(MockConnector::new(vec![link]));

        let (first, rx) = run(&session, "version");
        let (second, _rx) = run(&session, "serial");
        assert!(first);
        assert!(!second);

        rx.await.unwrap().unwrap();
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_rejects_without_device() {
        let session = DebugSession::new(MockConnector::new(Vec::new()));
        let (accepted, _rx) = run(&session, "version");
        assert!(!accepted);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_open_failure_is_delivered() {
        let session = session(MockConnector::new(Vec::new()));
        let (accepted, rx) = run(&session, "version");
        assert!(accepted);

        assert!(matches!(rx.await.unwrap(), Err(SessionError::Open(_))));
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_silent_device_times_out_and_frees_session() {
        let silent = Builder::new()
            .write(b"mfg version\n")
            .wait(Duration::from_secs(5))
            .build();
        let answering = Builder::new().write(b"mfg version\n").read(b"-\n").build();
        let connector = MockConnector::new(vec![silent, answering]);
        let session = DebugSession::with_settings(connector, DEFAULT_BAUD, Duration::from_millis(50));
        session.set_device(Some("/dev/ttyUSB0".into()));

        let (accepted, rx) = run(&session, "version");
        assert!(accepted);
        assert!(matches!(rx.await.unwrap(), Err(SessionError::Timeout(limit)) if limit == Duration::from_millis(50)));
        assert!(!session.is_active());

        let (accepted, rx) = run(&session, "version");
        assert!(accepted);
        assert_eq!(rx.await.unwrap().unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_eof_before_prompt() {
        let link = Builder::new().write(b"mfg version\n").read(b"Application: 2").build();
        let session = session(MockConnector::new(vec![link]));

        let (_, rx) = run(&session, "version");
        assert!(matches!(rx.await.unwrap(), Err(SessionError::ClosedBeforePrompt)));
    }
}
