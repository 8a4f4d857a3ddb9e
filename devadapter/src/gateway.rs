/// Single-flight command gateway for the configuration utility
///
/// The gateway owns the one subprocess slot. A buffered or a streaming
/// command may be in flight, never both. Buffered requests arriving while
/// the slot is busy wait in a short FIFO queue that drains itself as each
/// run closes; streaming requests are never queued.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::commands;
use crate::process::{ProcessLauncher, ProcessSink};
use crate::types::{CommandOutput, GENERIC_FAILURE};

/// Maximum number of buffered commands waiting behind the active one
pub const QUEUE_LIMIT: usize = 2;

pub type BufferedHandler = Box<dyn FnOnce(CommandOutput) + Send>;

/// Receives `(chunk, None)` per output chunk, trimmed but otherwise as read
/// (so possibly empty), then `("", Some(status))` once
pub type StreamingHandler = Box<dyn FnMut(String, Option<i32>) + Send>;

/// Accumulates buffered output without splitting lines across chunk boundaries
#[derive(Debug, Default)]
struct LineAccumulator {
    lines: Vec<String>,
    open: bool,
}

impl LineAccumulator {
    fn push_chunk(&mut self, chunk: &str) {
        let mut fragments = chunk.split('\n').map(|fragment| fragment.trim_end_matches('\r'));

        if let Some(first) = fragments.next() {
            match self.lines.last_mut() {
                Some(last) if self.open => last.push_str(first),
                _ => self.lines.push(first.to_string()),
            }
        }
        self.lines.extend(fragments.map(str::to_string));
        self.open = !chunk.ends_with('\n');
    }

    fn into_lines(self) -> Vec<String> {
        self.lines
            .into_iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }
}

enum Active {
    Buffered {
        lines: LineAccumulator,
        handler: BufferedHandler,
    },
    Streaming {
        // Taken out while a chunk is being delivered
        handler: Option<StreamingHandler>,
    },
}

struct QueuedCommand {
    args: Vec<String>,
    handler: BufferedHandler,
    timeout: Option<Duration>,
}

#[derive(Default)]
struct GatewayState {
    device: Option<String>,
    active: Option<Active>,
    queue: VecDeque<QueuedCommand>,
}

struct Inner {
    utility: PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
    command_timeout: Option<Duration>,
    reprogram_timeout: Option<Duration>,
    state: Mutex<GatewayState>,
}

/// Handle to the command gateway; clones share the same subprocess slot
#[derive(Clone)]
pub struct CommandGateway {
    inner: Arc<Inner>,
}

impl CommandGateway {
    pub fn new(utility: impl Into<PathBuf>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self::with_timeouts(utility, launcher, None, None)
    }

    /// Bound the built-in operations; `None` leaves a run unbounded
    pub fn with_timeouts(
        utility: impl Into<PathBuf>,
        launcher: Arc<dyn ProcessLauncher>,
        command: Option<Duration>,
        reprogram: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                utility: utility.into(),
                launcher,
                command_timeout: command,
                reprogram_timeout: reprogram,
                state: Mutex::new(GatewayState::default()),
            }),
        }
    }

    pub fn utility(&self) -> &Path {
        &self.inner.utility
    }

    pub fn set_device(&self, device: Option<String>) {
        log::debug!("GATEWAY: target device -> {:?}", device);
        self.lock().device = device;
    }

    pub fn device(&self) -> Option<String> {
        self.lock().device.clone()
    }

    /// True while a command holds the subprocess slot
    pub fn is_busy(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Run a command and deliver all of its output once it exits
    ///
    /// Returns false when the slot is busy and the queue is full.
    pub fn run_buffered<F>(&self, args: Vec<String>, handler: F, timeout: Option<Duration>) -> bool
    where
        F: FnOnce(CommandOutput) + Send + 'static,
    {
        let handler: BufferedHandler = Box::new(handler);
        {
            let mut state = self.lock();
            if state.active.is_some() {
                if state.queue.len() >= QUEUE_LIMIT {
                    log::warn!("GATEWAY: queue full, rejecting {:?}", args);
                    return false;
                }
                log::debug!("GATEWAY: queued {:?} ({} waiting)", args, state.queue.len() + 1);
                state.queue.push_back(QueuedCommand { args, handler, timeout });
                return true;
            }
            state.active = Some(Active::Buffered {
                lines: LineAccumulator::default(),
                handler,
            });
        }
        self.launch(args, timeout);
        true
    }

    /// Run a command and deliver each output chunk as it arrives
    ///
    /// Returns false whenever another command is in flight.
    pub fn run_streaming<F>(&self, args: Vec<String>, handler: F, timeout: Option<Duration>) -> bool
    where
        F: FnMut(String, Option<i32>) + Send + 'static,
    {
        {
            let mut state = self.lock();
            if state.active.is_some() {
                log::warn!("GATEWAY: busy, rejecting streaming {:?}", args);
                return false;
            }
            state.active = Some(Active::Streaming {
                handler: Some(Box::new(handler)),
            });
        }
        self.launch(args, timeout);
        true
    }

    pub fn query_version<F>(&self, handler: F) -> bool
    where
        F: FnOnce(CommandOutput) + Send + 'static,
    {
        self.run_buffered(commands::version_args(), handler, self.inner.command_timeout)
    }

    pub fn list_devices<F>(&self, handler: F) -> bool
    where
        F: FnOnce(CommandOutput) + Send + 'static,
    {
        self.run_buffered(commands::list_devices_args(), handler, self.inner.command_timeout)
    }

    /// Read product details from the target device
    ///
    /// Without a target device the handler receives an empty failed result
    /// before this returns false; the process layer is not touched.
    pub fn discover<F>(&self, handler: F) -> bool
    where
        F: FnOnce(CommandOutput) + Send + 'static,
    {
        let Some(device) = self.device() else {
            log::warn!("GATEWAY: discover requested with no target device");
            handler(CommandOutput::failed());
            return false;
        };
        self.run_buffered(commands::discover_args(&device), handler, self.inner.command_timeout)
    }

    /// Stream a reprogramming run of `images` onto the target device
    ///
    /// Without a target device the handler receives a final failed status
    /// before this returns false.
    pub fn reprogram<F>(&self, images: &[PathBuf], mut handler: F) -> bool
    where
        F: FnMut(String, Option<i32>) + Send + 'static,
    {
        let Some(device) = self.device() else {
            log::warn!("GATEWAY: reprogram requested with no target device");
            handler(String::new(), Some(GENERIC_FAILURE));
            return false;
        };
        self.run_streaming(
            commands::reprogram_args(&device, images),
            handler,
            self.inner.reprogram_timeout,
        )
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launch(&self, args: Vec<String>, timeout: Option<Duration>) {
        log::debug!("GATEWAY: run {} {}", self.inner.utility.display(), args.join(" "));

        let data_target: Weak<Inner> = Arc::downgrade(&self.inner);
        let close_target = data_target.clone();
        let sink = ProcessSink::new(
            move |chunk| {
                if let Some(inner) = data_target.upgrade() {
                    CommandGateway { inner }.on_data(chunk);
                }
            },
            move |code| {
                if let Some(inner) = close_target.upgrade() {
                    CommandGateway { inner }.on_close(code);
                }
            },
        );
        self.inner
            .launcher
            .launch(&self.inner.utility, &args, timeout, sink);
    }

    fn on_data(&self, chunk: &str) {
        let handler = {
            let mut state = self.lock();
            match state.active.as_mut() {
                Some(Active::Buffered { lines, .. }) => {
                    lines.push_chunk(chunk);
                    return;
                }
                Some(Active::Streaming { handler }) => handler.take(),
                None => {
                    log::warn!("GATEWAY: output with no command in flight");
                    return;
                }
            }
        };

        let Some(mut handler) = handler else {
            return;
        };
        handler(chunk.trim().to_string(), None);

        let mut state = self.lock();
        if let Some(Active::Streaming { handler: slot }) = state.active.as_mut() {
            *slot = Some(handler);
        }
    }

    fn on_close(&self, code: Option<i32>) {
        let status = code.unwrap_or(GENERIC_FAILURE);

        let (finished, next) = {
            let mut state = self.lock();
            let finished = state.active.take();
            let next = state.queue.pop_front().map(|queued| {
                let QueuedCommand { args, handler, timeout } = queued;
                state.active = Some(Active::Buffered {
                    lines: LineAccumulator::default(),
                    handler,
                });
                (args, timeout)
            });
            (finished, next)
        };

        log::debug!("GATEWAY: command closed with status {}", status);
        match finished {
            Some(Active::Buffered { lines, handler }) => {
                handler(CommandOutput::new(lines.into_lines(), status));
            }
            Some(Active::Streaming { handler: Some(mut handler) }) => {
                handler(String::new(), Some(status));
            }
            Some(Active::Streaming { handler: None }) => {
                log::error!("GATEWAY: close arrived during chunk delivery, status {} lost", status);
            }
            None => log::warn!("GATEWAY: close with no command in flight"),
        }

        if let Some((args, timeout)) = next {
            self.launch(args, timeout);
        }
    }
}

impl std::fmt::Debug for CommandGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGateway")
            .field("utility", &self.inner.utility)
            .field("busy", &self.is_busy())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;
    use std::sync::Mutex as StdMutex;

    fn gateway() -> (CommandGateway, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::default());
        (CommandGateway::new("cfgtool", launcher.clone()), launcher)
    }

    fn recorder() -> (Arc<StdMutex<Vec<CommandOutput>>>, impl Fn() -> BufferedHandler) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let make = move || -> BufferedHandler {
            let sink = sink.clone();
            Box::new(move |output| sink.lock().unwrap().push(output))
        };
        (seen, make)
    }

    #[test]
    fn test_buffered_version_query() {
        let (gateway, launcher) = gateway();
        let (seen, handler) = recorder();

        assert!(gateway.run_buffered(vec!["-v".into()], handler(), None));
        assert_eq!(launcher.launched(), vec![vec!["-v".to_string()]]);

        launcher.emit(0, "1.2.3\n");
        launcher.finish(0, Some(0));

        assert_eq!(*seen.lock().unwrap(), vec![CommandOutput::new(vec!["1.2.3".into()], 0)]);
        assert!(!gateway.is_busy());
    }

    #[test]
    fn test_chunk_without_newline_is_not_split() {
        let (gateway, launcher) = gateway();
        let (seen, handler) = recorder();

        gateway.run_buffered(vec!["--info".into()], handler(), None);
        launcher.emit(0, "Product Na");
        launcher.emit(0, "me: Beacon\r\nSerial");
        launcher.emit(0, " Number: 7\n");
        launcher.finish(0, Some(0));

        assert_eq!(
            seen.lock().unwrap()[0].lines,
            vec!["Product Name: Beacon", "Serial Number: 7"]
        );
    }

    #[test]
    fn test_queue_is_bounded_and_drains_in_order() {
        let (gateway, launcher) = gateway();
        let (seen, handler) = recorder();

        assert!(gateway.run_buffered(vec!["a".into()], handler(), None));
        assert!(gateway.run_buffered(vec!["b".into()], handler(), None));
        assert!(gateway.run_buffered(vec!["c".into()], handler(), None));
        assert!(!gateway.run_buffered(vec!["d".into()], handler(), None));
        assert_eq!(gateway.queued(), QUEUE_LIMIT);
        assert_eq!(launcher.launched().len(), 1);

        launcher.emit(0, "first\n");
        launcher.finish(0, Some(0));
        assert_eq!(launcher.launched()[1], vec!["b".to_string()]);

        launcher.finish(1, Some(2));
        assert_eq!(launcher.launched()[2], vec!["c".to_string()]);
        launcher.finish(2, Some(0));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].lines, vec!["first"]);
        assert_eq!(seen[1].status, 2);
        assert_eq!(launcher.launched().len(), 3);
        assert!(!gateway.is_busy());
    }

    #[test]
    fn test_streaming_rejected_while_busy() {
        let (gateway, launcher) = gateway();
        let (_seen, handler) = recorder();

        gateway.run_buffered(vec!["-v".into()], handler(), None);
        assert!(!gateway.run_streaming(vec!["--program".into()], |_, _| {}, None));

        launcher.finish(0, Some(0));
        assert!(gateway.run_streaming(vec!["--program".into()], |_, _| {}, None));
        assert!(!gateway.run_streaming(vec!["--program".into()], |_, _| {}, None));
        let (_seen, handler) = recorder();
        assert!(gateway.run_buffered(vec!["-v".into()], handler(), None));
        assert_eq!(gateway.queued(), 1);
    }

    #[test]
    fn test_streaming_delivers_chunks_then_status() {
        let (gateway, launcher) = gateway();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();

        gateway.run_streaming(
            vec!["--program".into()],
            move |chunk, status| sink.lock().unwrap().push((chunk, status)),
            None,
        );
        launcher.emit(0, "  -> Lines: 100\n");
        launcher.emit(0, "-> Lines: 200\n");
        launcher.finish(0, Some(0));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("-> Lines: 100".to_string(), None),
                ("-> Lines: 200".to_string(), None),
                (String::new(), Some(0)),
            ]
        );
    }

    #[test]
    fn test_blank_streaming_chunk_is_still_delivered() {
        let (gateway, launcher) = gateway();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();

        gateway.run_streaming(
            vec!["--program".into()],
            move |chunk, status| sink.lock().unwrap().push((chunk, status)),
            None,
        );
        launcher.emit(0, "\r\n");
        launcher.finish(0, Some(0));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(String::new(), None), (String::new(), Some(0))]
        );
    }

    #[test]
    fn test_operations_carry_their_timeouts() {
        let launcher = Arc::new(FakeLauncher::default());
        let gateway = CommandGateway::with_timeouts(
            "cfgtool",
            launcher.clone(),
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(600)),
        );
        gateway.set_device(Some("COM3".into()));

        let (_seen, handler) = recorder();
        assert!(gateway.query_version(handler()));
        launcher.finish(0, Some(0));
        assert!(gateway.reprogram(&[PathBuf::from("app.bin")], |_, _| {}));
        launcher.finish(1, Some(0));
        let (_seen, handler) = recorder();
        assert!(gateway.run_buffered(vec!["--list".into()], handler(), None));

        assert_eq!(launcher.timeout(0), Some(Duration::from_secs(5)));
        assert_eq!(launcher.timeout(1), Some(Duration::from_secs(600)));
        assert_eq!(launcher.timeout(2), None);
    }

    #[test]
    fn test_killed_process_reports_generic_failure() {
        let (gateway, launcher) = gateway();
        let (seen, handler) = recorder();

        gateway.run_buffered(vec!["--list".into()], handler(), None);
        launcher.emit(0, "partial");
        launcher.finish(0, None);

        assert_eq!(seen.lock().unwrap()[0].status, GENERIC_FAILURE);
    }

    #[test]
    fn test_device_scoped_operations_fail_without_device() {
        let (gateway, launcher) = gateway();
        let (seen, handler) = recorder();

        assert!(!gateway.discover(handler()));
        assert_eq!(*seen.lock().unwrap(), vec![CommandOutput::failed()]);

        let statuses = Arc::new(StdMutex::new(Vec::new()));
        let sink = statuses.clone();
        assert!(!gateway.reprogram(&[PathBuf::from("app.bin")], move |chunk, status| {
            sink.lock().unwrap().push((chunk, status))
        }));
        assert_eq!(*statuses.lock().unwrap(), vec![(String::new(), Some(GENERIC_FAILURE))]);
        assert!(launcher.launched().is_empty());
    }

    #[test]
    fn test_discover_uses_target_device() {
        let (gateway, launcher) = gateway();
        let (_seen, handler) = recorder();

        gateway.set_device(Some("COM7".into()));
        assert!(gateway.discover(handler()));
        assert_eq!(launcher.launched(), vec![commands::discover_args("COM7")]);
    }
}
