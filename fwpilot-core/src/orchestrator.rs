/// Update workflow state machine
///
/// The orchestrator owns the three adapters and one current workflow state.
/// Every input (observer command, setting, timer firing, adapter
/// completion) arrives on a single channel and is handled to completion
/// before the next one is read. Adapter callbacks never call back into the
/// orchestrator directly: they post a `Completion` onto that channel, so a
/// handler is never re-entered.
///
/// State handlers are plain dispatch over the event. An event a state has
/// no use for is ignored. Enter actions only start work; whatever that work
/// produces comes back later as a separate input.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use devadapter::{
    local_path, parse_device_list, parse_firmware_versions, parse_product_details, parse_progress_lines,
    progress_percent, CommandGateway, CommandOutput, DebugSession, DirectoryStore, FileOutcome,
    NativeSerialConnector, PackageManifest, RepositoryClient, SessionError, TokioLauncher,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::commands::{Command, Completion, Control, Event, Input, Setting};
use crate::config::{CheckFailurePolicy, Settings};
use crate::state::{Records, WorkflowState};
use crate::wire::{self, ObserverTransport, WireMessage};

/// Debug session command that reports firmware component versions
pub const VERSION_QUERY: &str = "version";

type StateHook = Box<dyn FnMut(WorkflowState) + Send>;

/// The adapters the orchestrator drives
#[derive(Clone)]
pub struct Adapters {
    pub gateway: CommandGateway,
    pub session: DebugSession,
    pub repository: RepositoryClient,
}

impl Adapters {
    /// Real processes, a real serial port and a directory-backed repository
    pub fn native(settings: &Settings) -> Self {
        let mut store = DirectoryStore::new(settings.repository_root.clone());
        if let Some(limit) = settings.repository_page_limit {
            store = store.with_max_keys(limit);
        }
        Self {
            gateway: CommandGateway::with_timeouts(
                settings.utility_path.clone(),
                Arc::new(TokioLauncher),
                settings.utility_timeout(),
                settings.reprogram_timeout(),
            ),
            session: DebugSession::with_settings(
                Arc::new(NativeSerialConnector),
                settings.serial_baud,
                settings.session_timeout(),
            ),
            repository: RepositoryClient::new(Arc::new(store), settings.index_extension.clone()),
        }
    }
}

pub struct Orchestrator {
    settings: Settings,
    adapters: Adapters,
    transport: Box<dyn ObserverTransport>,
    inputs: UnboundedSender<Input>,
    state: Option<WorkflowState>,
    records: Records,
    component_images: Vec<PathBuf>,
    hook: Option<StateHook>,
}

impl Orchestrator {
    /// `inputs` is the sending half of the channel later passed to `run`
    pub fn new(
        settings: Settings,
        adapters: Adapters,
        transport: Box<dyn ObserverTransport>,
        inputs: UnboundedSender<Input>,
    ) -> Self {
        Self {
            settings,
            adapters,
            transport,
            inputs,
            state: None,
            records: Records::default(),
            component_images: Vec::new(),
            hook: None,
        }
    }

    /// Call `hook` after every completed transition
    pub fn with_state_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(WorkflowState) + Send + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn current_state(&self) -> Option<WorkflowState> {
        self.state
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn adapters(&self) -> &Adapters {
        &self.adapters
    }

    /// Query the utility version and device list, then enter Welcome
    pub fn start(&mut self) {
        let gateway = self.adapters.gateway.clone();
        gateway.query_version(self.relay(Completion::UtilityVersion));
        gateway.list_devices(self.relay(Completion::DeviceList));
        self.enter_state(WorkflowState::Welcome);
    }

    /// Start the workflow and process inputs until `Shutdown`
    pub async fn run(mut self, mut inputs: UnboundedReceiver<Input>) {
        self.start();
        while let Some(input) = inputs.recv().await {
            if matches!(input, Input::Shutdown) {
                log::info!("Shutting down in state {:?}", self.state);
                break;
            }
            self.handle(input);
        }
    }

    /// Process one input to completion
    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.inject(Event::Command(command)),
            Input::Setting(setting) => self.apply_setting(setting),
            Input::Timeout => self.inject(Event::Timeout),
            Input::Completion(completion) => self.complete(completion),
            Input::Control(control) => self.inject(Event::Control(control)),
            Input::Shutdown => {}
        }
    }

    /// Route `event` to the current state's handler
    pub fn inject(&mut self, event: Event) {
        if let Some(target) = self.dispatch(event) {
            self.enter_state(target);
        }
    }

    /// Move to `target`; entering the current state does nothing
    pub fn enter_state(&mut self, target: WorkflowState) {
        if self.state == Some(target) {
            return;
        }
        match self.state {
            Some(from) => log::info!("State {} -> {}", from, target),
            None => log::info!("State -> {}", target),
        }

        self.transport.send(WireMessage::state(target));
        if self.state.is_some() {
            self.dispatch(Event::Exit);
        }
        self.state = Some(target);
        if let Some(next) = self.dispatch(Event::Enter) {
            log::error!("Enter of {} requested {}, ignored", target, next);
        }
        if let Some(hook) = self.hook.as_mut() {
            hook(target);
        }
    }

    fn dispatch(&mut self, event: Event) -> Option<WorkflowState> {
        let state = self.state?;
        log::trace!("{} <- {:?}", state, event);
        match state {
            WorkflowState::Welcome => self.on_welcome(event),
            WorkflowState::CheckingForUpdate => self.on_checking(event),
            WorkflowState::CheckFailedOffline => self.on_check_failed_offline(event),
            WorkflowState::CheckFailedCached => self.on_check_failed_cached(event),
            WorkflowState::ConnectPrompt => self.on_connect_prompt(event),
            WorkflowState::Detecting => self.on_detecting(event),
            WorkflowState::DetectionFailed => self.on_detection_failed(event),
            WorkflowState::DetectingManual => self.on_detecting_manual(event),
            WorkflowState::DetectedAvailable => self.on_detected_available(event),
            WorkflowState::DetectedCurrent => self.on_detected_current(event),
            WorkflowState::Updating => self.on_updating(event),
            WorkflowState::UpdateComplete => self.on_update_complete(event),
            WorkflowState::UpdateFailed => self.on_update_failed(event),
        }
    }

    fn on_welcome(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Command(Command::Continue) => Some(WorkflowState::CheckingForUpdate),
            _ => None,
        }
    }

    fn on_checking(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Enter => {
                let prefix = self.settings.repository_prefix.clone();
                self.adapters
                    .repository
                    .list_index_files(prefix, self.relay(Completion::IndexListing));
                None
            }
            Event::Control(Control::IndexListed(keys)) => {
                if keys.is_empty() {
                    log::warn!("No index files in the repository");
                    return Some(self.check_failed_target());
                }
                let dir = self.index_dir();
                self.adapters
                    .repository
                    .download_files(keys, dir, self.relay(Completion::IndexDownload));
                None
            }
            Event::Control(Control::CheckSucceeded) => {
                if self.read_cached_package() {
                    Some(WorkflowState::ConnectPrompt)
                } else {
                    log::warn!("Index downloaded but no readable manifest found");
                    Some(self.check_failed_target())
                }
            }
            Event::Control(Control::CheckFailed) => Some(self.check_failed_target()),
            _ => None,
        }
    }

    fn on_check_failed_offline(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Command(Command::Retry) => Some(WorkflowState::CheckingForUpdate),
            _ => None,
        }
    }

    fn on_check_failed_cached(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Command(Command::Continue) => Some(WorkflowState::ConnectPrompt),
            Event::Command(Command::Retry) => Some(WorkflowState::CheckingForUpdate),
            _ => None,
        }
    }

    fn on_connect_prompt(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Command(Command::Continue) => Some(WorkflowState::Detecting),
            _ => None,
        }
    }

    fn on_detecting(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Enter => {
                self.records.clear_device();
                let gateway = self.adapters.gateway.clone();
                if !gateway.discover(self.relay(Completion::Discovery)) && gateway.device().is_some() {
                    self.post(Input::Control(Control::DiscoveryFailed));
                }
                None
            }
            Event::Control(Control::DiscoverySucceeded) => Some(WorkflowState::DetectedAvailable),
            Event::Control(Control::DiscoveryFailed) => Some(WorkflowState::DetectionFailed),
            _ => None,
        }
    }

    fn on_detection_failed(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Enter => {
                self.refresh_devices();
                None
            }
            Event::Command(Command::Continue) => Some(WorkflowState::DetectingManual),
            Event::Command(Command::Retry) => Some(WorkflowState::Detecting),
            _ => None,
        }
    }

    fn on_detecting_manual(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Enter => {
                self.refresh_devices();
                None
            }
            Event::Command(Command::Connect) => {
                if self.records.selected_device.is_none() {
                    log::warn!("Connect requested with no device selected");
                    return None;
                }
                Some(WorkflowState::Detecting)
            }
            _ => None,
        }
    }

    fn on_detected_available(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Enter => {
                self.arm_timer(self.settings.settle_delay());
                None
            }
            Event::Timeout => {
                self.transport
                    .send(WireMessage::structured(wire::PRODUCT_DETAILS_KEY, &self.records.product));
                self.query_firmware_versions();
                None
            }
            Event::Control(Control::VersionsRead) if self.records.firmware_is_current() => {
                Some(WorkflowState::DetectedCurrent)
            }
            Event::Control(Control::VersionQueryFailed) => {
                log::warn!("Firmware versions unavailable, offering the update anyway");
                None
            }
            Event::Command(Command::Install) => Some(WorkflowState::Updating),
            _ => None,
        }
    }

    fn on_detected_current(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Command(Command::Install) => Some(WorkflowState::Updating),
            Event::Command(Command::Restart) => Some(WorkflowState::Welcome),
            _ => None,
        }
    }

    fn on_updating(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Enter => {
                self.emit_progress(0);
                self.download_components();
                None
            }
            Event::Control(Control::ComponentsReady(images)) => {
                let gateway = self.adapters.gateway.clone();
                let inputs = self.inputs.clone();
                let accepted = gateway.reprogram(&images, move |chunk, status| {
                    let _ = inputs.send(Input::Completion(Completion::ReprogramOutput { chunk, status }));
                });
                if !accepted && gateway.device().is_some() {
                    self.post(Input::Control(Control::ReprogramFailed));
                }
                None
            }
            Event::Control(Control::ReprogramProgress(percent)) => {
                self.emit_progress(percent);
                None
            }
            Event::Control(Control::ReprogramSucceeded) => {
                self.emit_progress(100);
                Some(WorkflowState::UpdateComplete)
            }
            Event::Control(Control::ReprogramFailed) => Some(WorkflowState::UpdateFailed),
            _ => None,
        }
    }

    fn on_update_complete(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Command(Command::Restart) => Some(WorkflowState::Welcome),
            _ => None,
        }
    }

    fn on_update_failed(&mut self, event: Event) -> Option<WorkflowState> {
        match event {
            Event::Command(Command::Retry) => Some(WorkflowState::Updating),
            Event::Command(Command::Restart) => Some(WorkflowState::Welcome),
            _ => None,
        }
    }

    /// Fold an adapter result into the records and raise the matching control event
    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::UtilityVersion(output) => self.on_utility_version(output),
            Completion::DeviceList(output) => self.on_device_list(output),
            Completion::IndexListing(Some(keys)) => self.inject(Event::Control(Control::IndexListed(keys))),
            Completion::IndexListing(None) => self.inject(Event::Control(Control::CheckFailed)),
            Completion::IndexDownload(outcome) => {
                log_download(&outcome);
                if outcome.batch.is_finished() {
                    let control = if outcome.batch.succeeded() {
                        Control::CheckSucceeded
                    } else {
                        Control::CheckFailed
                    };
                    self.inject(Event::Control(control));
                }
            }
            Completion::Discovery(output) => {
                if output.success() {
                    self.records.product = parse_product_details(&output.lines);
                    self.inject(Event::Control(Control::DiscoverySucceeded));
                } else {
                    log::warn!("Discovery failed with status {}", output.status);
                    self.inject(Event::Control(Control::DiscoveryFailed));
                }
            }
            Completion::FirmwareVersions(outcome) => self.on_firmware_versions(outcome),
            Completion::ComponentDownload(outcome) => {
                log_download(&outcome);
                if outcome.batch.is_finished() {
                    let control = if outcome.batch.all_succeeded() {
                        Control::ComponentsReady(self.component_images.clone())
                    } else {
                        log::error!(
                            "Only {} of {} firmware images downloaded",
                            outcome.batch.success,
                            outcome.batch.count
                        );
                        Control::ReprogramFailed
                    };
                    self.inject(Event::Control(control));
                }
            }
            Completion::ReprogramOutput { chunk, status } => self.on_reprogram_output(chunk, status),
        }
    }

    fn on_utility_version(&mut self, output: CommandOutput) {
        if !output.success() {
            log::warn!("Utility version query failed with status {}", output.status);
            return;
        }
        if let Some(version) = output.lines.into_iter().next() {
            log::info!("Configuration utility version {}", version);
            self.transport
                .send(WireMessage::scalar(wire::UTILITY_VERSION_KEY, version.as_str()));
            self.records.utility_version = Some(version);
        }
    }

    fn on_device_list(&mut self, output: CommandOutput) {
        if !output.success() {
            log::warn!("Device list query failed with status {}", output.status);
            return;
        }
        self.records.devices = parse_device_list(&output.lines);
        log::info!("Devices: {:?}", self.records.devices);
        self.transport
            .send(WireMessage::list(wire::DEVICES_KEY, &self.records.devices));

        if self.records.selected_device.is_none() {
            if let Some(first) = self.records.devices.first().cloned() {
                self.transport.send(WireMessage::scalar(wire::DEVICE_KEY, first.as_str()));
                self.apply_setting(Setting::Device(Some(first)));
            }
        }
    }

    fn on_firmware_versions(&mut self, outcome: Result<Vec<String>, SessionError>) {
        match outcome {
            Ok(lines) => {
                let versions = parse_firmware_versions(&lines);
                self.transport
                    .send(WireMessage::structured(wire::FIRMWARE_VERSIONS_KEY, &versions));
                self.records.firmware = Some(versions);
                self.inject(Event::Control(Control::VersionsRead));
            }
            Err(e) => {
                log::error!("Firmware version query failed: {}", e);
                self.inject(Event::Control(Control::VersionQueryFailed));
            }
        }
    }

    fn on_reprogram_output(&mut self, chunk: String, status: Option<i32>) {
        match status {
            Some(0) => self.inject(Event::Control(Control::ReprogramSucceeded)),
            Some(code) => {
                log::error!("Reprogramming exited with status {}", code);
                self.inject(Event::Control(Control::ReprogramFailed));
            }
            None => {
                log::debug!("GATEWAY: {}", chunk);
                if let Some(lines) = parse_progress_lines(&chunk) {
                    let percent = progress_percent(lines, self.settings.progress_total_lines);
                    self.inject(Event::Control(Control::ReprogramProgress(percent)));
                }
            }
        }
    }

    fn apply_setting(&mut self, setting: Setting) {
        match setting {
            Setting::Device(device) => {
                log::info!("Target device: {:?}", device);
                self.adapters.gateway.set_device(device.clone());
                self.adapters.session.set_device(device.clone());
                if self.records.selected_device != device {
                    self.records.clear_device();
                }
                self.records.selected_device = device;
            }
        }
    }

    fn check_failed_target(&mut self) -> WorkflowState {
        let cached = self.read_cached_package();
        match self.settings.check_failure_policy {
            CheckFailurePolicy::PreferCached => WorkflowState::CheckFailedCached,
            CheckFailurePolicy::DetectCache if cached => WorkflowState::CheckFailedCached,
            CheckFailurePolicy::DetectCache => WorkflowState::CheckFailedOffline,
        }
    }

    /// Load the newest cached manifest into the records and forward it
    fn read_cached_package(&mut self) -> bool {
        let Some((path, package)) = PackageManifest::latest_in(&self.index_dir(), &self.settings.index_extension)
        else {
            return false;
        };
        log::info!("Using package manifest {}", path.display());
        self.transport.send(WireMessage::structured(wire::PACKAGE_KEY, &package));
        self.records.package = Some(package);
        true
    }

    fn refresh_devices(&mut self) {
        let gateway = self.adapters.gateway.clone();
        if !gateway.list_devices(self.relay(Completion::DeviceList)) {
            log::warn!("Device list refresh rejected, gateway busy");
        }
    }

    fn query_firmware_versions(&mut self) {
        let session = self.adapters.session.clone();
        if !session.run_command(VERSION_QUERY, self.relay(Completion::FirmwareVersions)) {
            let reason = if session.device().is_none() {
                SessionError::NoDevice
            } else {
                SessionError::Busy
            };
            self.post(Input::Completion(Completion::FirmwareVersions(Err(reason))));
        }
    }

    fn download_components(&mut self) {
        let keys = self
            .records
            .package
            .as_ref()
            .map(PackageManifest::locations)
            .unwrap_or_default();
        if keys.is_empty() {
            log::error!("No firmware images to install");
            self.post(Input::Control(Control::ReprogramFailed));
            return;
        }

        let dir = self.firmware_dir();
        let images: Vec<PathBuf> = keys.iter().filter_map(|key| local_path(&dir, key)).collect();
        if images.len() != keys.len() {
            log::error!("Package lists an image location without a file name: {:?}", keys);
            self.post(Input::Control(Control::ReprogramFailed));
            return;
        }
        self.component_images = images;
        self.adapters
            .repository
            .download_files(keys, dir, self.relay(Completion::ComponentDownload));
    }

    fn emit_progress(&mut self, percent: u8) {
        log::debug!("Reprogramming progress {}%", percent);
        self.transport.send(WireMessage::scalar(wire::PROGRESS_KEY, percent));
    }

    /// Schedule one `Timeout` input; it is never cancelled
    fn arm_timer(&self, delay: Duration) {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(Input::Timeout);
        });
    }

    fn post(&self, input: Input) {
        if self.inputs.send(input).is_err() {
            log::debug!("Event loop closed, input dropped");
        }
    }

    /// Adapter callback that posts its result back onto the event loop
    fn relay<T>(&self, wrap: fn(T) -> Completion) -> impl Fn(T) + Send + Sync + 'static
    where
        T: 'static,
    {
        let inputs = self.inputs.clone();
        move |value| {
            if inputs.send(Input::Completion(wrap(value))).is_err() {
                log::debug!("Event loop closed, completion dropped");
            }
        }
    }

    fn index_dir(&self) -> PathBuf {
        self.settings.cache_dir.join("index")
    }

    fn firmware_dir(&self) -> PathBuf {
        self.settings.cache_dir.join("firmware")
    }
}

fn log_download(outcome: &FileOutcome) {
    if outcome.ok {
        log::debug!(
            "REPO: {} -> {} ({}/{})",
            outcome.key,
            outcome.path.display(),
            outcome.batch.completed,
            outcome.batch.count
        );
    } else {
        log::warn!(
            "REPO: {} failed ({}/{})",
            outcome.key,
            outcome.batch.completed,
            outcome.batch.count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ChannelTransport;
    use devadapter::testing::{FakeLauncher, MemoryStore, ScriptedSerial};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Fixture {
        orchestrator: Orchestrator,
        observed: UnboundedReceiver<WireMessage>,
        launcher: Arc<FakeLauncher>,
        _inputs: UnboundedReceiver<Input>,
        _cache: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let cache = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_dir: cache.path().to_path_buf(),
            ..Default::default()
        };
        let launcher = Arc::new(FakeLauncher::default());
        let adapters = Adapters {
            gateway: CommandGateway::new("cfgtool", launcher.clone()),
            session: DebugSession::new(Arc::new(ScriptedSerial::default())),
            repository: RepositoryClient::new(Arc::new(MemoryStore::default()), ".xml"),
        };
        let (out_tx, observed) = mpsc::unbounded_channel();
        let (in_tx, inputs) = mpsc::unbounded_channel();
        Fixture {
            orchestrator: Orchestrator::new(settings, adapters, Box::new(ChannelTransport::new(out_tx)), in_tx),
            observed,
            launcher,
            _inputs: inputs,
            _cache: cache,
        }
    }

    fn drain(observed: &mut UnboundedReceiver<WireMessage>) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = observed.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_entering_current_state_is_a_no_op() {
        let mut f = fixture();
        let entered = Arc::new(Mutex::new(Vec::new()));
        let seen = entered.clone();
        f.orchestrator = f.orchestrator.with_state_hook(move |state| seen.lock().unwrap().push(state));
        f.orchestrator.adapters().gateway.set_device(Some("COM3".into()));

        f.orchestrator.enter_state(WorkflowState::Detecting);
        f.orchestrator.enter_state(WorkflowState::Detecting);

        assert_eq!(f.launcher.launched().len(), 1);
        assert_eq!(drain(&mut f.observed), vec![WireMessage::state(WorkflowState::Detecting)]);
        assert_eq!(*entered.lock().unwrap(), vec![WorkflowState::Detecting]);
    }

    #[test]
    fn test_events_before_start_are_ignored() {
        let mut f = fixture();
        f.orchestrator.inject(Event::Command(Command::Continue));
        assert_eq!(f.orchestrator.current_state(), None);
        assert!(drain(&mut f.observed).is_empty());
    }

    #[test]
    fn test_unhandled_events_leave_state_unchanged() {
        let mut f = fixture();
        let ignored = [
            (WorkflowState::Welcome, Event::Command(Command::Install)),
            (WorkflowState::Welcome, Event::Timeout),
            (WorkflowState::Welcome, Event::Control(Control::ReprogramSucceeded)),
            (WorkflowState::ConnectPrompt, Event::Command(Command::Retry)),
            (WorkflowState::CheckFailedOffline, Event::Command(Command::Continue)),
            (WorkflowState::DetectedCurrent, Event::Command(Command::Continue)),
            (WorkflowState::UpdateComplete, Event::Command(Command::Retry)),
            (WorkflowState::UpdateFailed, Event::Control(Control::DiscoverySucceeded)),
        ];
        for (state, event) in ignored {
            f.orchestrator.enter_state(state);
            f.orchestrator.inject(event.clone());
            assert_eq!(f.orchestrator.current_state(), Some(state), "{state} handled {event:?}");
        }
    }

    #[test]
    fn test_connect_needs_a_selected_device() {
        let mut f = fixture();
        f.orchestrator.enter_state(WorkflowState::DetectingManual);
        f.orchestrator.inject(Event::Command(Command::Connect));
        assert_eq!(f.orchestrator.current_state(), Some(WorkflowState::DetectingManual));
        f.launcher.finish(0, Some(0));

        f.orchestrator.handle(Input::Setting(Setting::Device(Some("COM9".into()))));
        assert_eq!(f.orchestrator.adapters().session.device().as_deref(), Some("COM9"));
        f.orchestrator.inject(Event::Command(Command::Connect));
        assert_eq!(f.orchestrator.current_state(), Some(WorkflowState::Detecting));
        assert_eq!(
            f.launcher.launched().last().unwrap(),
            &vec!["--device".to_string(), "COM9".into(), "--info".into()]
        );
    }

    #[test]
    fn test_progress_is_emitted_before_completion() {
        let mut f = fixture();
        f.orchestrator.state = Some(WorkflowState::Updating);
        f.orchestrator.handle(Input::Completion(Completion::ReprogramOutput {
            chunk: "Erasing\n-> Lines: 15000".into(),
            status: None,
        }));
        f.orchestrator.handle(Input::Completion(Completion::ReprogramOutput {
            chunk: String::new(),
            status: Some(0),
        }));

        assert_eq!(
            drain(&mut f.observed),
            vec![
                WireMessage::scalar(wire::PROGRESS_KEY, 50u8),
                WireMessage::scalar(wire::PROGRESS_KEY, 100u8),
                WireMessage::state(WorkflowState::UpdateComplete),
            ]
        );
    }

    #[test]
    fn test_reprogram_failure_status_fails_update() {
        let mut f = fixture();
        f.orchestrator.state = Some(WorkflowState::Updating);
        f.orchestrator.handle(Input::Completion(Completion::ReprogramOutput {
            chunk: String::new(),
            status: Some(3),
        }));
        assert_eq!(f.orchestrator.current_state(), Some(WorkflowState::UpdateFailed));

        f.orchestrator.inject(Event::Command(Command::Restart));
        assert_eq!(f.orchestrator.current_state(), Some(WorkflowState::Welcome));
    }
}
