use crate::bridge::{AddressFilter, FilterKind, InstrumentationBridge};
use crate::channel::{ConfigurationChannel, PacketType};
use crate::config::{
    HARNESS_CONFIG_FILE, PRIME_ENV, PROC_MAPS_FILE, RUN_LOG_FILE, RunConfiguration,
};
use crate::error::CreteError;
use crate::fsm::{Event, Guards, State, awaits_next_test, transition};
use crate::launcher::{LaunchRequest, Launcher, TargetProcess};
use crate::procmap::ProcessMemoryMap;
use crate::resolver::AddressResolver;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const DEFAULT_HOST_IP: &str = "10.0.2.2";
const ASLR_CONTROL: &str = "/proc/sys/kernel/randomize_va_space";

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub host_ip: String,
    /// Local run configuration; must be absent when the host is in
    /// distributed mode and present otherwise.
    pub config_path: Option<PathBuf>,
    /// Directory holding `run.log`.
    pub workspace: PathBuf,
    pub port_poll_interval: Duration,
    pub completion_poll_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            host_ip: DEFAULT_HOST_IP.to_string(),
            config_path: None,
            workspace: PathBuf::from("."),
            port_poll_interval: Duration::from_millis(100),
            completion_poll_interval: Duration::from_millis(10),
        }
    }
}

/// The guest-side iteration driver.
///
/// Each [`Runner::step`] takes one event from the pending queue, applies one
/// transition and runs the entry action of the new state. Any error escaping
/// an action is fatal for the campaign.
pub struct Runner<B: InstrumentationBridge, L: Launcher> {
    options: RunnerOptions,
    bridge: B,
    launcher: L,

    state: State,
    events: VecDeque<Event>,
    guards: Guards,

    channel: Option<ConfigurationChannel<TcpStream>>,
    config_path: Option<PathBuf>,
    config: Option<RunConfiguration>,
    launch_dir: PathBuf,
    launch_args: Vec<String>,
    target: Option<Box<dyn TargetProcess>>,
    baseline: Option<[u8; 16]>,
    registered_filters: usize,
    completed_iterations: u64,
}

impl<B: InstrumentationBridge, L: Launcher> Runner<B, L> {
    pub fn new(options: RunnerOptions, bridge: B, launcher: L) -> Self {
        Self {
            options,
            bridge,
            launcher,
            state: State::Start,
            events: VecDeque::from([Event::Start]),
            guards: Guards {
                process_finished: false,
                first_exec: true,
            },
            channel: None,
            config_path: None,
            config: None,
            launch_dir: PathBuf::from("."),
            launch_args: Vec::new(),
            target: None,
            baseline: None,
            registered_filters: 0,
            completed_iterations: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn configuration(&self) -> Option<&RunConfiguration> {
        self.config.as_ref()
    }

    pub fn completed_iterations(&self) -> u64 {
        self.completed_iterations
    }

    /// Steps until `stop` is raised. Never returns `Ok` otherwise.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), CreteError> {
        while !stop.load(Ordering::SeqCst) {
            self.step()?;
        }
        info!(
            "Stop requested in state {} after {} iterations",
            self.state, self.completed_iterations
        );
        Ok(())
    }

    fn next_event(&self) -> Event {
        if self.state == State::Start {
            Event::Start
        } else if awaits_next_test(self.state, &self.guards) {
            Event::NextTest
        } else {
            Event::Poll
        }
    }

    pub fn step(&mut self) -> Result<(), CreteError> {
        let event = match self.events.pop_front() {
            Some(event) => event,
            None => self.next_event(),
        };

        if self.state == State::AwaitCompletion {
            self.guards.process_finished = match self.target.as_mut() {
                Some(target) => !target.is_running()?,
                None => true,
            };
        }

        match transition(self.state, event, &self.guards) {
            Some(next) => {
                debug!("exiting: {}", self.state);
                self.state = next;
                debug!("entering: {}", next);
                self.enter(next)?;
            }
            None if self.state == State::AwaitCompletion => {
                std::thread::sleep(self.options.completion_poll_interval);
            }
            None => debug!("{:?} ignored in {}", event, self.state),
        }

        self.events.push_back(self.next_event());
        Ok(())
    }

    fn enter(&mut self, state: State) -> Result<(), CreteError> {
        match state {
            State::Start => Ok(()),
            State::VerifyEnvironment => {
                self.verify_environment();
                Ok(())
            }
            State::CleanWorkspace => self.clean_workspace(),
            State::ConnectHost => self.connect_host(),
            State::LoadHostHandshake => self.load_host_handshake(),
            State::LoadDefaultConfig => self.load_default_config(),
            State::LoadEmbeddedFileData => self.load_embedded_file_data(),
            State::TransmitConfig => self.transmit_config(),
            State::PrimeTarget => self.prime_target(),
            State::ResolveInstrumentation => self.resolve_instrumentation(),
            State::ValidateSetup => self.validate_setup(),
            State::Execute => self.execute(),
            State::AwaitCompletion => Ok(()),
            State::VerifyInvariants => self.verify_invariants(),
            State::UpdateConfig => self.update_config(),
        }
    }

    fn channel(&mut self) -> Result<&mut ConfigurationChannel<TcpStream>, CreteError> {
        self.channel
            .as_mut()
            .ok_or_else(|| {
                CreteError::Transport(std::io::Error::new(
                    ErrorKind::NotConnected,
                    "not connected to the host",
                ))
            })
    }

    fn config(&self) -> Result<&RunConfiguration, CreteError> {
        self.config
            .as_ref()
            .ok_or_else(|| CreteError::configuration("run configuration not loaded"))
    }

    fn harness_path(&self) -> PathBuf {
        self.launch_dir.join(HARNESS_CONFIG_FILE)
    }

    fn maps_path(&self) -> PathBuf {
        self.launch_dir.join(PROC_MAPS_FILE)
    }

    fn verify_environment(&self) {
        match fs::read_to_string(ASLR_CONTROL) {
            Ok(value) if value.trim() != "0" => warn!(
                "ASLR is enabled ({} = {}); load addresses will differ between iterations",
                ASLR_CONTROL,
                value.trim()
            ),
            Ok(_) => debug!("ASLR disabled"),
            Err(e) => debug!("Could not read {}: {}", ASLR_CONTROL, e),
        }
    }

    fn clean_workspace(&self) -> Result<(), CreteError> {
        let log = self.options.workspace.join(RUN_LOG_FILE);
        File::create(&log).map_err(|e| CreteError::io(&log, e))?;
        Ok(())
    }

    fn connect_host(&mut self) -> Result<(), CreteError> {
        let port = loop {
            let port = self.bridge.read_port()?;
            if port != 0 {
                break port;
            }
            std::thread::sleep(self.options.port_poll_interval);
        };

        let address = format!("{}:{}", self.options.host_ip, port);
        let stream = TcpStream::connect(&address).map_err(|source| CreteError::Connect {
            address: address.clone(),
            source,
        })?;
        info!("Connected to host at {}", address);
        self.channel = Some(ConfigurationChannel::new(stream));
        Ok(())
    }

    fn load_host_handshake(&mut self) -> Result<(), CreteError> {
        let distributed: bool = self.channel()?.read_value(PacketType::HostDistributedMode)?;

        if distributed {
            if let Some(local) = &self.options.config_path {
                return Err(CreteError::ModeConflict {
                    mode: "distributed".to_string(),
                    message: format!(
                        "configuration {:?} given locally, but the host supplies it",
                        local
                    ),
                });
            }
            let path: String = self.channel()?.read_value(PacketType::HostConfigurationPath)?;
            info!("Distributed mode, configuration from host: {}", path);
            self.config_path = Some(PathBuf::from(path));
        } else {
            let local = self.options.config_path.clone().ok_or_else(|| {
                CreteError::ModeConflict {
                    mode: "developer".to_string(),
                    message: "the host expects a local configuration; pass --config".to_string(),
                }
            })?;
            info!("Developer mode, configuration: {:?}", local);
            self.config_path = Some(local);
        }
        Ok(())
    }

    fn load_default_config(&mut self) -> Result<(), CreteError> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| CreteError::configuration("no configuration path resolved"))?;
        let config = RunConfiguration::load_from_file(&path)?;

        self.launch_dir = config.launch_directory()?;
        self.launch_args = config.launch_args()?;
        debug!(
            "Launch directory {:?}, argv {:?}",
            self.launch_dir, self.launch_args
        );
        self.config = Some(config);
        Ok(())
    }

    fn load_embedded_file_data(&mut self) -> Result<(), CreteError> {
        let launch_dir = self.launch_dir.clone();
        let config = self
            .config
            .as_mut()
            .ok_or_else(|| CreteError::configuration("run configuration not loaded"))?;
        let loaded = config.load_file_data(&launch_dir)?;
        info!("Embedded {} input file(s) into the configuration", loaded);
        Ok(())
    }

    fn transmit_config(&mut self) -> Result<(), CreteError> {
        let config = self.config()?.clone();
        self.channel()?
            .write_value(PacketType::GuestConfiguration, &config)
    }

    fn persist(&self) -> Result<(), CreteError> {
        self.config()?.harness().write_to(&self.harness_path())
    }

    fn launch_request(
        &self,
        env_overrides: Vec<(OsString, OsString)>,
    ) -> Result<LaunchRequest, CreteError> {
        Ok(LaunchRequest {
            executable: self.config()?.executable.clone(),
            args: self.launch_args.clone(),
            launch_dir: self.launch_dir.clone(),
            env_overrides,
        })
    }

    fn prime_target(&mut self) -> Result<(), CreteError> {
        remove_stale(&self.maps_path())?;
        remove_stale(&self.harness_path())?;

        if let Some(config) = self.config.as_mut() {
            config.is_first_iteration = true;
        }
        self.persist()?;

        let request = self.launch_request(vec![(PRIME_ENV.into(), "1".into())])?;
        let exit = self.launcher.launch(&request)?.wait()?;
        if !exit.success() {
            warn!("Prime run of {:?} {}", request.executable, exit);
        }

        self.bridge.signal_prime()
    }

    fn resolve_instrumentation(&mut self) -> Result<(), CreteError> {
        let map = ProcessMemoryMap::load(&self.maps_path())?;
        let config = self.config()?.clone();
        let mut resolver = AddressResolver::new(&map, &config.executable);
        let mut filters: Vec<AddressFilter> = Vec::new();

        for lib in &config.libraries {
            filters.extend(resolver.resolve_library_ranges(lib, FilterKind::Include)?);
        }
        for func in &config.include_functions {
            filters.push(resolver.resolve_function(&func.name, func.library(), FilterKind::Include)?);
        }
        for func in &config.exclude_functions {
            filters.push(resolver.resolve_function(&func.name, func.library(), FilterKind::Exclude)?);
        }
        filters.extend(
            resolver.resolve_mapped_sections(&config.section_exclusions, FilterKind::CallStackExclude),
        );

        for filter in &filters {
            debug!(
                "{:?} filter [{:#x}, {:#x})",
                filter.kind, filter.start, filter.end
            );
            self.bridge.add_filter(filter)?;
        }
        self.registered_filters = filters.len();
        Ok(())
    }

    fn validate_setup(&mut self) -> Result<(), CreteError> {
        for required in [self.harness_path(), self.maps_path()] {
            if !required.is_file() {
                return Err(CreteError::Configuration {
                    file: Some(required),
                    message: "missing after the prime run".to_string(),
                });
            }
        }
        info!(
            "Setup complete: {} address filter(s) registered, waiting for the host",
            self.registered_filters
        );
        Ok(())
    }

    fn execute(&mut self) -> Result<(), CreteError> {
        self.channel()?.expect(PacketType::ClusterNextTest)?;

        // The interceptor reads this file at startup; it must exist first.
        self.persist()?;
        let request = self.launch_request(Vec::new())?;
        self.target = Some(self.launcher.launch(&request)?);
        self.guards.process_finished = false;
        Ok(())
    }

    fn verify_invariants(&mut self) -> Result<(), CreteError> {
        self.bridge.signal_dump()?;
        if let Some(mut target) = self.target.take() {
            let exit = target.wait()?;
            debug!("Target (pid {}) {}", target.id(), exit);
        }
        self.completed_iterations += 1;

        let map = ProcessMemoryMap::load(&self.maps_path())?;
        if map.entries().is_empty() {
            return Err(CreteError::InvariantViolation(format!(
                "{:?} is empty",
                self.maps_path()
            )));
        }

        let hash = map.content_hash();
        match self.baseline {
            None => {
                debug!("Recorded baseline process map hash");
                self.baseline = Some(hash);
            }
            Some(baseline) if baseline != hash => {
                return Err(CreteError::InvariantViolation(
                    "process memory map changed between iterations; is ASLR disabled?"
                        .to_string(),
                ));
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn update_config(&mut self) -> Result<(), CreteError> {
        if let Some(config) = self.config.as_mut() {
            config.is_first_iteration = false;
            config.clear_file_data();
        }
        self.persist()?;
        self.guards.first_exec = false;
        Ok(())
    }
}

fn remove_stale(path: &Path) -> Result<(), CreteError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CreteError::io(path, e)),
    }
}
