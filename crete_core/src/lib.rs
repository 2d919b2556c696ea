pub mod bridge;
pub mod channel;
pub mod config;
pub mod elf;
pub mod error;
pub mod fsm;
pub mod interceptor;
pub mod launcher;
pub mod procmap;
pub mod resolver;
pub mod runner;

pub use bridge::{AddressFilter, FilterKind, InstrumentationBridge, JournalBridge, RecordingBridge};
pub use channel::{ConfigurationChannel, PacketType};
pub use config::{HarnessConfiguration, RunConfiguration};
pub use error::CreteError;
pub use fsm::{Event, State};
pub use interceptor::{StartupEnvironment, StartupOutcome};
pub use launcher::{LaunchRequest, Launcher, ProcessLauncher, TargetProcess};
pub use procmap::ProcessMemoryMap;
pub use resolver::AddressResolver;
pub use runner::{Runner, RunnerOptions};
