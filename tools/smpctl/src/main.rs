use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use smp_ipc::{PriorityPolicy, WakeStrategy};

mod logger;
mod scenarios;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Cross-core call and watchdog scenarios on a simulated multi-core system"
)]
struct Opts {
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Task-level calls to every core.
    Ipc(IpcArgs),
    /// Stall CPU 0 from CPU 1 and watch its tick stop.
    Stall(StallArgs),
    /// Subscribe tasks with different reset periods to the task watchdog.
    TaskWdt(TaskWdtArgs),
    /// Run the interrupt watchdog, optionally with a core kept busy.
    IntWdt(IntWdtArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Policy {
    Callers,
    Fixed,
}

impl From<Policy> for PriorityPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Callers => PriorityPolicy::CallersPriority,
            Policy::Fixed => PriorityPolicy::Fixed,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Wake {
    Notify,
    Semaphore,
}

impl From<Wake> for WakeStrategy {
    fn from(wake: Wake) -> Self {
        match wake {
            Wake::Notify => WakeStrategy::Notify,
            Wake::Semaphore => WakeStrategy::Semaphore,
        }
    }
}

#[derive(Args, Debug)]
pub struct IpcArgs {
    #[arg(long, default_value_t = 2)]
    pub cores: usize,

    #[arg(long, value_enum, default_value_t = Policy::Callers)]
    pub policy: Policy,

    #[arg(long, value_enum, default_value_t = Wake::Notify)]
    pub wake: Wake,

    /// Wait-for-start calls issued to each core.
    #[arg(long, default_value_t = 100)]
    pub calls: u32,
}

#[derive(Args, Debug)]
pub struct StallArgs {
    /// How long the stall is held, and how long to watch after release.
    #[arg(long = "hold", default_value_t = 100, value_name = "MS")]
    pub hold_ms: u64,

    /// Nested stall depth.
    #[arg(long, default_value_t = 1)]
    pub depth: u32,
}

/// `name:period_ms`
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub period: Duration,
}

impl FromStr for TaskSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, period) = s
            .split_once(':')
            .ok_or_else(|| format!("expected NAME:PERIOD_MS, got {s:?}"))?;
        if name.is_empty() {
            return Err(String::from("task name is empty"));
        }
        let period = period
            .parse::<u64>()
            .map_err(|err| format!("bad period in {s:?}: {err}"))?;
        Ok(Self {
            name: name.to_owned(),
            period: Duration::from_millis(period),
        })
    }
}

#[derive(Args, Debug)]
pub struct TaskWdtArgs {
    #[arg(long = "timeout", default_value_t = 100, value_name = "MS")]
    pub timeout_ms: u64,

    /// Abort on timeout instead of logging a backtrace.
    #[arg(long)]
    pub panic: bool,

    /// Also subscribe the idle task of every core.
    #[arg(long)]
    pub idle: bool,

    #[arg(long = "task", value_name = "NAME:PERIOD_MS", default_values_t = default_tasks())]
    pub tasks: Vec<TaskSpec>,

    #[arg(long = "run", default_value_t = 500, value_name = "MS")]
    pub run_ms: u64,
}

fn default_tasks() -> Vec<TaskSpec> {
    vec![
        TaskSpec {
            name: String::from("A"),
            period: Duration::from_millis(10),
        },
        TaskSpec {
            name: String::from("B"),
            period: Duration::from_millis(200),
        },
    ]
}

impl std::fmt::Display for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.period.as_millis())
    }
}

#[derive(Args, Debug)]
pub struct IntWdtArgs {
    #[arg(long, default_value_t = 2)]
    pub cores: usize,

    #[arg(long = "timeout", default_value_t = 300, value_name = "MS")]
    pub timeout_ms: u64,

    /// Feed on every core 0 tick without checking the other cores.
    #[arg(long)]
    pub core0_only: bool,

    /// Keep this core's interrupt dispatcher busy.
    #[arg(long, value_name = "CORE")]
    pub stall_core: Option<u8>,

    #[arg(long = "stall", default_value_t = 1000, value_name = "MS")]
    pub stall_ms: u64,

    #[arg(long = "run", default_value_t = 1500, value_name = "MS")]
    pub run_ms: u64,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    logger::init(match opts.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    match &opts.command {
        Command::Ipc(args) => scenarios::ipc(args),
        Command::Stall(args) => scenarios::stall(args),
        Command::TaskWdt(args) => scenarios::task_wdt(args),
        Command::IntWdt(args) => scenarios::int_wdt(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_spec_parses_name_and_period() {
        let spec: TaskSpec = "worker:25".parse().unwrap();
        assert_eq!(spec.name, "worker");
        assert_eq!(spec.period, Duration::from_millis(25));
        assert_eq!(spec.to_string(), "worker:25");
    }

    #[test]
    fn task_spec_rejects_malformed_input() {
        assert!("worker".parse::<TaskSpec>().is_err());
        assert!(":10".parse::<TaskSpec>().is_err());
        assert!("worker:soon".parse::<TaskSpec>().is_err());
    }

    #[test]
    fn subcommands_parse() {
        let opts =
            Opts::try_parse_from(["smpctl", "task-wdt", "--task", "x:5", "--panic"]).unwrap();
        match opts.command {
            Command::TaskWdt(args) => {
                assert!(args.panic);
                assert_eq!(args.tasks.len(), 1);
                assert_eq!(args.tasks[0].name, "x");
            }
            other => panic!("unexpected command {other:?}"),
        }

        let opts = Opts::try_parse_from(["smpctl", "-v", "int-wdt", "--stall-core", "1"]).unwrap();
        assert_eq!(opts.verbose, 1);
        assert!(matches!(
            opts.command,
            Command::IntWdt(IntWdtArgs { stall_core: Some(1), .. })
        ));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Opts::command().debug_assert();
    }
}
