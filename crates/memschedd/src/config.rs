use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use memsched::{
    mb_to_events, BudgetMode, EventKind, Intensity, RegulatorConfig, UnitSettings, DEFAULT_WEIGHT,
};
use serde::Deserialize;
use utils::version;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the memory bandwidth regulation daemon
    Run(Box<RunArgs>),
    /// Report which CPUs can be regulated
    Probe(ProbeArgs),
}

fn parse_event(value: &str) -> Result<EventKind, String> {
    match value {
        "llc-misses" => Ok(EventKind::LlcMisses),
        "cpu-clock" => Ok(EventKind::CpuClock),
        other => Err(format!("unknown event `{other}`, expected llc-misses or cpu-clock")),
    }
}

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[arg(
        long,
        env = "MEMSCHED_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file with regulator parameters and per-CPU budgets"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, env = "MEMSCHED_CPUS", help = "Number of CPUs to regulate, defaults to all online CPUs")]
    pub cpus: Option<usize>,

    #[arg(long, env = "MEMSCHED_PERIOD_US", help = "Regulation period in microseconds")]
    pub period_us: Option<u64>,

    #[arg(long, env = "MEMSCHED_MAX_BANDWIDTH_MB", help = "Maximum memory bandwidth of the system in MB/s")]
    pub max_bandwidth_mb: Option<u64>,

    #[arg(
        long,
        env = "MEMSCHED_CEILING_PCT",
        help = "System utilization (percent) above which peers are not asked to donate"
    )]
    pub ceiling_pct: Option<u8>,

    #[arg(
        long,
        env = "MEMSCHED_BUDGET_PCT",
        value_delimiter = ',',
        help = "Initial per-CPU budgets as percent of the maximum bandwidth, e.g. 50,25,25"
    )]
    pub budget_pct: Vec<u8>,

    #[arg(long, env = "MEMSCHED_RECLAIM", action = clap::ArgAction::Set, help = "Allow exhausted CPUs to borrow donated budget")]
    pub reclaim: Option<bool>,

    #[arg(
        long,
        env = "MEMSCHED_PROACTIVE_DONATION",
        action = clap::ArgAction::Set,
        help = "Donate predicted surplus at the start of every period"
    )]
    pub proactive_donation: Option<bool>,

    #[arg(
        long,
        env = "MEMSCHED_TASK_PRIORITY",
        action = clap::ArgAction::Set,
        help = "Weight each CPU by the nice value of its registered processes"
    )]
    pub task_priority: Option<bool>,

    #[arg(long, env = "MEMSCHED_EVENT", value_parser = parse_event, help = "Counted event: llc-misses or cpu-clock")]
    pub event: Option<EventKind>,

    #[arg(
        long,
        env = "MEMSCHED_METRICS_FILE",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/logs/memsched-metrics.log",
        help = "Path for per-CPU regulation metrics in InfluxDB line protocol"
    )]
    pub metrics_file: PathBuf,

    #[arg(long, default_value = "10", help = "Seconds between metrics reports")]
    pub stats_interval_secs: u64,

    #[arg(long, env = "NODE_NAME", default_value = "localhost", help = "Host tag attached to metrics")]
    pub node_name: String,

    #[arg(long, default_value = "50", help = "Counter polling interval of the signal thread in microseconds")]
    pub poll_interval_us: u64,

    #[arg(long, default_value = "64", help = "Depth of each CPU's task queue")]
    pub queue_depth: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Count and decide but never stop any process"
    )]
    pub dry_run: bool,
}

#[derive(Parser, Clone, Debug)]
pub struct ProbeArgs {
    #[arg(long, help = "Number of CPUs to probe, defaults to all online CPUs")]
    pub cpus: Option<usize>,

    #[arg(long, value_parser = parse_event, default_value = "llc-misses", help = "Event to probe")]
    pub event: EventKind,
}

/// Contents of the `--config` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonFile {
    #[serde(default)]
    pub regulator: RegulatorConfig,
    #[serde(default)]
    pub units: Vec<UnitFileConfig>,
}

/// Per-CPU entry of the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitFileConfig {
    pub cpu: usize,
    pub limit_mb: Option<u64>,
    pub weight: Option<u32>,
    #[serde(default)]
    pub intensity: Intensity,
    /// Processes regulated on this CPU.
    #[serde(default)]
    pub pids: Vec<i32>,
}

impl DaemonFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Everything the daemon needs to start regulating.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub regulator: RegulatorConfig,
    pub units: Vec<UnitSettings>,
    pub pids: HashMap<usize, Vec<i32>>,
}

impl RunArgs {
    /// Merges the config file with the command line. Command line wins.
    pub fn resolve(&self) -> Result<Resolved> {
        let file = match &self.config {
            Some(path) => DaemonFile::load(path)?,
            None => DaemonFile::default(),
        };
        let cpus = self.cpus.unwrap_or_else(utils::affinity::online_cpus);
        self.resolve_with(file, cpus)
    }

    fn resolve_with(&self, file: DaemonFile, cpus: usize) -> Result<Resolved> {
        if cpus == 0 {
            bail!("at least one CPU must be regulated");
        }

        let mut regulator = file.regulator;
        if let Some(period_us) = self.period_us {
            regulator.period = Duration::from_micros(period_us);
        }
        if let Some(mb) = self.max_bandwidth_mb {
            regulator.max_bandwidth_mb = mb;
        }
        if let Some(pct) = self.ceiling_pct {
            regulator.ceiling_pct = pct;
        }
        if let Some(reclaim) = self.reclaim {
            regulator.reclaim = reclaim;
        }
        if let Some(proactive) = self.proactive_donation {
            regulator.proactive_donation = proactive;
        }
        if let Some(task_priority) = self.task_priority {
            regulator.task_priority = task_priority;
        }
        if let Some(event) = self.event {
            regulator.event = event;
        }
        regulator
            .validate()
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;

        if self.budget_pct.len() > cpus {
            bail!(
                "{} budgets given for {cpus} CPUs",
                self.budget_pct.len()
            );
        }
        let default_pct = (100 / cpus).max(1) as u8;
        let mut units = Vec::with_capacity(cpus);
        for cpu in 0..cpus {
            let pct = self.budget_pct.get(cpu).copied().unwrap_or(default_pct);
            if !(1..=100).contains(&pct) {
                bail!("budget of cpu {cpu} must be in [1, 100] percent, got {pct}");
            }
            units.push(UnitSettings::limit(regulator.budget_for_pct(pct)));
        }

        let mut pids = HashMap::new();
        for entry in file.units {
            let Some(unit) = units.get_mut(entry.cpu) else {
                bail!("config file names cpu {} but only {cpus} are regulated", entry.cpu);
            };
            unit.mode = match (entry.limit_mb, entry.weight) {
                (Some(_), Some(_)) => bail!("cpu {}: limitMb and weight are exclusive", entry.cpu),
                (Some(0), None) => bail!("cpu {}: limitMb must be positive", entry.cpu),
                (Some(mb), None) => BudgetMode::Limit(mb_to_events(mb, regulator.period)),
                (None, Some(0)) => BudgetMode::Weight(DEFAULT_WEIGHT),
                (None, Some(weight)) => BudgetMode::Weight(weight),
                (None, None) => unit.mode,
            };
            unit.intensity = entry.intensity;
            if !entry.pids.is_empty() {
                pids.insert(entry.cpu, entry.pids);
            }
        }

        Ok(Resolved {
            regulator,
            units,
            pids,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["memschedd", "run"];
        argv.extend_from_slice(extra);
        let Commands::Run(args) = Cli::parse_from(argv).command else {
            panic!("expected run command");
        };
        *args
    }

    #[test]
    fn equal_split_by_default() {
        let resolved = args(&[]).resolve_with(DaemonFile::default(), 4).expect("should resolve");
        let expected = resolved.regulator.budget_for_pct(25);
        assert_eq!(resolved.units, vec![UnitSettings::limit(expected); 4]);
    }

    #[test]
    fn cli_overrides_regulator_parameters() {
        let resolved = args(&[
            "--period-us",
            "2000",
            "--ceiling-pct",
            "70",
            "--reclaim",
            "false",
            "--event",
            "cpu-clock",
            "--budget-pct",
            "50,30",
            "--task-priority",
            "true",
        ])
        .resolve_with(DaemonFile::default(), 2)
        .expect("should resolve");

        let cfg = &resolved.regulator;
        assert_eq!(cfg.period, Duration::from_millis(2));
        assert_eq!(cfg.ceiling_pct, 70);
        assert!(!cfg.reclaim);
        assert_eq!(cfg.event, EventKind::CpuClock);
        assert!(cfg.task_priority);
        assert_eq!(resolved.units[0], UnitSettings::limit(cfg.budget_for_pct(50)));
        assert_eq!(resolved.units[1], UnitSettings::limit(cfg.budget_for_pct(30)));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(args(&["--ceiling-pct", "0"])
            .resolve_with(DaemonFile::default(), 2)
            .is_err());
        assert!(args(&["--budget-pct", "10,10,10"])
            .resolve_with(DaemonFile::default(), 2)
            .is_err());
        assert!(args(&[]).resolve_with(DaemonFile::default(), 0).is_err());
        assert!(Cli::try_parse_from(["memschedd", "run", "--event", "cycles"]).is_err());
    }

    #[test]
    fn loads_units_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
regulator:
  period: 1000
  maxBandwidthMb: 4200
  proactiveDonation: true
units:
  - cpu: 0
    limitMb: 1050
    intensity: 100
    pids: [101, 102]
  - cpu: 1
    weight: 0
"#
        )
        .expect("write config");

        let run = args(&["--config", file.path().to_str().expect("utf-8 path")]);
        let resolved = run.resolve_with(
            DaemonFile::load(file.path()).expect("should parse"),
            3,
        )
        .expect("should resolve");

        assert_eq!(resolved.regulator.max_bandwidth_mb, 4200);
        assert!(resolved.regulator.proactive_donation);
        assert_eq!(
            resolved.units[0],
            UnitSettings {
                mode: BudgetMode::Limit(mb_to_events(1050, Duration::from_millis(1))),
                intensity: Intensity::Conservative,
            }
        );
        assert_eq!(resolved.units[1].mode, BudgetMode::Weight(DEFAULT_WEIGHT));
        assert_eq!(resolved.pids.get(&0), Some(&vec![101, 102]));
        assert!(!resolved.pids.contains_key(&1));
    }

    #[test]
    fn rejects_conflicting_unit_entries() {
        let file: DaemonFile = serde_yaml::from_str(
            "units:\n  - cpu: 0\n    limitMb: 100\n    weight: 10\n",
        )
        .expect("should parse");
        assert!(args(&[]).resolve_with(file, 1).is_err());

        let file: DaemonFile =
            serde_yaml::from_str("units:\n  - cpu: 5\n    limitMb: 100\n").expect("should parse");
        assert!(args(&[]).resolve_with(file, 2).is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = DaemonFile::load(Path::new("/nonexistent/memsched.yaml"))
            .expect_err("should fail");
        assert!(err.to_string().contains("failed to read config file"));
    }
}
